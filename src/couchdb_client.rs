//! Handles all interactions with the CouchDB database.
//!
//! This module provides the board-document item provider, the `_changes` feed
//! watcher that turns document updates into change notifications for the engine,
//! and the board status report written after each transition. All functions are
//! asynchronous and use the `reqwest` client for HTTP communication and the
//! error types defined in `src/errors.rs`.

use super::config::AppConfig;
use super::engine::EngineHandle;
use super::errors::ProviderError;
use super::model::{BoardDocument, ChangeNotification, DisplayItem};
use super::provider::ItemProvider;
use super::scheduler::EngineStatus;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use log::{info, error, warn, debug, trace};
use std::time::Duration;
use tokio_stream::StreamExt;

/// Delay before reconnecting a dropped changes feed.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Fetches the board document from CouchDB.
#[must_use = "fetching the document can fail; the Result must be handled"]
pub async fn fetch_board_document(
    config: &AppConfig,
    client: &Client,
) -> Result<BoardDocument, ProviderError> {
    let url = config.board_url();
    debug!("Fetching board document for board_id: {}", config.board_id);
    let response = client.get(&url).send().await.map_err(ProviderError::Reqwest)?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        warn!("Board document not found for board_id: {} at URL: {}", config.board_id, url);
        return Err(ProviderError::NotFound(format!("Board document '{}'", config.board_id)));
    }
    let response = response.error_for_status().map_err(|e| {
        let status = e.status().unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        error!(
            "HTTP error fetching board document {}: {} - {}",
            config.board_id, status, e
        );
        ProviderError::HttpError { status, message: e.to_string() }
    })?;

    let doc = response.json::<BoardDocument>().await.map_err(|e| {
        error!("Failed to parse BoardDocument for board_id {}: {:?}", config.board_id, e);
        ProviderError::from(e)
    })?;
    info!("Fetched board document {}, _rev: {}", config.board_id, doc._rev);
    Ok(doc)
}

/// Loads display items from the board document.
#[derive(Clone, Debug)]
pub struct CouchDbProvider {
    config: AppConfig,
    client: Client,
}

impl CouchDbProvider {
    pub fn new(config: AppConfig, client: Client) -> Self {
        Self { config, client }
    }
}

impl ItemProvider for CouchDbProvider {
    async fn fetch_items(&self) -> Result<Vec<DisplayItem>, ProviderError> {
        let doc = fetch_board_document(&self.config, &self.client).await?;
        let items = doc.display_items(&self.config.board_url());
        debug!("Board {} yields {} displayable item(s)", self.config.board_id, items.len());
        Ok(items)
    }
}

/// Helper struct for parsing `_rev` from an existing status document.
#[derive(Deserialize, Debug)]
struct RevResponse {
    _rev: String,
}

/// Writes the `status_<board_id>` document describing what the board shows.
#[must_use = "updating board status can fail; the Result must be handled"]
pub async fn report_board_status(
    config: &AppConfig,
    client: &Client,
    status: &EngineStatus,
) -> Result<(), ProviderError> {
    let status_doc_id = format!("status_{}", config.board_id);
    let status_url = format!("{}/{}/{}", config.couchdb_url, config.database, status_doc_id);

    let mut current_rev = None;
    trace!("Fetching current _rev for status document: {}", status_doc_id);
    let resp = client.get(&status_url).send().await.map_err(|e| {
        error!("Request error fetching status doc '{}': {:?}", status_doc_id, e);
        ProviderError::Reqwest(e)
    })?;
    match resp.status() {
        reqwest::StatusCode::OK => match resp.json::<RevResponse>().await {
            Ok(rev) => current_rev = Some(rev._rev),
            Err(e) => warn!(
                "Failed to parse _rev from status doc '{}', writing without it: {}",
                status_doc_id, e
            ),
        },
        reqwest::StatusCode::NOT_FOUND => {
            debug!("Status doc '{}' not found, will create it", status_doc_id)
        }
        other => {
            let message =
                format!("Failed to fetch status doc '{}', status: {}", status_doc_id, other);
            error!("{}", message);
            return Err(ProviderError::HttpError { status: other, message });
        }
    }

    let mut payload = serde_json::json!({
        "type": "board_status",
        "board_id": config.board_id,
        "current_item_id": status.item_id,
        "current_index": status.index,
        "item_count": status.item_count,
        "message": status.message,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(rev) = current_rev {
        payload["_rev"] = serde_json::Value::String(rev);
    }
    trace!("Board status payload for doc '{}': {}", status_doc_id, payload);

    let response = client.put(&status_url).json(&payload).send().await.map_err(|e| {
        error!("Request error updating board status for {}: {:?}", config.board_id, e);
        ProviderError::Reqwest(e)
    })?;
    if response.status().is_success() {
        debug!("Updated board status for {}", config.board_id);
        Ok(())
    } else {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("N/A (failed to read error body: {})", e));
        error!(
            "Failed to update board status for {}. Status: {}, Body: {}",
            config.board_id, status, body
        );
        Err(ProviderError::HttpError { status, message: body })
    }
}

/// Parses one line of the continuous changes feed. Heartbeats, blank lines and
/// non-change objects (such as `last_seq`) yield `None`.
pub fn parse_change_line(line: &str) -> Option<ChangeNotification> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            debug!("Ignoring non-JSON line from changes feed ({}): {}", e, line);
            return None;
        }
    };
    let seq = value.get("seq")?;
    let seq = match seq.as_str() {
        Some(s) => s.to_string(),
        None => seq.to_string(),
    };
    Some(ChangeNotification {
        seq,
        doc_id: value.get("id").and_then(|v| v.as_str()).map(str::to_string),
        deleted: value.get("deleted").and_then(|v| v.as_bool()).unwrap_or(false),
    })
}

/// Splits complete lines off `buffer` after appending `chunk`. A trailing partial
/// line stays buffered until its newline arrives.
fn drain_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    buffer.extend_from_slice(chunk);
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}

/// Watches the CouchDB `_changes` feed for the board document and forwards every
/// change to the engine.
///
/// Runs until the process exits, reconnecting after [`RECONNECT_DELAY`] whenever
/// the feed fails or closes.
pub async fn watch_board_changes(config: AppConfig, client: Client, handle: EngineHandle) {
    let url = format!(
        "{}/{}/_changes?feed=continuous&heartbeat=10000&filter=_doc_ids&doc_ids=[\"{}\"]\
         &since=now",
        config.couchdb_url, config.database, config.board_id
    );
    info!(
        "Starting CouchDB changes feed listener for board {} at URL: {}",
        config.board_id, url
    );
    loop {
        match client.get(&url).header(ACCEPT, "application/json").send().await {
            Ok(response) if response.status().is_success() => {
                info!("Connected to CouchDB changes feed for board {}", config.board_id);
                let mut stream = response.bytes_stream();
                let mut buffer = Vec::new();
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(bytes) => {
                            for line in drain_lines(&mut buffer, &bytes) {
                                let Some(change) = parse_change_line(&line) else {
                                    trace!(
                                        "Changes feed heartbeat or non-change line for board {}",
                                        config.board_id
                                    );
                                    continue;
                                };
                                info!(
                                    "Change detected for board {}. Sequence: {}",
                                    config.board_id, change.seq
                                );
                                handle.notify_change(change);
                            }
                        }
                        Err(e) => {
                            error!(
                                "Error reading from CouchDB changes stream for board {}: {}",
                                config.board_id, e
                            );
                            break;
                        }
                    }
                }
            }
            Ok(response) => {
                error!(
                    "CouchDB changes feed request for board {} failed with status: {}",
                    config.board_id,
                    response.status()
                );
            }
            Err(e) => {
                error!(
                    "Failed to connect to CouchDB changes feed for board {}: {}",
                    config.board_id, e
                );
            }
        }
        warn!(
            "Changes feed for board {} disconnected. Reconnecting in {} seconds...",
            config.board_id,
            RECONNECT_DELAY.as_secs()
        );
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
