use log::{info, error, debug};
use reqwest::Client as ReqwestClient;
use tokio::sync::watch;

use signage_board::config::{load_config, AppConfig, DEFAULT_CONFIG_PATH};
use signage_board::couchdb_client::{report_board_status, watch_board_changes, CouchDbProvider};
use signage_board::engine::{Engine, EngineHandle};
use signage_board::errors::AppError;
use signage_board::media_pipeline::PrefetchBackend;
use signage_board::model::EngineState;
use signage_board::scheduler::EngineStatus;

/// Writes the board status document whenever the displayed item changes.
async fn report_status_changes(
    config: AppConfig,
    client: ReqwestClient,
    mut status: watch::Receiver<EngineStatus>,
) {
    let mut last_reported: Option<(Option<usize>, Option<String>)> = None;
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        if current.state != EngineState::Playing {
            continue;
        }
        let key = (current.index, current.item_id.clone());
        if last_reported.as_ref() == Some(&key) {
            continue;
        }
        debug!("Reporting board status: {}", current.message);
        match report_board_status(&config, &client, &current).await {
            Ok(()) => last_reported = Some(key),
            Err(e) => error!("Failed to report board status: {}", e),
        }
    }
    debug!("Status feed closed; board status reporting stopped");
}

/// Re-reads the configuration file on SIGHUP and pushes the playback settings
/// into the engine.
#[cfg(unix)]
async fn reload_config_on_sighup(path: String, handle: EngineHandle) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Cannot install SIGHUP handler: {}", e);
            return;
        }
    };
    while hangups.recv().await.is_some() {
        info!("SIGHUP received; reloading configuration from {}", path);
        match load_config(&path) {
            Ok(config) => handle.update_config(config.playback),
            Err(e) => error!("Keeping current configuration: {}", e),
        }
    }
}

/// Queues a full restart on SIGUSR1, sent after a new deployment lands. The
/// engine applies it at the next transition so the current slide finishes.
#[cfg(unix)]
async fn restart_on_sigusr1(handle: EngineHandle) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut requests = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Cannot install SIGUSR1 handler: {}", e);
            return;
        }
    };
    while requests.recv().await.is_some() {
        info!("SIGUSR1 received; restart queued for the next transition");
        handle.request_restart();
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    env_logger::init();
    info!("Starting signage board engine");

    let config_path =
        std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&config_path)?;
    match &config.manager_url {
        Some(manager) => info!("Board '{}' (manager: {})", config.board_id, manager),
        None => info!("Board '{}'", config.board_id),
    }

    let client = ReqwestClient::new();
    let provider = CouchDbProvider::new(config.clone(), client.clone());
    let backend_client = client.clone();
    let engine = Engine::new(
        config.playback.clone(),
        config.watchdog.clone(),
        config.board_id.clone(),
        provider,
        move |events| PrefetchBackend::new(backend_client, events),
    );
    let handle = engine.handle();

    tokio::spawn(watch_board_changes(config.clone(), client.clone(), handle.clone()));
    tokio::spawn(report_status_changes(
        config.clone(),
        client.clone(),
        handle.subscribe_status(),
    ));
    #[cfg(unix)]
    tokio::spawn(reload_config_on_sighup(config_path.clone(), handle.clone()));
    #[cfg(unix)]
    tokio::spawn(restart_on_sigusr1(handle.clone()));

    let engine_task = tokio::spawn(engine.run());

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received; shutting down"),
        Err(e) => error!("Cannot listen for shutdown signal: {}", e),
    }
    handle.shutdown();
    engine_task.await.map_err(|e| AppError::Generic(format!("Engine task failed: {}", e)))?;
    info!("Signage board engine stopped");
    Ok(())
}
