//! Materializes display items into local files.
//!
//! `PrefetchBackend` is the [`MediaBackend`] used by the binary. Creating a
//! resource starts a background task that downloads the media into a temporary
//! file (or checks that a local file exists); the file lives exactly as long as
//! the resource and is deleted on teardown. Video resources report `Ready` once
//! the file is in place and `Started` when play is requested on a ready file, which
//! is what a renderer watching [`PrefetchBackend::local_path`] needs.

use super::engine::MediaEventSender;
use super::errors::MediaError;
use super::media_manager::{MediaBackend, MediaEvent, MediaEventKind, ResourceId};
use super::model::DisplayItem;
use reqwest::Client;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use log::{info, error, debug, trace};

#[derive(Clone, Debug, PartialEq)]
enum MediaSource {
    Remote(String),
    Local(PathBuf),
}

impl MediaSource {
    fn parse(media_ref: &str) -> Result<Self, MediaError> {
        let media_ref = media_ref.trim();
        if media_ref.is_empty() {
            return Err(MediaError::UnsupportedKind("empty media reference".into()));
        }
        if media_ref.starts_with("http://") || media_ref.starts_with("https://") {
            return Ok(MediaSource::Remote(media_ref.to_string()));
        }
        if let Some(path) = media_ref.strip_prefix("file://") {
            return Ok(MediaSource::Local(PathBuf::from(path)));
        }
        if media_ref.contains("://") {
            return Err(MediaError::UnsupportedKind(media_ref.to_string()));
        }
        Ok(MediaSource::Local(PathBuf::from(media_ref)))
    }
}

#[derive(Debug)]
struct Slot {
    item_id: String,
    is_video: bool,
    task: Option<JoinHandle<()>>,
    /// Downloaded copy; deleted when the slot is dropped.
    file: Option<NamedTempFile>,
    /// Playable path once prefetching finished.
    path: Option<PathBuf>,
    /// Play was requested before the file was ready.
    play_pending: bool,
}

type Slots = Arc<Mutex<HashMap<ResourceId, Slot>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<ResourceId, Slot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct PrefetchBackend {
    client: Client,
    events: MediaEventSender,
    slots: Slots,
}

impl PrefetchBackend {
    pub fn new(client: Client, events: MediaEventSender) -> Self {
        Self { client, events, slots: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Local file backing `id`, once prefetched.
    pub fn local_path(&self, id: ResourceId) -> Option<PathBuf> {
        lock(&self.slots).get(&id).and_then(|slot| slot.path.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MediaBackend for PrefetchBackend {
    fn create(&mut self, id: ResourceId, item: &DisplayItem) -> Result<(), MediaError> {
        let source = MediaSource::parse(&item.media_ref)?;
        lock(&self.slots).insert(
            id,
            Slot {
                item_id: item.id.clone(),
                is_video: item.is_video(),
                task: None,
                file: None,
                path: None,
                play_pending: false,
            },
        );
        let task = tokio::spawn(prefetch(
            id,
            source,
            self.client.clone(),
            self.events.clone(),
            Arc::clone(&self.slots),
        ));
        match lock(&self.slots).get_mut(&id) {
            Some(slot) => slot.task = Some(task),
            None => task.abort(),
        }
        debug!("Prefetch started for '{}' ({:?})", item.id, id);
        Ok(())
    }

    fn play(&mut self, id: ResourceId) -> Result<(), MediaError> {
        let mut slots = lock(&self.slots);
        let slot = slots
            .get_mut(&id)
            .ok_or_else(|| MediaError::Generic(format!("play on unknown resource {:?}", id)))?;
        if slot.path.is_some() {
            if slot.is_video {
                self.events.send(MediaEvent { resource: id, kind: MediaEventKind::Started });
            }
        } else {
            trace!("Play for '{}' deferred until its file is ready", slot.item_id);
            slot.play_pending = true;
        }
        Ok(())
    }

    fn seek_to_start(&mut self, id: ResourceId) -> Result<(), MediaError> {
        if lock(&self.slots).contains_key(&id) {
            Ok(())
        } else {
            Err(MediaError::Generic(format!("seek on unknown resource {:?}", id)))
        }
    }

    fn destroy(&mut self, id: ResourceId) {
        let Some(slot) = lock(&self.slots).remove(&id) else { return };
        if let Some(task) = &slot.task {
            task.abort();
        }
        debug!("Released '{}' ({:?})", slot.item_id, id);
    }
}

async fn prefetch(
    id: ResourceId,
    source: MediaSource,
    client: Client,
    events: MediaEventSender,
    slots: Slots,
) {
    let result = match source {
        MediaSource::Remote(url) => download_to_temp_file(&client, &url).await.map(|file| {
            let path = file.path().to_path_buf();
            (Some(file), path)
        }),
        MediaSource::Local(path) => match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok((None, path)),
            Ok(_) => Err(MediaError::Generic(format!("{} is not a file", path.display()))),
            Err(e) => Err(MediaError::Io(e)),
        },
    };

    let mut guard = lock(&slots);
    // Torn down while prefetching: the file is dropped (and deleted) here.
    let Some(slot) = guard.get_mut(&id) else { return };
    match result {
        Ok((file, path)) => {
            info!("Media for '{}' ready at {}", slot.item_id, path.display());
            slot.file = file;
            slot.path = Some(path);
            if slot.is_video {
                events.send(MediaEvent { resource: id, kind: MediaEventKind::Ready });
                if slot.play_pending {
                    slot.play_pending = false;
                    events.send(MediaEvent { resource: id, kind: MediaEventKind::Started });
                }
            }
        }
        Err(e) => {
            error!("Failed to prefetch '{}': {}", slot.item_id, e);
            if slot.is_video {
                let kind = MediaEventKind::Failed(e.to_string());
                events.send(MediaEvent { resource: id, kind });
            }
        }
    }
}

/// Streams `url` into a fresh temporary file.
#[must_use = "downloading media can fail; the Result must be handled"]
pub async fn download_to_temp_file(
    client: &Client,
    url: &str,
) -> Result<NamedTempFile, MediaError> {
    debug!("Downloading media from {}", url);
    let response = client.get(url).send().await.map_err(|e| {
        error!("Request error fetching media {}: {:?}", url, e);
        MediaError::Download(e)
    })?;
    let response = response.error_for_status().map_err(|e| {
        error!("HTTP error {} fetching media {}", e.status().unwrap_or_default(), url);
        MediaError::Download(e)
    })?;

    let mut temp_file = tempfile::Builder::new().prefix("signage-").tempfile()?;
    trace!("Created temp file for {} at: {:?}", url, temp_file.path());
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            error!("Stream error while downloading {}: {:?}", url, e);
            MediaError::Download(e)
        })?;
        temp_file.write_all(&chunk)?;
    }
    temp_file.flush()?;
    info!("Downloaded {} to {:?}", url, temp_file.path());
    Ok(temp_file)
}
