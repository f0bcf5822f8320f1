//! Bridges "a video resource exists" to "the video is actually playing".
//!
//! A video slide's duration timer must start when playback starts, not when the
//! slide was requested, so slow buffering does not eat into display time. The
//! synchronizer tracks the active video, issues `play` once the backend reports
//! readiness, turns the first `Started` event into an arm signal, and restarts the
//! clip on `Ended` without involving the scheduler.

use super::errors::MediaError;
use super::media_manager::{
    MediaBackend, MediaEvent, MediaEventKind, MediaResourceManager, ResourceId, VideoPhase,
};
use log::{debug, info, trace, warn};
use std::time::Duration;

/// What the scheduler has to do after the synchronizer handled something.
#[derive(Debug)]
pub enum SyncAction {
    None,
    /// Arm the slide's duration timer now.
    ArmDuration,
    /// Playback has not started; arm the readiness deadline.
    AwaitStart,
    /// Playback will not start in time; fall back to image timing.
    Degrade(MediaError),
}

#[derive(Debug)]
struct ActivePlayback {
    resource: ResourceId,
    item_id: String,
    /// Still waiting for the first `Started` of this slide.
    awaiting_start: bool,
    play_issued: bool,
}

#[derive(Debug, Default)]
pub struct PlaybackSynchronizer {
    active: Option<ActivePlayback>,
}

impl PlaybackSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The video resource `id` just became the active slide.
    pub fn begin<B: MediaBackend>(
        &mut self,
        media: &mut MediaResourceManager<B>,
        id: ResourceId,
    ) -> SyncAction {
        let Some(resource) = media.resource_mut(id) else {
            warn!("Cannot begin playback of {:?}: not in the working set", id);
            return SyncAction::None;
        };
        let item_id = resource.item.id.clone();
        let phase = resource.video.unwrap_or(VideoPhase::Buffering);
        self.active = Some(ActivePlayback {
            resource: id,
            item_id: item_id.clone(),
            awaiting_start: true,
            play_issued: false,
        });

        match phase {
            VideoPhase::Playing => {
                debug!("Video '{}' is already playing; arming its timer immediately", item_id);
                self.mark_started();
                SyncAction::ArmDuration
            }
            VideoPhase::Ended => {
                if let Err(e) = media.backend_mut().seek_to_start(id) {
                    return self.degrade(e);
                }
                self.issue_play(media, id)
            }
            VideoPhase::Ready => self.issue_play(media, id),
            VideoPhase::Buffering => {
                debug!("Video '{}' still buffering; play will be issued when ready", item_id);
                SyncAction::AwaitStart
            }
        }
    }

    /// The active slide is gone (transition, reset, teardown).
    pub fn end(&mut self) {
        if let Some(active) = self.active.take() {
            trace!("Playback tracking for '{}' ended", active.item_id);
        }
    }

    pub fn is_awaiting_start(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.awaiting_start)
    }

    pub fn active_resource(&self) -> Option<ResourceId> {
        self.active.as_ref().map(|a| a.resource)
    }

    pub fn on_event<B: MediaBackend>(
        &mut self,
        media: &mut MediaResourceManager<B>,
        event: &MediaEvent,
    ) -> SyncAction {
        let id = event.resource;
        let is_active = self.active_resource() == Some(id);
        let Some(resource) = media.resource_mut(id) else {
            trace!("Dropping {:?} for {:?}: resource no longer in the working set", event.kind, id);
            return SyncAction::None;
        };
        let item_id = resource.item.id.clone();

        match &event.kind {
            MediaEventKind::Ready => {
                if resource.video != Some(VideoPhase::Playing) {
                    resource.video = Some(VideoPhase::Ready);
                }
                let needs_play =
                    self.active.as_ref().is_some_and(|a| a.resource == id && !a.play_issued);
                if needs_play {
                    return self.issue_play(media, id);
                }
                SyncAction::None
            }
            MediaEventKind::Started => {
                resource.video = Some(VideoPhase::Playing);
                if is_active && self.is_awaiting_start() {
                    info!("Video '{}' started playing", item_id);
                    self.mark_started();
                    return SyncAction::ArmDuration;
                }
                SyncAction::None
            }
            MediaEventKind::Ended => {
                resource.video = Some(VideoPhase::Ended);
                if !is_active {
                    return SyncAction::None;
                }
                debug!("Video '{}' ended; looping from the start", item_id);
                let backend = media.backend_mut();
                let restarted = match backend.seek_to_start(id) {
                    Ok(()) => backend.play(id),
                    Err(e) => Err(e),
                };
                if let Err(e) = restarted {
                    warn!("Failed to loop video '{}': {}", item_id, e);
                    return SyncAction::None;
                }
                if let Some(resource) = media.resource_mut(id) {
                    resource.video = Some(VideoPhase::Ready);
                }
                SyncAction::None
            }
            MediaEventKind::Failed(reason) => {
                if is_active && self.is_awaiting_start() {
                    let err = MediaError::PlaybackFailed { item_id, reason: reason.clone() };
                    return self.degrade(err);
                }
                warn!("Backend reported failure for '{}' ({:?}): {}", item_id, id, reason);
                SyncAction::None
            }
        }
    }

    /// The readiness deadline for the active video expired.
    pub fn on_readiness_timeout(&mut self, waited: Duration) -> SyncAction {
        match &self.active {
            Some(active) if active.awaiting_start => {
                let err = MediaError::ReadinessTimeout {
                    item_id: active.item_id.clone(),
                    waited_ms: waited.as_millis() as u64,
                };
                self.degrade(err)
            }
            _ => SyncAction::None,
        }
    }

    fn issue_play<B: MediaBackend>(
        &mut self,
        media: &mut MediaResourceManager<B>,
        id: ResourceId,
    ) -> SyncAction {
        if let Err(e) = media.backend_mut().play(id) {
            return self.degrade(e);
        }
        if let Some(active) = self.active.as_mut() {
            active.play_issued = true;
            debug!("Play issued for '{}'", active.item_id);
        }
        if self.is_awaiting_start() { SyncAction::AwaitStart } else { SyncAction::None }
    }

    fn mark_started(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.awaiting_start = false;
            active.play_issued = true;
        }
    }

    fn degrade(&mut self, err: MediaError) -> SyncAction {
        if let Some(active) = self.active.as_mut() {
            active.awaiting_start = false;
        }
        SyncAction::Degrade(err)
    }
}
