//! The slide scheduler: the one place that decides what is on screen.
//!
//! Everything that mutates the current slide, the working set, the pending change
//! queue or the watchdog state happens inside the handlers on this type, which the
//! engine calls one at a time. Time is an engine-relative `Duration` passed in by
//! the caller, so the same code runs under tokio and under tests that step a
//! simulated clock.
//!
//! Slide lifecycle:
//!
//! 1. A slide becomes current: images arm their duration timer right away, videos
//!    wait for the playback synchronizer to report that playback started.
//! 2. `min(preload_lead, duration / 2)` after arming, the next slide is preloaded.
//! 3. When the duration runs out the slide enters `Transitioning`; after the
//!    transition interval the pending changes are flushed, the playlist advances,
//!    the preloaded resource is promoted and the cycle repeats.
//!
//! Any reset (configuration change, reload) bumps the generation and cancels all
//! slide timers before new ones are armed.

use super::config::{PlaybackConfig, WatchdogConfig};
use super::diagnostics::{DiagnosticLog, DiagnosticRecord};
use super::errors::{AppError, ProviderError};
use super::media_manager::{MediaBackend, MediaEvent, MediaResourceManager, WorkingSet};
use super::model::{ChangeNotification, DisplayItem, EngineState, ItemKind, SlidePhase};
use super::playback::{PlaybackSynchronizer, SyncAction};
use super::playlist::PlaylistManager;
use super::timers::{FiredTimer, Generation, TimerKind, TimerQueue};
use super::updates::{NotifyOutcome, UpdateCoordinator};
use super::watchdog::{Watchdog, WatchdogVerdict};
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use std::time::Duration;

/// Delay before retrying a failed initial load.
pub const RELOAD_RETRY_DELAY: Duration = Duration::from_secs(10);

pub type ReloadTicket = u64;

#[derive(Clone, Debug, PartialEq)]
pub enum ReloadReason {
    Startup,
    /// Changes were flushed at a transition boundary.
    PendingChanges(usize),
    /// A change arrived while nothing was on screen.
    ChangeWhileIdle,
    Retry,
    /// Recovery after a stall.
    Restart,
    /// A queued restart request reached a transition boundary.
    RestartRequested,
}

/// Work the scheduler needs done outside its serialized context.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineRequest {
    Reload { ticket: ReloadTicket, reason: ReloadReason },
}

/// The slide on screen. Recreated on every transition, even when the item repeats.
#[derive(Clone, Debug, PartialEq)]
pub struct SlideSession {
    pub index: usize,
    pub item_id: String,
    pub phase: SlidePhase,
    pub started_at: Duration,
    /// When the duration timer was armed, and for how long.
    pub armed: Option<(Duration, Duration)>,
}

/// Snapshot for the status feed.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub index: Option<usize>,
    pub item_id: Option<String>,
    pub phase: Option<SlidePhase>,
    pub message: String,
    pub pending_changes: usize,
    pub item_count: usize,
}

#[derive(Debug)]
pub struct SlideScheduler<B> {
    config: PlaybackConfig,
    client_id: String,
    playlist: PlaylistManager,
    media: MediaResourceManager<B>,
    sync: PlaybackSynchronizer,
    updates: UpdateCoordinator,
    watchdog: Watchdog,
    diagnostics: DiagnosticLog,
    timers: TimerQueue,
    generation: Generation,
    session: Option<SlideSession>,
    /// Index learned during preload; committed at the next transition.
    pending_next: Option<usize>,
    state: EngineState,
    status_message: String,
    latest_ticket: ReloadTicket,
    requests: Vec<EngineRequest>,
}

impl<B: MediaBackend> SlideScheduler<B> {
    pub fn new(
        config: PlaybackConfig,
        watchdog: WatchdogConfig,
        client_id: impl Into<String>,
        backend: B,
        diagnostics: DiagnosticLog,
    ) -> Self {
        Self {
            config,
            client_id: client_id.into(),
            playlist: PlaylistManager::empty(),
            media: MediaResourceManager::new(backend),
            sync: PlaybackSynchronizer::new(),
            updates: UpdateCoordinator::new(),
            watchdog: Watchdog::new(watchdog),
            diagnostics,
            timers: TimerQueue::new(),
            generation: 0,
            session: None,
            pending_next: None,
            state: EngineState::Connecting,
            status_message: "Initializing...".to_string(),
            latest_ticket: 0,
            requests: Vec::new(),
        }
    }

    // --- lifecycle ---

    /// Starts monitoring and requests the first item load.
    pub fn init(&mut self, now: Duration) {
        info!("Scheduler starting for client '{}'", self.client_id);
        self.set_state(EngineState::Connecting, "Loading items...");
        self.arm_watchdog(now);
        self.request_reload(ReloadReason::Startup);
    }

    /// Cancels every timer and tears down every resource.
    pub fn dispose(&mut self) {
        let cancelled = self.timers.cancel_all();
        self.generation += 1;
        self.sync.end();
        self.media.evict_all();
        self.session = None;
        self.pending_next = None;
        self.updates.clear();
        self.watchdog.suspend();
        info!("Scheduler disposed ({} timer(s) cancelled)", cancelled);
        self.set_state(EngineState::Idle, "Stopped");
    }

    // --- inputs ---

    /// Fires every timer due at `now`, in deadline order.
    pub fn advance_to(&mut self, now: Duration) {
        while let Some(fired) = self.timers.pop_due(now) {
            self.on_timer(fired);
        }
    }

    pub fn on_media_event(&mut self, event: MediaEvent, now: Duration) {
        let action = self.sync.on_event(&mut self.media, &event);
        self.apply_sync_action(action, now);
    }

    pub fn notify_change(&mut self, change: ChangeNotification) {
        match self.updates.notify(change, self.session.is_none()) {
            NotifyOutcome::ReloadNow => self.request_reload(ReloadReason::ChangeWhileIdle),
            NotifyOutcome::Queued(count) => {
                debug!("{} change(s) waiting for the next transition", count);
            }
        }
    }

    /// Asks for a full restart at the next transition boundary, or right away when
    /// nothing is on screen.
    pub fn request_restart(&mut self) {
        if self.session.is_none() {
            info!("Restart requested with nothing on screen; reloading now");
            self.restart(ReloadReason::RestartRequested, "Restarting...");
        } else {
            self.updates.request_restart();
        }
    }

    pub fn on_reload_complete(
        &mut self,
        ticket: ReloadTicket,
        result: Result<Vec<DisplayItem>, ProviderError>,
        now: Duration,
    ) {
        if ticket != self.latest_ticket {
            trace!("Dropping stale reload #{} (latest is #{})", ticket, self.latest_ticket);
            return;
        }
        match result {
            Ok(items) => {
                self.timers.cancel(TimerKind::ReloadRetry);
                info!("Reload #{} delivered {} item(s)", ticket, items.len());
                self.load_items(items, now);
            }
            Err(e) if self.session.is_some() => {
                warn!("Reload #{} failed, keeping the current playlist: {}", ticket, e);
            }
            Err(e) => {
                let err = AppError::from(e);
                error!("Reload #{} failed: {}", ticket, err);
                let message = format!("Cannot load items: {}", err);
                self.set_state(EngineState::Error(err.to_string()), &message);
                // Not tied to a slide, so resets must not invalidate it.
                self.timers.arm(TimerKind::ReloadRetry, now + RELOAD_RETRY_DELAY, None);
            }
        }
    }

    /// Applies new timing/order settings. Equal settings are ignored.
    pub fn apply_config(&mut self, config: PlaybackConfig, now: Duration) {
        if config == self.config {
            debug!("Configuration unchanged; nothing to reset");
            return;
        }
        let reorder = config.play_order != self.config.play_order
            || config.shuffle_seed != self.config.shuffle_seed;
        info!("Applying new playback configuration: {:?}", config);
        self.config = config;
        self.reset("configuration changed");
        if self.session.is_none() {
            return;
        }
        if reorder {
            let resume = self.playlist.current();
            let items = self.playlist.items().to_vec();
            self.playlist = self.build_playlist(items);
            if let Some(index) = resume {
                self.playlist.start_at(index);
            }
        }
        self.media.evict_next();
        self.start_current_slide(now);
    }

    /// Requests drained by the engine after each handler.
    pub fn drain_requests(&mut self) -> Vec<EngineRequest> {
        std::mem::take(&mut self.requests)
    }

    // --- observation ---

    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.index)
    }

    pub fn phase(&self) -> Option<SlidePhase> {
        self.session.as_ref().map(|s| s.phase)
    }

    pub fn session(&self) -> Option<&SlideSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn working_set(&self) -> &WorkingSet {
        self.media.working_set()
    }

    pub fn backend(&self) -> &B {
        self.media.backend()
    }

    pub fn playlist(&self) -> &PlaylistManager {
        &self.playlist
    }

    pub fn pending_changes(&self) -> usize {
        self.updates.len()
    }

    pub fn diagnostics(&self) -> &[DiagnosticRecord] {
        self.diagnostics.records()
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Fraction of the current slide's duration already shown.
    pub fn progress(&self, now: Duration) -> f32 {
        match &self.session {
            Some(s) if s.phase == SlidePhase::Transitioning => 1.0,
            Some(SlideSession { armed: Some((at, total)), .. }) if !total.is_zero() => {
                (now.saturating_sub(*at).as_secs_f32() / total.as_secs_f32()).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    pub fn status(&self) -> EngineStatus {
        let message = match (&self.state, &self.session) {
            (EngineState::Playing, Some(session)) => self.describe(session),
            _ => self.status_message.clone(),
        };
        EngineStatus {
            state: self.state.clone(),
            index: self.current_index(),
            item_id: self.session.as_ref().map(|s| s.item_id.clone()),
            phase: self.phase(),
            message,
            pending_changes: self.updates.len(),
            item_count: self.playlist.len(),
        }
    }

    fn describe(&self, session: &SlideSession) -> String {
        let title = self
            .playlist
            .item(session.index)
            .and_then(|item| item.title.clone())
            .unwrap_or_else(|| session.item_id.clone());
        let mut message =
            format!("Showing {}/{}: {}", session.index + 1, self.playlist.len(), title);
        if session.phase == SlidePhase::Transitioning {
            message.push_str(" (transitioning)");
        } else if self.sync.is_awaiting_start() {
            message.push_str(" (waiting for playback)");
        }
        if !self.updates.is_empty() {
            message.push_str(&format!(", {} change(s) pending", self.updates.len()));
        }
        if self.updates.restart_pending() {
            message.push_str(", restart pending");
        }
        message
    }

    // --- internals ---

    fn on_timer(&mut self, fired: FiredTimer) {
        if let Some(generation) = fired.generation {
            if generation != self.generation {
                trace!(
                    "Dropping stale {:?} from generation {} (now {})",
                    fired.kind,
                    generation,
                    self.generation
                );
                return;
            }
        }
        let now = fired.deadline;
        match fired.kind {
            TimerKind::Preload => self.preload_next(),
            TimerKind::Duration => self.begin_transition(now),
            TimerKind::Transition => self.complete_transition(now),
            TimerKind::Readiness => {
                let action = self.sync.on_readiness_timeout(self.config.readiness_timeout());
                self.apply_sync_action(action, now);
            }
            TimerKind::ReloadRetry => self.request_reload(ReloadReason::Retry),
            TimerKind::WatchdogCheck => self.check_watchdog(now),
        }
    }

    fn reset(&mut self, reason: &str) {
        self.generation += 1;
        let cancelled = self.timers.cancel_slide_timers();
        self.sync.end();
        self.pending_next = None;
        debug!(
            "Reset ({}): generation {}, {} timer(s) cancelled",
            reason, self.generation, cancelled
        );
    }

    fn build_playlist(&self, items: Vec<DisplayItem>) -> PlaylistManager {
        PlaylistManager::initialize(items, self.config.play_order, self.config.shuffle_seed)
    }

    fn load_items(&mut self, items: Vec<DisplayItem>, now: Duration) {
        self.reset("item list reloaded");
        let resume_id = self.session.as_ref().map(|s| s.item_id.clone());
        self.playlist = self.build_playlist(items);
        if self.playlist.is_empty() {
            self.go_idle("No items to display");
            return;
        }
        if let Some(index) = resume_id.and_then(|id| self.playlist.position_of(&id)) {
            debug!("Resuming at index {} after reload", index);
            self.playlist.start_at(index);
        }
        self.media.evict_next();
        self.start_current_slide(now);
    }

    fn go_idle(&mut self, message: &str) {
        self.timers.cancel_slide_timers();
        self.sync.end();
        self.media.evict_all();
        self.session = None;
        self.pending_next = None;
        self.watchdog.suspend();
        self.set_state(EngineState::Idle, message);
    }

    fn current_item(&self) -> Option<(usize, DisplayItem)> {
        let index = self.playlist.current()?;
        self.playlist.item(index).cloned().map(|item| (index, item))
    }

    /// Makes the playlist's current item the slide on screen and arms its timing.
    fn start_current_slide(&mut self, now: Duration) {
        let Some((index, item)) = self.current_item() else {
            self.go_idle("No items to display");
            return;
        };
        // The previous slide's timers must be gone before this slide arms its own.
        self.timers.cancel_slide_timers();
        self.sync.end();
        self.pending_next = None;

        let promoted = self.media.promote(index, &item);
        self.session = Some(SlideSession {
            index,
            item_id: item.id.clone(),
            phase: SlidePhase::Waiting,
            started_at: now,
            armed: None,
        });
        self.watchdog.record_transition(now);
        if self.state != EngineState::Playing {
            self.set_state(EngineState::Playing, "Playing");
        }

        match (item.kind, promoted) {
            (_, Err(e)) => {
                error!(
                    "Cannot materialize '{}': {}; showing it with image timing",
                    item.id,
                    AppError::from(e)
                );
                self.arm_duration(now, self.config.auto_slide_interval());
            }
            (ItemKind::Image, Ok(_)) => self.arm_duration(now, self.config.auto_slide_interval()),
            (ItemKind::Video, Ok((id, _))) => {
                let action = self.sync.begin(&mut self.media, id);
                self.apply_sync_action(action, now);
            }
        }
    }

    fn apply_sync_action(&mut self, action: SyncAction, now: Duration) {
        match action {
            SyncAction::None => {}
            SyncAction::AwaitStart => {
                if !self.timers.is_armed(TimerKind::Readiness) {
                    let deadline = now + self.config.readiness_timeout();
                    self.timers.arm(TimerKind::Readiness, deadline, Some(self.generation));
                }
            }
            SyncAction::ArmDuration => {
                self.timers.cancel(TimerKind::Readiness);
                self.arm_duration(now, self.config.video_play_duration());
            }
            SyncAction::Degrade(err) => {
                self.timers.cancel(TimerKind::Readiness);
                warn!("{}; falling back to image timing", AppError::from(err));
                self.arm_duration(now, self.config.auto_slide_interval());
            }
        }
    }

    fn arm_duration(&mut self, now: Duration, duration: Duration) {
        let Some(session) = self.session.as_mut() else { return };
        let generation = Some(self.generation);
        self.timers.arm(TimerKind::Preload, now + self.config.preload_offset(duration), generation);
        self.timers.arm(TimerKind::Duration, now + duration, generation);
        session.armed = Some((now, duration));
        debug!(
            "Slide {} armed for {}ms at t={}ms",
            session.index,
            duration.as_millis(),
            now.as_millis()
        );
    }

    fn preload_next(&mut self) {
        let Some(next) = self.playlist.peek_next() else { return };
        self.pending_next = Some(next);
        if let Some(item) = self.playlist.item(next).cloned() {
            debug!("Preloading index {} ('{}')", next, item.id);
            self.media.preload(next, &item);
        }
    }

    fn begin_transition(&mut self, now: Duration) {
        let Some(session) = self.session.as_mut() else { return };
        session.phase = SlidePhase::Transitioning;
        trace!("Slide {} transitioning", session.index);
        let deadline = now + self.config.transition_duration();
        self.timers.arm(TimerKind::Transition, deadline, Some(self.generation));
    }

    fn complete_transition(&mut self, now: Duration) {
        if self.updates.take_restart() {
            self.restart(ReloadReason::RestartRequested, "Restarting...");
            return;
        }
        if let Some(count) = self.updates.flush() {
            self.request_reload(ReloadReason::PendingChanges(count));
        }
        let from = self.current_index();
        let expected = self.pending_next.take();
        let Some(index) = self.playlist.advance() else {
            self.go_idle("No items to display");
            return;
        };
        if expected.is_some_and(|e| e != index) {
            warn!("Advanced to index {} but index {:?} was preloaded", index, expected);
        }
        info!("Advancing slide from index {:?} to {}", from, index);
        self.start_current_slide(now);
    }

    fn arm_watchdog(&mut self, now: Duration) {
        self.timers.arm(TimerKind::WatchdogCheck, now + self.watchdog.check_interval(), None);
    }

    fn check_watchdog(&mut self, now: Duration) {
        self.arm_watchdog(now);
        if let WatchdogVerdict::Recover { stalled_for } = self.watchdog.check(now) {
            self.recover_from_stall(stalled_for);
        }
    }

    fn recover_from_stall(&mut self, stalled_for: Duration) {
        let stalled_for_ms = stalled_for.as_millis() as u64;
        error!("{}; restarting engine", AppError::StallDetected { stalled_for_ms });
        let record = DiagnosticRecord {
            timestamp: Utc::now(),
            stalled_for_ms,
            current_index: self.current_index(),
            current_item_id: self.session.as_ref().map(|s| s.item_id.clone()),
            item_count: self.playlist.len(),
            client_id: self.client_id.clone(),
        };
        if let Err(e) = self.diagnostics.append(record) {
            error!("Failed to persist diagnostic record: {}", AppError::from(e));
        }

        self.restart(ReloadReason::Restart, "Restarting after stall...");
    }

    /// Tears everything down and loads the item list from scratch. Playback starts
    /// at the first position once the reload arrives.
    fn restart(&mut self, reason: ReloadReason, message: &str) {
        self.reset("restart");
        self.media.evict_all();
        self.session = None;
        self.updates.clear();
        self.watchdog.suspend();
        self.playlist = PlaylistManager::empty();
        self.set_state(EngineState::Connecting, message);
        self.request_reload(reason);
    }

    fn request_reload(&mut self, reason: ReloadReason) {
        self.latest_ticket += 1;
        info!("Requesting item reload #{} ({:?})", self.latest_ticket, reason);
        self.requests.push(EngineRequest::Reload { ticket: self.latest_ticket, reason });
    }

    fn set_state(&mut self, state: EngineState, message: &str) {
        if self.state != state {
            info!(
                "Transitioning EngineState from {:?} to {:?}. Message: {}",
                self.state, state, message
            );
        }
        self.state = state;
        self.status_message = message.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_manager::testing::RecordingBackend;
    use crate::media_manager::{MediaEventKind, ResourceId};
    use crate::model::PlayOrder;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    type Board = SlideScheduler<RecordingBackend>;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn config(transition_ms: u64) -> PlaybackConfig {
        PlaybackConfig {
            auto_slide_interval_ms: 5_000,
            video_play_duration_ms: 10_000,
            transition_duration_ms: transition_ms,
            ..PlaybackConfig::default()
        }
    }

    fn scheduler(config: PlaybackConfig) -> Board {
        let backend = RecordingBackend::default();
        SlideScheduler::new(
            config,
            WatchdogConfig::default(),
            "lobby",
            backend,
            DiagnosticLog::in_memory(),
        )
    }

    /// Initializes and completes the startup load with `items` at t=0.
    fn started(config: PlaybackConfig, items: Vec<DisplayItem>) -> Board {
        let mut s = scheduler(config);
        s.init(ms(0));
        let ticket = reload_ticket(&mut s).expect("startup reload");
        s.on_reload_complete(ticket, Ok(items), ms(0));
        s
    }

    fn reload_ticket(s: &mut Board) -> Option<ReloadTicket> {
        s.drain_requests().into_iter().map(|EngineRequest::Reload { ticket, .. }| ticket).last()
    }

    fn reload_reasons(s: &mut Board) -> Vec<ReloadReason> {
        s.drain_requests().into_iter().map(|EngineRequest::Reload { reason, .. }| reason).collect()
    }

    fn current_resource(s: &Board) -> ResourceId {
        s.working_set().current().expect("current resource").id
    }

    fn media(s: &mut Board, kind: MediaEventKind, now: u64) {
        let resource = current_resource(s);
        s.on_media_event(MediaEvent { resource, kind }, ms(now));
    }

    fn change(seq: &str) -> ChangeNotification {
        ChangeNotification { seq: seq.into(), doc_id: None, deleted: false }
    }

    fn offline() -> Result<Vec<DisplayItem>, ProviderError> {
        Err(ProviderError::Generic("offline".into()))
    }

    fn two_images() -> Vec<DisplayItem> {
        vec![DisplayItem::image("A", "a.jpg"), DisplayItem::image("B", "b.jpg")]
    }

    fn video_then_image() -> Vec<DisplayItem> {
        vec![DisplayItem::video("V", "v.mp4"), DisplayItem::image("I", "i.jpg")]
    }

    #[test]
    fn image_then_video_timeline() {
        let items = vec![DisplayItem::image("A", "a.jpg"), DisplayItem::video("B", "b.mp4")];
        let mut s = started(config(0), items);

        assert_eq!(s.current_index(), Some(0));
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(5_000)));
        assert_eq!(s.timers().deadline_of(TimerKind::Preload), Some(ms(2_500)));

        s.advance_to(ms(2_499));
        assert_eq!(s.working_set().len(), 1);
        s.advance_to(ms(2_500));
        assert_eq!(s.working_set().len(), 2);
        assert_eq!(s.working_set().next().unwrap().item.id, "B");

        s.advance_to(ms(5_000));
        assert_eq!(s.current_index(), Some(1));
        assert_eq!(s.phase(), Some(SlidePhase::Waiting));
        assert!(!s.timers().is_armed(TimerKind::Duration), "video timer armed before playback");
        assert_eq!(s.working_set().len(), 1);

        media(&mut s, MediaEventKind::Ready, 5_200);
        assert!(!s.timers().is_armed(TimerKind::Duration));
        media(&mut s, MediaEventKind::Started, 5_300);
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(15_300)));

        s.advance_to(ms(15_299));
        assert_eq!(s.current_index(), Some(1));
        s.advance_to(ms(15_300));
        assert_eq!(s.current_index(), Some(0));
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(20_300)));
        assert_eq!(s.watchdog.state().last_transition_at, Some(ms(15_300)));
    }

    #[test]
    fn transition_interval_delays_the_switch() {
        let mut s = started(config(500), two_images());
        s.advance_to(ms(5_000));
        assert_eq!(s.phase(), Some(SlidePhase::Transitioning));
        assert_eq!(s.current_index(), Some(0));
        assert_eq!(s.progress(ms(5_100)), 1.0);
        s.advance_to(ms(5_499));
        assert_eq!(s.current_index(), Some(0));
        s.advance_to(ms(5_500));
        assert_eq!(s.current_index(), Some(1));
        assert_eq!(s.phase(), Some(SlidePhase::Waiting));
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(10_500)));
    }

    #[test]
    fn three_changes_flush_into_one_reload() {
        let mut s = started(config(0), two_images());
        for seq in ["1", "2", "3"] {
            s.notify_change(change(seq));
        }
        assert_eq!(s.pending_changes(), 3);
        assert!(s.status().message.contains("3 change(s) pending"));
        assert!(s.drain_requests().is_empty());

        s.advance_to(ms(5_000));
        assert_eq!(s.pending_changes(), 0);
        assert_eq!(reload_reasons(&mut s), vec![ReloadReason::PendingChanges(3)]);
    }

    #[test]
    fn change_while_idle_reloads_immediately() {
        let mut s = started(config(0), Vec::new());
        assert_eq!(s.state(), &EngineState::Idle);
        assert!(s.next_deadline().is_some(), "watchdog check stays armed");
        s.notify_change(change("9"));
        assert_eq!(s.pending_changes(), 0);
        assert_eq!(reload_reasons(&mut s), vec![ReloadReason::ChangeWhileIdle]);
    }

    #[test]
    fn video_timer_waits_for_started_signal() {
        let mut s = started(config(0), video_then_image());
        assert!(s.status().message.contains("waiting for playback"));
        for t in [100, 1_000, 4_999] {
            s.advance_to(ms(t));
            assert!(!s.timers().is_armed(TimerKind::Duration), "armed at t={}", t);
            assert!(!s.timers().is_armed(TimerKind::Preload));
        }
        media(&mut s, MediaEventKind::Ready, 4_999);
        assert!(!s.timers().is_armed(TimerKind::Duration));
        media(&mut s, MediaEventKind::Started, 4_999);
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(14_999)));
        assert!(!s.timers().is_armed(TimerKind::Readiness));
    }

    #[test]
    fn video_loop_does_not_rearm_duration() {
        let mut s = started(config(0), video_then_image());
        media(&mut s, MediaEventKind::Ready, 100);
        media(&mut s, MediaEventKind::Started, 200);
        media(&mut s, MediaEventKind::Ended, 3_000);
        media(&mut s, MediaEventKind::Ready, 3_010);
        media(&mut s, MediaEventKind::Started, 3_050);
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(10_200)));
        assert_eq!(s.current_index(), Some(0));
        assert_eq!(s.backend().seeks.len(), 1);
    }

    #[test]
    fn readiness_timeout_falls_back_to_image_duration_from_scratch() {
        let mut s = started(config(0), video_then_image());
        s.advance_to(ms(5_000));
        assert_eq!(s.current_index(), Some(0));
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(10_000)));
        // A late start does not re-arm.
        media(&mut s, MediaEventKind::Started, 6_000);
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(10_000)));
        s.advance_to(ms(10_000));
        assert_eq!(s.current_index(), Some(1));
    }

    #[test]
    fn unopenable_video_degrades_immediately() {
        let mut s = scheduler(config(0));
        s.media.backend_mut().fail_create_for.insert("V".into());
        s.init(ms(0));
        let ticket = reload_ticket(&mut s).unwrap();
        s.on_reload_complete(ticket, Ok(video_then_image()), ms(0));
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(5_000)));
    }

    #[test]
    fn single_item_still_transitions() {
        let mut s = started(config(0), vec![DisplayItem::image("only", "only.jpg")]);
        let resource = current_resource(&s);
        s.advance_to(ms(5_000));
        assert_eq!(s.current_index(), Some(0));
        assert_eq!(s.session().unwrap().started_at, ms(5_000));
        assert_eq!(s.watchdog.state().last_transition_at, Some(ms(5_000)));
        assert_eq!(current_resource(&s), resource, "resource reused");
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(10_000)));
    }

    #[test]
    fn config_change_leaves_exactly_one_duration_timer() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..200 {
            let items = (0..4).map(|i| DisplayItem::image(format!("i{}", i), "x.jpg")).collect();
            let mut s = started(config(300), items);
            let at = rng.random_range(0..40_000u64);
            s.advance_to(ms(at));
            let mut next = config(300);
            next.auto_slide_interval_ms = rng.random_range(1_000..4_900);
            if rng.random_bool(0.5) {
                next.play_order = PlayOrder::Random;
                next.shuffle_seed = Some(at);
            }
            s.apply_config(next.clone(), ms(at));
            let timers = s.timers();
            assert_eq!(timers.armed_count(TimerKind::Duration), 1, "config change at t={}", at);
            let expected = ms(at + next.auto_slide_interval_ms);
            assert_eq!(timers.deadline_of(TimerKind::Duration), Some(expected));
            assert!(!timers.is_armed(TimerKind::Transition));
            assert_eq!(s.phase(), Some(SlidePhase::Waiting));
        }
    }

    #[test]
    fn equal_config_is_a_no_op() {
        let mut s = started(config(0), vec![DisplayItem::image("A", "a.jpg")]);
        let generation = s.generation();
        s.apply_config(config(0), ms(1_000));
        assert_eq!(s.generation(), generation);
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(5_000)));
    }

    #[test]
    fn config_change_while_idle_arms_nothing() {
        let mut s = started(config(0), Vec::new());
        let next = PlaybackConfig { auto_slide_interval_ms: 8_000, ..config(0) };
        s.apply_config(next, ms(1_000));
        assert_eq!(s.state(), &EngineState::Idle);
        assert_eq!(s.timers().armed_count(TimerKind::Duration), 0);
        assert!(s.timers().is_armed(TimerKind::WatchdogCheck));
        assert_eq!(s.config().auto_slide_interval_ms, 8_000);
    }

    #[test]
    fn working_set_stays_bounded_under_random_drive() {
        let mut rng = StdRng::seed_from_u64(2024);
        let items: Vec<DisplayItem> = (0..6)
            .map(|i| {
                if i % 2 == 0 {
                    DisplayItem::video(format!("v{}", i), "v.mp4")
                } else {
                    DisplayItem::image(format!("i{}", i), "i.jpg")
                }
            })
            .collect();
        let mut cfg = config(200);
        cfg.play_order = PlayOrder::Random;
        cfg.shuffle_seed = Some(5);
        let mut s = started(cfg, items.clone());
        let mut now = 0u64;

        for step in 0..3_000 {
            match rng.random_range(0..13) {
                0..=4 => {
                    if let Some(deadline) = s.next_deadline() {
                        now = now.max(deadline.as_millis() as u64);
                        s.advance_to(ms(now));
                    }
                }
                5..=7 => {
                    let set = s.working_set();
                    let live: Vec<ResourceId> =
                        set.current().iter().chain(set.next().iter()).map(|r| r.id).collect();
                    if !live.is_empty() {
                        let resource = live[rng.random_range(0..live.len())];
                        let kind = match rng.random_range(0..4) {
                            0 => MediaEventKind::Ready,
                            1 => MediaEventKind::Started,
                            2 => MediaEventKind::Ended,
                            _ => MediaEventKind::Failed("decoder".into()),
                        };
                        s.on_media_event(MediaEvent { resource, kind }, ms(now));
                    }
                }
                8 => s.notify_change(change(&step.to_string())),
                9 | 10 => {
                    let mut next = config(rng.random_range(0..400));
                    next.auto_slide_interval_ms = rng.random_range(1_000..8_000);
                    if rng.random_bool(0.5) {
                        next.play_order = PlayOrder::Random;
                        next.shuffle_seed = Some(rng.random_range(0..4));
                    }
                    s.apply_config(next, ms(now));
                }
                11 => s.request_restart(),
                _ => {
                    if let Some(ticket) = reload_ticket(&mut s) {
                        let result = if rng.random_bool(0.25) {
                            offline()
                        } else {
                            Ok(items[..rng.random_range(0..=items.len())].to_vec())
                        };
                        s.on_reload_complete(ticket, result, ms(now));
                    }
                }
            }

            assert!(s.working_set().len() <= 2, "step {}", step);
            let live = s.backend().live.len();
            assert_eq!(live, s.working_set().len(), "leaked resource at step {}", step);
            let durations = s.timers().armed_count(TimerKind::Duration);
            match s.session() {
                Some(SlideSession { phase: SlidePhase::Waiting, armed: Some(_), .. }) => {
                    assert_eq!(durations, 1, "armed slide without its timer at step {}", step)
                }
                Some(_) => assert!(durations <= 1, "step {}", step),
                None => assert_eq!(durations, 0, "timer without a slide at step {}", step),
            }
            match s.state() {
                EngineState::Error(_) => assert!(
                    s.timers().is_armed(TimerKind::ReloadRetry) || !s.requests.is_empty(),
                    "error state with no way out at step {}",
                    step
                ),
                EngineState::Connecting => {
                    assert!(!s.requests.is_empty(), "connecting without a reload at step {}", step)
                }
                _ => {}
            }
        }
    }

    #[test]
    fn stall_triggers_one_recovery_with_diagnostics() {
        let mut cfg = config(0);
        cfg.auto_slide_interval_ms = 1_000_000;
        let mut s = started(cfg, two_images());

        s.advance_to(ms(179_999));
        assert!(s.diagnostics().is_empty());
        assert_eq!(s.state(), &EngineState::Playing);

        s.advance_to(ms(180_000));
        assert_eq!(s.diagnostics().len(), 1);
        let record = &s.diagnostics()[0];
        assert_eq!(record.stalled_for_ms, 180_000);
        assert_eq!(record.current_item_id.as_deref(), Some("A"));
        assert_eq!(record.item_count, 2);
        assert_eq!(record.client_id, "lobby");
        assert_eq!(s.state(), &EngineState::Connecting);
        assert!(s.working_set().is_empty());
        assert_eq!(reload_reasons(&mut s), vec![ReloadReason::Restart]);

        s.advance_to(ms(600_000));
        assert_eq!(s.diagnostics().len(), 1, "fired twice for one stall");
    }

    #[test]
    fn startup_failure_is_blocking_and_retries() {
        let mut s = scheduler(config(0));
        s.init(ms(0));
        let ticket = reload_ticket(&mut s).unwrap();
        s.on_reload_complete(ticket, offline(), ms(0));
        assert!(matches!(s.state(), EngineState::Error(_)));
        assert_eq!(s.current_index(), None);

        s.advance_to(ms(9_999));
        assert!(s.drain_requests().is_empty());
        s.advance_to(ms(10_000));
        let retry = reload_ticket(&mut s).expect("retry requested");
        s.on_reload_complete(retry, Ok(vec![DisplayItem::image("A", "a.jpg")]), ms(10_000));
        assert_eq!(s.state(), &EngineState::Playing);
    }

    #[test]
    fn config_change_during_startup_failure_keeps_retrying() {
        let mut s = scheduler(config(0));
        s.init(ms(0));
        let ticket = reload_ticket(&mut s).unwrap();
        s.on_reload_complete(ticket, offline(), ms(0));

        let next = PlaybackConfig { auto_slide_interval_ms: 8_000, ..config(0) };
        s.apply_config(next, ms(1_000));
        assert!(matches!(s.state(), EngineState::Error(_)));
        assert_eq!(s.timers().deadline_of(TimerKind::ReloadRetry), Some(ms(10_000)));

        s.advance_to(ms(10_000));
        let requests = s.drain_requests();
        let [EngineRequest::Reload { ticket, reason }] = requests.as_slice() else {
            panic!("expected one retry, got {:?}", requests);
        };
        assert_eq!(reason, &ReloadReason::Retry);
        s.on_reload_complete(*ticket, Ok(two_images()), ms(10_000));
        assert_eq!(s.state(), &EngineState::Playing);
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(18_000)));
    }

    #[test]
    fn failure_while_playing_keeps_playlist() {
        let mut s = started(config(0), two_images());
        s.notify_change(change("1"));
        s.advance_to(ms(5_000));
        let ticket = reload_ticket(&mut s).unwrap();
        s.on_reload_complete(ticket, Err(ProviderError::NotFound("lobby".into())), ms(5_100));
        assert_eq!(s.state(), &EngineState::Playing);
        assert_eq!(s.current_index(), Some(1));
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(10_000)));
    }

    #[test]
    fn stale_reload_is_ignored() {
        let mut s = started(config(0), vec![DisplayItem::image("A", "a.jpg")]);
        s.notify_change(change("1"));
        s.advance_to(ms(5_000));
        let old = reload_ticket(&mut s).unwrap();
        s.notify_change(change("2"));
        s.advance_to(ms(10_000));
        let newer = reload_ticket(&mut s).unwrap();
        assert!(newer > old);

        s.on_reload_complete(old, Ok(Vec::new()), ms(10_050));
        assert_eq!(s.state(), &EngineState::Playing);
        s.on_reload_complete(newer, Ok(Vec::new()), ms(10_060));
        assert_eq!(s.state(), &EngineState::Idle);
        assert!(s.working_set().is_empty());
        assert!(!s.timers().is_armed(TimerKind::Duration));
    }

    #[test]
    fn reload_resumes_current_item_and_keeps_its_resource() {
        let a = DisplayItem::image("A", "a.jpg");
        let b = DisplayItem::video("B", "b.mp4");
        let mut s = started(config(0), vec![a.clone(), b.clone()]);
        s.notify_change(change("1"));
        s.advance_to(ms(5_000));
        assert_eq!(s.current_index(), Some(1));
        media(&mut s, MediaEventKind::Ready, 5_100);
        media(&mut s, MediaEventKind::Started, 5_200);
        let resource = current_resource(&s);

        let ticket = reload_ticket(&mut s).unwrap();
        let c = DisplayItem::image("C", "c.jpg");
        s.on_reload_complete(ticket, Ok(vec![c, b, a]), ms(5_300));
        assert_eq!(s.current_index(), Some(1));
        assert_eq!(s.session().unwrap().item_id, "B");
        assert_eq!(current_resource(&s), resource);
        // Already playing, so the timer restarts from the reload.
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(15_300)));
    }

    #[test]
    fn restart_request_waits_for_the_transition_boundary() {
        let mut s = started(config(0), two_images());
        s.notify_change(change("1"));
        s.advance_to(ms(1_000));
        s.request_restart();
        assert!(s.status().message.contains("restart pending"));
        assert!(s.drain_requests().is_empty());

        s.advance_to(ms(4_999));
        assert_eq!(s.state(), &EngineState::Playing);
        assert_eq!(s.working_set().len(), 2);

        s.advance_to(ms(5_000));
        assert_eq!(s.state(), &EngineState::Connecting);
        assert_eq!(s.current_index(), None);
        assert!(s.working_set().is_empty());
        assert!(s.backend().live.is_empty());
        assert_eq!(s.pending_changes(), 0);
        assert!(!s.timers().is_armed(TimerKind::Duration));
        // The restart supersedes the queued change.
        assert_eq!(reload_reasons(&mut s), vec![ReloadReason::RestartRequested]);

        s.request_restart();
        assert_eq!(reload_reasons(&mut s), vec![ReloadReason::RestartRequested]);
        let ticket = s.latest_ticket;
        s.on_reload_complete(ticket, Ok(two_images()), ms(5_200));
        assert_eq!(s.current_index(), Some(0));
        assert_eq!(s.timers().deadline_of(TimerKind::Duration), Some(ms(10_200)));
        assert!(!s.status().message.contains("restart pending"));
    }

    #[test]
    fn restart_request_with_nothing_on_screen_reloads_now() {
        let mut s = started(config(0), Vec::new());
        s.request_restart();
        assert_eq!(s.state(), &EngineState::Connecting);
        assert_eq!(reload_reasons(&mut s), vec![ReloadReason::RestartRequested]);
    }

    #[test]
    fn random_order_visits_every_item_per_cycle() {
        let mut cfg = config(0);
        cfg.play_order = PlayOrder::Random;
        cfg.shuffle_seed = Some(17);
        let items = (0..5).map(|i| DisplayItem::image(format!("i{}", i), "x.jpg")).collect();
        let mut s = started(cfg, items);
        let mut seen = vec![s.current_index().unwrap()];
        for k in 1..=4u64 {
            s.advance_to(ms(5_000 * k));
            seen.push(s.current_index().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        // Preloading the wrap precomputed the next cycle.
        s.advance_to(ms(22_500));
        assert!(s.playlist().state().precomputed_next_permutation.is_some());
    }

    #[test]
    fn dispose_releases_everything() {
        let items = vec![DisplayItem::image("A", "a.jpg"), DisplayItem::video("B", "b.mp4")];
        let mut s = started(config(0), items);
        s.advance_to(ms(2_500));
        assert_eq!(s.working_set().len(), 2);
        s.dispose();
        assert!(s.working_set().is_empty());
        assert!(s.backend().live.is_empty());
        assert!(s.timers().is_empty());
        assert_eq!(s.next_deadline(), None);
    }
}
