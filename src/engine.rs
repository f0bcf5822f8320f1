//! Tokio runtime around the [`SlideScheduler`].
//!
//! One task owns the scheduler and runs the event loop: it sleeps until the
//! earliest timer deadline or until an [`EngineEvent`] arrives, whichever comes
//! first. Everything else (the changes feed, media backends, signal handlers)
//! talks to the engine through an [`EngineHandle`], so no handler ever runs
//! concurrently with another. Item reloads are spawned as separate tasks and come
//! back as `ReloadFinished` events tagged with their ticket.

use super::config::{PlaybackConfig, WatchdogConfig};
use super::diagnostics::DiagnosticLog;
use super::errors::ProviderError;
use super::media_manager::{MediaBackend, MediaEvent};
use super::model::{ChangeNotification, DisplayItem};
use super::provider::ItemProvider;
use super::scheduler::{EngineRequest, EngineStatus, ReloadReason, ReloadTicket, SlideScheduler};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

#[derive(Debug)]
pub enum EngineEvent {
    Media(MediaEvent),
    Change(ChangeNotification),
    ConfigChanged(PlaybackConfig),
    /// Full restart at the next transition boundary.
    RestartRequested,
    ReloadFinished { ticket: ReloadTicket, result: Result<Vec<DisplayItem>, ProviderError> },
    Shutdown,
}

/// Lets a [`MediaBackend`] report lifecycle events back to the engine.
#[derive(Clone, Debug)]
pub struct MediaEventSender {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl MediaEventSender {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: MediaEvent) {
        if self.tx.send(EngineEvent::Media(event)).is_err() {
            trace!("Engine stopped; media event dropped");
        }
    }
}

/// Cloneable entry point into a running engine.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
    status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    pub fn notify_change(&self, change: ChangeNotification) {
        self.post(EngineEvent::Change(change));
    }

    pub fn update_config(&self, config: PlaybackConfig) {
        self.post(EngineEvent::ConfigChanged(config));
    }

    pub fn media_event(&self, event: MediaEvent) {
        self.post(EngineEvent::Media(event));
    }

    pub fn request_restart(&self) {
        self.post(EngineEvent::RestartRequested);
    }

    pub fn shutdown(&self) {
        self.post(EngineEvent::Shutdown);
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    fn post(&self, event: EngineEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!("Engine is not running; dropped {:?}", e.0);
        }
    }
}

pub struct Engine<P, B> {
    scheduler: SlideScheduler<B>,
    provider: Arc<P>,
    tx: mpsc::UnboundedSender<EngineEvent>,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    status_tx: watch::Sender<EngineStatus>,
    epoch: Instant,
    initialized: bool,
}

impl<P, B> Engine<P, B>
where
    P: ItemProvider,
    B: MediaBackend,
{
    /// Builds the engine. `backend_factory` receives the sender the backend uses to
    /// report media events.
    pub fn new<F>(
        config: PlaybackConfig,
        watchdog: WatchdogConfig,
        client_id: impl Into<String>,
        provider: P,
        backend_factory: F,
    ) -> Self
    where
        F: FnOnce(MediaEventSender) -> B,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = backend_factory(MediaEventSender { tx: tx.clone() });
        let diagnostics = match &watchdog.diagnostics_path {
            Some(path) => DiagnosticLog::open(path),
            None => DiagnosticLog::in_memory(),
        };
        let scheduler = SlideScheduler::new(config, watchdog, client_id, backend, diagnostics);
        let (status_tx, _) = watch::channel(scheduler.status());
        Self {
            scheduler,
            provider: Arc::new(provider),
            tx,
            rx,
            status_tx,
            epoch: Instant::now(),
            initialized: false,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle { tx: self.tx.clone(), status: self.status_tx.subscribe() }
    }

    pub fn scheduler(&self) -> &SlideScheduler<B> {
        &self.scheduler
    }

    /// Arms the watchdog and starts the first item load.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        let now = self.now();
        self.scheduler.init(now);
        self.after_handler();
    }

    /// Cancels every timer and releases every resource.
    pub fn dispose(&mut self) {
        self.scheduler.dispose();
        self.publish_status();
    }

    /// Runs until [`EngineHandle::shutdown`] is called, then disposes.
    pub async fn run(mut self) {
        self.init();
        info!("Engine running");
        loop {
            let wake = self.scheduler.next_deadline().map(|d| self.epoch + d);
            let sleep = async move {
                match wake {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = sleep => {
                    let now = self.now();
                    self.scheduler.advance_to(now);
                }
                event = self.rx.recv() => {
                    match event {
                        Some(EngineEvent::Shutdown) | None => break,
                        Some(event) => self.handle_event(event),
                    }
                }
            }
            self.after_handler();
        }
        info!("Engine shutting down");
        self.dispose();
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn handle_event(&mut self, event: EngineEvent) {
        let now = self.now();
        // Overdue timers go first so events see the state they were raised against.
        self.scheduler.advance_to(now);
        match event {
            EngineEvent::Media(event) => self.scheduler.on_media_event(event, now),
            EngineEvent::Change(change) => self.scheduler.notify_change(change),
            EngineEvent::ConfigChanged(config) => self.scheduler.apply_config(config, now),
            EngineEvent::RestartRequested => self.scheduler.request_restart(),
            EngineEvent::ReloadFinished { ticket, result } => {
                self.scheduler.on_reload_complete(ticket, result, now)
            }
            EngineEvent::Shutdown => {}
        }
    }

    fn after_handler(&mut self) {
        for request in self.scheduler.drain_requests() {
            match request {
                EngineRequest::Reload { ticket, reason } => self.spawn_reload(ticket, reason),
            }
        }
        self.publish_status();
    }

    fn spawn_reload(&self, ticket: ReloadTicket, reason: ReloadReason) {
        let provider = Arc::clone(&self.provider);
        let tx = self.tx.clone();
        debug!("Spawning reload #{} ({:?})", ticket, reason);
        tokio::spawn(async move {
            let result = provider.fetch_items().await;
            if tx.send(EngineEvent::ReloadFinished { ticket, result }).is_err() {
                trace!("Engine stopped before reload #{} finished", ticket);
            }
        });
    }

    fn publish_status(&self) {
        let status = self.scheduler.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}
