//! Buffers change notifications until a transition boundary.
//!
//! Reloading the item list mid-slide would cut the slide short, so notifications
//! are queued while something is on screen and collapsed into a single reload when
//! the scheduler reaches the next boundary. A restart request (a new deployment)
//! waits for the same boundary and takes precedence over queued changes.

use super::model::ChangeNotification;
use std::collections::VecDeque;
use log::{debug, info};

#[derive(Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Nothing is on screen; reload right away.
    ReloadNow,
    /// Queued; carries the new queue length.
    Queued(usize),
}

#[derive(Debug, Default)]
pub struct UpdateCoordinator {
    pending: VecDeque<ChangeNotification>,
    restart_requested: bool,
}

impl UpdateCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&mut self, change: ChangeNotification, playlist_empty: bool) -> NotifyOutcome {
        if playlist_empty {
            info!("Change {} arrived with nothing on screen; reloading immediately", change.seq);
            return NotifyOutcome::ReloadNow;
        }
        self.pending.push_back(change);
        debug!("Change queued until the next transition ({} pending)", self.pending.len());
        NotifyOutcome::Queued(self.pending.len())
    }

    pub fn request_restart(&mut self) {
        if !self.restart_requested {
            info!("Restart queued until the next transition");
        }
        self.restart_requested = true;
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_requested
    }

    /// Consumes a queued restart request.
    pub fn take_restart(&mut self) -> bool {
        std::mem::take(&mut self.restart_requested)
    }

    /// Drains the queue. Returns how many changes were pending, or `None` when there
    /// is nothing to apply. The caller triggers exactly one reload for `Some`.
    pub fn flush(&mut self) -> Option<usize> {
        if self.pending.is_empty() {
            return None;
        }
        let count = self.pending.len();
        self.pending.clear();
        info!("Applying {} pending change(s) at transition boundary", count);
        Some(count)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.restart_requested = false;
    }
}
