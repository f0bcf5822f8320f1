//! Liveness monitor for slide transitions.
//!
//! If nothing has transitioned for `recovery_threshold`, the cause is outside the
//! engine's reach (a wedged player, a hung request), so the scheduler gives up on
//! the session and restarts from scratch. The watchdog fires once per stall
//! episode; a new episode starts with the next recorded transition.

use super::config::WatchdogConfig;
use std::time::Duration;
use log::{trace, warn};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WatchdogState {
    /// Engine-relative time of the last completed transition. `None` while nothing plays.
    pub last_transition_at: Option<Duration>,
}

#[derive(Debug, PartialEq)]
pub enum WatchdogVerdict {
    Healthy,
    Warning { stalled_for: Duration },
    Recover { stalled_for: Duration },
}

#[derive(Debug)]
pub struct Watchdog {
    config: WatchdogConfig,
    state: WatchdogState,
    /// `last_transition_at` of the episode that already triggered recovery.
    tripped_episode: Option<Duration>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self { config, state: WatchdogState::default(), tripped_episode: None }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.config.check_interval_ms)
    }

    pub fn state(&self) -> &WatchdogState {
        &self.state
    }

    pub fn record_transition(&mut self, now: Duration) {
        trace!("Watchdog: transition at t={}ms", now.as_millis());
        self.state.last_transition_at = Some(now);
        self.tripped_episode = None;
    }

    /// Stops monitoring until the next transition (nothing on screen).
    pub fn suspend(&mut self) {
        self.state.last_transition_at = None;
    }

    pub fn check(&mut self, now: Duration) -> WatchdogVerdict {
        let Some(last) = self.state.last_transition_at else {
            return WatchdogVerdict::Healthy;
        };
        if self.tripped_episode == Some(last) {
            return WatchdogVerdict::Healthy;
        }
        let stalled_for = now.saturating_sub(last);
        if stalled_for >= Duration::from_millis(self.config.recovery_threshold_ms) {
            self.tripped_episode = Some(last);
            WatchdogVerdict::Recover { stalled_for }
        } else if stalled_for >= Duration::from_millis(self.config.warning_threshold_ms) {
            warn!("No slide transition for {}ms", stalled_for.as_millis());
            WatchdogVerdict::Warning { stalled_for }
        } else {
            WatchdogVerdict::Healthy
        }
    }
}
