//! Single-shot timers on an engine-relative clock.
//!
//! Deadlines are `Duration`s measured from the engine's origin instant, so the
//! scheduler can be driven by a real tokio clock or by a test that simply passes
//! increasing `now` values. Each timer kind is armed at most once: arming a kind
//! that is already armed cancels the old entry first.

use std::time::Duration;
use log::trace;

/// Scheduler reset counter. Timers armed under an older generation are stale.
pub type Generation = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Slide display duration.
    Duration,
    /// Preload of the slide after the current one.
    Preload,
    /// Transition animation between two slides.
    Transition,
    /// Deadline for the active video to start playing.
    Readiness,
    /// Retry of a failed item-list load.
    ReloadRetry,
    /// Periodic liveness check.
    WatchdogCheck,
}

impl TimerKind {
    /// Timers that belong to the current slide and die on every reset.
    pub fn is_slide_timer(self) -> bool {
        matches!(
            self,
            TimerKind::Duration | TimerKind::Preload | TimerKind::Transition | TimerKind::Readiness
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// A timer that has come due.
#[derive(Clone, Copy, Debug)]
pub struct FiredTimer {
    pub id: TimerId,
    pub kind: TimerKind,
    pub deadline: Duration,
    /// `None` for timers that survive resets (watchdog check, reload retry).
    pub generation: Option<Generation>,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: Vec<FiredTimer>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `kind` to fire at `deadline`, cancelling any pending timer of the same kind.
    pub fn arm(
        &mut self,
        kind: TimerKind,
        deadline: Duration,
        generation: Option<Generation>,
    ) -> TimerId {
        if self.cancel(kind) {
            trace!("Re-arming {:?}: previous timer cancelled", kind);
        }
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.push(FiredTimer { id, kind, deadline, generation });
        trace!(
            "Armed {:?} ({:?}) for t={}ms, generation {:?}",
            kind,
            id,
            deadline.as_millis(),
            generation
        );
        id
    }

    /// Cancels the pending timer of `kind`. Returns whether one was pending.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        let before = self.entries.len();
        self.entries.retain(|t| t.kind != kind);
        before != self.entries.len()
    }

    /// Cancels every slide-scoped timer. Returns how many were pending.
    pub fn cancel_slide_timers(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|t| !t.kind.is_slide_timer());
        before - self.entries.len()
    }

    pub fn cancel_all(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.entries.iter().any(|t| t.kind == kind)
    }

    pub fn armed_count(&self, kind: TimerKind) -> usize {
        self.entries.iter().filter(|t| t.kind == kind).count()
    }

    pub fn deadline_of(&self, kind: TimerKind) -> Option<Duration> {
        self.entries.iter().find(|t| t.kind == kind).map(|t| t.deadline)
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.entries.iter().map(|t| t.deadline).min()
    }

    /// Removes and returns the earliest timer due at `now`. Ties fire in arming order.
    pub fn pop_due(&mut self, now: Duration) -> Option<FiredTimer> {
        let pos = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, t)| t.deadline <= now)
            .min_by_key(|(_, t)| (t.deadline, t.id))
            .map(|(i, _)| i)?;
        Some(self.entries.swap_remove(pos))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn rearming_a_kind_replaces_it() {
        let mut q = TimerQueue::new();
        q.arm(TimerKind::Duration, ms(5_000), Some(1));
        q.arm(TimerKind::Duration, ms(9_000), Some(2));
        assert_eq!(q.armed_count(TimerKind::Duration), 1);
        assert_eq!(q.deadline_of(TimerKind::Duration), Some(ms(9_000)));
    }

    #[test]
    fn pops_in_deadline_then_arming_order() {
        let mut q = TimerQueue::new();
        q.arm(TimerKind::Duration, ms(100), Some(1));
        q.arm(TimerKind::Preload, ms(50), Some(1));
        q.arm(TimerKind::WatchdogCheck, ms(100), None);

        assert!(q.pop_due(ms(49)).is_none());
        assert_eq!(q.pop_due(ms(200)).map(|t| t.kind), Some(TimerKind::Preload));
        assert_eq!(q.pop_due(ms(200)).map(|t| t.kind), Some(TimerKind::Duration));
        assert_eq!(q.pop_due(ms(200)).map(|t| t.kind), Some(TimerKind::WatchdogCheck));
        assert!(q.is_empty());
    }

    #[test]
    fn slide_cancellation_keeps_watchdog_and_retry() {
        let mut q = TimerQueue::new();
        q.arm(TimerKind::Duration, ms(1), Some(1));
        q.arm(TimerKind::Preload, ms(1), Some(1));
        q.arm(TimerKind::Readiness, ms(1), Some(1));
        q.arm(TimerKind::ReloadRetry, ms(1), Some(1));
        q.arm(TimerKind::WatchdogCheck, ms(1), None);
        assert_eq!(q.cancel_slide_timers(), 3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.next_deadline(), Some(ms(1)));
    }
}
