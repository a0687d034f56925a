// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Utc};
use tokio::time::Duration;
use tracing::trace;

use super::scheduler::{Scheduler, TimerHandle};

/// The result of trying to restore a value persisted by a previous run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RestoreOutcome {
    /// Nothing was restored. Either expiration isn't enabled, a timer was already running, or
    /// the stored value would have expired already.
    Skipped,

    /// The value was restored, and will expire after the remaining time.
    Restored { remaining: Duration },
}

/// A single value that becomes stale if it isn't refreshed within a timeout.
///
/// The cell never clears its value on expiry, it only records that the value is no longer
/// trustworthy. At most one timer is outstanding at a time, and it is always owned by the
/// cell's [Scheduler].
#[derive(Debug)]
pub(crate) struct ExpiringValueCell<V, S> {
    value: Option<V>,
    last_changed_at: Option<DateTime<Utc>>,
    expire_after: Option<Duration>,
    /// `None` when expiration is disabled.
    is_expired: Option<bool>,
    pending_timer: Option<TimerHandle>,
    scheduler: S,
}

impl<V, S> ExpiringValueCell<V, S>
where
    S: Scheduler,
{
    /// Create a new, empty cell.
    ///
    /// A zero `expire_after` disables expiration the same as `None`. With expiration enabled the
    /// cell starts out expired, as there isn't a value yet.
    pub(crate) fn new(expire_after: Option<Duration>, scheduler: S) -> Self {
        let expire_after = expire_after.filter(|timeout| *timeout > Duration::ZERO);
        Self {
            value: None,
            last_changed_at: None,
            expire_after,
            is_expired: expire_after.map(|_| true),
            pending_timer: None,
            scheduler,
        }
    }

    pub(crate) fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub(crate) fn last_changed_at(&self) -> Option<DateTime<Utc>> {
        self.last_changed_at
    }

    #[cfg(test)]
    pub(crate) fn expire_after(&self) -> Option<Duration> {
        self.expire_after
    }

    pub(crate) fn is_expired(&self) -> Option<bool> {
        self.is_expired
    }

    pub(crate) fn pending_timer(&self) -> Option<TimerHandle> {
        self.pending_timer
    }

    /// Restore a value from a previous run.
    ///
    /// This has to happen before any live update is accepted. The stored value is only brought
    /// back if there is still time left before it would have expired, and the timer is resumed
    /// for just that remaining time.
    pub(crate) fn restore(
        &mut self,
        last_value: V,
        last_changed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RestoreOutcome {
        if self.pending_timer.is_some() {
            return RestoreOutcome::Skipped;
        }
        let expire_after = match self.expire_after {
            Some(expire_after) => expire_after,
            None => return RestoreOutcome::Skipped,
        };
        let remaining = chrono::Duration::from_std(expire_after)
            .ok()
            .and_then(|timeout| last_changed_at.checked_add_signed(timeout))
            // A negative remaining time fails the conversion back to std
            .and_then(|expires_at| (expires_at - now).to_std().ok());
        let remaining = match remaining {
            Some(remaining) if remaining > Duration::ZERO => remaining,
            _ => return RestoreOutcome::Skipped,
        };
        self.value = Some(last_value);
        self.last_changed_at = Some(last_changed_at);
        self.is_expired = Some(false);
        self.pending_timer = Some(self.scheduler.schedule_after(remaining));
        RestoreOutcome::Restored { remaining }
    }

    /// Replace the value with a newly received one, restarting the expiration timer.
    pub(crate) fn accept_update(&mut self, new_value: V, now: DateTime<Utc>) {
        self.value = Some(new_value);
        self.last_changed_at = Some(now);
        self.reschedule();
    }

    /// Mark the current value as fresh again without replacing it.
    ///
    /// Used when a message arrived but no value could be extracted from it. Receiving anything
    /// still proves the source is alive.
    pub(crate) fn refresh(&mut self) {
        self.reschedule();
    }

    fn reschedule(&mut self) {
        if let Some(expire_after) = self.expire_after {
            self.is_expired = Some(false);
            if let Some(previous) = self.pending_timer.take() {
                self.scheduler.cancel(previous);
            }
            self.pending_timer = Some(self.scheduler.schedule_after(expire_after));
        }
    }

    /// Deliver a fired timer to this cell.
    ///
    /// Only the currently pending timer expires the value. Anything else was cancelled or
    /// superseded, and is ignored. Returns whether the value was expired by this call.
    pub(crate) fn fire(&mut self, handle: TimerHandle) -> bool {
        if self.pending_timer == Some(handle) {
            self.expire_now();
            true
        } else {
            trace!(%handle, pending = ?self.pending_timer, "ignoring stale timer");
            false
        }
    }

    fn expire_now(&mut self) {
        self.pending_timer = None;
        self.is_expired = Some(true);
    }

    /// Cancel any pending timer.
    ///
    /// The staleness flag is left as it is, so a final save still sees whether the value had
    /// expired. Safe to call more than once.
    pub(crate) fn dispose(&mut self) {
        if let Some(pending) = self.pending_timer.take() {
            self.scheduler.cancel(pending);
        }
    }

    /// Combine an external availability signal with this cell's staleness.
    pub(crate) fn is_available(&self, base_available: bool) -> bool {
        base_available && (self.expire_after.is_none() || self.is_expired != Some(true))
    }
}

#[cfg(test)]
mod test {
    use chrono::{DateTime, TimeZone, Utc};
    use tokio::time::Duration;

    use super::{ExpiringValueCell, RestoreOutcome};
    use crate::expiry::ManualScheduler;

    type Cell = ExpiringValueCell<&'static str, ManualScheduler>;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap()
    }

    fn at(seconds: u64) -> DateTime<Utc> {
        epoch() + chrono::Duration::seconds(seconds as i64)
    }

    fn secs(seconds: u64) -> Duration {
        Duration::from_secs(seconds)
    }

    fn new_cell(expire_after: Option<u64>) -> (Cell, ManualScheduler) {
        let scheduler = ManualScheduler::default();
        let cell = Cell::new(expire_after.map(secs), scheduler.clone());
        (cell, scheduler)
    }

    /// Advance the virtual clock and deliver everything that fired to the cell.
    fn run_until(cell: &mut Cell, scheduler: &ManualScheduler, seconds: u64) -> usize {
        scheduler
            .advance(secs(seconds))
            .into_iter()
            .filter(|handle| cell.fire(*handle))
            .count()
    }

    #[test]
    fn construction() {
        let (cell, scheduler) = new_cell(Some(30));
        assert_eq!(cell.is_expired(), Some(true));
        assert_eq!(cell.value(), None);
        assert_eq!(scheduler.pending(), 0);

        let (cell, _) = new_cell(None);
        assert_eq!(cell.is_expired(), None);

        // Zero is the same as disabled
        let (cell, _) = new_cell(Some(0));
        assert_eq!(cell.is_expired(), None);
        assert_eq!(cell.expire_after(), None);
    }

    #[test]
    fn disabled_never_tracks_expiry() {
        let (mut cell, scheduler) = new_cell(None);
        for base in [true, false] {
            assert_eq!(cell.is_available(base), base);
        }
        cell.accept_update("1", at(0));
        cell.accept_update("2", at(5));
        assert_eq!(cell.is_expired(), None);
        assert_eq!(cell.pending_timer(), None);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(cell.value(), Some(&"2"));
        assert_eq!(cell.last_changed_at(), Some(at(5)));
        cell.dispose();
        assert_eq!(cell.is_expired(), None);
        for base in [true, false] {
            assert_eq!(cell.is_available(base), base);
        }
    }

    #[test]
    fn update_reschedules_single_timer() {
        let (mut cell, scheduler) = new_cell(Some(30));
        cell.accept_update("a", at(0));
        assert_eq!(cell.is_expired(), Some(false));
        assert_eq!(scheduler.pending(), 1);
        let first = cell.pending_timer().unwrap();

        scheduler.advance(secs(10));
        cell.accept_update("b", at(10));
        assert_eq!(scheduler.pending(), 1);
        let second = cell.pending_timer().unwrap();
        assert_ne!(first, second);
        assert_eq!(scheduler.deadline(second), Some(secs(40)));

        // Only the second timer fires, and only once
        assert_eq!(run_until(&mut cell, &scheduler, 100), 1);
        assert!(!cell.fire(first));
        assert!(!cell.fire(second));
    }

    #[test]
    fn expiry_keeps_value() {
        let (mut cell, scheduler) = new_cell(Some(30));
        cell.accept_update("22.5", at(0));
        assert!(cell.is_available(true));
        assert_eq!(run_until(&mut cell, &scheduler, 30), 1);
        assert_eq!(cell.is_expired(), Some(true));
        assert_eq!(cell.pending_timer(), None);
        assert_eq!(cell.value(), Some(&"22.5"));
        assert!(!cell.is_available(true));
        // Base unavailability always wins
        assert!(!cell.is_available(false));
    }

    #[test]
    fn restore_within_window() {
        let (mut cell, scheduler) = new_cell(Some(60));
        // Last changed 20 seconds before "now"
        let outcome = cell.restore("restored", at(0), at(20));
        assert_eq!(
            outcome,
            RestoreOutcome::Restored {
                remaining: secs(40)
            }
        );
        assert_eq!(cell.is_expired(), Some(false));
        assert_eq!(cell.value(), Some(&"restored"));
        assert_eq!(cell.last_changed_at(), Some(at(0)));
        let handle = cell.pending_timer().unwrap();
        assert_eq!(scheduler.deadline(handle), Some(secs(40)));

        assert_eq!(run_until(&mut cell, &scheduler, 39), 0);
        assert_eq!(cell.is_expired(), Some(false));
        assert_eq!(run_until(&mut cell, &scheduler, 40), 1);
        assert_eq!(cell.is_expired(), Some(true));
    }

    #[test]
    fn restore_after_window() {
        let (mut cell, scheduler) = new_cell(Some(60));
        assert_eq!(cell.restore("old", at(0), at(60)), RestoreOutcome::Skipped);
        assert_eq!(cell.restore("old", at(0), at(3600)), RestoreOutcome::Skipped);
        assert_eq!(cell.is_expired(), Some(true));
        assert_eq!(cell.value(), None);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn restore_preconditions() {
        let (mut cell, scheduler) = new_cell(None);
        assert_eq!(cell.restore("v", at(0), at(1)), RestoreOutcome::Skipped);
        assert_eq!(cell.value(), None);
        assert_eq!(scheduler.pending(), 0);

        // A live update got in first
        let (mut cell, scheduler) = new_cell(Some(60));
        cell.accept_update("live", at(10));
        assert_eq!(cell.restore("stale", at(0), at(10)), RestoreOutcome::Skipped);
        assert_eq!(cell.value(), Some(&"live"));
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn dispose_cancels_timer() {
        let (mut cell, scheduler) = new_cell(Some(30));
        cell.accept_update("22.5", at(0));
        scheduler.advance(secs(5));
        let handle = cell.pending_timer().unwrap();
        cell.dispose();
        assert_eq!(cell.pending_timer(), None);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(run_until(&mut cell, &scheduler, 31), 0);
        assert!(!cell.fire(handle));
        assert_eq!(cell.is_expired(), Some(false));
        assert_eq!(cell.value(), Some(&"22.5"));
        // Idempotent
        cell.dispose();
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(cell.is_expired(), Some(false));
    }

    #[test]
    fn dispose_keeps_expired_flag() {
        let (mut cell, scheduler) = new_cell(Some(30));
        cell.accept_update("22.5", at(0));
        assert_eq!(run_until(&mut cell, &scheduler, 30), 1);
        cell.dispose();
        assert_eq!(cell.is_expired(), Some(true));
        assert!(!cell.is_available(true));

        // Nothing received yet
        let (mut cell, _) = new_cell(Some(30));
        cell.dispose();
        assert_eq!(cell.is_expired(), Some(true));
    }

    #[test]
    fn refresh_keeps_value_and_reschedules() {
        let (mut cell, scheduler) = new_cell(Some(30));
        cell.accept_update("7", at(0));
        assert_eq!(run_until(&mut cell, &scheduler, 30), 1);
        assert_eq!(cell.is_expired(), Some(true));
        scheduler.advance(secs(40));
        cell.refresh();
        assert_eq!(cell.is_expired(), Some(false));
        assert_eq!(cell.value(), Some(&"7"));
        assert_eq!(cell.last_changed_at(), Some(at(0)));
        let handle = cell.pending_timer().unwrap();
        assert_eq!(scheduler.deadline(handle), Some(secs(70)));
    }

    #[test]
    fn rescheduled_update_scenario() {
        let (mut cell, scheduler) = new_cell(Some(60));
        cell.accept_update("10", at(0));
        assert_eq!(cell.is_expired(), Some(false));

        assert_eq!(run_until(&mut cell, &scheduler, 30), 0);
        cell.accept_update("12", at(30));
        let handle = cell.pending_timer().unwrap();
        assert_eq!(scheduler.deadline(handle), Some(secs(90)));

        assert_eq!(run_until(&mut cell, &scheduler, 61), 0);
        assert_eq!(cell.is_expired(), Some(false));
        assert_eq!(run_until(&mut cell, &scheduler, 90), 1);
        assert_eq!(cell.is_expired(), Some(true));
        assert_eq!(cell.value(), Some(&"12"));
    }
}
