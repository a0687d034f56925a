// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::trace;

/// An opaque token for a single scheduled timer.
///
/// Handles are only unique within the scheduler that issued them.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct TimerHandle(u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Something that can run a callback after a delay, and cancel it before then.
///
/// The callback itself is implied by the scheduler: whoever owns the scheduler decides where a
/// fired timer is delivered. A scheduler must deliver each handle at most once, and must not
/// deliver a handle that was cancelled before it fired.
pub(crate) trait Scheduler {
    fn schedule_after(&mut self, delay: Duration) -> TimerHandle;

    fn cancel(&mut self, handle: TimerHandle);
}

/// The event sent back to the service loop when a [TokioScheduler] timer elapses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TimerFired {
    /// The index of the sensor that owns the timer.
    pub(crate) sensor: usize,

    pub(crate) handle: TimerHandle,
}

/// A [Scheduler] backed by spawned tokio tasks.
///
/// Each timer is a task sleeping for the requested delay, after which it sends a [TimerFired]
/// over the channel. The timer tasks never touch sensor state themselves, so the expiry is always
/// handled on the task that drains the channel.
#[derive(Debug)]
pub(crate) struct TokioScheduler {
    sensor: usize,
    sender: mpsc::UnboundedSender<TimerFired>,
    next_id: u64,
    timers: HashMap<TimerHandle, JoinHandle<()>>,
}

impl TokioScheduler {
    pub(crate) fn new(sensor: usize, sender: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            sensor,
            sender,
            next_id: 0,
            timers: HashMap::new(),
        }
    }

    /// The number of timers that have not fired or been cancelled yet.
    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.timers
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&mut self, delay: Duration) -> TimerHandle {
        // Forget about timers that have already run
        self.timers.retain(|_, task| !task.is_finished());
        let handle = TimerHandle(self.next_id);
        self.next_id += 1;
        let event = TimerFired {
            sensor: self.sensor,
            handle,
        };
        let sender = self.sender.clone();
        // The deadline is fixed now, not when the task first runs.
        let deadline = Instant::now() + delay;
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            // The receiver is only gone when the service is shutting down.
            if sender.send(event).is_err() {
                trace!(%handle, "timer fired after the service loop closed");
            }
        });
        trace!(sensor = self.sensor, %handle, ?delay, "scheduled timer");
        self.timers.insert(handle, task);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.timers.remove(&handle) {
            task.abort();
            trace!(sensor = self.sensor, %handle, "cancelled timer");
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }
}
