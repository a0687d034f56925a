// SPDX-License-Identifier: GPL-3.0-or-later
mod cell;
mod scheduler;

pub(crate) use cell::{ExpiringValueCell, RestoreOutcome};
pub(crate) use scheduler::{Scheduler, TimerFired, TimerHandle, TokioScheduler};

#[cfg(test)]
pub(crate) use scheduler::manual::ManualScheduler;
