//! Rolling restart: replaces every worker one at a time, keeping pool
//! capacity within ±1, driven entirely by events the main loop already
//! observes (`WorkerExited`, `StartupFinished`) rather than a separate task
//! awaiting each step — a second mutator of the worker map would break the
//! single-actor discipline the rest of the supervisor relies on.

use std::collections::VecDeque;

/// Where a single slot is in its replace-one-worker cycle.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RollingPhase {
    /// The old occupant of `worker_id` was just sent the kill protocol;
    /// waiting for its process to actually exit.
    AwaitingExit(u32),
    /// The replacement for `worker_id` was forked; waiting for its
    /// `startup_finished`.
    AwaitingStartup(u32),
}

/// The in-progress rolling restart state.
pub(crate) struct RollingRestart {
    /// Worker ids still to be cycled, in insertion order.
    pub(crate) remaining: VecDeque<u32>,
    pub(crate) phase: RollingPhase,
}

impl RollingRestart {
    /// Starts a rolling restart over `worker_ids`, in order, returning the
    /// state machine positioned at "currently killing the first worker".
    /// `worker_ids` must be non-empty.
    pub(crate) fn start(mut worker_ids: VecDeque<u32>) -> Option<Self> {
        let first = worker_ids.pop_front()?;
        Some(Self {
            remaining: worker_ids,
            phase: RollingPhase::AwaitingExit(first),
        })
    }
}
