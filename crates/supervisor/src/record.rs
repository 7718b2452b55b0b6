//! The master's bookkeeping for a single worker slot. The supervisor owns
//! one of these per live worker, keyed by `worker_id`; the worker itself
//! only ever sees a channel handle back to the master, never the record
//! itself, so the reference stays one-way.

use std::time::Instant;

use tokio::{sync::mpsc, task::JoinHandle};

/// Bookkeeping the supervisor keeps for one worker slot.
pub(crate) struct WorkerRecord {
    /// Dense 1-based slot index, stable across restarts of the same slot.
    pub(crate) worker_id: u32,
    /// The OS process id of the worker currently occupying this slot.
    pub(crate) pid: u32,
    /// Monotonic timestamp of the last received heartbeat. `None` both
    /// before the first heartbeat arrives and while a kill is in progress.
    pub(crate) last_heartbeat_at: Option<Instant>,
    /// The last opaque status payload the worker published, kept only for
    /// diagnostics on death.
    pub(crate) status: Option<serde_json::Value>,
    /// Set when the master initiated termination; suppresses restart-on-exit
    /// and heartbeat-timeout double-kills.
    pub(crate) killed: bool,
    /// Outbox into the dedicated writer task that owns the child's stdin.
    /// Dropping this sender closes the child's stdin, which doubles as the
    /// graceful "disconnect" request (see DESIGN.md).
    pub(crate) to_worker: Option<mpsc::Sender<ipc::ToWorker>>,
    /// Signals the exit-watcher task to force a `SIGKILL` immediately.
    pub(crate) force_kill: mpsc::Sender<()>,
    /// The 60s kill-grace timer, running while `killed` is true. Aborted
    /// once the worker's exit is observed so it doesn't fire spuriously.
    pub(crate) kill_timer: Option<JoinHandle<()>>,
}

impl WorkerRecord {
    /// Sends a message to this worker's stdin, swallowing the error if the
    /// channel is already closed.
    pub(crate) fn send(&self, message: ipc::ToWorker) {
        if let Some(sender) = &self.to_worker {
            if sender.try_send(message).is_err() {
                tracing::debug!(worker_id = self.worker_id, "failed to queue message to worker");
            }
        }
    }
}
