//! Every consequential occurrence in the supervisor funnels through one
//! `mpsc` channel into a single event loop task, so that worker-record
//! mutations all happen in one logical execution context.

use std::process::ExitStatus;

/// Something the main supervisor loop needs to react to.
pub(crate) enum SupervisorEvent {
    /// A worker sent a message over its IPC channel.
    FromWorker { worker_id: u32, message: ipc::ToMaster },
    /// A worker's child process has actually exited.
    WorkerExited { worker_id: u32, status: Option<ExitStatus> },
    /// The 60s kill-grace timer for a worker elapsed without the worker
    /// having exited on its own.
    KillTimeout { worker_id: u32 },
    /// The heartbeat monitor's periodic tick.
    HeartbeatTick,
    /// SIGHUP: reload configuration and begin a rolling restart.
    ReloadRequested,
    /// SIGINT or SIGTERM: begin a clean shutdown.
    ShutdownRequested,
    /// The jittered crash-restart delay for `worker_id` elapsed; spawn its
    /// replacement now.
    RespawnReady { worker_id: u32 },
    /// The sticky dispatcher routed a new peer connection to `worker_id`.
    StickyRouted { worker_id: u32, peer_addr: String },
}
