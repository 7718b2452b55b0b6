#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The master: forks workers one at a time, keeps the pool at its
//! configured size, monitors liveness via heartbeats, aggregates rate-limit
//! counters, drives rolling restarts, and shuts the pool down cleanly.
//! `num_workers == 0` skips all of this and runs the worker runtime
//! in-process instead (see [`run`]).

use std::{collections::HashMap, time::Duration};

use config::{Config, ConfigSource};
use ipc::ToMaster;
use ratelimiter::GlobalAggregator;
use rand::Rng;
use servicehost::ServiceRegistry;
use tokio::sync::mpsc;

mod events;
mod record;
mod rolling;
mod spawn;
mod sticky;

use events::SupervisorEvent;
use record::WorkerRecord;
use rolling::{RollingPhase, RollingRestart};

/// How long the master waits for logs to flush before a fatal first-worker
/// startup exit.
const STARTUP_FLUSH_DELAY: Duration = Duration::from_millis(1_000);

/// How long the master waits for a worker to confirm a graceful disconnect
/// before sending `SIGKILL`.
const KILL_GRACE: Duration = Duration::from_millis(60_000);

/// Upper bound (exclusive) on the jittered delay before respawning a worker
/// that exited unexpectedly in steady state.
const RESPAWN_JITTER_MAX_MS: u64 = 2_000;

/// Consecutive startup failures of the very first worker before the master
/// gives up.
const FIRST_WORKER_BUDGET: u32 = 3;

/// Errors produced while loading configuration or spawning a worker.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),

    /// The worker runtime failed in degenerate single-process mode.
    #[error("worker runtime error: {0}")]
    Worker(#[from] worker::Error),
}

/// Where the startup sequencer is: either still filling the pool one slot
/// at a time, or done and running in steady state.
#[derive(Clone, Copy)]
enum Phase {
    Starting { worker_id: u32, consecutive_failures: u32 },
    Running,
}

struct Supervisor {
    workers: HashMap<u32, WorkerRecord>,
    config: Config,
    config_json: serde_json::Value,
    source: ConfigSource,
    phase: Phase,
    first_worker_seen: bool,
    shutting_down: bool,
    rolling: Option<RollingRestart>,
    global_aggregator: GlobalAggregator,
    events_tx: mpsc::Sender<SupervisorEvent>,
    log_controller: Option<worker::LogController>,
}

/// The outcome of the clustered event loop: the process exit code.
enum Outcome {
    Continue,
    Exit(i32),
}

impl Supervisor {
    fn spawn_slot(&mut self, worker_id: u32) {
        match spawn::spawn_worker(worker_id, &self.config_json, self.events_tx.clone()) {
            Ok(record) => {
                let _ = self.workers.insert(worker_id, record);
            }
            Err(err) => {
                tracing::error!(worker_id, error = %err, "failed to spawn worker process");
            }
        }
    }

    /// Sets `killed = true`, drops the IPC writer (the graceful disconnect
    /// request), and starts the 60s kill-grace timer. Idempotent.
    fn initiate_kill(&mut self, worker_id: u32) {
        let Some(record) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if record.killed {
            return;
        }
        record.killed = true;
        record.to_worker = None;

        let events_tx = self.events_tx.clone();
        record.kill_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            let _ = events_tx.send(SupervisorEvent::KillTimeout { worker_id }).await;
        }));
    }

    fn schedule_respawn(&self, worker_id: u32) {
        let delay_ms = rand::thread_rng().gen_range(0..RESPAWN_JITTER_MAX_MS);
        let events_tx = self.events_tx.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = events_tx.send(SupervisorEvent::RespawnReady { worker_id }).await;
        });
    }

    fn broadcast(&self, message: ipc::ToWorker) {
        for record in self.workers.values() {
            record.send(message.clone());
        }
    }

    async fn handle_event(&mut self, event: SupervisorEvent) -> Outcome {
        match event {
            SupervisorEvent::FromWorker { worker_id, message } => self.handle_from_worker(worker_id, message),
            SupervisorEvent::WorkerExited { worker_id, status } => return self.handle_worker_exited(worker_id, status).await,
            SupervisorEvent::KillTimeout { worker_id } => {
                if let Some(record) = self.workers.get(&worker_id) {
                    if record.killed {
                        let _ = record.force_kill.try_send(());
                    }
                }
            }
            SupervisorEvent::HeartbeatTick => self.check_heartbeats(),
            SupervisorEvent::ReloadRequested => self.handle_reload(),
            SupervisorEvent::ShutdownRequested => return self.handle_shutdown(),
            SupervisorEvent::RespawnReady { worker_id } => {
                if !self.workers.contains_key(&worker_id) {
                    self.spawn_slot(worker_id);
                }
            }
            SupervisorEvent::StickyRouted { worker_id, peer_addr } => {
                if let Some(record) = self.workers.get(&worker_id) {
                    record.send(ipc::ToWorker::StickyBalance { peer_addr });
                }
            }
        }
        Outcome::Continue
    }

    fn handle_from_worker(&mut self, worker_id: u32, message: ToMaster) {
        match message {
            ToMaster::Heartbeat => {
                if let Some(record) = self.workers.get_mut(&worker_id) {
                    record.last_heartbeat_at = Some(std::time::Instant::now());
                }
            }
            ToMaster::ServiceStatus { status } => {
                if let Some(record) = self.workers.get_mut(&worker_id) {
                    record.status = Some(status);
                }
            }
            ToMaster::StartupFinished { summary } => {
                tracing::info!(worker_id, ?summary, "worker finished starting up");
                self.first_worker_seen = true;
                self.on_startup_finished(worker_id);
            }
            ToMaster::RatelimiterCounters { counters } => {
                if let Some(blocks) = self.global_aggregator.merge(counters) {
                    self.broadcast(ipc::ToWorker::RatelimiterBlocks { blocks });
                }
            }
        }
    }

    fn on_startup_finished(&mut self, worker_id: u32) {
        if let Phase::Starting { worker_id: pending, .. } = self.phase {
            if pending == worker_id {
                if worker_id == self.config.num_workers as u32 {
                    self.phase = Phase::Running;
                } else {
                    let next = worker_id + 1;
                    self.spawn_slot(next);
                    self.phase = Phase::Starting {
                        worker_id: next,
                        consecutive_failures: 0,
                    };
                }
                return;
            }
        }

        if let Some(rolling) = &mut self.rolling {
            if let RollingPhase::AwaitingStartup(id) = rolling.phase {
                if id == worker_id {
                    match rolling.remaining.pop_front() {
                        Some(next) => {
                            rolling.phase = RollingPhase::AwaitingExit(next);
                            self.initiate_kill(next);
                        }
                        None => {
                            tracing::info!("rolling restart finished");
                            self.rolling = None;
                        }
                    }
                }
            }
        }
    }

    async fn handle_worker_exited(&mut self, worker_id: u32, status: Option<std::process::ExitStatus>) -> Outcome {
        tracing::warn!(worker_id, ?status, "worker process exited");

        if self.shutting_down {
            if let Some(record) = self.workers.remove(&worker_id) {
                if let Some(timer) = record.kill_timer {
                    timer.abort();
                }
            }
            if self.workers.is_empty() {
                return Outcome::Exit(0);
            }
            return Outcome::Continue;
        }

        if let Phase::Starting {
            worker_id: pending,
            consecutive_failures,
        } = self.phase
        {
            if pending == worker_id {
                let _ = self.workers.remove(&worker_id);

                if self.first_worker_seen {
                    // The first-worker budget only applies to worker 1; once
                    // it has started successfully, a startup-gate exit of the
                    // worker currently being sequenced is an ordinary crash,
                    // respawned through the same jittered path as a
                    // steady-state exit rather than re-forked immediately.
                    self.schedule_respawn(worker_id);
                    return Outcome::Continue;
                }

                let failures = consecutive_failures + 1;
                if failures >= FIRST_WORKER_BUDGET {
                    tracing::error!(worker_id, failures, "first worker failed to start repeatedly; aborting");
                    tokio::time::sleep(STARTUP_FLUSH_DELAY).await;
                    return Outcome::Exit(1);
                }

                self.phase = Phase::Starting {
                    worker_id,
                    consecutive_failures: failures,
                };
                self.spawn_slot(worker_id);
                return Outcome::Continue;
            }
        }

        let Some(record) = self.workers.remove(&worker_id) else {
            return Outcome::Continue;
        };
        if let Some(timer) = record.kill_timer {
            timer.abort();
        }

        if let Some(rolling) = &mut self.rolling {
            if let RollingPhase::AwaitingExit(id) = rolling.phase {
                if id == worker_id {
                    rolling.phase = RollingPhase::AwaitingStartup(id);
                    self.spawn_slot(worker_id);
                    return Outcome::Continue;
                }
            }

            // A sibling worker crashed independently while a rolling restart
            // is in progress: the exit listener does not spawn replacements
            // in that state. This worker will be cycled anyway (and already
            // picks up the reloaded config), so drop it from the pending
            // queue if it's still waiting there and respawn it directly
            // rather than leaving the rolling restart to await an exit that
            // already happened.
            rolling.remaining.retain(|&id| id != worker_id);
            self.spawn_slot(worker_id);
            return Outcome::Continue;
        }

        self.schedule_respawn(worker_id);
        Outcome::Continue
    }

    fn check_heartbeats(&mut self) {
        let timeout = Duration::from_millis(self.config.worker_heartbeat_timeout_ms);
        let now = std::time::Instant::now();

        let stale: Vec<u32> = self
            .workers
            .iter()
            .filter(|(_, record)| {
                if record.killed {
                    return false;
                }
                match record.last_heartbeat_at {
                    None => true,
                    Some(last) => now.duration_since(last) > timeout,
                }
            })
            .map(|(worker_id, _)| *worker_id)
            .collect();

        for worker_id in stale {
            let status = self.workers.get(&worker_id).and_then(|record| record.status.clone());
            tracing::error!(worker_id, ?status, "worker missed its heartbeat deadline; killing it");
            self.initiate_kill(worker_id);
        }
    }

    fn handle_reload(&mut self) {
        if self.shutting_down || self.rolling.is_some() {
            tracing::warn!("ignoring reload request: shutdown or rolling restart already in progress");
            return;
        }
        if !matches!(self.phase, Phase::Running) {
            tracing::warn!("ignoring reload request: initial worker pool has not finished starting up");
            return;
        }

        let config = match Config::load(self.source.clone()) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(error = %err, "configuration reload failed; keeping current configuration");
                return;
            }
        };
        let config_json = match serde_json::to_value(&config) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(error = %err, "reloaded configuration could not be serialized; aborting reload");
                return;
            }
        };

        self.config = config;
        self.config_json = config_json;

        if let Some(log_controller) = &mut self.log_controller {
            log_controller.reconfigure(&self.config.logging);
        }

        let worker_ids: std::collections::VecDeque<u32> = (1..=self.config.num_workers as u32).collect();
        let Some(rolling) = RollingRestart::start(worker_ids) else {
            return;
        };

        tracing::info!("configuration reloaded; starting rolling restart");
        if let RollingPhase::AwaitingExit(first) = rolling.phase {
            self.rolling = Some(rolling);
            self.initiate_kill(first);
        }
    }

    fn handle_shutdown(&mut self) -> Outcome {
        if self.shutting_down {
            return Outcome::Continue;
        }
        tracing::info!("shutting down");
        self.shutting_down = true;

        if self.workers.is_empty() {
            return Outcome::Exit(0);
        }

        let worker_ids: Vec<u32> = self.workers.keys().copied().collect();
        for worker_id in worker_ids {
            self.initiate_kill(worker_id);
        }
        Outcome::Continue
    }
}

/// Loads the configuration from `source` and runs either the clustered
/// master/worker pool or, for `num_workers == 0`, the worker runtime
/// in-process. Returns the process exit code. `log_controller`, if given, is
/// used to rebuild the master's own log filter from a reloaded
/// configuration's `logging` section on SIGHUP (spec.md §4.6); it has no
/// effect in degenerate mode, which never reloads.
pub async fn run(source: ConfigSource, registry: ServiceRegistry, log_controller: Option<worker::LogController>) -> i32 {
    let config = match Config::load(source.clone()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            return 1;
        }
    };

    if config.num_workers == 0 {
        return run_degenerate(config, registry).await;
    }

    run_clustered(config, source, registry, log_controller).await
}

async fn run_degenerate(config: Config, registry: ServiceRegistry) -> i32 {
    let standalone = match worker::run_standalone(&config, &registry).await {
        Ok(standalone) => standalone,
        Err(err) => {
            tracing::error!(error = %err, "worker runtime failed to start");
            return 1;
        }
    };

    tracing::info!(summary = ?standalone.summary(), "worker runtime started in-process");
    await_shutdown_signal().await;

    standalone.stop().await;
    0
}

async fn run_clustered(config: Config, source: ConfigSource, _registry: ServiceRegistry, log_controller: Option<worker::LogController>) -> i32 {
    let config_json = match serde_json::to_value(&config) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, "configuration could not be serialized for workers");
            return 1;
        }
    };

    let (events_tx, mut events_rx) = mpsc::channel::<SupervisorEvent>(256);

    let heartbeat_period = Duration::from_millis(config.worker_heartbeat_timeout_ms / 2 + 1);
    let heartbeat_tx = events_tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_period);
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(SupervisorEvent::HeartbeatTick).await.is_err() {
                return;
            }
        }
    });

    let signal_tx = events_tx.clone();
    let signal_task = tokio::spawn(install_signal_handlers(signal_tx));

    let sticky_task = config.sticky.as_ref().filter(|sticky| sticky.enabled).map(|sticky| {
        let dispatcher = sticky::StickyDispatcher::new(config.num_workers as u32);
        let sticky = sticky.clone();
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = sticky::accept_loop(sticky, dispatcher, events_tx).await {
                tracing::error!(error = %err, "sticky dispatcher accept loop failed");
            }
        })
    });

    let mut supervisor = Supervisor {
        workers: HashMap::new(),
        config,
        config_json,
        source,
        phase: Phase::Starting {
            worker_id: 1,
            consecutive_failures: 0,
        },
        first_worker_seen: false,
        shutting_down: false,
        rolling: None,
        global_aggregator: GlobalAggregator::new(Box::new(ratelimiter::SlidingWindowLimiter::default())),
        events_tx,
        log_controller,
    };
    supervisor.spawn_slot(1);

    let exit_code = loop {
        let Some(event) = events_rx.recv().await else {
            tracing::error!("supervisor event channel closed unexpectedly");
            break 1;
        };

        match supervisor.handle_event(event).await {
            Outcome::Continue => {}
            Outcome::Exit(code) => break code,
        }
    };

    heartbeat_task.abort();
    signal_task.abort();
    if let Some(task) = sticky_task {
        task.abort();
    }

    exit_code
}

#[cfg(unix)]
async fn install_signal_handlers(events_tx: mpsc::Sender<SupervisorEvent>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                let _ = events_tx.send(SupervisorEvent::ShutdownRequested).await;
            }
            _ = sigterm.recv() => {
                let _ = events_tx.send(SupervisorEvent::ShutdownRequested).await;
            }
            _ = sighup.recv() => {
                let _ = events_tx.send(SupervisorEvent::ReloadRequested).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn install_signal_handlers(_events_tx: mpsc::Sender<SupervisorEvent>) {
    std::future::pending::<()>().await;
}

#[cfg(unix)]
async fn await_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return,
    };

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn await_shutdown_signal() {
    std::future::pending::<()>().await;
}
