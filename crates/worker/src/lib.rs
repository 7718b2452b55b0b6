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

//! The worker runtime: installed inside every worker process,
//! it waits for its initial configuration, starts Heap Watch and the
//! rate-limiter client, runs the Service Host, and from then on emits
//! heartbeats and drains rate-limit counters until the master asks it to
//! stop. The degenerate `num_workers == 0` case runs the same Service Host
//! and Heap Watch startup through [`run_standalone`] without any IPC.

use std::{sync::Arc, time::Duration};

use config::Config;
use heapwatch::{Action, HeapWatch, Mode};
use ipc::{IpcReader, IpcWriter, ToMaster, ToWorker};
use ratelimiter::{LocalAggregator, RatelimiterHandle, SlidingWindowLimiter, StandaloneAggregator};
use servicehost::ServiceRegistry;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

pub mod logging;

pub use logging::LogController;

/// How long a worker waits for its initial `config` message before giving up.
pub const STARTUP_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Delay the worker waits for logs to flush before exiting 1 on a fatal
/// startup failure.
const LOG_FLUSH_DELAY: Duration = Duration::from_millis(1_000);

/// Default interval at which the rate-limiter client drains its counters.
const DEFAULT_RATELIMITER_INTERVAL: Duration = Duration::from_millis(5_000);

/// Errors produced by the worker runtime. All of them end in the worker
/// exiting non-zero; the master treats that like any other worker death.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No `config` message arrived within [`STARTUP_TIMEOUT`].
    #[error("timed out waiting for initial configuration")]
    StartupTimeout,

    /// The `config` payload did not match the expected shape.
    #[error("malformed configuration payload (reason: {0})")]
    MalformedConfig(#[from] serde_json::Error),

    /// The Service Host failed to start one or more services.
    #[error("service host failed to start (reason: {0})")]
    ServiceHost(#[from] servicehost::Error),

    /// The IPC channel to the master failed or closed.
    #[error("ipc error (reason: {0})")]
    Ipc(#[from] ipc::Error),
}

/// Waits for the first message on `reader`, expecting [`ToWorker::Config`].
async fn await_initial_config<R>(reader: &mut IpcReader<R, ToWorker>) -> Result<Config, Error>
where
    R: AsyncRead + Unpin,
{
    let message = tokio::time::timeout(STARTUP_TIMEOUT, reader.recv())
        .await
        .map_err(|_elapsed| Error::StartupTimeout)??;

    match message {
        ToWorker::Config { config } => Ok(serde_json::from_value(config)?),
        other => {
            tracing::error!(?other, "expected initial config message, got something else");
            Err(Error::StartupTimeout)
        }
    }
}

fn build_registry_limiter(_config: &Config) -> Box<dyn ratelimiter::GlobalLimiter> {
    Box::new(SlidingWindowLimiter::default())
}

/// How many connections the Sticky Dispatcher relay may queue for a service
/// that hasn't pulled from [`servicehost::StickyInbound`] yet.
const STICKY_RELAY_BACKLOG: usize = 64;

/// When the Sticky Dispatcher (C7) is enabled, binds this worker's private
/// relay listener (`relay_base_port + worker_id`, loopback only) and forwards
/// every accepted connection into a channel a service can consume through
/// [`servicehost::Options::sticky_inbound`]. Returns `None` when the Sticky
/// Dispatcher is disabled, or if the relay port could not be bound (logged
/// and otherwise non-fatal: the worker still starts, just without sticky
/// routing).
async fn start_sticky_relay(worker_id: u32, sticky: Option<&config::StickyConfig>) -> Option<servicehost::StickyInbound> {
    let sticky = sticky.filter(|sticky| sticky.enabled)?;
    let relay_port = sticky.relay_base_port + worker_id as u16;

    let listener = match tokio::net::TcpListener::bind(("127.0.0.1", relay_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::warn!(%worker_id, relay_port, error = %err, "failed to bind sticky dispatcher relay port");
            return None;
        }
    };

    let (tx, rx) = mpsc::channel(STICKY_RELAY_BACKLOG);
    let _ = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    if tx.send(stream).await.is_err() {
                        return;
                    }
                }
                Err(err) => tracing::debug!(error = %err, "sticky dispatcher relay accept failed"),
            }
        }
    });

    Some(Arc::new(tokio::sync::Mutex::new(rx)))
}

/// Runs the worker runtime against a real parent-child IPC channel (the
/// re-exec'd worker's stdin/stdout). Returns the process exit code the
/// worker's `main` should pass to `std::process::exit`.
pub async fn run_clustered<R, W>(
    worker_id: u32,
    reader: R,
    writer: W,
    registry: &ServiceRegistry,
    log_controller: Option<LogController>,
) -> i32
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut ipc_reader: IpcReader<R, ToWorker> = IpcReader::new(reader);

    let config = match await_initial_config(&mut ipc_reader).await {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%worker_id, error = %err, "worker did not receive configuration in time");
            return 1;
        }
    };

    let ipc_writer: IpcWriter<W, ToMaster> = IpcWriter::new(writer);
    let (outbox_tx, outbox_rx) = mpsc::channel::<ToMaster>(64);
    let writer_task = tokio::spawn(run_writer(ipc_writer, outbox_rx));

    let local_aggregator = Arc::new(LocalAggregator::new());
    let aggregator_task = tokio::spawn(run_ratelimiter_client(
        local_aggregator.clone(),
        outbox_tx.clone(),
        DEFAULT_RATELIMITER_INTERVAL,
    ));

    let heartbeat_interval = Duration::from_millis(config.worker_heartbeat_timeout_ms / 3);

    // Seed the heartbeat timestamp before startup_finished so the master
    // never sees a worker record with no heartbeat at all.
    if outbox_tx.send(ToMaster::Heartbeat).await.is_err() {
        tracing::error!(%worker_id, "failed to seed initial heartbeat; master channel already closed");
    }

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let signal_task = tokio::spawn(install_signal_handlers(
        worker_id,
        shutdown_tx.clone(),
        log_controller.clone(),
    ));

    let heap_task = tokio::spawn(run_heap_watch(
        worker_id,
        config.worker_heap_limit_mb,
        Mode::Clustered,
        shutdown_tx.clone(),
    ));

    let sticky_inbound = start_sticky_relay(worker_id, config.sticky.as_ref()).await;

    let startup = match servicehost::start(
        registry,
        &config.services,
        worker_id,
        config.app_base_path.as_deref(),
        local_aggregator.clone() as Arc<dyn RatelimiterHandle>,
        sticky_inbound,
    )
    .await
    {
        Ok(startup) => startup,
        Err(err) => {
            tracing::error!(%worker_id, error = %err, "service host failed to start; worker exiting");
            tokio::time::sleep(LOG_FLUSH_DELAY).await;
            signal_task.abort();
            heap_task.abort();
            aggregator_task.abort();
            writer_task.abort();
            return 1;
        }
    };

    if outbox_tx
        .send(ToMaster::StartupFinished {
            summary: startup.summary.clone(),
        })
        .await
        .is_err()
    {
        tracing::error!(%worker_id, "failed to publish startup_finished; master channel already closed");
    }

    let heartbeat_task = tokio::spawn(run_heartbeat(outbox_tx.clone(), heartbeat_interval));

    // Main receive loop: master messages and the shutdown trigger (SIGTERM,
    // SIGUSR2-adjacent heap-fatal escalation) race until one fires.
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                tracing::info!(%worker_id, "worker stopping");
                break;
            }
            message = ipc_reader.recv() => {
                match message {
                    Ok(ToWorker::RatelimiterBlocks { blocks }) => {
                        local_aggregator.replace_blocks(blocks);
                    }
                    Ok(ToWorker::StickyBalance { peer_addr }) => {
                        tracing::debug!(%worker_id, %peer_addr, "sticky dispatcher routed a peer to this worker");
                    }
                    Ok(other @ ToWorker::Config { .. }) => {
                        tracing::error!(%worker_id, ?other, "unexpected message kind; ignoring");
                    }
                    Err(ipc::Error::Closed) => {
                        tracing::info!(%worker_id, "master channel closed; stopping");
                        break;
                    }
                    Err(err) => {
                        tracing::error!(%worker_id, error = %err, "ipc read error; ignoring");
                    }
                }
            }
        }
    }

    heartbeat_task.abort();
    signal_task.abort();
    heap_task.abort();
    aggregator_task.abort();

    startup.stop().await;

    drop(outbox_tx);
    let _ = writer_task.await;

    0
}

async fn run_writer<W>(mut ipc_writer: IpcWriter<W, ToMaster>, mut outbox_rx: mpsc::Receiver<ToMaster>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbox_rx.recv().await {
        // Swallowed: subsequent exit handling takes over once the master
        // notices the worker is gone.
        if let Err(err) = ipc_writer.send(&message).await {
            tracing::debug!(error = %err, "failed to send message to master");
        }
    }
}

async fn run_heartbeat(outbox_tx: mpsc::Sender<ToMaster>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; already seeded above.
    loop {
        ticker.tick().await;
        if outbox_tx.send(ToMaster::Heartbeat).await.is_err() {
            break;
        }
    }
}

async fn run_ratelimiter_client(aggregator: Arc<LocalAggregator>, outbox_tx: mpsc::Sender<ToMaster>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let drained = aggregator.drain();
        if drained.is_empty() {
            continue;
        }
        if outbox_tx.send(ToMaster::RatelimiterCounters { counters: drained }).await.is_err() {
            break;
        }
    }
}

async fn run_heap_watch(worker_id: u32, limit_mb: u64, mode: Mode, shutdown_tx: mpsc::Sender<()>) {
    let mut watch = HeapWatch::new(limit_mb, mode);
    let mut ticker = tokio::time::interval(heapwatch::TICK_INTERVAL);

    loop {
        ticker.tick().await;
        match watch.tick() {
            Action::Ok(_) => {}
            Action::Warn(sample) => {
                tracing::warn!(%worker_id, used_bytes = sample.used_bytes, "heap usage over ceiling");
            }
            Action::Fatal {
                sample,
                should_terminate,
                disconnect_after,
                force_exit_after,
            } => {
                tracing::error!(%worker_id, used_bytes = sample.used_bytes, should_terminate, "heap usage persistently over ceiling");

                if !should_terminate {
                    continue;
                }

                let shutdown_tx = shutdown_tx.clone();
                let _ = tokio::spawn(async move {
                    tokio::time::sleep(disconnect_after).await;
                    let _ = shutdown_tx.send(()).await;
                    tokio::time::sleep(force_exit_after).await;
                    tracing::error!("forced exit after heap-fatal grace period elapsed");
                    std::process::exit(1);
                });
                return;
            }
        }
    }
}

#[cfg(unix)]
async fn install_signal_handlers(worker_id: u32, shutdown_tx: mpsc::Sender<()>, log_controller: Option<LogController>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigusr2 = match signal(SignalKind::user_defined2()) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGUSR2 handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!(%worker_id, "received SIGTERM; stopping");
                let _ = shutdown_tx.send(()).await;
                return;
            }
            _ = sigusr2.recv() => {
                tracing::info!(%worker_id, "received SIGUSR2; taking heap snapshot and raising verbosity");
                let mut watch = HeapWatch::new(u64::MAX, Mode::Clustered);
                if let Action::Ok(sample) = watch.tick() {
                    logging::write_heap_snapshot(worker_id, sample);
                }
                if let Some(controller) = &log_controller {
                    controller.burst_trace();
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn install_signal_handlers(_worker_id: u32, _shutdown_tx: mpsc::Sender<()>, _log_controller: Option<LogController>) {
    std::future::pending::<()>().await;
}

/// A service host started standalone (degenerate `num_workers == 0` mode),
/// with no IPC and no sibling workers. The caller (the supervisor's own
/// process) owns the returned handle and decides when to stop it.
pub struct StandaloneWorker {
    summary: serde_json::Value,
    startup: servicehost::StartupResult,
    ratelimiter: Arc<StandaloneAggregator>,
    heap_task: tokio::task::JoinHandle<()>,
}

impl StandaloneWorker {
    /// The serializable summary of every started service's return value.
    pub fn summary(&self) -> &serde_json::Value {
        &self.summary
    }

    /// The standalone rate-limiter, performing both the worker and master
    /// aggregator roles in this single process.
    pub fn ratelimiter(&self) -> Arc<StandaloneAggregator> {
        self.ratelimiter.clone()
    }

    /// Stops every retained service closer, in start order, and tears down
    /// the Heap Watch ticker.
    pub async fn stop(self) {
        self.heap_task.abort();
        self.startup.stop().await;
    }
}

/// Starts the Service Host and Heap Watch in the current process with no
/// IPC, for the degenerate `num_workers == 0` case.
pub async fn run_standalone(config: &Config, registry: &ServiceRegistry) -> Result<StandaloneWorker, Error> {
    let ratelimiter = Arc::new(StandaloneAggregator::new(build_registry_limiter(config)));

    // The Sticky Dispatcher requires a master accepting on its behalf; the
    // degenerate single-process mode has no master, so no relay is started.
    let startup = servicehost::start(
        registry,
        &config.services,
        0,
        config.app_base_path.as_deref(),
        ratelimiter.clone() as Arc<dyn RatelimiterHandle>,
        None,
    )
    .await?;

    let summary = startup.summary.clone();

    let limit_mb = config.worker_heap_limit_mb;
    let heap_task = tokio::spawn(async move {
        let mut watch = HeapWatch::new(limit_mb, Mode::NonClustered);
        let mut ticker = tokio::time::interval(heapwatch::TICK_INTERVAL);
        loop {
            ticker.tick().await;
            match watch.tick() {
                Action::Ok(_) => {}
                Action::Warn(sample) => tracing::warn!(used_bytes = sample.used_bytes, "heap usage over ceiling"),
                Action::Fatal { sample, .. } => {
                    tracing::error!(used_bytes = sample.used_bytes, "heap usage persistently over ceiling (non-clustered: log only)");
                }
            }
        }
    });

    Ok(StandaloneWorker {
        summary,
        startup,
        ratelimiter,
        heap_task,
    })
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use tokio::io::duplex;

    use super::*;

    struct Echo;

    #[async_trait]
    impl servicehost::ServiceFactory for Echo {
        async fn create(&self, options: servicehost::Options) -> Result<servicehost::ServiceInstance, servicehost::Error> {
            let summary = serde_json::to_value(&options.config).unwrap_or(serde_json::Value::Null);
            Ok(servicehost::ServiceInstance::summary_only(summary))
        }
    }

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry.register("echo", Arc::new(Echo));
        registry
    }

    fn test_config() -> Config {
        config::Config::load(config::ConfigSource::Document(
            "num_workers: 0\nworker_heartbeat_timeout_ms: 300\nservices:\n  - name: s\n    module: echo\n".to_string(),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn startup_timeout_exits_nonzero_when_no_config_arrives() {
        let (_client, server) = duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);

        let code = tokio::time::timeout(
            Duration::from_millis(200),
            run_clustered(1, server_read, server_write, &registry(), None),
        )
        .await;

        // The real STARTUP_TIMEOUT is 3s; this just exercises the code path
        // up to the point it would time out without waiting the full delay.
        assert!(code.is_err(), "run_clustered should still be waiting for config at 200ms");
    }

    #[tokio::test]
    async fn run_standalone_starts_services_without_ipc() {
        let standalone = run_standalone(&test_config(), &registry()).await.unwrap();
        assert!(standalone.summary()["s"]["worker_id"] == 0);
        standalone.stop().await;
    }
}
