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

//! A minimal demo service module used by this workspace's own integration
//! tests: a TCP listener that answers every connection with a fixed "ok\n"
//! body, exactly the `simple_server(port)` module referenced by the spec's
//! end-to-end scenarios. It exists only to give the supervisor something
//! real to load, start, and stop; production embedders bring their own
//! service modules and register them into their own [`ServiceRegistry`]
//! instead.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde::Deserialize;
use servicehost::{Options, ServiceCloser, ServiceFactory, ServiceInstance};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};

const OK_BODY: &str = "ok\n";

/// Errors raised while starting the demo server.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The service's `conf` did not contain a usable `port` field.
    #[error("simple_server conf is missing or has an invalid 'port' field (reason: {0})")]
    MalformedConf(#[from] serde_yaml::Error),

    /// The listener could not be bound.
    #[error("simple_server failed to bind port {port} (reason: {reason})")]
    BindFailed {
        /// The port that failed to bind.
        port: u16,
        /// The underlying I/O error message.
        reason: String,
    },
}

#[derive(Deserialize)]
struct SimpleServerConf {
    port: u16,
    #[serde(default)]
    worker_id: u32,
}

/// Registered under the module name `simple_server`.
pub struct SimpleServerFactory;

#[async_trait]
impl ServiceFactory for SimpleServerFactory {
    async fn create(&self, options: Options) -> Result<ServiceInstance, servicehost::Error> {
        let conf: SimpleServerConf = serde_yaml::from_value(options.config.clone()).map_err(|err| {
            servicehost::Error::ServiceInitError {
                service: options.name.clone(),
                reason: Error::from(err).to_string(),
            }
        })?;

        let listener = TcpListener::bind(("127.0.0.1", conf.port))
            .await
            .map_err(|err| servicehost::Error::ServiceInitError {
                service: options.name.clone(),
                reason: Error::BindFailed {
                    port: conf.port,
                    reason: err.to_string(),
                }
                .to_string(),
            })?;

        let bound_port = listener.local_addr().map(|addr| addr.port()).unwrap_or(conf.port);
        let hitcount = Arc::new(AtomicU64::new(0));

        let accept_hitcount = hitcount.clone();
        let worker_id = conf.worker_id;
        let accept_task = tokio::spawn(async move {
            loop {
                let (socket, _peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::debug!(error = %err, "simple_server accept failed");
                        continue;
                    }
                };
                let hitcount = accept_hitcount.clone();
                let _ = tokio::spawn(async move {
                    serve_one(socket, worker_id, hitcount).await;
                });
            }
        });

        // When the Sticky Dispatcher routed connections to this worker, they
        // arrive on `sticky_inbound` instead of `listener` above: serve those
        // the same way rather than leaving them to pile up unconsumed.
        let sticky_task = options.sticky_inbound.map(|sticky_inbound| {
            let hitcount = hitcount.clone();
            tokio::spawn(async move {
                loop {
                    let socket = {
                        let mut inbound = sticky_inbound.lock().await;
                        inbound.recv().await
                    };
                    let Some(socket) = socket else { return };
                    let hitcount = hitcount.clone();
                    let _ = tokio::spawn(async move {
                        serve_one(socket, worker_id, hitcount).await;
                    });
                }
            })
        });

        Ok(ServiceInstance {
            summary: serde_json::json!({ "port": bound_port, "worker_id": conf.worker_id }),
            closer: Some(Box::new(SimpleServerCloser { accept_task, sticky_task })),
        })
    }
}

async fn serve_one(mut socket: tokio::net::TcpStream, worker_id: u32, hitcount: Arc<AtomicU64>) {
    let mut buf = [0u8; 1024];

    // Only the request line matters for this demo: read whatever is
    // available and respond unconditionally with 200 "ok\n".
    match socket.read(&mut buf).await {
        Ok(0) | Err(_) => return,
        Ok(_n) => {}
    }

    let total = hitcount.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::info!(%worker_id, hitcount = total, "simple_server handled a request");

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}",
        OK_BODY.len(),
        OK_BODY
    );

    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

struct SimpleServerCloser {
    accept_task: JoinHandle<()>,
    sticky_task: Option<JoinHandle<()>>,
}

#[async_trait]
impl ServiceCloser for SimpleServerCloser {
    async fn close(&self) -> Result<(), servicehost::Error> {
        self.accept_task.abort();
        if let Some(sticky_task) = &self.sticky_task {
            sticky_task.abort();
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct PidfileConf {
    dir: String,
    #[serde(default)]
    worker_id: u32,
}

/// A service with no network surface of its own: on start, it writes its own
/// process id to `{dir}/worker-{worker_id}.pid`. Used by this workspace's own
/// integration tests to observe, from outside the supervised pool, which OS
/// process currently occupies a given worker slot without needing every
/// worker to bind a shared port.
pub struct PidfileFactory;

#[async_trait]
impl ServiceFactory for PidfileFactory {
    async fn create(&self, options: Options) -> Result<ServiceInstance, servicehost::Error> {
        let conf: PidfileConf = serde_yaml::from_value(options.config.clone()).map_err(|err| {
            servicehost::Error::ServiceInitError {
                service: options.name.clone(),
                reason: format!("pidfile conf is missing or has an invalid 'dir' field (reason: {err})"),
            }
        })?;

        let path = std::path::Path::new(&conf.dir).join(format!("worker-{}.pid", conf.worker_id));
        let pid = std::process::id();
        std::fs::write(&path, pid.to_string()).map_err(|err| servicehost::Error::ServiceInitError {
            service: options.name.clone(),
            reason: format!("failed to write pidfile {} (reason: {err})", path.display()),
        })?;

        Ok(ServiceInstance::summary_only(serde_json::json!({ "pid": pid, "worker_id": conf.worker_id })))
    }
}

/// A service whose factory always fails synchronously, used to exercise the
/// first-worker startup budget (spec.md §4.6, §8 scenario 5).
pub struct AlwaysFailFactory;

#[async_trait]
impl ServiceFactory for AlwaysFailFactory {
    async fn create(&self, options: Options) -> Result<ServiceInstance, servicehost::Error> {
        Err(servicehost::Error::ServiceInitError {
            service: options.name,
            reason: "synthetic startup failure for testing".to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use tokio::net::TcpStream;

    use super::*;

    #[tokio::test]
    async fn responds_ok_to_any_request() {
        let options = Options {
            name: "s".to_string(),
            app_base_path: None,
            config: serde_yaml::to_value(serde_json::json!({"port": 0, "worker_id": 1})).unwrap(),
            logger: tracing::info_span!("test"),
            metrics: serde_yaml::Value::Null,
            ratelimiter: test_ratelimiter(),
            sticky_inbound: None,
        };

        let instance = SimpleServerFactory.create(options).await.unwrap();
        let port = instance.summary["port"].as_u64().unwrap() as u16;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        let response = String::from_utf8(response).unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok\n"));

        if let Some(closer) = instance.closer {
            closer.close().await.unwrap();
        }
    }

    fn test_ratelimiter() -> Arc<dyn ratelimiter::RatelimiterHandle> {
        struct NeverBlock;
        impl ratelimiter::GlobalLimiter for NeverBlock {
            fn is_above_limit(&mut self, _key: &str, _min_limit: u64, _increment: u64) -> bool {
                false
            }
        }
        Arc::new(ratelimiter::StandaloneAggregator::new(Box::new(NeverBlock)))
    }
}
