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

//! Inside a worker: resolves and loads the configured service modules,
//! starts them, and owns their lifetime.

use std::{collections::HashMap, path::Path, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use config::ServiceDescriptor;
use ratelimiter::RatelimiterHandle;
use thiserror::Error;
use tokio::{net::TcpStream, sync::{mpsc, Mutex}};

/// Errors raised while resolving or starting service modules.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// None of the three resolution candidates matched a registered module.
    #[error("module '{module}' not found (service '{service}')")]
    ModuleNotFound {
        /// The service's configured name.
        service: String,
        /// The module locator that failed to resolve.
        module: String,
    },

    /// An `entrypoint` was named but the module has no such export.
    #[error("entrypoint '{entrypoint}' not found in module '{module}' (service '{service}')")]
    EntrypointNotFound {
        /// The service's configured name.
        service: String,
        /// The module locator.
        module: String,
        /// The requested entrypoint name.
        entrypoint: String,
    },

    /// The service's factory failed, synchronously or asynchronously.
    #[error("service '{service}' failed to start (reason: {reason})")]
    ServiceInitError {
        /// The service's configured name.
        service: String,
        /// The failure reason reported by the factory.
        reason: String,
    },
}

/// A stream of connections the Sticky Dispatcher (C7) routed to this worker,
/// shared across every service since only one is expected to consume it. See
/// [`Options::sticky_inbound`].
pub type StickyInbound = Arc<Mutex<mpsc::Receiver<TcpStream>>>;

/// Everything a service factory needs to start.
pub struct Options {
    /// The service's configured name.
    pub name: String,
    /// The base path used to resolve sibling resources, if any.
    pub app_base_path: Option<PathBuf>,
    /// `service.conf`, with `worker_id` injected.
    pub config: serde_yaml::Value,
    /// A tracing span named after this service, a child of the worker span.
    pub logger: tracing::Span,
    /// Metrics sink configuration, opaque to the core.
    pub metrics: serde_yaml::Value,
    /// A handle onto the worker's rate-limiter (local or standalone).
    pub ratelimiter: Arc<dyn RatelimiterHandle>,
    /// Present when the Sticky Dispatcher is enabled: a service that wants
    /// sticky-routed connections pulls them from here instead of binding its
    /// own listener. `None` when the Sticky Dispatcher is disabled or this is
    /// the degenerate single-process worker.
    pub sticky_inbound: Option<StickyInbound>,
}

/// A capability for the Worker Runtime to cleanly stop a started service.
#[async_trait]
pub trait ServiceCloser: Send + Sync {
    /// Stops the service, releasing whatever it holds.
    async fn close(&self) -> Result<(), Error>;
}

/// What a factory invocation returns: a serializable summary (folded into
/// the worker's `startup_finished` payload) and, optionally, a closer
/// retained for shutdown.
pub struct ServiceInstance {
    /// A JSON-serializable summary of the factory's return value. Values
    /// that cannot be serialized are replaced with their error string by the
    /// factory author before returning here.
    pub summary: serde_json::Value,
    /// Present when the service exposes a `close` capability.
    pub closer: Option<Box<dyn ServiceCloser>>,
}

impl ServiceInstance {
    /// A service instance with only a summary, no closer.
    pub fn summary_only(summary: serde_json::Value) -> Self {
        Self { summary, closer: None }
    }
}

/// Builds and starts one service module.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    /// Starts the service with the given options.
    async fn create(&self, options: Options) -> Result<ServiceInstance, Error>;
}

/// A module registered under a name, with optionally named entrypoints
/// beyond its own default factory.
struct RegisteredModule {
    default: Arc<dyn ServiceFactory>,
    entrypoints: HashMap<String, Arc<dyn ServiceFactory>>,
}

/// A compile-time registry standing in for dynamic module loading: every
/// crate in this workspace denies `unsafe_code`, and `libloading`-style
/// dynamic resolution requires unsafe, so modules are registered ahead of
/// time under the names the configuration will reference.
#[derive(Default)]
pub struct ServiceRegistry {
    modules: HashMap<String, RegisteredModule>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module's default factory under `name`.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ServiceFactory>) {
        self.modules.insert(
            name.into(),
            RegisteredModule {
                default: factory,
                entrypoints: HashMap::new(),
            },
        );
    }

    /// Registers a named entrypoint on an already-registered module.
    pub fn register_entrypoint(&mut self, module: &str, entrypoint: impl Into<String>, factory: Arc<dyn ServiceFactory>) {
        if let Some(registered) = self.modules.get_mut(module) {
            let _ = registered.entrypoints.insert(entrypoint.into(), factory);
        }
    }

    /// Resolves `descriptor.module` against, in order: the name as given,
    /// the name joined to the app base path, and the name joined to the
    /// base path's `modules` directory. The first that is registered wins.
    fn resolve(&self, descriptor: &ServiceDescriptor, app_base_path: Option<&Path>) -> Result<&RegisteredModule, Error> {
        let candidates = resolution_candidates(&descriptor.module, descriptor.app_base_path.as_deref().or(app_base_path));

        for candidate in &candidates {
            if let Some(registered) = self.modules.get(candidate) {
                return Ok(registered);
            }
        }

        Err(Error::ModuleNotFound {
            service: descriptor.name.clone(),
            module: descriptor.module.clone(),
        })
    }
}

fn resolution_candidates(module: &str, app_base_path: Option<&Path>) -> Vec<String> {
    let mut candidates = vec![module.to_string()];

    if let Some(base) = app_base_path {
        candidates.push(base.join(module).display().to_string());
        candidates.push(base.join("modules").join(module).display().to_string());
    }

    candidates
}

/// The worker's startup result: a serializable summary of every service's
/// return value, and the retained closers to run at shutdown, in start
/// order.
pub struct StartupResult {
    /// A map from service name to its summary.
    pub summary: serde_json::Value,
    closers: Vec<(String, Box<dyn ServiceCloser>)>,
}

impl StartupResult {
    /// Stops every retained service in start order, awaiting each before
    /// moving to the next.
    pub async fn stop(self) {
        for (name, closer) in self.closers {
            if let Err(err) = closer.close().await {
                tracing::warn!(service = %name, error = %err, "service failed to close cleanly");
            }
        }
    }
}

/// Loads and starts every configured service, in order, against `registry`.
/// Resolution happens sequentially (so a missing module fails fast without
/// starting siblings that were only listed after it); the resolved
/// factories are then invoked concurrently, since each invocation may
/// return synchronously or yield a future awaited in parallel.
pub async fn start(
    registry: &ServiceRegistry,
    services: &[ServiceDescriptor],
    worker_id: u32,
    app_base_path: Option<&Path>,
    ratelimiter: Arc<dyn RatelimiterHandle>,
    sticky_inbound: Option<StickyInbound>,
) -> Result<StartupResult, Error> {
    let mut invocations = Vec::with_capacity(services.len());

    for descriptor in services {
        let registered = registry.resolve(descriptor, app_base_path)?;

        let export: Arc<dyn ServiceFactory> = match &descriptor.entrypoint {
            Some(entrypoint) => registered
                .entrypoints
                .get(entrypoint)
                .cloned()
                .ok_or_else(|| Error::EntrypointNotFound {
                    service: descriptor.name.clone(),
                    module: descriptor.module.clone(),
                    entrypoint: entrypoint.clone(),
                })?,
            None => registered.default.clone(),
        };

        let options = Options {
            name: descriptor.name.clone(),
            app_base_path: descriptor.app_base_path.clone().or_else(|| app_base_path.map(Path::to_path_buf)),
            config: inject_worker_id(descriptor.conf.clone(), worker_id),
            logger: tracing::info_span!("service", name = %descriptor.name),
            metrics: serde_yaml::Value::Null,
            ratelimiter: ratelimiter.clone(),
            sticky_inbound: sticky_inbound.clone(),
        };

        invocations.push(invoke_named(descriptor.name.clone(), export, options));
    }

    let results = futures::future::join_all(invocations).await;

    let mut summary = serde_json::Map::new();
    let mut closers = Vec::new();

    for result in results {
        let (name, instance) = result?;
        summary.insert(name.clone(), instance.summary);
        if let Some(closer) = instance.closer {
            closers.push((name, closer));
        }
    }

    Ok(StartupResult {
        summary: serde_json::Value::Object(summary),
        closers,
    })
}

async fn invoke_named(
    name: String,
    factory: Arc<dyn ServiceFactory>,
    options: Options,
) -> Result<(String, ServiceInstance), Error> {
    let instance = factory.create(options).await.map_err(|err| Error::ServiceInitError {
        service: name.clone(),
        reason: err.to_string(),
    })?;
    Ok((name, instance))
}

fn inject_worker_id(conf: serde_yaml::Value, worker_id: u32) -> serde_yaml::Value {
    let mut mapping = match conf {
        serde_yaml::Value::Mapping(mapping) => mapping,
        serde_yaml::Value::Null => serde_yaml::Mapping::new(),
        other => {
            let mut mapping = serde_yaml::Mapping::new();
            let _ = mapping.insert(serde_yaml::Value::String("value".to_string()), other);
            mapping
        }
    };
    let _ = mapping.insert(
        serde_yaml::Value::String("worker_id".to_string()),
        serde_yaml::Value::Number(worker_id.into()),
    );
    serde_yaml::Value::Mapping(mapping)
}

#[cfg(test)]
mod test {
    use ratelimiter::{GlobalLimiter, StandaloneAggregator};

    use super::*;

    struct NeverBlock;
    impl GlobalLimiter for NeverBlock {
        fn is_above_limit(&mut self, _key: &str, _min_limit: u64, _increment: u64) -> bool {
            false
        }
    }

    struct Echo;

    #[async_trait]
    impl ServiceFactory for Echo {
        async fn create(&self, options: Options) -> Result<ServiceInstance, Error> {
            let summary = serde_json::to_value(&options.config).unwrap_or(serde_json::Value::Null);
            Ok(ServiceInstance::summary_only(summary))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl ServiceFactory for AlwaysFails {
        async fn create(&self, _options: Options) -> Result<ServiceInstance, Error> {
            Err(Error::ServiceInitError {
                service: "boom".to_string(),
                reason: "synthetic failure".to_string(),
            })
        }
    }

    fn ratelimiter_handle() -> Arc<dyn RatelimiterHandle> {
        Arc::new(StandaloneAggregator::new(Box::new(NeverBlock)))
    }

    #[tokio::test]
    async fn resolves_bare_name_and_injects_worker_id() {
        let mut registry = ServiceRegistry::new();
        registry.register("echo", Arc::new(Echo));

        let descriptor = ServiceDescriptor {
            name: "svc".to_string(),
            module: "echo".to_string(),
            entrypoint: None,
            app_base_path: None,
            conf: serde_yaml::Value::Null,
        };

        let result = start(&registry, std::slice::from_ref(&descriptor), 7, None, ratelimiter_handle(), None)
            .await
            .unwrap();

        assert_eq!(result.summary["svc"]["worker_id"], 7);
    }

    #[tokio::test]
    async fn resolves_against_app_base_path() {
        let mut registry = ServiceRegistry::new();
        registry.register("/app/modules/echo", Arc::new(Echo));

        let descriptor = ServiceDescriptor {
            name: "svc".to_string(),
            module: "echo".to_string(),
            entrypoint: None,
            app_base_path: None,
            conf: serde_yaml::Value::Null,
        };

        let base = Path::new("/app");
        let result = start(&registry, std::slice::from_ref(&descriptor), 1, Some(base), ratelimiter_handle(), None)
            .await
            .unwrap();

        assert!(result.summary.get("svc").is_some());
    }

    #[tokio::test]
    async fn unresolvable_module_is_reported() {
        let registry = ServiceRegistry::new();
        let descriptor = ServiceDescriptor {
            name: "svc".to_string(),
            module: "missing".to_string(),
            entrypoint: None,
            app_base_path: None,
            conf: serde_yaml::Value::Null,
        };

        let result = start(&registry, std::slice::from_ref(&descriptor), 1, None, ratelimiter_handle(), None).await;
        assert!(matches!(result, Err(Error::ModuleNotFound { .. })));
    }

    #[tokio::test]
    async fn factory_failure_is_reported() {
        let mut registry = ServiceRegistry::new();
        registry.register("boom", Arc::new(AlwaysFails));

        let descriptor = ServiceDescriptor {
            name: "svc".to_string(),
            module: "boom".to_string(),
            entrypoint: None,
            app_base_path: None,
            conf: serde_yaml::Value::Null,
        };

        let result = start(&registry, std::slice::from_ref(&descriptor), 1, None, ratelimiter_handle(), None).await;
        assert!(matches!(result, Err(Error::ServiceInitError { .. })));
    }
}
