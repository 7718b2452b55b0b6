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

//! Loads and resolves the effective configuration shared by the master and
//! every worker: environment-variable interpolation, `num_workers`
//! resolution against the host CPU count, defaulting, and validation.

use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

mod expr;
mod interpolate;

pub use expr::ExprError;

/// Errors produced while loading or resolving a configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The configuration file could not be read.
    #[error("configuration file '{file}' could not be read (reason: {reason})")]
    UnreadableFile {
        /// The path that was attempted.
        file: String,
        /// The underlying I/O error message.
        reason: String,
    },

    /// The document is not valid YAML, or does not match the expected shape.
    #[error("configuration document is malformed (reason: {reason})")]
    MalformedDocument {
        /// The underlying parse error message.
        reason: String,
    },

    /// Field-level validation failed (out-of-range values).
    #[error("configuration is invalid (reason: {reason})")]
    InvalidValues {
        /// The validator-reported reason.
        reason: String,
    },

    /// `services` resolved to an empty list, treated as a hard configuration
    /// error (see DESIGN.md).
    #[error("configuration has no services declared")]
    EmptyServices,

    /// The `num_workers` expression failed to evaluate.
    #[error("num_workers expression '{expr}' is invalid (reason: {source})")]
    NumWorkers {
        /// The original expression text.
        expr: String,
        /// The parse/evaluation failure.
        #[source]
        source: ExprError,
    },
}

/// Where the raw configuration document comes from.
#[derive(Clone)]
pub enum ConfigSource {
    /// An already-parsed YAML value (e.g. built up programmatically).
    Parsed(serde_yaml::Value),
    /// A raw YAML document string, interpolated before parsing.
    Document(String),
    /// A path to a YAML file on disk, read and interpolated before parsing.
    Path(PathBuf),
}

/// A single service module to load inside each worker.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceDescriptor {
    /// The service's name, used for logging and as the default module name.
    pub name: String,
    /// A locator resolved by the Service Host against the app base path.
    pub module: String,
    /// An optional named export inside the loaded module to invoke instead
    /// of the module's own default factory.
    pub entrypoint: Option<String>,
    /// Overrides the configuration-level `app_base_path` for this service.
    pub app_base_path: Option<PathBuf>,
    /// Opaque configuration handed to the service verbatim (`worker_id` is
    /// injected by the Service Host at invocation time).
    #[serde(default)]
    pub conf: serde_yaml::Value,
}

/// Package metadata, surfaced to services and logs but otherwise unused by
/// the core.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PackageInfo {
    /// The package name.
    pub name: Option<String>,
    /// The package version.
    pub version: Option<String>,
}

/// The num_workers field as written in the document: either a plain integer
/// or a small arithmetic expression over the `ncpu` token.
#[derive(Debug, Clone)]
enum NumWorkersSpec {
    Count(u64),
    Expr(String),
}

impl<'de> Deserialize<'de> for NumWorkersSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(u64),
            Expr(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(NumWorkersSpec::Count(n)),
            Repr::Expr(s) => Ok(NumWorkersSpec::Expr(s)),
        }
    }
}

/// The configuration document as written, before `num_workers` resolution.
#[derive(Deserialize, Debug, Clone, Validate)]
struct RawConfig {
    #[serde(default = "default_num_workers")]
    num_workers: NumWorkersSpec,

    #[serde(default = "default_heartbeat_timeout_ms")]
    #[validate(range(min = 1))]
    worker_heartbeat_timeout_ms: u64,

    #[serde(default = "default_heap_limit_mb")]
    #[validate(range(min = 1))]
    worker_heap_limit_mb: u64,

    #[serde(default)]
    logging: serde_yaml::Value,

    #[serde(default)]
    metrics: serde_yaml::Value,

    #[serde(default)]
    ratelimiter: serde_yaml::Value,

    #[serde(default)]
    services: Vec<ServiceDescriptor>,

    #[serde(default)]
    package: Option<PackageInfo>,

    #[serde(default)]
    app_base_path: Option<PathBuf>,

    #[serde(default)]
    #[validate(nested)]
    sticky: Option<StickyConfig>,
}

/// Configuration for the optional Sticky Dispatcher. Opt-in: absent or
/// `enabled: false` means the master never binds the listen address itself
/// and every worker is responsible for its own listening sockets (see
/// DESIGN.md for the default-off rationale).
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct StickyConfig {
    /// Whether the sticky dispatcher is active.
    #[serde(default)]
    pub enabled: bool,
    /// The address the master itself listens on, accepting on behalf of the
    /// whole pool.
    pub listen_addr: String,
    /// Base port for the per-worker relay sockets this implementation uses
    /// to hand an accepted connection to the chosen worker without raw file
    /// descriptor passing (every crate in this workspace denies
    /// `unsafe_code`). Worker `k` is relayed to on `relay_base_port + k`.
    #[validate(range(min = 1))]
    pub relay_base_port: u16,
}

fn default_num_workers() -> NumWorkersSpec {
    NumWorkersSpec::Expr("ncpu".to_string())
}

fn default_heartbeat_timeout_ms() -> u64 {
    7500
}

fn default_heap_limit_mb() -> u64 {
    1500
}

/// The fully resolved configuration, ready to hand to the supervisor and
/// (per-worker, serialized) to the worker runtime.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// The resolved worker pool size. Zero selects degenerate single-process
    /// mode.
    pub num_workers: u64,
    /// Heartbeat timeout, in milliseconds.
    pub worker_heartbeat_timeout_ms: u64,
    /// Per-worker heap ceiling, in megabytes.
    pub worker_heap_limit_mb: u64,
    /// Logging sink configuration, opaque to the core.
    pub logging: serde_yaml::Value,
    /// Metrics sink configuration, opaque to the core.
    pub metrics: serde_yaml::Value,
    /// Rate-limiter configuration, opaque to the core.
    pub ratelimiter: serde_yaml::Value,
    /// The services to load inside each worker, in order.
    pub services: Vec<ServiceDescriptor>,
    /// Package metadata, surfaced to services and logs.
    pub package: Option<PackageInfo>,
    /// Base path used for module resolution; overridable by `APP_BASE_PATH`.
    pub app_base_path: Option<PathBuf>,
    /// Sticky Dispatcher configuration, if opted into.
    pub sticky: Option<StickyConfig>,
}

impl Config {
    /// Loads, interpolates, parses, resolves, and validates a configuration
    /// from the given source.
    pub fn load(source: ConfigSource) -> Result<Self, Error> {
        let raw: RawConfig = match source {
            ConfigSource::Parsed(value) => {
                serde_yaml::from_value(value).map_err(|err| Error::MalformedDocument {
                    reason: err.to_string(),
                })?
            }
            ConfigSource::Document(document) => {
                let interpolated = interpolate::interpolate_env(&document);
                serde_yaml::from_str(&interpolated).map_err(|err| Error::MalformedDocument {
                    reason: err.to_string(),
                })?
            }
            ConfigSource::Path(path) => {
                let document = fs::read_to_string(&path).map_err(|err| Error::UnreadableFile {
                    file: path.display().to_string(),
                    reason: err.to_string(),
                })?;
                let interpolated = interpolate::interpolate_env(&document);
                serde_yaml::from_str(&interpolated).map_err(|err| Error::MalformedDocument {
                    reason: err.to_string(),
                })?
            }
        };

        raw.validate().map_err(|err| Error::InvalidValues { reason: err.to_string() })?;

        let num_workers = match &raw.num_workers {
            NumWorkersSpec::Count(n) => *n,
            NumWorkersSpec::Expr(expr) => resolve_num_workers_expr(expr)?,
        };

        if raw.services.is_empty() {
            return Err(Error::EmptyServices);
        }

        let app_base_path = std::env::var("APP_BASE_PATH").ok().map(PathBuf::from).or(raw.app_base_path);

        Ok(Config {
            num_workers,
            worker_heartbeat_timeout_ms: raw.worker_heartbeat_timeout_ms,
            worker_heap_limit_mb: raw.worker_heap_limit_mb,
            logging: raw.logging,
            metrics: raw.metrics,
            ratelimiter: raw.ratelimiter,
            services: raw.services,
            package: raw.package,
            app_base_path,
            sticky: raw.sticky,
        })
    }
}

/// Resolves `num_workers` when given as a string: evaluates it as an
/// arithmetic expression over `ncpu`, falling back to the host CPU count
/// when the string doesn't match the restricted grammar at all.
fn resolve_num_workers_expr(expr: &str) -> Result<u64, Error> {
    let ncpu = num_cpus() as i64;

    match expr::eval(expr, ncpu) {
        Ok(value) if value >= 0 => Ok(value as u64),
        Ok(_negative) => Err(Error::NumWorkers {
            expr: expr.to_string(),
            source: ExprError::NegativeResult,
        }),
        Err(ExprError::Syntax(_)) => Ok(ncpu as u64),
        Err(other) => Err(Error::NumWorkers {
            expr: expr.to_string(),
            source: other,
        }),
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolves_integer_num_workers() {
        let config = Config::load(ConfigSource::Document(
            "num_workers: 4\nservices:\n  - name: s\n    module: m\n".to_string(),
        ))
        .unwrap();
        assert_eq!(config.num_workers, 4);
    }

    #[test]
    fn resolves_ncpu_expression() {
        let config = Config::load(ConfigSource::Document(
            "num_workers: \"ncpu + 1\"\nservices:\n  - name: s\n    module: m\n".to_string(),
        ))
        .unwrap();
        assert_eq!(config.num_workers, num_cpus() as u64 + 1);
    }

    #[test]
    fn falls_back_to_ncpu_on_unparseable_expression() {
        let config = Config::load(ConfigSource::Document(
            "num_workers: \"not an expression\"\nservices:\n  - name: s\n    module: m\n".to_string(),
        ))
        .unwrap();
        assert_eq!(config.num_workers, num_cpus() as u64);
    }

    #[test]
    fn empty_services_is_a_config_error() {
        let result = Config::load(ConfigSource::Document("num_workers: 0\nservices: []\n".to_string()));
        assert!(matches!(result, Err(Error::EmptyServices)));
    }

    #[test]
    fn interpolates_env_with_default() {
        std::env::remove_var("SUPD_TEST_VAR");
        let config = Config::load(ConfigSource::Document(
            "num_workers: 0\nservices:\n  - name: s\n    module: m\n    conf:\n      addr: \"{env(SUPD_TEST_VAR, fallback)}\"\n"
                .to_string(),
        ))
        .unwrap();
        assert_eq!(config.services[0].conf["addr"], "fallback");
    }

    #[test]
    fn interpolates_env_when_set() {
        std::env::set_var("SUPD_TEST_VAR2", "override");
        let config = Config::load(ConfigSource::Document(
            "num_workers: 0\nservices:\n  - name: s\n    module: m\n    conf:\n      addr: \"{env(SUPD_TEST_VAR2, fallback)}\"\n"
                .to_string(),
        ))
        .unwrap();
        assert_eq!(config.services[0].conf["addr"], "override");
        std::env::remove_var("SUPD_TEST_VAR2");
    }

    #[test]
    fn invalid_nested_sticky_config_is_rejected() {
        let result = Config::load(ConfigSource::Document(
            "num_workers: 0\nservices:\n  - name: s\n    module: m\nsticky:\n  enabled: true\n  listen_addr: \"0.0.0.0:9000\"\n  relay_base_port: 0\n".to_string(),
        ));
        assert!(matches!(result, Err(Error::InvalidValues { .. })));
    }

    #[test]
    fn defaults_are_applied() {
        let config = Config::load(ConfigSource::Document(
            "num_workers: 0\nservices:\n  - name: s\n    module: m\n".to_string(),
        ))
        .unwrap();
        assert_eq!(config.worker_heartbeat_timeout_ms, 7500);
        assert_eq!(config.worker_heap_limit_mb, 1500);
    }
}
