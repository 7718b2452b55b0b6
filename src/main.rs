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

//! The `supd` binary: the master's own command line, and (via `--role
//! worker`) the re-exec'd entry point every worker process runs through.
//! Argument parsing beyond the `--role`/`--worker-id` re-exec contract and
//! the exit-code contract is glue, not core (spec.md §1); this is
//! deliberately thin.

use std::path::PathBuf;

use clap::Parser;
use config::ConfigSource;
use tracing_subscriber::{prelude::*, reload, EnvFilter};

mod registry;

/// `supd`: a generic service supervisor.
#[derive(Parser, Debug)]
#[command(name = "supd", version, about = "Generic service supervisor")]
struct Cli {
    /// Path to the YAML configuration file. Defaults to `supd.yaml` in the
    /// current directory.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Set by the master when re-execing a worker process. Not meant to be
    /// passed directly.
    #[arg(long, hide = true)]
    role: Option<String>,

    /// The worker slot id, set alongside `--role worker`.
    #[arg(long = "worker-id", hide = true)]
    worker_id: Option<u32>,
}

fn base_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (filter_layer, reload_handle) = reload::Layer::new(base_filter());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
    let log_controller = worker::LogController::new(reload_handle, base_filter());

    let services = registry::build();

    let exit_code = match cli.role.as_deref() {
        Some("worker") => {
            let worker_id = cli.worker_id.unwrap_or(0);
            worker::run_clustered(
                worker_id,
                tokio::io::stdin(),
                tokio::io::stdout(),
                &services,
                Some(log_controller),
            )
            .await
        }
        Some(other) => {
            tracing::error!(role = %other, "unrecognized --role; exiting");
            1
        }
        None => {
            let source = match cli.config {
                Some(path) => ConfigSource::Path(path),
                None => ConfigSource::Path(PathBuf::from("supd.yaml")),
            };
            supervisor::run(source, services, Some(log_controller)).await
        }
    };

    std::process::exit(exit_code);
}
