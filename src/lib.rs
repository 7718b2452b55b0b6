#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! `supd` is a generic service supervisor: a master process that forks a
//! pool of worker processes, each running the same set of configured
//! service modules, and keeps that pool healthy over time.
//!
//! The master (see the [`supervisor`] crate) starts the configured number of
//! workers, restarts any that die, monitors their liveness via heartbeats,
//! aggregates their rate-limit counters, watches their memory usage, and can
//! roll them one at a time onto a new configuration without taking the whole
//! pool down. Each worker (see the [`worker`] crate) runs a [`servicehost`]
//! that loads and starts the configured services, and talks back to the
//! master over an [`ipc`] channel framed on its own stdin/stdout.
//!
//! Setting `num_workers: 0` skips the master/worker split entirely and runs
//! the services directly in the one process `supd` was invoked as.

/// Configuration loading and resolution (C1).
pub use config;
/// Per-worker memory watch (C3).
pub use heapwatch;
/// The master-worker wire protocol and framed transport.
pub use ipc;
/// Cross-process rate-limit counter aggregation (C2).
pub use ratelimiter;
/// Service module resolution and lifecycle (C4).
pub use servicehost;
/// The master: fork sequencing, heartbeats, restarts, rolling restart (C6/C7).
pub use supervisor;
/// The worker runtime (C5).
pub use worker;
