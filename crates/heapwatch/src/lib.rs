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

//! Per-worker periodic memory measurement with an escalating response.
//! `tick` is pure: it samples memory and returns an [`Action`] describing
//! what the caller should do; the caller (the `worker` crate) owns the
//! actual disconnect-request/exit side effects rather than this crate
//! acting on the runtime directly.

use std::time::Duration;

use sysinfo::{Pid, System};

/// The interval at which Heap Watch samples memory.
pub const TICK_INTERVAL: Duration = Duration::from_millis(60_000);

/// The cadence at which GC pause times are accumulated, when a
/// [`GcPauseSource`] is present.
pub const GC_PAUSE_INTERVAL: Duration = Duration::from_millis(1_000);

/// How many consecutive over-ceiling ticks are tolerated at `warn` severity
/// before escalating to `fatal`.
const FATAL_THRESHOLD: u32 = 3;

/// Grace period between the disconnect request and the forced exit, in
/// clustered mode, once the fail counter exceeds [`FATAL_THRESHOLD`].
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(1_000);

/// Delay after the disconnect request before the worker is forced to exit.
pub const FORCE_EXIT_GRACE: Duration = Duration::from_millis(60_000);

/// A single memory sample.
#[derive(Debug, Clone, Copy)]
pub struct HeapSample {
    /// Resident set size, in bytes.
    pub resident_bytes: u64,
    /// Virtual memory size, in bytes.
    pub total_bytes: u64,
    /// The value compared against the ceiling. Without a language-level heap
    /// profiler to hook into, this is the resident set size.
    pub used_bytes: u64,
}

/// Accumulated garbage-collector pause times between two ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcPause {
    /// Time spent in minor collections, in milliseconds.
    pub minor_ms: f64,
    /// Time spent in major collections, in milliseconds.
    pub major_ms: f64,
    /// Time spent in incremental collection steps, in milliseconds.
    pub incremental_ms: f64,
    /// Time spent in weak-reference processing, in milliseconds.
    pub weak_ms: f64,
}

/// An optional hook a service module can supply to report GC pause times.
/// Its absence is not an error.
pub trait GcPauseSource: Send {
    /// Returns the pause times accumulated since the previous call.
    fn sample(&mut self) -> GcPause;
}

/// Whether the worker is part of a supervised pool (clustered) or running
/// alone in degenerate single-process mode (non-clustered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Running under a supervisor alongside sibling workers.
    Clustered,
    /// Running as the sole process (`num_workers == 0`).
    NonClustered,
}

/// What the caller should do in response to a tick.
#[derive(Debug, Clone, Copy)]
pub enum Action {
    /// Memory is within the ceiling; the fail counter is at zero.
    Ok(HeapSample),
    /// Memory is over the ceiling, but the fail counter has not yet
    /// exceeded [`FATAL_THRESHOLD`]; log at warn.
    Warn(HeapSample),
    /// The fail counter has exceeded [`FATAL_THRESHOLD`]; log at fatal and,
    /// in clustered mode, request a graceful disconnect then force an exit
    /// after the given grace periods. In non-clustered mode, log only.
    Fatal {
        /// The sample that triggered the escalation.
        sample: HeapSample,
        /// Whether a disconnect-then-exit sequence should actually run.
        should_terminate: bool,
        /// Delay before requesting a graceful disconnect.
        disconnect_after: Duration,
        /// Delay after the disconnect request before a forced exit.
        force_exit_after: Duration,
    },
}

/// Periodic memory watcher for a single worker process.
pub struct HeapWatch {
    limit_bytes: u64,
    mode: Mode,
    fail_count: u32,
    system: System,
    pid: Pid,
    gc_pause_source: Option<Box<dyn GcPauseSource>>,
}

impl HeapWatch {
    /// Creates a watcher for the current process with the given ceiling (in
    /// megabytes) and mode.
    pub fn new(limit_mb: u64, mode: Mode) -> Self {
        Self::with_gc_pause_source(limit_mb, mode, None)
    }

    /// Creates a watcher with an optional GC pause source.
    pub fn with_gc_pause_source(limit_mb: u64, mode: Mode, gc_pause_source: Option<Box<dyn GcPauseSource>>) -> Self {
        let pid = sysinfo::get_current_pid().unwrap_or(Pid::from(0));
        Self {
            limit_bytes: limit_mb * 1024 * 1024,
            mode,
            fail_count: 0,
            system: System::new(),
            pid,
            gc_pause_source,
        }
    }

    /// Samples memory and advances the fail counter, returning the action
    /// the caller should take.
    pub fn tick(&mut self) -> Action {
        self.system.refresh_process(self.pid);

        let sample = match self.system.process(self.pid) {
            Some(process) => HeapSample {
                resident_bytes: process.memory(),
                total_bytes: process.virtual_memory(),
                used_bytes: process.memory(),
            },
            None => HeapSample {
                resident_bytes: 0,
                total_bytes: 0,
                used_bytes: 0,
            },
        };

        if sample.used_bytes > self.limit_bytes {
            self.fail_count += 1;
        } else {
            self.fail_count = 0;
        }

        if self.fail_count == 0 {
            return Action::Ok(sample);
        }

        if self.fail_count <= FATAL_THRESHOLD {
            Action::Warn(sample)
        } else {
            Action::Fatal {
                sample,
                should_terminate: self.mode == Mode::Clustered,
                disconnect_after: DISCONNECT_GRACE,
                force_exit_after: FORCE_EXIT_GRACE,
            }
        }
    }

    /// Samples accumulated GC pause times since the previous call, if a
    /// [`GcPauseSource`] was supplied.
    pub fn sample_gc_pause(&mut self) -> Option<GcPause> {
        self.gc_pause_source.as_mut().map(|source| source.sample())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stays_ok_under_ceiling() {
        let mut watch = HeapWatch::new(1_000_000, Mode::Clustered);
        assert!(matches!(watch.tick(), Action::Ok(_) | Action::Warn(_)));
    }

    #[test]
    fn escalates_to_warn_then_fatal() {
        // A near-zero ceiling guarantees every tick is over budget.
        let mut watch = HeapWatch::new(0, Mode::Clustered);

        for _ in 0..FATAL_THRESHOLD {
            assert!(matches!(watch.tick(), Action::Warn(_)));
        }

        match watch.tick() {
            Action::Fatal { should_terminate, .. } => assert!(should_terminate),
            other => panic!("expected Fatal, got {other:?}"),
        }
    }

    #[test]
    fn non_clustered_fatal_does_not_request_termination() {
        let mut watch = HeapWatch::new(0, Mode::NonClustered);
        for _ in 0..FATAL_THRESHOLD {
            let _ = watch.tick();
        }
        match watch.tick() {
            Action::Fatal { should_terminate, .. } => assert!(!should_terminate),
            other => panic!("expected Fatal, got {other:?}"),
        }
    }

    #[test]
    fn fail_counter_resets_once_back_under_ceiling() {
        let mut watch = HeapWatch::new(0, Mode::Clustered);
        let _ = watch.tick();
        let _ = watch.tick();
        watch.limit_bytes = u64::MAX;
        assert!(matches!(watch.tick(), Action::Ok(_)));
    }

    #[test]
    fn absent_gc_pause_source_is_not_an_error() {
        let mut watch = HeapWatch::new(1_000_000, Mode::Clustered);
        assert!(watch.sample_gc_pause().is_none());
    }
}
