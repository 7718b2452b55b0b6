//! Dynamic log-level control used by the SIGUSR2 trace-logging burst:
//! a [`tracing_subscriber::reload::Handle`] lets the
//! worker temporarily widen its own filter without tearing down and
//! reinstalling the global subscriber.

use std::time::Duration;

use tracing_subscriber::{filter::LevelFilter, reload, EnvFilter};

/// How long a SIGUSR2 trace burst stays in effect before the previous filter
/// is restored.
pub const TRACE_BURST_DURATION: Duration = Duration::from_millis(5_000);

/// A handle onto the worker's reloadable log filter, installed by whatever
/// sets up the worker's `tracing_subscriber::Registry`.
#[derive(Clone)]
pub struct LogController {
    handle: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
    base_filter: EnvFilter,
}

impl LogController {
    /// Wraps a reload handle with the filter that should be restored once a
    /// trace burst ends.
    pub fn new(handle: reload::Handle<EnvFilter, tracing_subscriber::Registry>, base_filter: EnvFilter) -> Self {
        Self { handle, base_filter }
    }

    /// Raises the log level to `trace` for [`TRACE_BURST_DURATION`], then
    /// restores the prior filter. Errors modifying the filter are logged and
    /// otherwise swallowed: a failed verbosity bump is not worth crashing a
    /// worker over.
    pub fn burst_trace(&self) {
        if let Err(err) = self.handle.modify(|filter| *filter = EnvFilter::new(LevelFilter::TRACE.to_string())) {
            tracing::warn!(error = %err, "failed to raise log verbosity for trace burst");
            return;
        }

        let handle = self.handle.clone();
        let base_filter = self.base_filter.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(TRACE_BURST_DURATION).await;
            if let Err(err) = handle.modify(|filter| *filter = base_filter) {
                tracing::warn!(error = %err, "failed to restore log verbosity after trace burst");
            }
        });
    }

    /// Rebuilds the active filter from a reloaded configuration's `logging`
    /// section (its `level` field, e.g. `logging: {level: debug}`; falls back
    /// to `info` when absent or unrecognized). The new filter also becomes
    /// what a later trace burst restores to, so a reload during a burst
    /// isn't silently undone once the burst ends.
    pub fn reconfigure(&mut self, logging: &serde_yaml::Value) {
        let level = logging
            .as_mapping()
            .and_then(|mapping| mapping.get(&serde_yaml::Value::String("level".to_string())))
            .and_then(|value| value.as_str())
            .unwrap_or("info");

        let new_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

        if let Err(err) = self.handle.modify(|filter| *filter = new_filter.clone()) {
            tracing::warn!(error = %err, "failed to rebuild log filter from reloaded configuration");
            return;
        }
        self.base_filter = new_filter;
    }
}

/// Writes a best-effort heap snapshot into the temp directory. Absence of a
/// real heap-profiling facility is not an error: this writes
/// whatever [`heapwatch::HeapSample`] can observe from the OS.
pub fn write_heap_snapshot(worker_id: u32, sample: heapwatch::HeapSample) {
    let path = std::env::temp_dir().join(format!("supd-worker-{worker_id}-{}.heapsnapshot", std::process::id()));

    let contents = format!(
        "resident_bytes={}\ntotal_bytes={}\nused_bytes={}\n",
        sample.resident_bytes, sample.total_bytes, sample.used_bytes
    );

    if let Err(err) = std::fs::write(&path, contents) {
        tracing::warn!(error = %err, path = %path.display(), "failed to write heap snapshot");
    } else {
        tracing::info!(path = %path.display(), "wrote heap snapshot");
    }
}
