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

//! Cross-process rate-limit counter aggregation: a worker-side local
//! aggregator that tracks observed counters and a cached block set, and a
//! master-side global aggregator that merges worker reports through a
//! pluggable [`GlobalLimiter`] and decides which keys to block.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
    time::Instant,
};

pub use ipc::CounterSnapshot;

/// A single key's accumulated counter, kept locally between drains.
#[derive(Debug, Clone)]
struct RateCounter {
    value: u64,
    limits: BTreeSet<u64>,
    first_seen_at: Instant,
}

impl RateCounter {
    fn new() -> Self {
        Self {
            value: 0,
            limits: BTreeSet::new(),
            first_seen_at: Instant::now(),
        }
    }
}

/// Worker-side half of the aggregator: tracks local counters and the last
/// block set broadcast by the master.
pub struct LocalAggregator {
    counters: Mutex<HashMap<String, RateCounter>>,
    blocks: Mutex<HashMap<String, u64>>,
}

impl Default for LocalAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAggregator {
    /// Creates an aggregator with no counters and no cached blocks.
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Adds `increment` to `counters[key].value`, records `limit` in the
    /// key's limit set, and returns whether the cached block value for
    /// `key` exceeds `limit`.
    pub fn observe(&self, key: &str, limit: u64, increment: u64) -> bool {
        {
            let mut counters = self.counters.lock().expect("ratelimiter counters lock poisoned");
            let counter = counters.entry(key.to_string()).or_insert_with(RateCounter::new);
            counter.value += increment;
            let _ = counter.limits.insert(limit);
        }
        self.peek(key, limit)
    }

    /// Performs the same check as [`Self::observe`] without mutating
    /// counters.
    pub fn peek(&self, key: &str, limit: u64) -> bool {
        let blocks = self.blocks.lock().expect("ratelimiter blocks lock poisoned");
        blocks.get(key).is_some_and(|value| *value > limit)
    }

    /// Atomically swaps out the counters map, returning a serializable
    /// snapshot to ship to the master and leaving an empty map behind.
    pub fn drain(&self) -> HashMap<String, CounterSnapshot> {
        let drained = {
            let mut counters = self.counters.lock().expect("ratelimiter counters lock poisoned");
            std::mem::take(&mut *counters)
        };

        drained
            .into_iter()
            .map(|(key, counter)| {
                (
                    key,
                    CounterSnapshot {
                        value: counter.value,
                        limits: counter.limits.into_iter().collect(),
                    },
                )
            })
            .collect()
    }

    /// Replaces the locally cached block set wholesale: a missed broadcast
    /// means the worker continues to use the prior block set.
    pub fn replace_blocks(&self, new_blocks: HashMap<String, u64>) {
        let mut blocks = self.blocks.lock().expect("ratelimiter blocks lock poisoned");
        *blocks = new_blocks;
    }

    fn peek_snapshot(&self, key: &str) -> Option<CounterSnapshot> {
        let counters = self.counters.lock().expect("ratelimiter counters lock poisoned");
        counters.get(key).map(|counter| CounterSnapshot {
            value: counter.value,
            limits: counter.limits.iter().copied().collect(),
        })
    }
}

/// A master-side global limiter backing algorithm. The specific algorithm
/// (token bucket, sliding window, ...) is delegated; only the decision
/// interface is normative.
pub trait GlobalLimiter: Send {
    /// Returns whether `key`'s aggregated value, given the effective
    /// (minimum-across-workers) limit, is currently above the limit.
    fn is_above_limit(&mut self, key: &str, min_limit: u64, increment: u64) -> bool;
}

/// A simple fixed-window counter, used as the default [`GlobalLimiter`]
/// when the embedder does not supply one of their own.
pub struct SlidingWindowLimiter {
    window: std::time::Duration,
    windows: HashMap<String, (Instant, u64)>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter with the given window duration.
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window,
            windows: HashMap::new(),
        }
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(1))
    }
}

impl GlobalLimiter for SlidingWindowLimiter {
    fn is_above_limit(&mut self, key: &str, min_limit: u64, increment: u64) -> bool {
        let now = Instant::now();
        let entry = self.windows.entry(key.to_string()).or_insert((now, 0));

        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }

        entry.1 += increment;
        entry.1 > min_limit
    }
}

/// Master-side aggregator: merges worker counter reports through a
/// [`GlobalLimiter`] and produces the block set to broadcast.
pub struct GlobalAggregator {
    limiter: Box<dyn GlobalLimiter>,
    blocks: HashMap<String, u64>,
}

impl GlobalAggregator {
    /// Creates an aggregator backed by the given limiter.
    pub fn new(limiter: Box<dyn GlobalLimiter>) -> Self {
        Self {
            limiter,
            blocks: HashMap::new(),
        }
    }

    /// Merges one worker's drained counters into the global limiter. For
    /// each key, the effective limit is the minimum of all limits observed
    /// for that key. Returns `Some(full block map)` if any key's block
    /// decision changed, so the caller can broadcast it; `None` otherwise.
    pub fn merge(&mut self, worker_counters: HashMap<String, CounterSnapshot>) -> Option<HashMap<String, u64>> {
        let mut changed = false;

        for (key, snapshot) in worker_counters {
            let Some(min_limit) = snapshot.limits.iter().min().copied() else {
                continue;
            };

            let blocked = self.limiter.is_above_limit(&key, min_limit, snapshot.value);

            if blocked {
                if self.blocks.insert(key, snapshot.value) != Some(snapshot.value) {
                    changed = true;
                }
            } else if self.blocks.remove(&key).is_some() {
                changed = true;
            }
        }

        changed.then(|| self.blocks.clone())
    }
}

/// Performs both the worker-side and master-side roles in a single process,
/// for the degenerate `num_workers == 0` case where there is no IPC round
/// trip to drain counters across.
pub struct StandaloneAggregator {
    local: LocalAggregator,
    global: Mutex<GlobalAggregator>,
}

impl StandaloneAggregator {
    /// Creates a standalone aggregator backed by the given limiter.
    pub fn new(limiter: Box<dyn GlobalLimiter>) -> Self {
        Self {
            local: LocalAggregator::new(),
            global: Mutex::new(GlobalAggregator::new(limiter)),
        }
    }

    /// Observes `key`, immediately folding the global limiter's decision
    /// back into the local block cache, and returns whether `key` is
    /// currently blocked at `limit`.
    pub fn observe(&self, key: &str, limit: u64, increment: u64) -> bool {
        let _ = self.local.observe(key, limit, increment);

        if let Some(snapshot) = self.local.peek_snapshot(key) {
            let mut global = self.global.lock().expect("ratelimiter global lock poisoned");
            if let Some(new_blocks) = global.merge(HashMap::from([(key.to_string(), snapshot)])) {
                self.local.replace_blocks(new_blocks);
            }
        }

        self.local.peek(key, limit)
    }

    /// Performs the cached-block check without observing a new increment.
    pub fn peek(&self, key: &str, limit: u64) -> bool {
        self.local.peek(key, limit)
    }
}

/// A uniform handle over either aggregator role a service sees: workers get
/// a [`LocalAggregator`], the degenerate single-process mode gets a
/// [`StandaloneAggregator`]; both answer the same `observe`/`peek` calls a
/// service module's `Options.ratelimiter` handle exposes.
pub trait RatelimiterHandle: Send + Sync {
    /// See [`LocalAggregator::observe`].
    fn observe(&self, key: &str, limit: u64, increment: u64) -> bool;
    /// See [`LocalAggregator::peek`].
    fn peek(&self, key: &str, limit: u64) -> bool;
}

impl RatelimiterHandle for LocalAggregator {
    fn observe(&self, key: &str, limit: u64, increment: u64) -> bool {
        LocalAggregator::observe(self, key, limit, increment)
    }

    fn peek(&self, key: &str, limit: u64) -> bool {
        LocalAggregator::peek(self, key, limit)
    }
}

impl RatelimiterHandle for StandaloneAggregator {
    fn observe(&self, key: &str, limit: u64, increment: u64) -> bool {
        StandaloneAggregator::observe(self, key, limit, increment)
    }

    fn peek(&self, key: &str, limit: u64) -> bool {
        StandaloneAggregator::peek(self, key, limit)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn observe_reports_no_block_until_broadcast_arrives() {
        let local = LocalAggregator::new();
        assert!(!local.observe("k", 10, 1));
    }

    #[test]
    fn observe_reports_block_once_cached_blocks_say_so() {
        let local = LocalAggregator::new();
        local.replace_blocks(HashMap::from([("k".to_string(), 20)]));
        assert!(local.observe("k", 10, 1));
        assert!(!local.observe("k", 25, 1));
    }

    #[test]
    fn drain_empties_counters_and_preserves_limits() {
        let local = LocalAggregator::new();
        let _ = local.observe("k", 10, 3);
        let _ = local.observe("k", 20, 2);

        let snapshot = local.drain();
        assert_eq!(snapshot["k"].value, 5);
        assert_eq!(snapshot["k"].limits, vec![10, 20]);

        let empty = local.drain();
        assert!(empty.is_empty());
    }

    struct AlwaysBlock;
    impl GlobalLimiter for AlwaysBlock {
        fn is_above_limit(&mut self, _key: &str, _min_limit: u64, _increment: u64) -> bool {
            true
        }
    }

    #[test]
    fn global_aggregator_broadcasts_on_change() {
        let mut global = GlobalAggregator::new(Box::new(AlwaysBlock));
        let counters = HashMap::from([(
            "k".to_string(),
            CounterSnapshot {
                value: 5,
                limits: vec![10],
            },
        )]);

        let first = global.merge(counters.clone());
        assert_eq!(first, Some(HashMap::from([("k".to_string(), 5)])));

        // same value again: no change, no re-broadcast.
        let second = global.merge(counters);
        assert_eq!(second, None);
    }

    #[test]
    fn standalone_aggregator_blocks_without_ipc_round_trip() {
        let standalone = StandaloneAggregator::new(Box::new(AlwaysBlock));
        // First observe triggers the global limiter, which always blocks;
        // the decision should be visible on the very same call.
        assert!(standalone.observe("k", 1, 1));
    }
}
