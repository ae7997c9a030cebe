//! Operation timings and key cache counters.
//!
//! A `MetricsSink` is told how long each encrypt, decrypt and metastore call
//! took, and whether each key cache lookup hit or missed. Every method has an
//! empty default, so a sink overrides only what it exports.
//! `MetricsRecorder` keeps running totals in memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Receives metrics from a factory. Called synchronously on the thread doing
/// the work.
pub trait MetricsSink: Send + Sync {
    fn encrypt(&self, _elapsed: Duration) {}
    fn decrypt(&self, _elapsed: Duration) {}
    fn metastore_load(&self, _elapsed: Duration) {}
    fn metastore_store(&self, _elapsed: Duration) {}
    /// `cache` is `"system"` or `"intermediate"`.
    fn cache_hit(&self, _cache: &str) {}
    fn cache_miss(&self, _cache: &str) {}
}

#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Timer {
    count: Counter,
    total_us: Counter,
}

impl Timer {
    fn record(&self, elapsed: Duration) {
        self.count.inc();
        self.total_us
            .add(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            count: self.count.get(),
            total_us: self.total_us.get(),
        }
    }
}

/// Call count and cumulative duration in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total_us: u64,
}

/// Point-in-time copy of a `MetricsRecorder`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub encrypt: TimerSnapshot,
    pub decrypt: TimerSnapshot,
    pub metastore_load: TimerSnapshot,
    pub metastore_store: TimerSnapshot,
    pub system_cache_hits: u64,
    pub system_cache_misses: u64,
    pub intermediate_cache_hits: u64,
    pub intermediate_cache_misses: u64,
}

/// In-memory totals for every metric a factory reports.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    encrypt: Timer,
    decrypt: Timer,
    metastore_load: Timer,
    metastore_store: Timer,
    system_hits: Counter,
    system_misses: Counter,
    intermediate_hits: Counter,
    intermediate_misses: Counter,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            encrypt: self.encrypt.snapshot(),
            decrypt: self.decrypt.snapshot(),
            metastore_load: self.metastore_load.snapshot(),
            metastore_store: self.metastore_store.snapshot(),
            system_cache_hits: self.system_hits.get(),
            system_cache_misses: self.system_misses.get(),
            intermediate_cache_hits: self.intermediate_hits.get(),
            intermediate_cache_misses: self.intermediate_misses.get(),
        }
    }

    fn cache_counter(&self, cache: &str, hit: bool) -> Option<&Counter> {
        match (cache, hit) {
            ("system", true) => Some(&self.system_hits),
            ("system", false) => Some(&self.system_misses),
            ("intermediate", true) => Some(&self.intermediate_hits),
            ("intermediate", false) => Some(&self.intermediate_misses),
            _ => None,
        }
    }
}

impl MetricsSink for MetricsRecorder {
    fn encrypt(&self, elapsed: Duration) {
        self.encrypt.record(elapsed);
    }

    fn decrypt(&self, elapsed: Duration) {
        self.decrypt.record(elapsed);
    }

    fn metastore_load(&self, elapsed: Duration) {
        self.metastore_load.record(elapsed);
    }

    fn metastore_store(&self, elapsed: Duration) {
        self.metastore_store.record(elapsed);
    }

    fn cache_hit(&self, cache: &str) {
        if let Some(counter) = self.cache_counter(cache, true) {
            counter.inc();
        }
    }

    fn cache_miss(&self, cache: &str) {
        if let Some(counter) = self.cache_counter(cache, false) {
            counter.inc();
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// The timed operations a factory reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timed {
    Encrypt,
    Decrypt,
    MetastoreLoad,
    MetastoreStore,
}

/// The metrics sinks attached to one factory.
#[derive(Clone, Default)]
pub(crate) struct Metrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl Metrics {
    pub(crate) fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }

    /// Run `op` and report how long it took as `timed`.
    pub(crate) fn time<T>(&self, timed: Timed, op: impl FnOnce() -> T) -> T {
        if self.sinks.is_empty() {
            return op();
        }
        let start = Instant::now();
        let out = op();
        let elapsed = start.elapsed();
        for sink in &self.sinks {
            match timed {
                Timed::Encrypt => sink.encrypt(elapsed),
                Timed::Decrypt => sink.decrypt(elapsed),
                Timed::MetastoreLoad => sink.metastore_load(elapsed),
                Timed::MetastoreStore => sink.metastore_store(elapsed),
            }
        }
        out
    }

    pub(crate) fn cache_hit(&self, cache: &str) {
        for sink in &self.sinks {
            sink.cache_hit(cache);
        }
    }

    pub(crate) fn cache_miss(&self, cache: &str) {
        for sink in &self.sinks {
            sink.cache_miss(cache);
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
