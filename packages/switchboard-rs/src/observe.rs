//! Side-channel telemetry hooks.
//!
//! A [`DispatchObserver`] sees every completed dispatch and every cache size
//! change. Observers are told what happened; they cannot influence dispatch.
//! [`DispatchStats`] is a lock-free in-process implementation: per-kind
//! counters, a fixed-bucket duration histogram and per-table size gauges.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::cache::CacheTable;
use crate::core::RequestKind;

/// Receives dispatch telemetry. Every method defaults to a no-op.
pub trait DispatchObserver: Send + Sync + 'static {
    /// A query, command or publish finished (successfully or not).
    fn dispatched(&self, kind: RequestKind, request: &'static str, elapsed: Duration, ok: bool) {
        let _ = (kind, request, elapsed, ok);
    }

    /// The number of entries in a cache table changed.
    fn cache_size(&self, table: CacheTable, size: usize) {
        let _ = (table, size);
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DispatchObserver for NoopObserver {}

// =============================================================================
// Dispatch Stats
// =============================================================================

/// Upper bounds (microseconds) of the duration histogram buckets. One extra
/// bucket collects everything slower.
pub const DURATION_BUCKETS_MICROS: [u64; 10] = [
    10, 50, 100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 1_000_000,
];

const KINDS: usize = 3;
const TABLES: usize = 4;
const BUCKETS: usize = DURATION_BUCKETS_MICROS.len() + 1;

fn kind_index(kind: RequestKind) -> usize {
    match kind {
        RequestKind::Query => 0,
        RequestKind::Command => 1,
        RequestKind::Event => 2,
    }
}

fn table_index(table: CacheTable) -> usize {
    match table {
        CacheTable::Queries => 0,
        CacheTable::Commands => 1,
        CacheTable::Events => 2,
        CacheTable::Handlers => 3,
    }
}

/// Atomic counters fed by the mediator.
///
/// Share it with `MediatorBuilder::with_observer(stats.clone())` by wrapping in
/// an `Arc`, then read with [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatches: [AtomicU64; KINDS],
    failures: [AtomicU64; KINDS],
    durations: [AtomicU64; BUCKETS],
    cache_sizes: [AtomicUsize; TABLES],
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed dispatches of `kind`.
    pub fn dispatches(&self, kind: RequestKind) -> u64 {
        self.dispatches[kind_index(kind)].load(Ordering::Relaxed)
    }

    /// Failed dispatches of `kind`.
    pub fn failures(&self, kind: RequestKind) -> u64 {
        self.failures[kind_index(kind)].load(Ordering::Relaxed)
    }

    /// Last reported size of `table`.
    pub fn cache_size_of(&self, table: CacheTable) -> usize {
        self.cache_sizes[table_index(table)].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let by_kind = |counters: &[AtomicU64; KINDS]| KindCounts {
            queries: counters[0].load(Ordering::Relaxed),
            commands: counters[1].load(Ordering::Relaxed),
            events: counters[2].load(Ordering::Relaxed),
        };

        StatsSnapshot {
            dispatches: by_kind(&self.dispatches),
            failures: by_kind(&self.failures),
            duration_buckets: self
                .durations
                .iter()
                .enumerate()
                .map(|(i, count)| DurationBucket {
                    le_micros: DURATION_BUCKETS_MICROS.get(i).copied(),
                    count: count.load(Ordering::Relaxed),
                })
                .collect(),
            cache_sizes: CacheSizes {
                queries: self.cache_size_of(CacheTable::Queries),
                commands: self.cache_size_of(CacheTable::Commands),
                events: self.cache_size_of(CacheTable::Events),
                handlers: self.cache_size_of(CacheTable::Handlers),
            },
        }
    }
}

impl DispatchObserver for DispatchStats {
    fn dispatched(&self, kind: RequestKind, _request: &'static str, elapsed: Duration, ok: bool) {
        let index = kind_index(kind);
        self.dispatches[index].fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures[index].fetch_add(1, Ordering::Relaxed);
        }

        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let bucket = DURATION_BUCKETS_MICROS
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(BUCKETS - 1);
        self.durations[bucket].fetch_add(1, Ordering::Relaxed);
    }

    fn cache_size(&self, table: CacheTable, size: usize) {
        self.cache_sizes[table_index(table)].store(size, Ordering::Relaxed);
    }
}

/// Per-kind counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub queries: u64,
    pub commands: u64,
    pub events: u64,
}

impl KindCounts {
    pub fn total(&self) -> u64 {
        self.queries + self.commands + self.events
    }
}

/// One histogram bucket; `le_micros == None` is the overflow bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DurationBucket {
    pub le_micros: Option<u64>,
    pub count: u64,
}

/// Last reported size of each cache table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheSizes {
    pub queries: usize,
    pub commands: usize,
    pub events: usize,
    pub handlers: usize,
}

/// Serializable copy of [`DispatchStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub dispatches: KindCounts,
    pub failures: KindCounts,
    pub duration_buckets: Vec<DurationBucket>,
    pub cache_sizes: CacheSizes,
}
