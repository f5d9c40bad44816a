//! Concurrency-safe caches for invocation thunks and resolved handlers.
//!
//! # Publication
//!
//! Reads are lock-free shard lookups. On a miss the thunk is built outside any
//! lock, then published with `entry().or_insert_with`: the first insert wins
//! and every racing caller walks away with the winner. A losing build is
//! dropped; thunks are a pure function of their key, so nothing is lost.
//!
//! # Bounding
//!
//! There is no per-entry LRU. [`DispatchCache::sweep`] clears any table that
//! has grown past its ceiling; cleared entries are rebuilt on next use. A
//! background [`CacheSweeper`] can run the sweep on an interval.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::{ContractKey, DispatchKey, RequestKind};
use crate::error::MediatorError;
use crate::handler::HandlerRef;
use crate::observe::{DispatchObserver, NoopObserver};
use crate::resolver::HandlerResolver;
use crate::thunk::InvocationThunk;

/// One of the cache's tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTable {
    Queries,
    Commands,
    Events,
    Handlers,
}

impl CacheTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTable::Queries => "queries",
            CacheTable::Commands => "commands",
            CacheTable::Events => "events",
            CacheTable::Handlers => "handlers",
        }
    }

    fn for_kind(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Query => CacheTable::Queries,
            RequestKind::Command => CacheTable::Commands,
            RequestKind::Event => CacheTable::Events,
        }
    }
}

impl fmt::Display for CacheTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size ceilings enforced by [`DispatchCache::sweep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLimits {
    pub max_query_thunks: usize,
    pub max_command_thunks: usize,
    pub max_event_thunks: usize,
    pub max_handlers: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_query_thunks: 10_000,
            max_command_thunks: 5_000,
            max_event_thunks: 5_000,
            max_handlers: 10_000,
        }
    }
}

impl CacheLimits {
    fn ceiling(&self, table: CacheTable) -> usize {
        match table {
            CacheTable::Queries => self.max_query_thunks,
            CacheTable::Commands => self.max_command_thunks,
            CacheTable::Events => self.max_event_thunks,
            CacheTable::Handlers => self.max_handlers,
        }
    }
}

/// What a sweep cleared. Zero means the table was within its ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub queries_cleared: usize,
    pub commands_cleared: usize,
    pub events_cleared: usize,
    pub handlers_cleared: usize,
}

impl SweepReport {
    /// Total entries dropped.
    pub fn total(&self) -> usize {
        self.queries_cleared + self.commands_cleared + self.events_cleared + self.handlers_cleared
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Thunk and handler caches for one mediator.
///
/// Explicitly constructed and owned; two mediators never share entries unless
/// they share the `Arc<DispatchCache>`.
pub struct DispatchCache {
    queries: DashMap<DispatchKey, InvocationThunk>,
    commands: DashMap<DispatchKey, InvocationThunk>,
    events: DashMap<DispatchKey, InvocationThunk>,
    handlers: DashMap<ContractKey, HandlerRef>,
    limits: CacheLimits,
    published: AtomicUsize,
    observer: Arc<dyn DispatchObserver>,
}

impl DispatchCache {
    pub fn new(limits: CacheLimits) -> Self {
        Self::with_observer(limits, Arc::new(NoopObserver))
    }

    /// Cache that reports its table sizes to `observer`.
    pub fn with_observer(limits: CacheLimits, observer: Arc<dyn DispatchObserver>) -> Self {
        Self {
            queries: DashMap::new(),
            commands: DashMap::new(),
            events: DashMap::new(),
            handlers: DashMap::new(),
            limits,
            published: AtomicUsize::new(0),
            observer,
        }
    }

    fn thunks(&self, table: CacheTable) -> &DashMap<DispatchKey, InvocationThunk> {
        match table {
            CacheTable::Queries => &self.queries,
            CacheTable::Commands => &self.commands,
            _ => &self.events,
        }
    }

    /// Cached thunk for `key`, building it with `build` on a miss.
    ///
    /// `build` runs outside any lock and may run concurrently for the same key;
    /// exactly one result is published. A failed build caches nothing.
    pub fn get_or_build<F>(&self, key: &DispatchKey, build: F) -> Result<InvocationThunk, MediatorError>
    where
        F: FnOnce() -> Result<InvocationThunk, MediatorError>,
    {
        let table = CacheTable::for_kind(key.kind());
        let thunks = self.thunks(table);
        if let Some(thunk) = thunks.get(key) {
            return Ok(thunk.clone());
        }

        debug!(request = key.request_name(), kind = %key.kind(), "thunk cache miss");
        let built = build()?;

        let mut published = false;
        let thunk = thunks
            .entry(*key)
            .or_insert_with(|| {
                published = true;
                built
            })
            .clone();

        if published {
            self.published.fetch_add(1, Ordering::Relaxed);
            self.observer.cache_size(table, thunks.len());
        } else {
            debug!(request = key.request_name(), "discarded duplicate thunk");
        }
        Ok(thunk)
    }

    /// Handler for `contract`, from cache or from `resolver`.
    ///
    /// Only singleton handlers are retained. Transient and scoped instances
    /// are handed back and forgotten.
    pub fn get_or_resolve_handler(
        &self,
        contract: &ContractKey,
        resolver: &dyn HandlerResolver,
    ) -> Result<HandlerRef, MediatorError> {
        if let Some(handler) = self.handlers.get(contract) {
            return Ok(handler.clone());
        }

        let resolved = resolver
            .resolve(contract)?
            .ok_or(MediatorError::HandlerNotFound {
                contract: contract.name(),
            })?;

        if !resolved.lifetime.is_cacheable() {
            return Ok(resolved.handler);
        }

        let handler = self
            .handlers
            .entry(*contract)
            .or_insert(resolved.handler)
            .clone();
        self.observer
            .cache_size(CacheTable::Handlers, self.handlers.len());
        Ok(handler)
    }

    /// Clear every table whose size exceeds its ceiling.
    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            queries_cleared: self.sweep_thunks(CacheTable::Queries),
            commands_cleared: self.sweep_thunks(CacheTable::Commands),
            events_cleared: self.sweep_thunks(CacheTable::Events),
            handlers_cleared: self.sweep_handlers(),
        };

        if !report.is_empty() {
            info!(
                queries = report.queries_cleared,
                commands = report.commands_cleared,
                events = report.events_cleared,
                handlers = report.handlers_cleared,
                "dispatch cache sweep cleared oversized tables"
            );
        }
        report
    }

    fn sweep_thunks(&self, table: CacheTable) -> usize {
        let thunks = self.thunks(table);
        let size = thunks.len();
        if size <= self.limits.ceiling(table) {
            return 0;
        }
        thunks.clear();
        self.observer.cache_size(table, thunks.len());
        size
    }

    fn sweep_handlers(&self) -> usize {
        let size = self.handlers.len();
        if size <= self.limits.max_handlers {
            return 0;
        }
        self.handlers.clear();
        self.observer
            .cache_size(CacheTable::Handlers, self.handlers.len());
        size
    }

    /// Drop everything, regardless of limits.
    pub fn clear(&self) {
        for table in [CacheTable::Queries, CacheTable::Commands, CacheTable::Events] {
            self.thunks(table).clear();
            self.observer.cache_size(table, 0);
        }
        self.handlers.clear();
        self.observer.cache_size(CacheTable::Handlers, 0);
    }

    /// Current number of entries in `table`.
    pub fn len(&self, table: CacheTable) -> usize {
        match table {
            CacheTable::Handlers => self.handlers.len(),
            other => self.thunks(other).len(),
        }
    }

    /// Cached thunks across all three thunk tables.
    pub fn thunk_count(&self) -> usize {
        self.queries.len() + self.commands.len() + self.events.len()
    }

    /// Returns true if a thunk for `key` is cached.
    pub fn contains(&self, key: &DispatchKey) -> bool {
        self.thunks(CacheTable::for_kind(key.kind())).contains_key(key)
    }

    /// How many thunks have ever been published (first-insert wins only).
    pub fn published_thunks(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    /// Sweep on a fixed interval until the returned handle is stopped or
    /// dropped, or the cache itself is dropped.
    ///
    /// The task holds only a weak reference to the cache.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> CacheSweeper {
        let interval = interval.max(Duration::from_millis(1));
        let cache: Weak<Self> = Arc::downgrade(self);
        let token = CancellationToken::new();
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.sweep();
                    }
                }
            }
            info!("dispatch cache sweeper stopped");
        });

        info!(interval_ms = interval.as_millis() as u64, "dispatch cache sweeper started");
        CacheSweeper {
            token,
            handle: Some(handle),
        }
    }
}

impl fmt::Debug for DispatchCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchCache")
            .field("queries", &self.queries.len())
            .field("commands", &self.commands.len())
            .field("events", &self.events.len())
            .field("handlers", &self.handlers.len())
            .field("limits", &self.limits)
            .finish()
    }
}

/// Handle to a background sweep task. Dropping it stops the task.
pub struct CacheSweeper {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CacheSweeper {
    /// Stop the task and wait for it to exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Returns true once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
