//! # Switchboard
//!
//! An in-process mediator that routes typed queries, commands and events to
//! their handlers through a configurable pipeline.
//!
//! ## Core Concepts
//!
//! Switchboard separates **asking** from **telling**:
//! - [`Query`] = Read (exactly one handler, returns a value)
//! - [`Command`] = Write (exactly one handler, returns a result)
//! - [`Event`] = Notification (zero or more handlers, fan-out)
//!
//! Callers never name a handler. The [`Mediator`] resolves one through a
//! [`HandlerResolver`], wraps the call in the configured [`PipelineStep`]s, and
//! invokes it through a cached [`InvocationThunk`].
//!
//! ## Architecture
//!
//! ```text
//! mediator.query(q) / send(c) / publish(e)
//!     │
//!     ▼
//! DispatchCache ──── miss ──► InvokerFactory.build()
//!     │                        ├─► CompiledInvokerFactory (default)
//!     │                        └─► StaticHandlerRegistry  (static-dispatch)
//!     │
//!     ├─► handler: cache ── miss ──► HandlerResolver.resolve()
//!     │
//!     ▼
//! PipelineExecutor
//!     │
//!     ├─► global step 1 ──┐
//!     │                   ▼
//!     │            global step 2 ──┐
//!     │                            ▼
//!     │                   per-type step ──┐
//!     │                                   ▼
//!     │                            InvocationThunk.call()
//!     │                                   │
//!     │                                   ├─► QueryHandler / CommandHandler
//!     │                                   └─► EventHandler × N (join_all)
//!     ▼
//! Result<Output, MediatorError>
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One handler per query or command** - Duplicates are rejected at registration
//! 2. **Thunks are built once per request type** - Concurrent first use publishes exactly one
//! 3. **Pipelines run outside-in** - Global steps wrap per-type steps wrap the handler
//! 4. **Every event handler runs** - Failures are aggregated, never short-circuited
//! 5. **Cancellation is cooperative** - The token reaches every step and handler
//!
//! ## Example
//!
//! ```ignore
//! use switchboard::{async_trait, CancellationToken, HandlerContainer, Mediator, Query, QueryHandler};
//!
//! #[derive(Debug, Clone)]
//! struct GetUser { id: u64 }
//!
//! impl Query for GetUser {
//!     type Output = Option<User>;
//! }
//!
//! struct GetUserHandler { db: Db }
//!
//! #[async_trait]
//! impl QueryHandler<GetUser> for GetUserHandler {
//!     async fn handle(&self, q: GetUser, _cancel: CancellationToken) -> anyhow::Result<Option<User>> {
//!         self.db.find_user(q.id).await
//!     }
//! }
//!
//! let mediator = Mediator::builder(
//!     HandlerContainer::new().with_query::<GetUser, _>(GetUserHandler { db }),
//! )
//! .with_pipeline(PipelineConfig::new().add_global(TracingStep))
//! .build();
//!
//! let user = mediator.query(GetUser { id: 7 }).await?;
//! ```
//!
//! ## Dispatch strategies
//!
//! The default [`CompiledInvokerFactory`] builds thunks lazily from the
//! request's static type. With the `static-dispatch` feature, the default
//! becomes an empty [`StaticHandlerRegistry`] and every request type must be
//! registered up front; dispatch then never falls back to runtime building.

// Core modules
mod cache;
mod config;
mod core;
mod error;
mod handler;
mod invoker;
mod mediator;
mod observe;
mod pipeline;
mod registry;
mod resolver;
mod thunk;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export request types
pub use crate::core::{
    AnyRequest, Command, ContractKey, DispatchKey, ErasedResponse, Event, Query, RequestKind,
};

// Re-export error types
pub use crate::error::{ErrorKind, HandlerFailure, MediatorError, ResolverError};

// Re-export handler types
pub use handler::{CommandHandler, EventHandler, HandlerRef, QueryHandler};

// Re-export thunk types
pub use thunk::{
    bound_event_thunk, command_thunk, command_thunk_with, event_thunk, query_thunk,
    query_thunk_with, InvocationThunk,
};

// Re-export invoker strategies
pub use invoker::{
    default_invokers, CompiledInvokerFactory, InvokerFactory, RequestDescriptor, ThunkCompiler,
};
pub use registry::StaticHandlerRegistry;

// Re-export resolver types
pub use resolver::{HandlerContainer, HandlerLifetime, HandlerResolver, Resolved};

// Re-export cache types
pub use cache::{CacheLimits, CacheSweeper, CacheTable, DispatchCache, SweepReport};

// Re-export pipeline types
pub use pipeline::{
    Next, PipelineConfig, PipelineExecutor, PipelineResult, PipelineStep, TracingStep,
    ValidationStep,
};

// Re-export observer types
pub use observe::{
    CacheSizes, DispatchObserver, DispatchStats, DurationBucket, KindCounts, NoopObserver,
    StatsSnapshot, DURATION_BUCKETS_MICROS,
};

// Re-export mediator types (primary entry point)
pub use config::MediatorConfig;
pub use mediator::{Mediator, MediatorBuilder};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
