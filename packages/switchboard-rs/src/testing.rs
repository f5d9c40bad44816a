//! Testing utilities for code built on switchboard.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! switchboard = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Recording pipeline order
//!
//! ```ignore
//! use switchboard::testing::{RecordingStep, StepLog};
//!
//! let log = StepLog::new();
//! let pipeline = PipelineConfig::new()
//!     .add_global(RecordingStep::new("auth", &log))
//!     .add_per_type::<CreateUser>(RecordingStep::new("validate", &log));
//!
//! mediator.send(CreateUser { .. }).await?;
//!
//! assert_eq!(
//!     log.entries(),
//!     vec!["auth:before", "validate:before", "validate:after", "auth:after"]
//! );
//! ```
//!
//! # Counting thunk builds
//!
//! ```ignore
//! use switchboard::testing::CountingFactory;
//!
//! let factory = Arc::new(CountingFactory::compiled());
//! let mediator = MediatorBuilder::new(container)
//!     .with_invokers(factory.clone())
//!     .build();
//!
//! mediator.query(Ping { id: 1 }).await?;
//! mediator.query(Ping { id: 2 }).await?;
//! assert_eq!(factory.builds(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::{AnyRequest, ContractKey, DispatchKey};
use crate::error::{MediatorError, ResolverError};
use crate::handler::HandlerRef;
use crate::invoker::{CompiledInvokerFactory, InvokerFactory, RequestDescriptor};
use crate::pipeline::{Next, PipelineResult, PipelineStep};
use crate::resolver::{HandlerResolver, Resolved};
use crate::thunk::InvocationThunk;

/// Shared, ordered log of pipeline activity.
#[derive(Debug, Clone, Default)]
pub struct StepLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        // Poisoned = a test step panicked; the entries are still usable
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.lock().push(entry.into());
    }

    /// Copy of every entry, in order.
    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Pipeline step that logs `name:before` and `name:after` around `next`.
///
/// `name:after` is logged even when the rest of the chain fails.
#[derive(Debug, Clone)]
pub struct RecordingStep {
    name: &'static str,
    log: StepLog,
}

impl RecordingStep {
    pub fn new(name: &'static str, log: &StepLog) -> Self {
        Self {
            name,
            log: log.clone(),
        }
    }
}

#[async_trait]
impl PipelineStep for RecordingStep {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn process(
        &self,
        request: AnyRequest,
        next: Next<'_>,
        cancel: CancellationToken,
    ) -> PipelineResult {
        self.log.push(format!("{}:before", self.name));
        let result = next.run(request, cancel).await;
        self.log.push(format!("{}:after", self.name));
        result
    }
}

/// Invoker factory that counts `build` calls before delegating.
pub struct CountingFactory {
    inner: Arc<dyn InvokerFactory>,
    builds: AtomicUsize,
}

impl CountingFactory {
    pub fn new(inner: Arc<dyn InvokerFactory>) -> Self {
        Self {
            inner,
            builds: AtomicUsize::new(0),
        }
    }

    /// Counting wrapper around a fresh [`CompiledInvokerFactory`].
    pub fn compiled() -> Self {
        Self::new(Arc::new(CompiledInvokerFactory::new()))
    }

    /// Number of `build` calls so far (successful or not).
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl InvokerFactory for CountingFactory {
    fn build(&self, descriptor: &RequestDescriptor) -> Result<InvocationThunk, MediatorError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.inner.build(descriptor)
    }

    fn event_bindings(&self, key: &DispatchKey) -> Option<Vec<InvocationThunk>> {
        self.inner.event_bindings(key)
    }

    fn strategy(&self) -> &'static str {
        self.inner.strategy()
    }
}

/// Resolver whose every call fails with the given message.
#[derive(Debug)]
pub struct FailingResolver {
    message: &'static str,
    calls: AtomicUsize,
}

impl FailingResolver {
    pub fn new(message: &'static str) -> Self {
        Self {
            message,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of resolve calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self, contract: &ContractKey) -> ResolverError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ResolverError::new(contract.name(), anyhow::anyhow!(self.message))
    }
}

impl HandlerResolver for FailingResolver {
    fn resolve(&self, contract: &ContractKey) -> Result<Option<Resolved>, ResolverError> {
        Err(self.fail(contract))
    }

    fn resolve_all(&self, contract: &ContractKey) -> Result<Vec<HandlerRef>, ResolverError> {
        Err(self.fail(contract))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;

    #[derive(Debug, Clone)]
    struct Ping;

    impl Query for Ping {
        type Output = ();
    }

    #[test]
    fn test_step_log_keeps_order() {
        let log = StepLog::new();
        let clone = log.clone();
        log.push("a");
        clone.push("b");

        assert_eq!(log.entries(), vec!["a", "b"]);
        log.clear();
        assert!(clone.entries().is_empty());
    }

    #[test]
    fn test_counting_factory_counts_every_build() {
        let factory = CountingFactory::compiled();
        factory.build(&RequestDescriptor::query::<Ping>()).unwrap();
        let _ = factory.build(&RequestDescriptor::erased(&AnyRequest::query(Ping)));

        assert_eq!(factory.builds(), 2);
        assert_eq!(factory.strategy(), "compiled");
    }

    #[test]
    fn test_failing_resolver_counts_calls() {
        let resolver = FailingResolver::new("boom");
        let err = resolver.resolve(&ContractKey::query::<Ping>()).unwrap_err();

        assert!(err.to_string().contains("boom"));
        assert_eq!(resolver.calls(), 1);
    }
}
