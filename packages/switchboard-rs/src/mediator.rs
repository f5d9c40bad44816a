//! The mediator: the one entry point callers use.
//!
//! # Flow
//!
//! ```text
//! query/send ──► resolve handler (cache, else resolver)
//!            ──► thunk for (request, response) (cache, else invoker factory)
//!            ──► pipeline chain ──► thunk.call ──► handler
//!            ◄── unwrap typed result
//!
//! publish    ──► fan-out bindings (static registry, else resolver.resolve_all)
//!            ──► pipeline chain once around the whole fan-out
//!            ──► every handler concurrently, failures aggregated
//! ```
//!
//! Direct variants take the handler from the caller and skip the resolver and
//! the cache, but run the same pipeline and the same thunk wrapper.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheSweeper, DispatchCache, SweepReport};
use crate::config::MediatorConfig;
use crate::core::{
    unwrap_response, AnyRequest, Command, ContractKey, DispatchKey, ErasedResponse, Event, Query,
    RequestKind,
};
use crate::error::{HandlerFailure, MediatorError};
use crate::handler::{CommandHandler, EventHandler, HandlerRef, QueryHandler};
use crate::invoker::{default_invokers, InvokerFactory, RequestDescriptor};
use crate::observe::{DispatchObserver, NoopObserver};
use crate::pipeline::{PipelineConfig, PipelineExecutor, PipelineResult};
use crate::registry::StaticHandlerRegistry;
use crate::resolver::HandlerResolver;
use crate::thunk::{event_thunk, InvocationThunk};

/// Routes queries, commands and events to their handlers.
///
/// Cheap to clone; clones share caches, pipeline and resolver.
#[derive(Clone)]
pub struct Mediator {
    resolver: Arc<dyn HandlerResolver>,
    invokers: Arc<dyn InvokerFactory>,
    cache: Arc<DispatchCache>,
    pipeline: Arc<PipelineExecutor>,
    observer: Arc<dyn DispatchObserver>,
    config: MediatorConfig,
}

impl Mediator {
    /// Create a new mediator builder.
    pub fn builder(resolver: impl HandlerResolver) -> MediatorBuilder {
        MediatorBuilder::new(resolver)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Run a query to completion.
    pub async fn query<Q: Query>(&self, query: Q) -> Result<Q::Output, MediatorError> {
        self.query_with_cancel(query, CancellationToken::new()).await
    }

    /// Run a query, observing `cancel`.
    pub async fn query_with_cancel<Q: Query>(
        &self,
        query: Q,
        cancel: CancellationToken,
    ) -> Result<Q::Output, MediatorError> {
        let started = Instant::now();
        let result = self
            .dispatch_resolved(&RequestDescriptor::query::<Q>(), AnyRequest::query(query), cancel)
            .await
            .and_then(unwrap_response::<Q::Output>);
        self.record(RequestKind::Query, std::any::type_name::<Q>(), started, &result);
        result
    }

    /// Run a query against a handler the caller already holds.
    pub async fn query_direct<Q: Query>(
        &self,
        query: Q,
        handler: Arc<dyn QueryHandler<Q>>,
        cancel: CancellationToken,
    ) -> Result<Q::Output, MediatorError> {
        let started = Instant::now();
        let descriptor = RequestDescriptor::query::<Q>();
        let result = match self.invokers.build(&descriptor) {
            Ok(thunk) => self
                .invoke(thunk, HandlerRef::query::<Q>(handler), AnyRequest::query(query), cancel)
                .await
                .and_then(unwrap_response::<Q::Output>),
            Err(e) => Err(e),
        };
        self.record(RequestKind::Query, std::any::type_name::<Q>(), started, &result);
        result
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Execute a command to completion.
    pub async fn send<C: Command>(&self, command: C) -> Result<C::Output, MediatorError> {
        self.send_with_cancel(command, CancellationToken::new()).await
    }

    /// Execute a command, observing `cancel`.
    pub async fn send_with_cancel<C: Command>(
        &self,
        command: C,
        cancel: CancellationToken,
    ) -> Result<C::Output, MediatorError> {
        let started = Instant::now();
        let result = self
            .dispatch_resolved(
                &RequestDescriptor::command::<C>(),
                AnyRequest::command(command),
                cancel,
            )
            .await
            .and_then(unwrap_response::<C::Output>);
        self.record(RequestKind::Command, std::any::type_name::<C>(), started, &result);
        result
    }

    /// Execute a command against a handler the caller already holds.
    pub async fn send_direct<C: Command>(
        &self,
        command: C,
        handler: Arc<dyn CommandHandler<C>>,
        cancel: CancellationToken,
    ) -> Result<C::Output, MediatorError> {
        let started = Instant::now();
        let descriptor = RequestDescriptor::command::<C>();
        let result = match self.invokers.build(&descriptor) {
            Ok(thunk) => self
                .invoke(
                    thunk,
                    HandlerRef::command::<C>(handler),
                    AnyRequest::command(command),
                    cancel,
                )
                .await
                .and_then(unwrap_response::<C::Output>),
            Err(e) => Err(e),
        };
        self.record(RequestKind::Command, std::any::type_name::<C>(), started, &result);
        result
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Broadcast an event to every bound handler.
    pub async fn publish<E: Event>(&self, event: E) -> Result<(), MediatorError> {
        self.publish_with_cancel(event, CancellationToken::new()).await
    }

    /// Broadcast an event, observing `cancel`.
    ///
    /// Every handler runs to completion even if others fail. Failures are
    /// reported together as [`MediatorError::Publish`] once all have finished.
    pub async fn publish_with_cancel<E: Event>(
        &self,
        event: E,
        cancel: CancellationToken,
    ) -> Result<(), MediatorError> {
        let started = Instant::now();
        let result = match self.event_bindings::<E>() {
            Ok(bindings) => self.fan_out(event, bindings, cancel).await,
            Err(e) => Err(e),
        };
        self.record(RequestKind::Event, std::any::type_name::<E>(), started, &result);
        result
    }

    /// Broadcast an event to handlers the caller already holds.
    pub async fn publish_direct<E: Event>(
        &self,
        event: E,
        handlers: Vec<Arc<dyn EventHandler<E>>>,
        cancel: CancellationToken,
    ) -> Result<(), MediatorError> {
        let started = Instant::now();
        let thunk = event_thunk::<E>();
        let bindings = handlers
            .into_iter()
            .map(|handler| (thunk.clone(), HandlerRef::event::<E>(handler)))
            .collect();
        let result = self.fan_out(event, bindings, cancel).await;
        self.record(RequestKind::Event, std::any::type_name::<E>(), started, &result);
        result
    }

    // =========================================================================
    // Erased dispatch
    // =========================================================================

    /// Dispatch a query or command known only by its type tag.
    ///
    /// The invoker factory must already know the type: with the compiled
    /// strategy that means a prior typed call or a declaration, otherwise the
    /// result is `ContractResolution`.
    pub async fn dispatch(
        &self,
        request: AnyRequest,
        cancel: CancellationToken,
    ) -> Result<ErasedResponse, MediatorError> {
        let started = Instant::now();
        let kind = request.kind();
        let request_type = request.type_name();

        let result = if kind == RequestKind::Event {
            Err(MediatorError::ContractResolution {
                request_type,
                response_type: request.key().response_name(),
            })
        } else {
            let descriptor = RequestDescriptor::erased(&request);
            self.dispatch_resolved(&descriptor, request, cancel).await
        };
        self.record(kind, request_type, started, &result);
        result
    }

    // =========================================================================
    // Cache control
    // =========================================================================

    /// Clear every cache table that exceeds its ceiling.
    pub fn sweep_cache(&self) -> SweepReport {
        self.cache.sweep()
    }

    /// Start the background sweep at the configured interval.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn_cache_sweeper(&self) -> CacheSweeper {
        self.cache.spawn_sweeper(self.config.sweep_interval())
    }

    pub fn cache(&self) -> &Arc<DispatchCache> {
        &self.cache
    }

    pub fn config(&self) -> &MediatorConfig {
        &self.config
    }

    /// Name of the active invoker strategy (`"compiled"` or `"static"`).
    pub fn strategy(&self) -> &'static str {
        self.invokers.strategy()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn dispatch_resolved(
        &self,
        descriptor: &RequestDescriptor,
        request: AnyRequest,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let handler = self
            .cache
            .get_or_resolve_handler(descriptor.contract(), self.resolver.as_ref())?;
        let thunk = self
            .cache
            .get_or_build(descriptor.key(), || self.invokers.build(descriptor))?;
        self.invoke(thunk, handler, request, cancel).await
    }

    async fn invoke(
        &self,
        thunk: InvocationThunk,
        handler: HandlerRef,
        request: AnyRequest,
        cancel: CancellationToken,
    ) -> PipelineResult {
        self.pipeline
            .execute(request, cancel, move |request, cancel| {
                thunk.call(handler.clone(), request, cancel)
            })
            .await
    }

    fn event_bindings<E: Event>(&self) -> Result<Vec<(InvocationThunk, HandlerRef)>, MediatorError> {
        let key = DispatchKey::event::<E>();
        if let Some(bound) = self.invokers.event_bindings(&key) {
            return Ok(bound
                .into_iter()
                .map(|thunk| (thunk, HandlerRef::detached()))
                .collect());
        }

        let handlers = self.resolver.resolve_all(&ContractKey::event::<E>())?;
        if handlers.is_empty() {
            return Ok(Vec::new());
        }

        let descriptor = RequestDescriptor::event::<E>();
        let thunk = self
            .cache
            .get_or_build(&key, || self.invokers.build(&descriptor))?;
        Ok(handlers
            .into_iter()
            .map(|handler| (thunk.clone(), handler))
            .collect())
    }

    async fn fan_out<E: Event>(
        &self,
        event: E,
        bindings: Vec<(InvocationThunk, HandlerRef)>,
        cancel: CancellationToken,
    ) -> Result<(), MediatorError> {
        if bindings.is_empty() {
            debug!(event = std::any::type_name::<E>(), "no handlers bound, publish is a no-op");
            return Ok(());
        }

        let bindings = Arc::new(bindings);
        self.pipeline
            .execute(AnyRequest::event(event), cancel, move |request, cancel| {
                let bindings = bindings.clone();
                async move {
                    let event = request.into_inner::<E>()?;
                    let calls = bindings.iter().map(|(thunk, handler)| {
                        thunk.call(handler.clone(), AnyRequest::event(event.clone()), cancel.clone())
                    });
                    let results = join_all(calls).await;
                    collect_failures::<E>(results, &cancel)?;
                    Ok::<_, MediatorError>(Box::new(()) as ErasedResponse)
                }
            })
            .await
            .map(|_| ())
    }

    fn record<T>(
        &self,
        kind: RequestKind,
        request: &'static str,
        started: Instant,
        result: &Result<T, MediatorError>,
    ) {
        if let Err(e) = result {
            debug!(kind = %kind, request, error = %e, "dispatch failed");
        }
        self.observer
            .dispatched(kind, request, started.elapsed(), result.is_ok());
    }
}

/// Turn per-handler outcomes into the publish result.
fn collect_failures<E: Event>(
    results: Vec<PipelineResult>,
    cancel: &CancellationToken,
) -> Result<(), MediatorError> {
    let handlers = results.len();
    let failures: Vec<HandlerFailure> = results
        .into_iter()
        .enumerate()
        .filter_map(|(index, result)| result.err().map(|error| HandlerFailure { index, error }))
        .collect();

    if failures.is_empty() {
        return Ok(());
    }

    let event_type = std::any::type_name::<E>();
    if cancel.is_cancelled() && failures.iter().any(|f| f.error.is_cancelled()) {
        // Caller only sees Cancelled
        for failure in failures.iter().filter(|f| !f.error.is_cancelled()) {
            warn!(
                event = event_type,
                handler = failure.index,
                error = %failure.error,
                "event handler failed before cancellation"
            );
        }
        return Err(MediatorError::Cancelled {
            request_type: event_type,
        });
    }

    warn!(
        event = event_type,
        failed = failures.len(),
        handlers,
        "event handlers failed"
    );
    Err(MediatorError::Publish {
        event_type,
        handlers,
        failures,
    })
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("strategy", &self.invokers.strategy())
            .field("cache", &self.cache)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Mediator Builder
// =============================================================================

/// Builder for [`Mediator`].
///
/// # Example
///
/// ```ignore
/// let container = HandlerContainer::new()
///     .with_query::<GetOrder, _>(GetOrderHandler::new(db.clone()))
///     .with_command::<PlaceOrder, _>(PlaceOrderHandler::new(db.clone()))
///     .with_event::<OrderPlaced, _>(SendConfirmation::new(mailer));
///
/// let mediator = MediatorBuilder::new(container)
///     .with_config(MediatorConfig::from_env()?)
///     .with_pipeline(PipelineConfig::new().add_global(TracingStep))
///     .build();
///
/// let order = mediator.query(GetOrder { id }).await?;
/// ```
pub struct MediatorBuilder {
    resolver: Arc<dyn HandlerResolver>,
    invokers: Option<Arc<dyn InvokerFactory>>,
    pipeline: PipelineConfig,
    observer: Arc<dyn DispatchObserver>,
    config: MediatorConfig,
}

impl MediatorBuilder {
    /// Create a new builder around a resolver.
    pub fn new(resolver: impl HandlerResolver) -> Self {
        Self::with_arc(Arc::new(resolver))
    }

    /// Create a new builder around a shared resolver.
    pub fn with_arc(resolver: Arc<dyn HandlerResolver>) -> Self {
        Self {
            resolver,
            invokers: None,
            pipeline: PipelineConfig::new(),
            observer: Arc::new(NoopObserver),
            config: MediatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MediatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific invoker strategy instead of the build default.
    pub fn with_invokers(mut self, invokers: Arc<dyn InvokerFactory>) -> Self {
        self.invokers = Some(invokers);
        self
    }

    /// Dispatch through explicitly registered invokers only.
    pub fn with_static_registry(self, registry: StaticHandlerRegistry) -> Self {
        self.with_invokers(Arc::new(registry))
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Report dispatch and cache telemetry to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> Mediator {
        let invokers = self.invokers.unwrap_or_else(default_invokers);
        let cache = DispatchCache::with_observer(self.config.cache, self.observer.clone());

        debug!(strategy = invokers.strategy(), "building mediator");
        Mediator {
            resolver: self.resolver,
            invokers,
            cache: Arc::new(cache),
            pipeline: Arc::new(PipelineExecutor::new(self.pipeline)),
            observer: self.observer,
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheLimits, CacheTable};
    use crate::invoker::CompiledInvokerFactory;
    use crate::observe::DispatchStats;
    use crate::pipeline::ValidationStep;
    use crate::resolver::HandlerContainer;
    use crate::testing::{CountingFactory, FailingResolver, RecordingStep, StepLog};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // =========================================================================
    // Test types
    // =========================================================================

    #[derive(Debug, Clone, PartialEq)]
    struct Ping {
        id: i64,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Pong {
        id: i64,
    }

    impl Query for Ping {
        type Output = Pong;
    }

    struct PingHandler;

    #[async_trait]
    impl QueryHandler<Ping> for PingHandler {
        async fn handle(&self, query: Ping, _cancel: CancellationToken) -> Result<Pong> {
            Ok(Pong { id: query.id })
        }
    }

    #[derive(Debug)]
    struct CreateUser {
        name: String,
    }

    impl Command for CreateUser {
        type Output = u64;
    }

    struct CreateUserHandler;

    #[async_trait]
    impl CommandHandler<CreateUser> for CreateUserHandler {
        async fn handle(&self, command: CreateUser, _cancel: CancellationToken) -> Result<u64> {
            Ok(command.name.len() as u64)
        }
    }

    #[derive(Debug)]
    struct Reset;

    impl Command for Reset {
        type Output = ();
    }

    struct ResetHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler<Reset> for ResetHandler {
        async fn handle(&self, _command: Reset, _cancel: CancellationToken) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug, Clone)]
    struct OrderPlaced {
        amount: usize,
    }

    struct Tally {
        total: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler<OrderPlaced> for Tally {
        async fn handle(&self, event: OrderPlaced, _cancel: CancellationToken) -> Result<()> {
            self.total.fetch_add(event.amount, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl EventHandler<OrderPlaced> for Broken {
        async fn handle(&self, _event: OrderPlaced, _cancel: CancellationToken) -> Result<()> {
            anyhow::bail!("smtp unavailable")
        }
    }

    struct Slow;

    #[async_trait]
    impl QueryHandler<Ping> for Slow {
        async fn handle(&self, query: Ping, _cancel: CancellationToken) -> Result<Pong> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Pong { id: query.id })
        }
    }

    #[derive(Debug, Clone)]
    struct Lookup;

    impl Query for Lookup {
        type Output = &'static str;
    }

    impl Command for Lookup {
        type Output = &'static str;
    }

    struct LookupReader;

    #[async_trait]
    impl QueryHandler<Lookup> for LookupReader {
        async fn handle(&self, _query: Lookup, _cancel: CancellationToken) -> Result<&'static str> {
            Ok("read")
        }
    }

    struct LookupWriter;

    #[async_trait]
    impl CommandHandler<Lookup> for LookupWriter {
        async fn handle(&self, _command: Lookup, _cancel: CancellationToken) -> Result<&'static str> {
            Ok("write")
        }
    }

    fn lookup_container() -> HandlerContainer {
        HandlerContainer::new()
            .with_query::<Lookup, _>(LookupReader)
            .with_command::<Lookup, _>(LookupWriter)
    }

    /// Builder pinned to the compiled strategy regardless of the
    /// `static-dispatch` default.
    fn compiled_builder(resolver: impl HandlerResolver) -> MediatorBuilder {
        MediatorBuilder::new(resolver).with_invokers(Arc::new(CompiledInvokerFactory::new()))
    }

    fn ping_mediator() -> Mediator {
        compiled_builder(HandlerContainer::new().with_query::<Ping, _>(PingHandler)).build()
    }

    // =========================================================================
    // Queries and commands
    // =========================================================================

    #[tokio::test]
    async fn test_ping_first_cached_and_direct_agree() {
        let mediator = ping_mediator();

        let first = mediator.query(Ping { id: 42 }).await.unwrap();
        let cached = mediator.query(Ping { id: 42 }).await.unwrap();
        let direct = mediator
            .query_direct(Ping { id: 42 }, Arc::new(PingHandler), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first, Pong { id: 42 });
        assert_eq!(first, cached);
        assert_eq!(first, direct);
    }

    #[tokio::test]
    async fn test_thunk_built_once_under_sequential_use() {
        let factory = Arc::new(CountingFactory::compiled());
        let mediator = compiled_builder(HandlerContainer::new().with_query::<Ping, _>(PingHandler))
            .with_invokers(factory.clone())
            .build();

        for id in 0..10 {
            assert_eq!(mediator.query(Ping { id }).await.unwrap(), Pong { id });
        }

        assert_eq!(factory.builds(), 1);
        assert_eq!(mediator.cache().published_thunks(), 1);
    }

    #[tokio::test]
    async fn test_commands_with_and_without_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mediator = compiled_builder(
            HandlerContainer::new()
                .with_command::<CreateUser, _>(CreateUserHandler)
                .with_command::<Reset, _>(ResetHandler {
                    calls: calls.clone(),
                }),
        )
        .build();

        let id = mediator
            .send(CreateUser {
                name: "alice".into(),
            })
            .await
            .unwrap();
        mediator.send(Reset).await.unwrap();

        assert_eq!(id, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_handler_is_handler_not_found() {
        let mediator = compiled_builder(HandlerContainer::new()).build();

        let err = mediator.query(Ping { id: 1 }).await.unwrap_err();

        assert!(matches!(err, MediatorError::HandlerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_resolver_error_propagates_unchanged() {
        let mediator = compiled_builder(FailingResolver::new("container poisoned")).build();

        let err = mediator.query(Ping { id: 1 }).await.unwrap_err();

        match err {
            MediatorError::Resolver(inner) => {
                assert_eq!(inner.source.to_string(), "container poisoned")
            }
            other => panic!("Expected Resolver, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped() {
        struct Failing;

        #[async_trait]
        impl QueryHandler<Ping> for Failing {
            async fn handle(&self, _query: Ping, _cancel: CancellationToken) -> Result<Pong> {
                anyhow::bail!("db down")
            }
        }

        let mediator =
            compiled_builder(HandlerContainer::new().with_query::<Ping, _>(Failing)).build();

        let err = mediator.query(Ping { id: 1 }).await.unwrap_err();

        assert!(matches!(err, MediatorError::Handler { .. }));
        assert!(err.to_string().contains("db down"));
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    #[tokio::test]
    async fn test_pipeline_order_through_mediator() {
        let log = StepLog::new();
        let mediator = compiled_builder(HandlerContainer::new().with_query::<Ping, _>(PingHandler))
            .with_pipeline(
                PipelineConfig::new()
                    .add_global(RecordingStep::new("A", &log))
                    .add_global(RecordingStep::new("B", &log))
                    .add_per_type::<Ping>(RecordingStep::new("C", &log)),
            )
            .build();

        let pong = mediator.query(Ping { id: 7 }).await.unwrap();

        assert_eq!(pong, Pong { id: 7 });
        assert_eq!(
            log.entries(),
            vec!["A:before", "B:before", "C:before", "C:after", "B:after", "A:after"]
        );
    }

    #[tokio::test]
    async fn test_empty_pipeline_matches_fast_path() {
        let plain = ping_mediator();
        let explicit = compiled_builder(HandlerContainer::new().with_query::<Ping, _>(PingHandler))
            .with_pipeline(PipelineConfig::new())
            .build();

        assert_eq!(
            plain.query(Ping { id: 3 }).await.unwrap(),
            explicit.query(Ping { id: 3 }).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_validation_rejection_reaches_caller() {
        let mediator = compiled_builder(
            HandlerContainer::new().with_command::<CreateUser, _>(CreateUserHandler),
        )
        .with_pipeline(PipelineConfig::new().add_per_type::<CreateUser>(ValidationStep::new(
            |c: &CreateUser| {
                if c.name.is_empty() {
                    Err("name is required".to_string())
                } else {
                    Ok(())
                }
            },
        )))
        .build();

        let err = mediator
            .send(CreateUser {
                name: String::new(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, MediatorError::Validation { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_direct_dispatch_runs_pipeline() {
        let log = StepLog::new();
        let mediator = compiled_builder(HandlerContainer::new())
            .with_pipeline(PipelineConfig::new().add_global(RecordingStep::new("A", &log)))
            .build();

        let pong = mediator
            .query_direct(Ping { id: 5 }, Arc::new(PingHandler), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(pong, Pong { id: 5 });
        assert_eq!(log.entries(), vec!["A:before", "A:after"]);
        assert_eq!(mediator.cache().thunk_count(), 0);
    }

    // =========================================================================
    // Events
    // =========================================================================

    #[tokio::test]
    async fn test_fan_out_runs_all_and_reports_failure() {
        let h1 = Arc::new(AtomicUsize::new(0));
        let h3 = Arc::new(AtomicUsize::new(0));
        let mediator = compiled_builder(
            HandlerContainer::new()
                .with_event::<OrderPlaced, _>(Tally { total: h1.clone() })
                .with_event::<OrderPlaced, _>(Broken)
                .with_event::<OrderPlaced, _>(Tally { total: h3.clone() }),
        )
        .build();

        let err = mediator
            .publish(OrderPlaced { amount: 10 })
            .await
            .unwrap_err();

        assert_eq!(h1.load(Ordering::SeqCst), 10);
        assert_eq!(h3.load(Ordering::SeqCst), 10);
        match err {
            MediatorError::Publish {
                handlers, failures, ..
            } => {
                assert_eq!(handlers, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 1);
                assert!(failures[0].error.to_string().contains("smtp unavailable"));
            }
            other => panic!("Expected Publish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_handlers_is_noop() {
        let mediator = compiled_builder(HandlerContainer::new()).build();
        mediator.publish(OrderPlaced { amount: 1 }).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_direct_matches_resolved() {
        let resolved_total = Arc::new(AtomicUsize::new(0));
        let direct_total = Arc::new(AtomicUsize::new(0));
        let mediator = compiled_builder(HandlerContainer::new().with_event::<OrderPlaced, _>(
            Tally {
                total: resolved_total.clone(),
            },
        ))
        .build();

        mediator.publish(OrderPlaced { amount: 4 }).await.unwrap();
        mediator
            .publish_direct(
                OrderPlaced { amount: 4 },
                vec![Arc::new(Tally {
                    total: direct_total.clone(),
                }) as Arc<dyn EventHandler<OrderPlaced>>],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            resolved_total.load(Ordering::SeqCst),
            direct_total.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_event_pipeline_wraps_whole_fan_out() {
        let log = StepLog::new();
        let total = Arc::new(AtomicUsize::new(0));
        let mediator = compiled_builder(
            HandlerContainer::new()
                .with_event::<OrderPlaced, _>(Tally {
                    total: total.clone(),
                })
                .with_event::<OrderPlaced, _>(Tally {
                    total: total.clone(),
                }),
        )
        .with_pipeline(PipelineConfig::new().add_global(RecordingStep::new("A", &log)))
        .build();

        mediator.publish(OrderPlaced { amount: 1 }).await.unwrap();

        assert_eq!(total.load(Ordering::SeqCst), 2);
        assert_eq!(log.entries(), vec!["A:before", "A:after"]);
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    #[tokio::test]
    async fn test_cancellation_surfaces_as_cancelled() {
        let mediator =
            compiled_builder(HandlerContainer::new().with_query::<Ping, _>(Slow)).build();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = mediator
            .query_with_cancel(Ping { id: 1 }, cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_publish_is_cancelled_not_publish() {
        struct Waits;

        #[async_trait]
        impl EventHandler<OrderPlaced> for Waits {
            async fn handle(&self, _event: OrderPlaced, _cancel: CancellationToken) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let mediator = compiled_builder(
            HandlerContainer::new()
                .with_event::<OrderPlaced, _>(Waits)
                .with_event::<OrderPlaced, _>(Waits),
        )
        .build();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = mediator
            .publish_with_cancel(OrderPlaced { amount: 1 }, cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
    }

    #[test]
    fn test_collect_failures_prefers_cancelled_once_token_fired() {
        let results = || -> Vec<PipelineResult> {
            vec![
                Ok(Box::new(()) as ErasedResponse),
                Err(MediatorError::from_handler("Tally", anyhow::anyhow!("smtp unavailable"))),
                Err(MediatorError::Cancelled {
                    request_type: "OrderPlaced",
                }),
            ]
        };

        let live = CancellationToken::new();
        match collect_failures::<OrderPlaced>(results(), &live) {
            Err(MediatorError::Publish {
                handlers, failures, ..
            }) => {
                assert_eq!(handlers, 3);
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].index, 1);
            }
            other => panic!("Expected Publish, got {other:?}"),
        }

        let fired = CancellationToken::new();
        fired.cancel();
        let err = collect_failures::<OrderPlaced>(results(), &fired).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_publish_still_runs_failing_handler() {
        struct Waits;

        #[async_trait]
        impl EventHandler<OrderPlaced> for Waits {
            async fn handle(&self, _event: OrderPlaced, _cancel: CancellationToken) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let total = Arc::new(AtomicUsize::new(0));
        let mediator = compiled_builder(
            HandlerContainer::new()
                .with_event::<OrderPlaced, _>(Broken)
                .with_event::<OrderPlaced, _>(Waits)
                .with_event::<OrderPlaced, _>(Tally {
                    total: total.clone(),
                }),
        )
        .build();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = mediator
            .publish_with_cancel(OrderPlaced { amount: 2 }, cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(total.load(Ordering::SeqCst), 2);
    }

    // =========================================================================
    // Erased dispatch and strategies
    // =========================================================================

    #[tokio::test]
    async fn test_erased_dispatch_needs_known_contract() {
        let mediator = ping_mediator();

        let err = mediator
            .dispatch(AnyRequest::query(Ping { id: 1 }), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MediatorError::ContractResolution { .. }));

        mediator.query(Ping { id: 1 }).await.unwrap();
        mediator.cache().clear();

        let response = mediator
            .dispatch(AnyRequest::query(Ping { id: 2 }), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(unwrap_response::<Pong>(response).unwrap(), Pong { id: 2 });
    }

    #[tokio::test]
    async fn test_erased_dispatch_with_declared_contract() {
        let mediator = compiled_builder(HandlerContainer::new().with_query::<Ping, _>(PingHandler))
            .with_invokers(Arc::new(CompiledInvokerFactory::new().declare_query::<Ping>()))
            .build();

        let response = mediator
            .dispatch(AnyRequest::query(Ping { id: 8 }), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(unwrap_response::<Pong>(response).unwrap(), Pong { id: 8 });
    }

    #[tokio::test]
    async fn test_static_strategy_is_indistinguishable() {
        let total = Arc::new(AtomicUsize::new(0));
        let counter = total.clone();
        let registry = StaticHandlerRegistry::new()
            .with_query::<Ping>()
            .with_event::<OrderPlaced, _, _>(move |event, _cancel| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(event.amount, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            });
        let mediator = compiled_builder(HandlerContainer::new().with_query::<Ping, _>(PingHandler))
            .with_static_registry(registry)
            .build();

        assert_eq!(mediator.strategy(), "static");
        assert_eq!(mediator.query(Ping { id: 42 }).await.unwrap(), Pong { id: 42 });
        assert_eq!(
            ping_mediator().query(Ping { id: 42 }).await.unwrap(),
            mediator.query(Ping { id: 42 }).await.unwrap()
        );

        mediator.publish(OrderPlaced { amount: 3 }).await.unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_static_strategy_missing_registration() {
        let mediator = compiled_builder(HandlerContainer::new().with_query::<Ping, _>(PingHandler))
            .with_static_registry(StaticHandlerRegistry::new())
            .build();

        let err = mediator.query(Ping { id: 1 }).await.unwrap_err();

        assert!(matches!(err, MediatorError::ContractResolution { .. }));
    }

    #[tokio::test]
    async fn test_static_strategy_keeps_query_and_command_apart() {
        let registry = StaticHandlerRegistry::new()
            .with_query::<Lookup>()
            .with_command::<Lookup>();
        let mediator = compiled_builder(lookup_container())
            .with_static_registry(registry)
            .build();

        assert_eq!(mediator.query(Lookup).await.unwrap(), "read");
        assert_eq!(mediator.send(Lookup).await.unwrap(), "write");
    }

    #[tokio::test]
    async fn test_erased_command_never_borrows_query_thunk() {
        let mediator = compiled_builder(lookup_container()).build();

        assert_eq!(mediator.query(Lookup).await.unwrap(), "read");
        mediator.cache().clear();

        let err = mediator
            .dispatch(AnyRequest::command(Lookup), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MediatorError::ContractResolution { .. }));

        assert_eq!(mediator.send(Lookup).await.unwrap(), "write");
        mediator.cache().clear();

        let response = mediator
            .dispatch(AnyRequest::command(Lookup), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(unwrap_response::<&'static str>(response).unwrap(), "write");
    }

    #[tokio::test]
    async fn test_builder_without_invokers_uses_build_default() {
        let mediator = MediatorBuilder::new(HandlerContainer::new()).build();
        assert_eq!(mediator.strategy(), default_invokers().strategy());
    }

    // =========================================================================
    // Cache and telemetry
    // =========================================================================

    #[tokio::test]
    async fn test_sweep_recovery_returns_same_result() {
        let mediator = compiled_builder(HandlerContainer::new().with_query::<Ping, _>(PingHandler))
            .with_config(MediatorConfig {
                cache: CacheLimits {
                    max_query_thunks: 0,
                    max_handlers: 0,
                    ..CacheLimits::default()
                },
                ..MediatorConfig::default()
            })
            .build();

        let before = mediator.query(Ping { id: 42 }).await.unwrap();
        let report = mediator.sweep_cache();
        let after = mediator.query(Ping { id: 42 }).await.unwrap();

        assert_eq!(report.queries_cleared, 1);
        assert_eq!(report.handlers_cleared, 1);
        assert_eq!(before, after);
        assert_eq!(mediator.cache().published_thunks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_follows_configured_interval() {
        let mediator = compiled_builder(HandlerContainer::new().with_query::<Ping, _>(PingHandler))
            .with_config(MediatorConfig {
                cache: CacheLimits {
                    max_query_thunks: 0,
                    ..CacheLimits::default()
                },
                sweep_interval_secs: 60,
            })
            .build();
        mediator.query(Ping { id: 1 }).await.unwrap();
        let sweeper = mediator.spawn_cache_sweeper();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mediator.cache().len(CacheTable::Queries), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(mediator.cache().len(CacheTable::Queries), 0);

        sweeper.stop().await;
        assert_eq!(mediator.query(Ping { id: 2 }).await.unwrap(), Pong { id: 2 });
    }

    #[tokio::test]
    async fn test_observer_sees_dispatches_and_cache_sizes() {
        let stats = Arc::new(DispatchStats::new());
        let mediator = compiled_builder(HandlerContainer::new().with_query::<Ping, _>(PingHandler))
            .with_observer(stats.clone())
            .build();

        mediator.query(Ping { id: 1 }).await.unwrap();
        let _ = mediator.send(Reset).await;

        assert_eq!(stats.dispatches(RequestKind::Query), 1);
        assert_eq!(stats.failures(RequestKind::Command), 1);
        assert_eq!(stats.cache_size_of(CacheTable::Queries), 1);
        assert_eq!(stats.cache_size_of(CacheTable::Handlers), 1);
    }
}
