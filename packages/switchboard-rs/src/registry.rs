//! Explicitly registered invokers, for builds that must not compile thunks at
//! first use.
//!
//! Every entry is placed here by an explicit call during startup; nothing is
//! discovered at runtime. Queries and commands map to exactly one thunk and a
//! second registration is rejected. Events accumulate a fan-out list of
//! handler-bound invokers.
//!
//! # Example
//!
//! ```ignore
//! let registry = StaticHandlerRegistry::new()
//!     .with_query::<GetOrder>()
//!     .with_command::<PlaceOrder>()
//!     .with_event::<OrderPlaced, _, _>(move |event, _cancel| {
//!         let mailer = mailer.clone();
//!         async move { mailer.confirm(event.order_id).await }
//!     });
//!
//! let mediator = MediatorBuilder::new(container)
//!     .with_static_registry(registry)
//!     .build();
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{Command, DispatchKey, Event, Query};
use crate::error::MediatorError;
use crate::handler::{CommandHandler, QueryHandler};
use crate::invoker::{InvokerFactory, RequestDescriptor};
use crate::thunk::{
    bound_event_thunk, command_thunk, command_thunk_with, query_thunk, query_thunk_with,
    InvocationThunk,
};

/// Startup-populated table of invocation thunks.
///
/// Immutable once handed to a mediator; lookups never allocate or lock.
#[derive(Default, Clone)]
pub struct StaticHandlerRegistry {
    thunks: HashMap<DispatchKey, InvocationThunk>,
    events: HashMap<DispatchKey, Vec<InvocationThunk>>,
}

impl StaticHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Register query type `Q`, invoking `handle` directly.
    pub fn register_query<Q: Query>(&mut self) -> Result<(), MediatorError> {
        self.insert(query_thunk::<Q>())
    }

    /// Register query type `Q` with an explicit invoker.
    pub fn register_query_with<Q, F, Fut>(&mut self, invoker: F) -> Result<(), MediatorError>
    where
        Q: Query,
        F: Fn(Arc<dyn QueryHandler<Q>>, Q, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Q::Output>> + Send + 'static,
    {
        self.insert(query_thunk_with(invoker))
    }

    /// Register query type `Q`, replacing any existing registration.
    pub fn replace_query<Q: Query>(&mut self) {
        let thunk = query_thunk::<Q>();
        self.thunks.insert(*thunk.key(), thunk);
    }

    /// Consuming form of [`register_query`](Self::register_query).
    ///
    /// # Panics
    ///
    /// Panics if `Q` is already registered.
    pub fn with_query<Q: Query>(mut self) -> Self {
        self.register_query::<Q>().unwrap_or_else(|e| {
            panic!("{}", e);
        });
        self
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Register command type `C`, invoking `handle` directly.
    pub fn register_command<C: Command>(&mut self) -> Result<(), MediatorError> {
        self.insert(command_thunk::<C>())
    }

    /// Register command type `C` with an explicit invoker.
    pub fn register_command_with<C, F, Fut>(&mut self, invoker: F) -> Result<(), MediatorError>
    where
        C: Command,
        F: Fn(Arc<dyn CommandHandler<C>>, C, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<C::Output>> + Send + 'static,
    {
        self.insert(command_thunk_with(invoker))
    }

    /// Register command type `C`, replacing any existing registration.
    pub fn replace_command<C: Command>(&mut self) {
        let thunk = command_thunk::<C>();
        self.thunks.insert(*thunk.key(), thunk);
    }

    /// Consuming form of [`register_command`](Self::register_command).
    ///
    /// # Panics
    ///
    /// Panics if `C` is already registered.
    pub fn with_command<C: Command>(mut self) -> Self {
        self.register_command::<C>().unwrap_or_else(|e| {
            panic!("{}", e);
        });
        self
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Append a handler-bound invoker to the fan-out list for `E`.
    ///
    /// The invoker owns whatever handler state it needs; the resolver is not
    /// consulted for events in static mode.
    pub fn register_event<E, F, Fut>(&mut self, invoker: F)
    where
        E: Event,
        F: Fn(E, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.events
            .entry(DispatchKey::event::<E>())
            .or_default()
            .push(bound_event_thunk(invoker));
    }

    /// Consuming form of [`register_event`](Self::register_event).
    pub fn with_event<E, F, Fut>(mut self, invoker: F) -> Self
    where
        E: Event,
        F: Fn(E, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_event(invoker);
        self
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// The registered thunk for a query or command key, if any.
    pub fn lookup(&self, key: &DispatchKey) -> Option<InvocationThunk> {
        self.thunks.get(key).cloned()
    }

    /// The fan-out list for an event key (empty if none registered).
    pub fn event_handlers(&self, key: &DispatchKey) -> &[InvocationThunk] {
        self.events.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of registered query and command types.
    pub fn len(&self) -> usize {
        self.thunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thunks.is_empty() && self.events.is_empty()
    }

    fn insert(&mut self, thunk: InvocationThunk) -> Result<(), MediatorError> {
        let key = *thunk.key();
        if self.thunks.contains_key(&key) {
            return Err(MediatorError::AlreadyRegistered {
                type_name: key.request_name(),
            });
        }
        self.thunks.insert(key, thunk);
        Ok(())
    }
}

impl InvokerFactory for StaticHandlerRegistry {
    fn build(&self, descriptor: &RequestDescriptor) -> Result<InvocationThunk, MediatorError> {
        self.lookup(descriptor.key())
            .ok_or(MediatorError::ContractResolution {
                request_type: descriptor.key().request_name(),
                response_type: descriptor.key().response_name(),
            })
    }

    fn event_bindings(&self, key: &DispatchKey) -> Option<Vec<InvocationThunk>> {
        Some(self.event_handlers(key).to_vec())
    }

    fn strategy(&self) -> &'static str {
        "static"
    }
}

impl std::fmt::Debug for StaticHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticHandlerRegistry")
            .field("thunks", &self.thunks.len())
            .field("event_types", &self.events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{unwrap_response, AnyRequest};
    use crate::handler::HandlerRef;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct Ping {
        id: u32,
    }

    impl Query for Ping {
        type Output = u32;
    }

    #[derive(Debug)]
    struct Reset;

    impl Command for Reset {
        type Output = ();
    }

    #[derive(Debug, Clone)]
    struct Tick;

    struct PingHandler;

    #[async_trait]
    impl QueryHandler<Ping> for PingHandler {
        async fn handle(&self, query: Ping, _cancel: CancellationToken) -> anyhow::Result<u32> {
            Ok(query.id)
        }
    }

    #[test]
    fn test_duplicate_query_is_rejected() {
        let mut registry = StaticHandlerRegistry::new();
        registry.register_query::<Ping>().unwrap();

        let err = registry.register_query::<Ping>().unwrap_err();

        assert!(matches!(err, MediatorError::AlreadyRegistered { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_query_and_command_of_one_type_register_separately() {
        #[derive(Debug, Clone)]
        struct Touch;

        impl Query for Touch {
            type Output = ();
        }

        impl Command for Touch {
            type Output = ();
        }

        let mut registry = StaticHandlerRegistry::new();
        registry.register_query::<Touch>().unwrap();
        registry.register_command::<Touch>().unwrap();

        let query = registry.lookup(&DispatchKey::query::<Touch>()).unwrap();
        let command = registry.lookup(&DispatchKey::command::<Touch>()).unwrap();
        assert!(!query.ptr_eq(&command));
        assert_eq!(command.key(), &DispatchKey::command::<Touch>());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_with_command_panics_on_duplicate() {
        let _ = StaticHandlerRegistry::new()
            .with_command::<Reset>()
            .with_command::<Reset>();
    }

    #[test]
    fn test_replace_overwrites() {
        let mut registry = StaticHandlerRegistry::new().with_command::<Reset>();
        let before = registry.lookup(&DispatchKey::command::<Reset>()).unwrap();

        registry.replace_command::<Reset>();
        let after = registry.lookup(&DispatchKey::command::<Reset>()).unwrap();

        assert!(!before.ptr_eq(&after));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_lookup_is_contract_resolution() {
        let registry = StaticHandlerRegistry::new();
        assert!(registry.lookup(&DispatchKey::query::<Ping>()).is_none());

        let err = registry.build(&RequestDescriptor::query::<Ping>()).unwrap_err();
        assert!(matches!(err, MediatorError::ContractResolution { .. }));
    }

    #[test]
    fn test_events_accumulate() {
        let registry = StaticHandlerRegistry::new()
            .with_event::<Tick, _, _>(|_, _| async { Ok::<(), anyhow::Error>(()) })
            .with_event::<Tick, _, _>(|_, _| async { Ok::<(), anyhow::Error>(()) });

        let key = DispatchKey::event::<Tick>();
        assert_eq!(registry.event_handlers(&key).len(), 2);
        assert_eq!(registry.event_bindings(&key).unwrap().len(), 2);
        assert_eq!(
            registry
                .event_bindings(&DispatchKey::event::<Ping>())
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn test_registered_invoker_is_called() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = StaticHandlerRegistry::new();
        registry
            .register_query_with::<Ping, _, _>(move |handler, query, cancel| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { handler.handle(query, cancel).await }
            })
            .unwrap();

        let thunk = registry.build(&RequestDescriptor::query::<Ping>()).unwrap();
        let response = thunk
            .call(
                HandlerRef::query::<Ping>(Arc::new(PingHandler)),
                AnyRequest::query(Ping { id: 9 }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(unwrap_response::<u32>(response).unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.strategy(), "static");
    }
}
