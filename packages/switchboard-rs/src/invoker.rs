//! Invoker factories: the two strategies for turning a request type into an
//! [`InvocationThunk`].
//!
//! - [`CompiledInvokerFactory`] compiles the thunk at the first sighting of a
//!   type from the monomorphized builder the typed facade call carries.
//! - [`StaticHandlerRegistry`](crate::StaticHandlerRegistry) serves thunks
//!   registered explicitly at startup and never compiles anything.
//!
//! Both sit behind [`InvokerFactory`], so the mediator cannot tell them apart:
//! same inputs, same erased result shape, same error taxonomy. Which one a
//! mediator uses by default is fixed at build time by the `static-dispatch`
//! cargo feature (see [`default_invokers`]).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::core::{AnyRequest, Command, ContractKey, DispatchKey, Event, Query};
use crate::error::MediatorError;
use crate::thunk::{command_thunk, event_thunk, query_thunk, InvocationThunk};

/// Monomorphized thunk builder for one request type.
pub type ThunkCompiler = fn() -> InvocationThunk;

/// Everything a factory may know about a request type.
///
/// Typed facade calls always carry a compiler; erased dispatch only has the
/// type tags of the [`AnyRequest`].
#[derive(Clone, Copy, Debug)]
pub struct RequestDescriptor {
    key: DispatchKey,
    contract: ContractKey,
    compiler: Option<ThunkCompiler>,
}

impl RequestDescriptor {
    /// Descriptor for query type `Q`.
    pub fn query<Q: Query>() -> Self {
        Self {
            key: DispatchKey::query::<Q>(),
            contract: ContractKey::query::<Q>(),
            compiler: Some(query_thunk::<Q> as ThunkCompiler),
        }
    }

    /// Descriptor for command type `C`.
    pub fn command<C: Command>() -> Self {
        Self {
            key: DispatchKey::command::<C>(),
            contract: ContractKey::command::<C>(),
            compiler: Some(command_thunk::<C> as ThunkCompiler),
        }
    }

    /// Descriptor for event type `E`.
    pub fn event<E: Event>() -> Self {
        Self {
            key: DispatchKey::event::<E>(),
            contract: ContractKey::event::<E>(),
            compiler: Some(event_thunk::<E> as ThunkCompiler),
        }
    }

    /// Descriptor carrying only the type tags of an erased request.
    pub fn erased(request: &AnyRequest) -> Self {
        Self {
            key: *request.key(),
            contract: *request.contract(),
            compiler: None,
        }
    }

    pub fn key(&self) -> &DispatchKey {
        &self.key
    }

    pub fn contract(&self) -> &ContractKey {
        &self.contract
    }

    pub fn compiler(&self) -> Option<ThunkCompiler> {
        self.compiler
    }
}

/// Produces invocation thunks for request types.
///
/// Implementations must be idempotent: building the same key twice yields
/// interchangeable thunks, so the cache may discard either.
pub trait InvokerFactory: Send + Sync + 'static {
    /// Build the thunk for a query or command (or a resolver-bound event).
    ///
    /// A type the strategy cannot produce a thunk for fails with
    /// [`MediatorError::ContractResolution`].
    fn build(&self, descriptor: &RequestDescriptor) -> Result<InvocationThunk, MediatorError>;

    /// Handler-bound fan-out invokers for an event, if this strategy owns
    /// event bindings. `None` means "ask the resolver".
    fn event_bindings(&self, key: &DispatchKey) -> Option<Vec<InvocationThunk>>;

    /// Short strategy name for logs.
    fn strategy(&self) -> &'static str;
}

// =============================================================================
// Compiled Invoker Factory
// =============================================================================

/// Compiles thunks lazily from the descriptor's monomorphized builder.
///
/// Every compiler seen is recorded in a catalog, so once a type has been
/// dispatched through the typed API (or declared up front) it can also be
/// dispatched by type tag alone.
#[derive(Default)]
pub struct CompiledInvokerFactory {
    catalog: DashMap<DispatchKey, ThunkCompiler>,
}

impl CompiledInvokerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make query type `Q` dispatchable by type tag before its first typed call.
    pub fn declare_query<Q: Query>(self) -> Self {
        self.learn(&RequestDescriptor::query::<Q>());
        self
    }

    /// Make command type `C` dispatchable by type tag before its first typed call.
    pub fn declare_command<C: Command>(self) -> Self {
        self.learn(&RequestDescriptor::command::<C>());
        self
    }

    /// Returns true if a compiler is known for `key`.
    pub fn knows(&self, key: &DispatchKey) -> bool {
        self.catalog.contains_key(key)
    }

    /// Number of catalogued request types.
    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    fn learn(&self, descriptor: &RequestDescriptor) {
        if let Some(compiler) = descriptor.compiler {
            self.catalog.entry(descriptor.key).or_insert(compiler);
        }
    }
}

impl InvokerFactory for CompiledInvokerFactory {
    fn build(&self, descriptor: &RequestDescriptor) -> Result<InvocationThunk, MediatorError> {
        self.learn(descriptor);

        let compiler = descriptor
            .compiler
            .or_else(|| self.catalog.get(&descriptor.key).map(|entry| *entry.value()))
            .ok_or(MediatorError::ContractResolution {
                request_type: descriptor.key.request_name(),
                response_type: descriptor.key.response_name(),
            })?;

        debug!(
            request = descriptor.key.request_name(),
            kind = %descriptor.key.kind(),
            "compiling invocation thunk"
        );
        Ok(compiler())
    }

    fn event_bindings(&self, _key: &DispatchKey) -> Option<Vec<InvocationThunk>> {
        None
    }

    fn strategy(&self) -> &'static str {
        "compiled"
    }
}

/// The invoker strategy selected by build configuration.
///
/// With the `static-dispatch` feature this is an empty
/// [`StaticHandlerRegistry`](crate::StaticHandlerRegistry); supply a populated
/// one with `MediatorBuilder::with_static_registry`.
pub fn default_invokers() -> Arc<dyn InvokerFactory> {
    #[cfg(feature = "static-dispatch")]
    {
        Arc::new(crate::registry::StaticHandlerRegistry::new())
    }
    #[cfg(not(feature = "static-dispatch"))]
    {
        Arc::new(CompiledInvokerFactory::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RequestKind;

    #[derive(Debug, Clone)]
    struct Ping;

    impl Query for Ping {
        type Output = u32;
    }

    #[derive(Debug)]
    struct Reset;

    impl Command for Reset {
        type Output = ();
    }

    #[test]
    fn test_typed_descriptor_builds_and_is_catalogued() {
        let factory = CompiledInvokerFactory::new();
        assert!(factory.is_empty());

        let thunk = factory.build(&RequestDescriptor::query::<Ping>()).unwrap();

        assert_eq!(thunk.key(), &DispatchKey::query::<Ping>());
        assert!(factory.knows(&DispatchKey::query::<Ping>()));
        assert_eq!(factory.len(), 1);
    }

    #[test]
    fn test_erased_descriptor_without_compiler_is_contract_resolution() {
        let factory = CompiledInvokerFactory::new();
        let request = AnyRequest::query(Ping);

        let err = factory.build(&RequestDescriptor::erased(&request)).unwrap_err();

        assert!(matches!(err, MediatorError::ContractResolution { .. }));
    }

    #[test]
    fn test_erased_descriptor_resolves_after_declaration() {
        let factory = CompiledInvokerFactory::new().declare_command::<Reset>();
        let request = AnyRequest::command(Reset);

        let thunk = factory.build(&RequestDescriptor::erased(&request)).unwrap();

        assert_eq!(thunk.key(), &DispatchKey::command::<Reset>());
    }

    #[test]
    fn test_compiled_factory_defers_events_to_resolver() {
        let factory = CompiledInvokerFactory::new();
        assert!(factory.event_bindings(&DispatchKey::event::<Ping>()).is_none());
        assert_eq!(factory.strategy(), "compiled");
    }

    #[cfg(not(feature = "static-dispatch"))]
    #[test]
    fn test_default_invokers_are_compiled() {
        assert_eq!(default_invokers().strategy(), "compiled");
    }

    #[cfg(feature = "static-dispatch")]
    #[test]
    fn test_default_invokers_are_static_under_feature() {
        let invokers = default_invokers();

        assert_eq!(invokers.strategy(), "static");
        assert!(matches!(
            invokers.build(&RequestDescriptor::query::<Ping>()),
            Err(MediatorError::ContractResolution { .. })
        ));
    }

    #[test]
    fn test_query_and_command_of_one_type_catalogue_separately() {
        #[derive(Debug, Clone)]
        struct Touch;

        impl Query for Touch {
            type Output = ();
        }

        impl Command for Touch {
            type Output = ();
        }

        let factory = CompiledInvokerFactory::new().declare_query::<Touch>();
        assert!(!factory.knows(&DispatchKey::command::<Touch>()));

        let err = factory
            .build(&RequestDescriptor::erased(&AnyRequest::command(Touch)))
            .unwrap_err();
        assert!(matches!(err, MediatorError::ContractResolution { .. }));

        let factory = factory.declare_command::<Touch>();
        let thunk = factory
            .build(&RequestDescriptor::erased(&AnyRequest::command(Touch)))
            .unwrap();
        assert_eq!(thunk.key().kind(), RequestKind::Command);
        assert_eq!(factory.len(), 2);
    }

    #[test]
    fn test_descriptor_contract_matches_request() {
        let descriptor = RequestDescriptor::query::<Ping>();
        assert_eq!(descriptor.contract(), &ContractKey::query::<Ping>());
        assert!(descriptor.compiler().is_some());
        assert!(RequestDescriptor::erased(&AnyRequest::query(Ping))
            .compiler()
            .is_none());
    }
}
