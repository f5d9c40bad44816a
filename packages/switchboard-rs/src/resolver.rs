//! Handler resolution: the seam to whatever owns handler instances.
//!
//! The engine never constructs or owns handlers. It asks a [`HandlerResolver`]
//! for the instance bound to a contract and caches the reference only when the
//! resolver declares it a singleton.
//!
//! [`HandlerContainer`] is a small in-memory resolver for applications that do
//! not bring their own container, and for tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{Command, ContractKey, Event, Query};
use crate::error::{MediatorError, ResolverError};
use crate::handler::{CommandHandler, EventHandler, HandlerRef, QueryHandler};

/// How long a resolved handler instance may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerLifetime {
    /// A new instance per resolution. Never cached.
    Transient,
    /// One instance per resolver scope. Never cached by the engine, which has
    /// no notion of the resolver's scopes.
    Scoped,
    /// One instance for the life of the resolver. Cached after first resolve.
    Singleton,
}

impl HandlerLifetime {
    /// Whether the engine may retain the reference across calls.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, HandlerLifetime::Singleton)
    }
}

/// A handler reference plus the lifetime policy it was resolved under.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub handler: HandlerRef,
    pub lifetime: HandlerLifetime,
}

impl Resolved {
    pub fn singleton(handler: HandlerRef) -> Self {
        Self {
            handler,
            lifetime: HandlerLifetime::Singleton,
        }
    }

    pub fn transient(handler: HandlerRef) -> Self {
        Self {
            handler,
            lifetime: HandlerLifetime::Transient,
        }
    }

    pub fn scoped(handler: HandlerRef) -> Self {
        Self {
            handler,
            lifetime: HandlerLifetime::Scoped,
        }
    }
}

/// Maps a handler contract to live instances.
///
/// Resolution is synchronous and is not expected to honor cancellation.
/// Failures are reported as [`ResolverError`] and reach the caller unchanged.
pub trait HandlerResolver: Send + Sync + 'static {
    /// The single handler for a query or command contract.
    ///
    /// `Ok(None)` means nothing is registered; the mediator reports
    /// `HandlerNotFound`.
    fn resolve(&self, contract: &ContractKey) -> Result<Option<Resolved>, ResolverError>;

    /// Every handler bound to an event contract, in registration order.
    fn resolve_all(&self, contract: &ContractKey) -> Result<Vec<HandlerRef>, ResolverError>;
}

// =============================================================================
// Handler Container
// =============================================================================

type HandlerFactory = Arc<dyn Fn() -> HandlerRef + Send + Sync>;

#[derive(Clone)]
enum Registration {
    Singleton(HandlerRef),
    Transient(HandlerFactory),
}

impl Registration {
    fn resolve(&self) -> Resolved {
        match self {
            Registration::Singleton(handler) => Resolved::singleton(handler.clone()),
            Registration::Transient(factory) => Resolved::transient(factory()),
        }
    }
}

/// In-memory resolver populated at startup.
///
/// Query and command contracts hold one registration each; a duplicate is
/// rejected (`with_*` panics, `try_with_*` returns `AlreadyRegistered`,
/// `with_*_replace` overwrites). Event contracts accumulate.
#[derive(Default, Clone)]
pub struct HandlerContainer {
    single: HashMap<ContractKey, Registration>,
    many: HashMap<ContractKey, Vec<Registration>>,
}

impl HandlerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a singleton query handler.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `Q`.
    /// Use `try_with_query` for a non-panicking version, or
    /// `with_query_replace` to overwrite.
    pub fn with_query<Q, H>(self, handler: H) -> Self
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        self.try_with_query::<Q, H>(handler).unwrap_or_else(|e| {
            panic!("{}", e);
        })
    }

    /// Register a singleton query handler, returning an error on duplicates.
    pub fn try_with_query<Q, H>(self, handler: H) -> Result<Self, MediatorError>
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        self.try_with_query_arc::<Q>(Arc::new(handler))
    }

    /// Register an already-shared query handler instance.
    pub fn try_with_query_arc<Q: Query>(
        self,
        handler: Arc<dyn QueryHandler<Q>>,
    ) -> Result<Self, MediatorError> {
        self.try_insert(
            ContractKey::query::<Q>(),
            Registration::Singleton(HandlerRef::query::<Q>(handler)),
        )
    }

    /// Register a singleton query handler, replacing any existing one.
    pub fn with_query_replace<Q, H>(mut self, handler: H) -> Self
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        let handler: Arc<dyn QueryHandler<Q>> = Arc::new(handler);
        self.single.insert(
            ContractKey::query::<Q>(),
            Registration::Singleton(HandlerRef::query::<Q>(handler)),
        );
        self
    }

    /// Register a query handler built fresh for every resolution.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `Q`.
    pub fn with_query_factory<Q, H, F>(self, factory: F) -> Self
    where
        Q: Query,
        H: QueryHandler<Q>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: HandlerFactory = Arc::new(move || {
            let handler: Arc<dyn QueryHandler<Q>> = Arc::new(factory());
            HandlerRef::query::<Q>(handler)
        });
        self.try_insert(ContractKey::query::<Q>(), Registration::Transient(factory))
            .unwrap_or_else(|e| {
                panic!("{}", e);
            })
    }

    /// Register a singleton command handler.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `C`.
    pub fn with_command<C, H>(self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.try_with_command::<C, H>(handler).unwrap_or_else(|e| {
            panic!("{}", e);
        })
    }

    /// Register a singleton command handler, returning an error on duplicates.
    pub fn try_with_command<C, H>(self, handler: H) -> Result<Self, MediatorError>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let handler: Arc<dyn CommandHandler<C>> = Arc::new(handler);
        self.try_insert(
            ContractKey::command::<C>(),
            Registration::Singleton(HandlerRef::command::<C>(handler)),
        )
    }

    /// Register a singleton command handler, replacing any existing one.
    pub fn with_command_replace<C, H>(mut self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let handler: Arc<dyn CommandHandler<C>> = Arc::new(handler);
        self.single.insert(
            ContractKey::command::<C>(),
            Registration::Singleton(HandlerRef::command::<C>(handler)),
        );
        self
    }

    /// Register a command handler built fresh for every resolution.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `C`.
    pub fn with_command_factory<C, H, F>(self, factory: F) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: HandlerFactory = Arc::new(move || {
            let handler: Arc<dyn CommandHandler<C>> = Arc::new(factory());
            HandlerRef::command::<C>(handler)
        });
        self.try_insert(ContractKey::command::<C>(), Registration::Transient(factory))
            .unwrap_or_else(|e| {
                panic!("{}", e);
            })
    }

    /// Add a singleton handler to the fan-out list for `E`.
    pub fn with_event<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        let handler: Arc<dyn EventHandler<E>> = Arc::new(handler);
        self.many
            .entry(ContractKey::event::<E>())
            .or_default()
            .push(Registration::Singleton(HandlerRef::event::<E>(handler)));
        self
    }

    /// Add a per-publish handler factory to the fan-out list for `E`.
    pub fn with_event_factory<E, H, F>(mut self, factory: F) -> Self
    where
        E: Event,
        H: EventHandler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: HandlerFactory = Arc::new(move || {
            let handler: Arc<dyn EventHandler<E>> = Arc::new(factory());
            HandlerRef::event::<E>(handler)
        });
        self.many
            .entry(ContractKey::event::<E>())
            .or_default()
            .push(Registration::Transient(factory));
        self
    }

    /// Returns true if a query or command handler is registered for `contract`.
    pub fn has(&self, contract: &ContractKey) -> bool {
        self.single.contains_key(contract)
    }

    /// Number of event handlers bound to `contract`.
    pub fn event_handler_count(&self, contract: &ContractKey) -> usize {
        self.many.get(contract).map_or(0, Vec::len)
    }

    fn try_insert(
        mut self,
        contract: ContractKey,
        registration: Registration,
    ) -> Result<Self, MediatorError> {
        if self.single.contains_key(&contract) {
            return Err(MediatorError::AlreadyRegistered {
                type_name: contract.name(),
            });
        }
        self.single.insert(contract, registration);
        Ok(self)
    }
}

impl HandlerResolver for HandlerContainer {
    fn resolve(&self, contract: &ContractKey) -> Result<Option<Resolved>, ResolverError> {
        Ok(self.single.get(contract).map(Registration::resolve))
    }

    fn resolve_all(&self, contract: &ContractKey) -> Result<Vec<HandlerRef>, ResolverError> {
        Ok(self
            .many
            .get(contract)
            .map(|list| list.iter().map(|r| r.resolve().handler).collect())
            .unwrap_or_default())
    }
}

impl fmt::Debug for HandlerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContainer")
            .field("handlers", &self.single.keys().collect::<Vec<_>>())
            .field("event_contracts", &self.many.len())
            .finish()
    }
}
