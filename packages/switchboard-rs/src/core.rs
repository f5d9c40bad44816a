//! Core request traits and the type tags the engine routes on.
//!
//! # Overview
//!
//! Switchboard separates three kinds of request:
//! - [`Query`] = a read that expects a result
//! - [`Command`] = intent to change something; `Output = ()` for void commands
//! - [`Event`] = a fact broadcast to zero or more handlers
//!
//! A request's identity is its Rust type. The engine never inspects request
//! values; it routes on [`DispatchKey`] (request type + response type) and
//! finds handlers by [`ContractKey`] (the handler trait object type).
//!
//! # Type erasure
//!
//! Caches and pipelines are heterogeneous, so requests travel through them as
//! an [`AnyRequest`]: an owned, boxed payload tagged with its keys. The cache
//! never owns a request, only the thunks that know how to deliver one.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::MediatorError;
use crate::handler::{CommandHandler, EventHandler, QueryHandler};

/// Type-erased result of a handler or pipeline step.
pub type ErasedResponse = Box<dyn Any + Send>;

/// A read request with a typed result.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone)]
/// struct GetOrder {
///     id: u64,
/// }
///
/// impl Query for GetOrder {
///     type Output = Option<Order>;
/// }
/// ```
pub trait Query: Send + Sync + 'static {
    /// What a handler for this query returns.
    type Output: Send + 'static;
}

/// A request to change state.
///
/// Commands that produce nothing declare `type Output = ();`.
pub trait Command: Send + Sync + 'static {
    /// What a handler for this command returns.
    type Output: Send + 'static;
}

/// A fact, broadcast to every handler bound to its type.
///
/// **Note**: This trait is automatically implemented for any type that is
/// `Clone + Send + Sync + 'static`. Each fan-out handler receives its own clone.
pub trait Event: Clone + Send + Sync + 'static {}

// Blanket implementation for any type that meets the requirements
impl<T: Clone + Send + Sync + 'static> Event for T {}

/// Which operation family a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Read with a result.
    Query,
    /// Write with `()` or a result.
    Command,
    /// Broadcast fact.
    Event,
}

impl RequestKind {
    /// Stable lowercase name, used in logs and telemetry.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Query => "query",
            RequestKind::Command => "command",
            RequestKind::Event => "event",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Dispatch Key
// =============================================================================

/// Cache key for an invocation thunk: operation family, request type and
/// response type.
///
/// A type that is both a query and a command yields two distinct keys.
/// Equality and hashing ignore the names, which are diagnostic.
#[derive(Clone, Copy)]
pub struct DispatchKey {
    request: TypeId,
    response: TypeId,
    kind: RequestKind,
    request_name: &'static str,
    response_name: &'static str,
}

impl DispatchKey {
    /// Key for query type `Q`.
    pub fn query<Q: Query>() -> Self {
        Self::of::<Q, Q::Output>(RequestKind::Query)
    }

    /// Key for command type `C`.
    pub fn command<C: Command>() -> Self {
        Self::of::<C, C::Output>(RequestKind::Command)
    }

    /// Key for event type `E`.
    pub fn event<E: Event>() -> Self {
        Self::of::<E, ()>(RequestKind::Event)
    }

    fn of<R: 'static, T: 'static>(kind: RequestKind) -> Self {
        Self {
            request: TypeId::of::<R>(),
            response: TypeId::of::<T>(),
            kind,
            request_name: std::any::type_name::<R>(),
            response_name: std::any::type_name::<T>(),
        }
    }

    /// TypeId of the request.
    pub fn request_type(&self) -> TypeId {
        self.request
    }

    /// TypeId of the response.
    pub fn response_type(&self) -> TypeId {
        self.response
    }

    /// Operation family.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Human-readable request type name.
    pub fn request_name(&self) -> &'static str {
        self.request_name
    }

    /// Human-readable response type name.
    pub fn response_name(&self) -> &'static str {
        self.response_name
    }
}

impl PartialEq for DispatchKey {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.request == other.request
            && self.response == other.response
    }
}

impl Eq for DispatchKey {}

impl Hash for DispatchKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.request.hash(state);
        self.response.hash(state);
    }
}

impl fmt::Debug for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchKey")
            .field("kind", &self.kind)
            .field("request", &self.request_name)
            .field("response", &self.response_name)
            .finish()
    }
}

// =============================================================================
// Contract Key
// =============================================================================

/// Identifies a handler contract, i.e. a handler trait object type such as
/// `dyn QueryHandler<GetOrder>`.
#[derive(Clone, Copy)]
pub struct ContractKey {
    type_id: TypeId,
    name: &'static str,
}

impl ContractKey {
    /// Key for an arbitrary (usually unsized) contract type.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Contract for query type `Q`.
    pub fn query<Q: Query>() -> Self {
        Self::of::<dyn QueryHandler<Q>>()
    }

    /// Contract for command type `C`.
    pub fn command<C: Command>() -> Self {
        Self::of::<dyn CommandHandler<C>>()
    }

    /// Contract for event type `E`.
    pub fn event<E: Event>() -> Self {
        Self::of::<dyn EventHandler<E>>()
    }

    /// TypeId of the contract.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Human-readable contract name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ContractKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ContractKey {}

impl Hash for ContractKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContractKey").field(&self.name).finish()
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// =============================================================================
// Any Request
// =============================================================================

/// An owned, type-erased request tagged with its dispatch and contract keys.
///
/// Pipeline steps receive requests in this form. Inspect with
/// [`downcast_ref`](Self::downcast_ref), rewrite with
/// [`downcast_mut`](Self::downcast_mut), then hand the request to `next`.
pub struct AnyRequest {
    key: DispatchKey,
    contract: ContractKey,
    payload: Box<dyn Any + Send + Sync>,
}

impl AnyRequest {
    /// Erase a query.
    pub fn query<Q: Query>(query: Q) -> Self {
        Self {
            key: DispatchKey::query::<Q>(),
            contract: ContractKey::query::<Q>(),
            payload: Box::new(query),
        }
    }

    /// Erase a command.
    pub fn command<C: Command>(command: C) -> Self {
        Self {
            key: DispatchKey::command::<C>(),
            contract: ContractKey::command::<C>(),
            payload: Box::new(command),
        }
    }

    pub(crate) fn event<E: Event>(event: E) -> Self {
        Self {
            key: DispatchKey::event::<E>(),
            contract: ContractKey::event::<E>(),
            payload: Box::new(event),
        }
    }

    /// Dispatch key of the payload.
    pub fn key(&self) -> &DispatchKey {
        &self.key
    }

    /// Handler contract of the payload.
    pub fn contract(&self) -> &ContractKey {
        &self.contract
    }

    /// Operation family.
    pub fn kind(&self) -> RequestKind {
        self.key.kind
    }

    /// TypeId of the payload.
    pub fn request_type(&self) -> TypeId {
        self.key.request
    }

    /// Human-readable payload type name.
    pub fn type_name(&self) -> &'static str {
        self.key.request_name
    }

    /// Returns true if the payload is an `R`.
    pub fn is<R: Any>(&self) -> bool {
        self.payload.is::<R>()
    }

    /// Borrow the payload as an `R`.
    pub fn downcast_ref<R: Any>(&self) -> Option<&R> {
        self.payload.downcast_ref()
    }

    /// Mutably borrow the payload as an `R`.
    pub fn downcast_mut<R: Any>(&mut self) -> Option<&mut R> {
        self.payload.downcast_mut()
    }

    /// Take the payload back as an `R`.
    pub fn into_inner<R: Any>(self) -> Result<R, MediatorError> {
        self.payload
            .downcast::<R>()
            .map(|boxed| *boxed)
            .map_err(|_| MediatorError::TypeMismatch {
                expected: std::any::type_name::<R>(),
            })
    }
}

impl fmt::Debug for AnyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyRequest")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Take a type-erased response back as a `T`.
pub(crate) fn unwrap_response<T: Any>(response: ErasedResponse) -> Result<T, MediatorError> {
    response
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| MediatorError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })
}
