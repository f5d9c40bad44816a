//! Handler contracts and the opaque handler reference.
//!
//! Handlers are the application's code. They:
//! 1. Receive one owned request
//! 2. Do the work (IO, computation)
//! 3. Return the typed result (or `()` for void commands and events)
//!
//! Every `handle` receives a [`CancellationToken`]. The engine also races the
//! handler against the token, so a handler that never checks it still gets
//! cancelled at its next await point.
//!
//! # Example
//!
//! ```ignore
//! struct GetOrderHandler {
//!     db: PgPool,
//! }
//!
//! #[async_trait]
//! impl QueryHandler<GetOrder> for GetOrderHandler {
//!     async fn handle(&self, query: GetOrder, _cancel: CancellationToken) -> Result<Option<Order>> {
//!         Ok(Order::find(query.id, &self.db).await?)
//!     }
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::{Command, Event, Query};
use crate::error::MediatorError;

/// Handler contract for query type `Q`.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    /// Answer the query.
    async fn handle(&self, query: Q, cancel: CancellationToken) -> Result<Q::Output>;
}

/// Handler contract for command type `C`.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Execute the command.
    async fn handle(&self, command: C, cancel: CancellationToken) -> Result<C::Output>;
}

/// Handler contract for event type `E`.
///
/// Zero or more event handlers may be bound to one event type; all of them run.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    /// React to the event.
    async fn handle(&self, event: E, cancel: CancellationToken) -> Result<()>;
}

/// Opaque, shared reference to a handler instance.
///
/// The content is always an `Arc` of the contract trait object
/// (`Arc<dyn QueryHandler<Q>>` and so on), so recovering the contract is a
/// checked downcast. Cloning is an `Arc` bump. The engine never owns the
/// handler's lifetime; the resolver does.
#[derive(Clone)]
pub struct HandlerRef {
    inner: Arc<dyn Any + Send + Sync>,
    contract: &'static str,
}

impl HandlerRef {
    /// Wrap a query handler.
    pub fn query<Q: Query>(handler: Arc<dyn QueryHandler<Q>>) -> Self {
        Self::wrap(handler)
    }

    /// Wrap a command handler.
    pub fn command<C: Command>(handler: Arc<dyn CommandHandler<C>>) -> Self {
        Self::wrap(handler)
    }

    /// Wrap an event handler.
    pub fn event<E: Event>(handler: Arc<dyn EventHandler<E>>) -> Self {
        Self::wrap(handler)
    }

    /// Placeholder for invokers that carry their own handler (static event
    /// bindings). Downcasting it to any contract fails.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(()),
            contract: "detached",
        }
    }

    fn wrap<T: ?Sized + Send + Sync + 'static>(handler: Arc<T>) -> Self {
        Self {
            inner: Arc::new(handler),
            contract: std::any::type_name::<T>(),
        }
    }

    /// Recover the contract object, e.g. `handler.downcast::<dyn QueryHandler<Q>>()`.
    pub fn downcast<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, MediatorError> {
        self.inner
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or(MediatorError::TypeMismatch {
                expected: std::any::type_name::<T>(),
            })
    }

    /// Diagnostic name of the contract this reference was created for.
    pub fn contract_name(&self) -> &'static str {
        self.contract
    }

    /// Returns true if both references point at the same handler instance.
    pub fn ptr_eq(&self, other: &HandlerRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRef")
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Ping;

    impl Query for Ping {
        type Output = u32;
    }

    struct PingHandler;

    #[async_trait]
    impl QueryHandler<Ping> for PingHandler {
        async fn handle(&self, _query: Ping, _cancel: CancellationToken) -> Result<u32> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_handler_ref_downcasts_to_contract() {
        let handler = HandlerRef::query::<Ping>(Arc::new(PingHandler));
        let contract = handler.downcast::<dyn QueryHandler<Ping>>().unwrap();

        let out = contract.handle(Ping, CancellationToken::new()).await.unwrap();
        assert_eq!(out, 1);
        assert!(handler.contract_name().contains("QueryHandler"));
    }

    #[test]
    fn test_handler_ref_rejects_other_contract() {
        let handler = HandlerRef::query::<Ping>(Arc::new(PingHandler));
        assert!(matches!(
            handler.downcast::<dyn EventHandler<Ping>>(),
            Err(MediatorError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_detached_downcasts_to_nothing() {
        let handler = HandlerRef::detached();
        assert!(handler.downcast::<dyn QueryHandler<Ping>>().is_err());
        assert_eq!(handler.contract_name(), "detached");
    }

    #[test]
    fn test_clones_share_instance() {
        let handler = HandlerRef::query::<Ping>(Arc::new(PingHandler));
        let clone = handler.clone();
        assert!(handler.ptr_eq(&clone));
        assert!(!handler.ptr_eq(&HandlerRef::query::<Ping>(Arc::new(PingHandler))));
    }
}
