//! Invocation thunks: pre-bound, type-erased calls into a handler contract.
//!
//! A thunk is built once per [`DispatchKey`] and reused for every later call
//! with that key. It knows how to:
//! 1. Cast the opaque [`HandlerRef`] back to the contract trait object
//! 2. Take the concrete request out of the [`AnyRequest`]
//! 3. Call `handle`
//! 4. Box the typed result into an [`ErasedResponse`]
//!
//! No type inspection happens after construction. The builders below are
//! generic, so "compiling" a thunk is just monomorphizing one of them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::core::{AnyRequest, Command, DispatchKey, ErasedResponse, Event, Query};
use crate::error::MediatorError;
use crate::handler::{CommandHandler, EventHandler, HandlerRef, QueryHandler};

type ThunkFn = dyn Fn(HandlerRef, AnyRequest, CancellationToken) -> BoxFuture<'static, Result<ErasedResponse, MediatorError>>
    + Send
    + Sync;

/// A reusable, type-erased handler invocation.
///
/// Immutable after creation and safe to call concurrently from any number of
/// tasks. Cloning is an `Arc` bump.
#[derive(Clone)]
pub struct InvocationThunk {
    key: DispatchKey,
    call: Arc<ThunkFn>,
}

impl InvocationThunk {
    /// Wrap a raw invocation function for `key`.
    pub fn new<F>(key: DispatchKey, call: F) -> Self
    where
        F: Fn(HandlerRef, AnyRequest, CancellationToken) -> BoxFuture<'static, Result<ErasedResponse, MediatorError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            key,
            call: Arc::new(call),
        }
    }

    /// The key this thunk was built for.
    pub fn key(&self) -> &DispatchKey {
        &self.key
    }

    /// Invoke the handler.
    ///
    /// A token that is already cancelled yields `Cancelled` without calling
    /// the handler. Otherwise the handler runs with the token and is raced
    /// against it; if both are ready the handler's result wins.
    pub fn call(
        &self,
        handler: HandlerRef,
        request: AnyRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<ErasedResponse, MediatorError>> + Send + 'static {
        let request_type = request.type_name();
        let invocation = if cancel.is_cancelled() {
            None
        } else {
            Some((self.call)(handler, request, cancel.clone()))
        };

        async move {
            let Some(invocation) = invocation else {
                return Err(MediatorError::Cancelled { request_type });
            };

            tokio::select! {
                biased;
                result = invocation => result,
                _ = cancel.cancelled() => Err(MediatorError::Cancelled { request_type }),
            }
        }
    }

    /// Returns true if both thunks share the same construction.
    pub fn ptr_eq(&self, other: &InvocationThunk) -> bool {
        Arc::ptr_eq(&self.call, &other.call)
    }
}

impl fmt::Debug for InvocationThunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationThunk")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Thunk that calls [`QueryHandler::handle`] directly.
pub fn query_thunk<Q: Query>() -> InvocationThunk {
    query_thunk_with::<Q, _, _>(|handler, query, cancel| async move {
        handler.handle(query, cancel).await
    })
}

/// Thunk that routes a query through an explicit invoker function.
pub fn query_thunk_with<Q, F, Fut>(invoker: F) -> InvocationThunk
where
    Q: Query,
    F: Fn(Arc<dyn QueryHandler<Q>>, Q, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Q::Output>> + Send + 'static,
{
    let invoker = Arc::new(invoker);
    InvocationThunk::new(DispatchKey::query::<Q>(), move |handler, request, cancel| {
        let invoker = invoker.clone();
        Box::pin(async move {
            let handler = handler.downcast::<dyn QueryHandler<Q>>()?;
            let query = request.into_inner::<Q>()?;
            let output = invoker(handler, query, cancel)
                .await
                .map_err(|e| MediatorError::from_handler(std::any::type_name::<Q>(), e))?;
            Ok::<_, MediatorError>(Box::new(output) as ErasedResponse)
        })
    })
}

/// Thunk that calls [`CommandHandler::handle`] directly.
pub fn command_thunk<C: Command>() -> InvocationThunk {
    command_thunk_with::<C, _, _>(|handler, command, cancel| async move {
        handler.handle(command, cancel).await
    })
}

/// Thunk that routes a command through an explicit invoker function.
pub fn command_thunk_with<C, F, Fut>(invoker: F) -> InvocationThunk
where
    C: Command,
    F: Fn(Arc<dyn CommandHandler<C>>, C, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<C::Output>> + Send + 'static,
{
    let invoker = Arc::new(invoker);
    InvocationThunk::new(DispatchKey::command::<C>(), move |handler, request, cancel| {
        let invoker = invoker.clone();
        Box::pin(async move {
            let handler = handler.downcast::<dyn CommandHandler<C>>()?;
            let command = request.into_inner::<C>()?;
            let output = invoker(handler, command, cancel)
                .await
                .map_err(|e| MediatorError::from_handler(std::any::type_name::<C>(), e))?;
            Ok::<_, MediatorError>(Box::new(output) as ErasedResponse)
        })
    })
}

/// Thunk that calls [`EventHandler::handle`] directly.
pub fn event_thunk<E: Event>() -> InvocationThunk {
    InvocationThunk::new(DispatchKey::event::<E>(), |handler, request, cancel| {
        Box::pin(async move {
            let handler = handler.downcast::<dyn EventHandler<E>>()?;
            let event = request.into_inner::<E>()?;
            handler
                .handle(event, cancel)
                .await
                .map_err(|e| MediatorError::from_handler(std::any::type_name::<E>(), e))?;
            Ok::<_, MediatorError>(Box::new(()) as ErasedResponse)
        })
    })
}

/// Thunk for a handler-bound event invoker; the [`HandlerRef`] is ignored.
pub fn bound_event_thunk<E, F, Fut>(invoker: F) -> InvocationThunk
where
    E: Event,
    F: Fn(E, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let invoker = Arc::new(invoker);
    InvocationThunk::new(DispatchKey::event::<E>(), move |_handler, request, cancel| {
        let invoker = invoker.clone();
        Box::pin(async move {
            let event = request.into_inner::<E>()?;
            invoker(event, cancel)
                .await
                .map_err(|e| MediatorError::from_handler(std::any::type_name::<E>(), e))?;
            Ok::<_, MediatorError>(Box::new(()) as ErasedResponse)
        })
    })
}
