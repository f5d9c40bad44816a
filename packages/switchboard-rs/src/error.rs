//! Structured error types for switchboard.
//!
//! `MediatorError` provides pattern-matchable errors instead of a generic
//! `anyhow::Error`. Handlers keep returning `anyhow::Result` (ergonomic for
//! application code); the engine maps those errors at the thunk boundary.
//!
//! # The Error Boundary Rule
//!
//! > **Every error surfaces to the immediate caller of `query`/`send`/`publish`.**
//!
//! The engine never retries and never swallows a handler or pipeline error.
//! A handler that returns a `MediatorError` inside its `anyhow::Error` (for
//! example a `Validation` or `Cancelled`) keeps that variant; anything else is
//! wrapped as [`MediatorError::Handler`].
//!
//! # Example
//!
//! ```ignore
//! use switchboard::{ErrorKind, MediatorError};
//!
//! match mediator.query(GetOrder { id }).await {
//!     Ok(order) => render(order),
//!     Err(MediatorError::Validation { message, .. }) => bad_request(message),
//!     Err(e) if e.kind() == ErrorKind::Configuration => panic!("wiring bug: {e}"),
//!     Err(e) => internal_error(e),
//! }
//! ```

use std::fmt;

use thiserror::Error;

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse classification of a [`MediatorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing contract or handler, duplicate registration, type mismatch.
    /// A programming error: fatal to the call, never worth retrying.
    Configuration,
    /// The external resolver failed.
    Resolver,
    /// A pipeline step rejected the request.
    Validation,
    /// Cooperative cancellation was observed.
    Cancelled,
    /// A handler (or one or more fan-out handlers) failed.
    Handler,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration_error"),
            ErrorKind::Resolver => write!(f, "resolver_error"),
            ErrorKind::Validation => write!(f, "validation_error"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Handler => write!(f, "handler_error"),
        }
    }
}

// =============================================================================
// Resolver Error
// =============================================================================

/// Error raised by an external [`HandlerResolver`](crate::HandlerResolver).
///
/// Propagated to the caller unchanged as [`MediatorError::Resolver`].
#[derive(Debug, Error)]
#[error("resolver failed for contract {contract}: {source}")]
pub struct ResolverError {
    /// Diagnostic name of the contract being resolved.
    pub contract: &'static str,
    /// What the resolver reported.
    #[source]
    pub source: anyhow::Error,
}

impl ResolverError {
    /// Wrap a resolver failure for `contract`.
    pub fn new(contract: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self {
            contract,
            source: source.into(),
        }
    }
}

// =============================================================================
// Handler Failure (fan-out)
// =============================================================================

/// One failed handler inside a [`MediatorError::Publish`].
#[derive(Debug)]
pub struct HandlerFailure {
    /// Position of the handler in the fan-out order.
    pub index: usize,
    /// What that handler reported.
    pub error: MediatorError,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler #{}: {}", self.index, self.error)
    }
}

// =============================================================================
// Mediator Error
// =============================================================================

/// Structured error type for switchboard operations.
#[derive(Debug, Error)]
pub enum MediatorError {
    /// No handler contract could be located for a request/response pair.
    #[error("no handler contract for request type {request_type} with response {response_type}")]
    ContractResolution {
        /// Human-readable request type name.
        request_type: &'static str,
        /// Human-readable response type name.
        response_type: &'static str,
    },

    /// The contract is known but nothing is registered to handle it.
    #[error("no handler registered for {contract}")]
    HandlerNotFound {
        /// Diagnostic name of the contract.
        contract: &'static str,
    },

    /// The external resolver failed.
    #[error(transparent)]
    Resolver(#[from] ResolverError),

    /// A pipeline step rejected the request.
    #[error("validation failed for {request_type}: {message}")]
    Validation {
        /// Human-readable request type name.
        request_type: &'static str,
        /// Why the request was rejected.
        message: String,
    },

    /// Cooperative cancellation was observed before the call completed.
    #[error("dispatch of {request_type} was cancelled")]
    Cancelled {
        /// Human-readable request type name.
        request_type: &'static str,
    },

    /// A handler returned an error.
    #[error("handler for {request_type} failed: {source}")]
    Handler {
        /// Human-readable request type name.
        request_type: &'static str,
        /// The handler's error.
        #[source]
        source: anyhow::Error,
    },

    /// One or more event handlers failed. All handlers ran to completion.
    #[error("{} of {handlers} handlers failed for event {event_type}", .failures.len())]
    Publish {
        /// Human-readable event type name.
        event_type: &'static str,
        /// Number of handlers the event fanned out to.
        handlers: usize,
        /// Every failure, in fan-out order.
        failures: Vec<HandlerFailure>,
    },

    /// A type-erased value did not have the expected concrete type.
    #[error("type mismatch: expected {expected}")]
    TypeMismatch {
        /// Expected type name.
        expected: &'static str,
    },

    /// A handler or invoker is already registered for this type.
    #[error("already registered for {type_name}")]
    AlreadyRegistered {
        /// Human-readable type name.
        type_name: &'static str,
    },
}

impl MediatorError {
    /// Map an error returned by a handler or invoker.
    ///
    /// A `MediatorError` carried inside the `anyhow::Error` keeps its variant.
    pub fn from_handler(request_type: &'static str, error: anyhow::Error) -> Self {
        match error.downcast::<MediatorError>() {
            Ok(inner) => inner,
            Err(source) => MediatorError::Handler {
                request_type,
                source,
            },
        }
    }

    /// Build a validation error for request type `R`.
    pub fn validation<R: ?Sized + 'static>(message: impl Into<String>) -> Self {
        MediatorError::Validation {
            request_type: std::any::type_name::<R>(),
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MediatorError::ContractResolution { .. }
            | MediatorError::HandlerNotFound { .. }
            | MediatorError::TypeMismatch { .. }
            | MediatorError::AlreadyRegistered { .. } => ErrorKind::Configuration,
            MediatorError::Resolver(_) => ErrorKind::Resolver,
            MediatorError::Validation { .. } => ErrorKind::Validation,
            MediatorError::Cancelled { .. } => ErrorKind::Cancelled,
            MediatorError::Handler { .. } | MediatorError::Publish { .. } => ErrorKind::Handler,
        }
    }

    /// Returns true if this is a cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MediatorError::Cancelled { .. })
    }

    /// Whether a caller may reasonably retry the same request.
    ///
    /// Configuration errors and validation rejections will fail the same way
    /// again; the engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Resolver | ErrorKind::Handler | ErrorKind::Cancelled
        )
    }
}
