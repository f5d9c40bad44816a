//! Onion-style middleware around the terminal handler call.
//!
//! ```text
//!   global[0] ──► global[1] ──► per_type[0] ──► terminal (thunk → handler)
//!      ▲             ▲              ▲                 │
//!      └─────────────┴──────────────┴─────────────────┘  post-processing
//! ```
//!
//! Each step receives the erased request, a [`Next`] for the rest of the chain
//! and the cancellation token. A step may inspect or rewrite the request,
//! short-circuit by returning without calling `next`, or post-process the
//! response `next` returns.
//!
//! Chains are composed once when the [`PipelineExecutor`] is built (global
//! steps first, then per-type steps). Request types with no applicable steps
//! skip the chain entirely and await the terminal directly.
//!
//! # Example
//!
//! ```ignore
//! struct Timing;
//!
//! #[async_trait]
//! impl PipelineStep for Timing {
//!     async fn process(&self, request: AnyRequest, next: Next<'_>, cancel: CancellationToken) -> PipelineResult {
//!         let started = Instant::now();
//!         let name = request.type_name();
//!         let result = next.run(request, cancel).await;
//!         metrics::record(name, started.elapsed());
//!         result
//!     }
//! }
//!
//! let pipeline = PipelineConfig::new()
//!     .add_global(Timing)
//!     .add_per_type::<CreateUser>(ValidationStep::new(|c: &CreateUser| {
//!         if c.name.is_empty() { Err("name is required".into()) } else { Ok(()) }
//!     }));
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::{AnyRequest, ErasedResponse};
use crate::error::MediatorError;

/// What a pipeline link returns.
pub type PipelineResult = Result<ErasedResponse, MediatorError>;

type TerminalFn<'a> =
    dyn Fn(AnyRequest, CancellationToken) -> BoxFuture<'static, PipelineResult> + Send + Sync + 'a;

/// A middleware step.
#[async_trait]
pub trait PipelineStep: Send + Sync + 'static {
    /// Name used in diagnostics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Handle the request, usually by calling `next.run(request, cancel)`.
    async fn process(
        &self,
        request: AnyRequest,
        next: Next<'_>,
        cancel: CancellationToken,
    ) -> PipelineResult;
}

/// The remainder of the chain.
///
/// `run` consumes it, so a step can continue at most once.
pub struct Next<'a> {
    steps: &'a [Arc<dyn PipelineStep>],
    terminal: &'a TerminalFn<'a>,
}

impl<'a> Next<'a> {
    /// Continue with the next step, or the terminal handler call.
    pub async fn run(self, request: AnyRequest, cancel: CancellationToken) -> PipelineResult {
        if cancel.is_cancelled() {
            return Err(MediatorError::Cancelled {
                request_type: request.type_name(),
            });
        }

        match self.steps.split_first() {
            Some((step, rest)) => {
                let next = Next {
                    steps: rest,
                    terminal: self.terminal,
                };
                step.process(request, next, cancel).await
            }
            None => (self.terminal)(request, cancel).await,
        }
    }

    /// Steps left before the terminal call.
    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Startup registration of pipeline steps.
#[derive(Default, Clone)]
pub struct PipelineConfig {
    global: Vec<Arc<dyn PipelineStep>>,
    per_type: Vec<(TypeId, &'static str, Arc<dyn PipelineStep>)>,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step that wraps every request.
    pub fn add_global(mut self, step: impl PipelineStep) -> Self {
        self.global.push(Arc::new(step));
        self
    }

    /// Add a step that wraps requests of type `R` only.
    pub fn add_per_type<R: 'static>(self, step: impl PipelineStep) -> Self {
        self.add_for_type(TypeId::of::<R>(), std::any::type_name::<R>(), step)
    }

    /// Untyped form of [`add_per_type`](Self::add_per_type).
    pub fn add_for_type(
        mut self,
        request_type: TypeId,
        request_name: &'static str,
        step: impl PipelineStep,
    ) -> Self {
        self.per_type
            .push((request_type, request_name, Arc::new(step)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.per_type.is_empty()
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("global", &self.global.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field(
                "per_type",
                &self
                    .per_type
                    .iter()
                    .map(|(_, request, step)| (*request, step.name()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Composed chains, one per request type that has per-type steps.
///
/// Everything else shares the global chain, which is empty (and skipped) when
/// no global steps are configured.
#[derive(Default)]
pub struct PipelineExecutor {
    global: Vec<Arc<dyn PipelineStep>>,
    chains: HashMap<TypeId, Vec<Arc<dyn PipelineStep>>>,
}

impl PipelineExecutor {
    pub fn new(config: PipelineConfig) -> Self {
        let PipelineConfig { global, per_type } = config;

        let mut chains: HashMap<TypeId, Vec<Arc<dyn PipelineStep>>> = HashMap::new();
        for (request_type, _name, step) in per_type {
            chains
                .entry(request_type)
                .or_insert_with(|| global.clone())
                .push(step);
        }

        Self { global, chains }
    }

    /// The composed chain for a request type.
    pub fn chain_for(&self, request_type: TypeId) -> &[Arc<dyn PipelineStep>] {
        self.chains
            .get(&request_type)
            .map(Vec::as_slice)
            .unwrap_or(self.global.as_slice())
    }

    /// Returns true if any step applies to `request_type`.
    pub fn has_steps(&self, request_type: TypeId) -> bool {
        !self.chain_for(request_type).is_empty()
    }

    /// Step names in execution order, for diagnostics.
    pub fn step_names(&self, request_type: TypeId) -> Vec<&'static str> {
        self.chain_for(request_type)
            .iter()
            .map(|step| step.name())
            .collect()
    }

    /// Run `request` through its chain, ending in `terminal`.
    ///
    /// With no applicable steps the terminal future is awaited directly.
    pub async fn execute<F, Fut>(
        &self,
        request: AnyRequest,
        cancel: CancellationToken,
        terminal: F,
    ) -> PipelineResult
    where
        F: Fn(AnyRequest, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = PipelineResult> + Send + 'static,
    {
        let steps = self.chain_for(request.request_type());
        if steps.is_empty() {
            return terminal(request, cancel).await;
        }

        let boxed = move |request: AnyRequest, cancel: CancellationToken| -> BoxFuture<'static, PipelineResult> {
            Box::pin(terminal(request, cancel))
        };
        Next {
            steps,
            terminal: &boxed,
        }
        .run(request, cancel)
        .await
    }
}

impl fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("global", &self.global.len())
            .field("per_type_chains", &self.chains.len())
            .finish()
    }
}

// =============================================================================
// Built-in Steps
// =============================================================================

/// Rejects requests of type `R` that fail a predicate.
///
/// Requests of any other type pass through untouched.
pub struct ValidationStep<R, F> {
    validate: F,
    _marker: PhantomData<fn(&R)>,
}

impl<R, F> ValidationStep<R, F>
where
    R: Send + Sync + 'static,
    F: Fn(&R) -> Result<(), String> + Send + Sync + 'static,
{
    pub fn new(validate: F) -> Self {
        Self {
            validate,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R, F> PipelineStep for ValidationStep<R, F>
where
    R: Send + Sync + 'static,
    F: Fn(&R) -> Result<(), String> + Send + Sync + 'static,
{
    async fn process(
        &self,
        request: AnyRequest,
        next: Next<'_>,
        cancel: CancellationToken,
    ) -> PipelineResult {
        if let Some(typed) = request.downcast_ref::<R>() {
            if let Err(message) = (self.validate)(typed) {
                return Err(MediatorError::Validation {
                    request_type: request.type_name(),
                    message,
                });
            }
        }
        next.run(request, cancel).await
    }
}

/// Runs the rest of the chain inside a `dispatch` tracing span.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStep;

#[async_trait]
impl PipelineStep for TracingStep {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn process(
        &self,
        request: AnyRequest,
        next: Next<'_>,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let span = tracing::debug_span!(
            "dispatch",
            kind = %request.kind(),
            request = request.type_name()
        );
        next.run(request, cancel).instrument(span).await
    }
}
