//! StepHandler trait and its object-safe wrapper.
//!
//! 1. `StepHandler` is the RPITIT trait concrete handlers implement
//! 2. `StepHandlerDyn` is an object-safe twin with boxed futures,
//!    blanket-implemented for every `T: StepHandler`
//! 3. `BoxStepHandler` wraps `Arc<dyn StepHandlerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use xskynet_types::context::RunContext;
use xskynet_types::plan::Step;
use xskynet_types::result::StepResult;

/// Executes steps of one `kind`.
///
/// Expected failures (bad input, remote errors, exhausted retries) must be
/// reported as a `StepResult` with `status: failed`. An `Err` is reserved for
/// genuine defects; the executor treats it exactly like a failed result.
/// Retries are a handler concern and may be reported via `StepResult::stats`.
pub trait StepHandler: Send + Sync {
    /// The step kind this handler is bound to (e.g. "shell", "http").
    fn kind(&self) -> &str;

    /// Execute one step within a run.
    fn execute(
        &self,
        step: &Step,
        ctx: &RunContext,
    ) -> impl Future<Output = anyhow::Result<StepResult>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn kind(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        step: &'a Step,
        ctx: &'a RunContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StepResult>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn kind(&self) -> &str {
        StepHandler::kind(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        step: &'a Step,
        ctx: &'a RunContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StepResult>> + Send + 'a>> {
        Box::pin(self.execute(step, ctx))
    }
}

/// Type-erased, cheaply cloneable step handler.
///
/// Clones share the same underlying handler, so a handler resolved from the
/// registry can be moved into a spawned task.
#[derive(Clone)]
pub struct BoxStepHandler {
    inner: Arc<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub fn kind(&self) -> &str {
        self.inner.kind()
    }

    pub async fn execute(&self, step: &Step, ctx: &RunContext) -> anyhow::Result<StepResult> {
        self.inner.execute_boxed(step, ctx).await
    }

    /// Whether two boxes point at the same handler instance.
    pub fn ptr_eq(&self, other: &BoxStepHandler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepHandler")
            .field("kind", &self.kind())
            .finish()
    }
}
