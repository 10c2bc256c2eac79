//! Plan executor: batch-parallel DAG execution with lifecycle events.
//!
//! The `PlanExecutor` validates a plan, groups its tasks into topological
//! batches, and runs every task of a batch concurrently via `tokio::JoinSet`.
//! Steps inside a task run strictly in order. Every transition is emitted on
//! the event bus as a `plan.*`, `task.*`, or `step.*` event.
//!
//! # Execution flow
//!
//! 1. Validate the plan and build batches. Nothing is emitted on failure.
//! 2. Emit `plan.started`.
//! 3. For each batch, stop early if the run was cancelled or timed out,
//!    otherwise spawn every still-idle task of the batch.
//! 4. Each task: `task.started`, then its steps in order, then
//!    `task.succeeded` or `task.failed`. The first failing step skips the rest.
//! 5. A failed task transitively skips every task depending on it.
//! 6. Emit `plan.succeeded` or `plan.failed` and return the finished plan.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;
use xskynet_types::config::RuntimeConfig;
use xskynet_types::context::RunContext;
use xskynet_types::event::{DomainEvent, METADATA_SOURCE, types};
use xskynet_types::plan::{Plan, PlanStatus, Step, StepId, StepStatus, Task, TaskId, TaskStatus};
use xskynet_types::result::{ErrorInfo, StepResult, codes};

use crate::event::bus::EventBus;
use crate::registry::ExecutorRegistry;

use super::dag::{PlanError, build_batches, dependents_of};
use super::state::{RunState, TaskOutcome, task_payload};

/// `metadata.source` carried by every event the executor emits.
pub const EVENT_SOURCE: &str = "executor";

/// Metadata key carrying the run ID on executor events.
pub const METADATA_RUN_ID: &str = "runId";

/// Bag key used when the plan context is not a JSON object.
pub const CONTEXT_BAG_KEY: &str = "context";

/// Aggregate ID of `step.*` events: `{task_id}/{step_id}`.
///
/// Step IDs are only unique within their task, so the task ID is part of
/// the key.
pub fn step_aggregate_id(task_id: &str, step_id: &str) -> String {
    format!("{task_id}/{step_id}")
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scheduling limits for plan runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum tasks running at once within a batch. `0` means unbounded.
    pub max_parallelism: usize,
    /// Best-effort overall timeout, checked before each batch is scheduled.
    pub plan_timeout: Option<Duration>,
}

impl From<&RuntimeConfig> for ExecutorConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_parallelism: config.max_parallelism,
            plan_timeout: config.plan_timeout(),
        }
    }
}

/// Per-run options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run ID to use instead of a generated UUIDv7. Lets callers cancel a
    /// run they have not yet seen a `plan.started` event for.
    pub run_id: Option<String>,
    /// Read-only environment handed to every handler.
    pub env: HashMap<String, String>,
}

impl RunOptions {
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Outcome of one plan run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: String,
    /// The plan with final statuses and, on failure, the plan-level error.
    pub plan: Plan,
    /// Results of every step that was invoked, keyed by task then step.
    pub step_results: HashMap<TaskId, HashMap<StepId, StepResult>>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn status(&self) -> PlanStatus {
        self.plan.status
    }

    pub fn is_success(&self) -> bool {
        self.plan.status == PlanStatus::Succeeded
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.plan.error.as_ref()
    }

    pub fn step_result(&self, task_id: &str, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(task_id)?.get(step_id)
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The plan failed validation; no events were emitted.
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),

    /// No active run with this ID (for cancel).
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// A run with the requested ID is already in flight.
    #[error("run already active: {0}")]
    RunAlreadyActive(String),
}

// ---------------------------------------------------------------------------
// PlanExecutor
// ---------------------------------------------------------------------------

/// Runs plans against a frozen executor registry.
pub struct PlanExecutor {
    registry: Arc<ExecutorRegistry>,
    bus: EventBus,
    config: ExecutorConfig,
    /// Cancellation tokens keyed by run ID, present while the run is active.
    cancellation_tokens: DashMap<String, CancellationToken>,
}

impl PlanExecutor {
    pub fn new(registry: Arc<ExecutorRegistry>, bus: EventBus, config: ExecutorConfig) -> Self {
        Self {
            registry,
            bus,
            config,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `plan` to completion with a generated run ID.
    pub async fn execute(&self, plan: Plan) -> Result<ExecutionResult, ExecutorError> {
        self.execute_with(plan, RunOptions::default()).await
    }

    /// Run `plan` to completion.
    ///
    /// Returns `Err` when the plan is invalid or `options.run_id` names a run
    /// that is still active. Handler failures, timeouts, and cancellation all
    /// produce an `Ok` result with a failed plan.
    ///
    /// Dropping the returned future ends the run: it leaves `active_runs` and
    /// its in-flight tasks are aborted.
    pub async fn execute_with(
        &self,
        plan: Plan,
        options: RunOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        let batches = batch_indices(&plan)?;

        let unresolved = self.registry.unresolved_kinds(&plan);
        if !unresolved.is_empty() {
            tracing::warn!(
                plan_id = %plan.id,
                kinds = ?unresolved,
                "plan references step kinds with no registered handler"
            );
        }

        let run_id = options
            .run_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let started_at = Instant::now();
        let deadline = self.config.plan_timeout.map(|timeout| started_at + timeout);
        let token = match self.cancellation_tokens.entry(run_id.clone()) {
            Entry::Occupied(_) => return Err(ExecutorError::RunAlreadyActive(run_id)),
            Entry::Vacant(slot) => slot.insert(CancellationToken::new()).value().clone(),
        };
        let active = ActiveRun {
            tokens: &self.cancellation_tokens,
            run_id: run_id.clone(),
        };

        let ctx = RunContext::new(run_id.clone(), plan.id.clone()).with_env(options.env);
        seed_bag(&ctx, plan.context.as_ref());
        let dispatch = Dispatch {
            registry: Arc::clone(&self.registry),
            bus: self.bus.clone(),
            ctx,
        };

        let index_of: HashMap<&str, usize> = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(idx, task)| (task.id.as_str(), idx))
            .collect();

        let mut state = RunState::new(&plan);
        state.set_plan_status(PlanStatus::Running);

        tracing::info!(
            run_id = %run_id,
            plan_id = %plan.id,
            tasks = plan.tasks.len(),
            batches = batches.len(),
            "plan run started"
        );
        dispatch.emit(dispatch.event(
            types::PLAN_STARTED,
            &plan.id,
            plan_payload(&plan, &state, &run_id),
        ));

        for (batch_no, batch) in batches.iter().enumerate() {
            if let Some(halt) = halt_reason(&token, deadline) {
                tracing::warn!(
                    run_id = %run_id,
                    batch = batch_no,
                    code = %halt.code,
                    "plan run halted before batch"
                );
                for &idx in batches[batch_no..].iter().flatten() {
                    let task = &plan.tasks[idx];
                    if state.fail_unstarted(idx, &task.id, halt.clone()) {
                        dispatch.emit(dispatch.event(
                            types::TASK_FAILED,
                            &task.id,
                            state.task_payload(idx, task, &run_id),
                        ));
                    }
                }
                break;
            }

            let runnable: Vec<usize> = batch
                .iter()
                .copied()
                .filter(|&idx| state.task_status(idx) == TaskStatus::Idle)
                .collect();
            tracing::debug!(
                run_id = %run_id,
                batch = batch_no,
                runnable = runnable.len(),
                skipped = batch.len() - runnable.len(),
                "scheduling batch"
            );

            let semaphore = (self.config.max_parallelism > 0)
                .then(|| Arc::new(Semaphore::new(self.config.max_parallelism)));

            let mut join_set = JoinSet::new();
            for &idx in &runnable {
                state.mark_running(idx);
                let task = plan.tasks[idx].clone();
                let dispatch = dispatch.clone();
                let semaphore = semaphore.clone();
                let span = tracing::debug_span!("task", run_id = %run_id, task_id = %task.id);
                join_set.spawn(
                    async move {
                        let _permit = match semaphore {
                            Some(semaphore) => semaphore.acquire_owned().await.ok(),
                            None => None,
                        };
                        dispatch.run_task(idx, task).await
                    }
                    .instrument(span),
                );
            }

            let mut outcomes = Vec::with_capacity(runnable.len());
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        tracing::error!(run_id = %run_id, error = %e, "task future did not complete");
                    }
                }
            }

            let reported: HashSet<usize> = outcomes.iter().map(|o| o.index).collect();
            for idx in runnable.iter().copied().filter(|idx| !reported.contains(idx)) {
                let task = &plan.tasks[idx];
                let error = ErrorInfo::new(
                    codes::TASK_ABORTED,
                    format!("task '{}' stopped without reporting a result", task.id),
                );
                let steps = vec![StepStatus::Skipped; task.steps.len()];
                dispatch.emit(dispatch.event(
                    types::TASK_FAILED,
                    &task.id,
                    task_payload(&run_id, task, TaskStatus::Failed, &steps, Some(&error)),
                ));
                outcomes.push(TaskOutcome {
                    index: idx,
                    status: TaskStatus::Failed,
                    steps,
                    results: Vec::new(),
                    error: Some(error),
                });
            }

            // Declaration order decides which failure becomes the plan error.
            outcomes.sort_by_key(|o| o.index);
            for outcome in outcomes {
                let idx = outcome.index;
                let failed = outcome.status == TaskStatus::Failed;
                state.apply(&plan.tasks[idx].id, outcome);
                if failed {
                    skip_dependents(&mut state, &plan, &index_of, idx, &run_id);
                }
            }
        }

        drop(active);

        let (status, event_type) = if state.all_succeeded() {
            (PlanStatus::Succeeded, types::PLAN_SUCCEEDED)
        } else {
            (PlanStatus::Failed, types::PLAN_FAILED)
        };
        state.set_plan_status(status);
        dispatch.emit(dispatch.event(
            event_type,
            &plan.id,
            plan_payload(&plan, &state, &run_id),
        ));

        let duration_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            run_id = %run_id,
            plan_id = %plan.id,
            status = %status,
            duration_ms,
            "plan run finished"
        );

        let (plan, step_results) = state.finish(plan);
        Ok(ExecutionResult {
            run_id,
            plan,
            step_results,
            duration_ms,
        })
    }

    /// Request cancellation of an active run.
    ///
    /// Non-preemptive: tasks already scheduled finish, no further batch is
    /// scheduled, and every task not yet started fails with code `cancelled`.
    pub fn cancel(&self, run_id: &str) -> Result<(), ExecutorError> {
        let token = self
            .cancellation_tokens
            .get(run_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;
        token.cancel();
        tracing::info!(run_id = %run_id, "plan run cancellation requested");
        Ok(())
    }

    /// IDs of runs currently in flight.
    pub fn active_runs(&self) -> Vec<String> {
        self.cancellation_tokens
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Removes a run's cancellation token when the run ends, including when the
/// `execute` future is dropped mid-run.
struct ActiveRun<'a> {
    tokens: &'a DashMap<String, CancellationToken>,
    run_id: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.tokens.remove(&self.run_id);
    }
}

// ---------------------------------------------------------------------------
// Task dispatch
// ---------------------------------------------------------------------------

/// Everything a spawned task needs, cheap to clone into each future.
#[derive(Clone)]
struct Dispatch {
    registry: Arc<ExecutorRegistry>,
    bus: EventBus,
    ctx: RunContext,
}

impl Dispatch {
    fn event(&self, event_type: &str, aggregate_id: &str, payload: Value) -> DomainEvent {
        DomainEvent::new(event_type)
            .with_aggregate(aggregate_id)
            .with_payload(payload)
            .with_metadata(METADATA_SOURCE, json!(EVENT_SOURCE))
            .with_metadata(METADATA_RUN_ID, json!(self.ctx.run_id))
    }

    /// Emit, logging store failures instead of aborting the run.
    fn emit(&self, event: DomainEvent) {
        let event_type = event.event_type.clone();
        if let Err(e) = self.bus.emit(event) {
            tracing::error!(
                run_id = %self.ctx.run_id,
                event_type = %event_type,
                error = %e,
                "failed to record executor event"
            );
        }
    }

    async fn run_task(&self, index: usize, task: Task) -> TaskOutcome {
        let run_id = self.ctx.run_id.as_str();
        let mut steps = vec![StepStatus::Idle; task.steps.len()];
        self.emit(self.event(
            types::TASK_STARTED,
            &task.id,
            task_payload(run_id, &task, TaskStatus::Running, &steps, None),
        ));

        let mut results = Vec::with_capacity(task.steps.len());
        let mut error: Option<ErrorInfo> = None;

        for (pos, step) in task.steps.iter().enumerate() {
            if error.is_some() {
                steps[pos] = StepStatus::Skipped;
                continue;
            }
            let aggregate_id = step_aggregate_id(&task.id, &step.id);

            steps[pos] = StepStatus::Running;
            self.emit(self.event(
                types::STEP_STARTED,
                &aggregate_id,
                step_payload(run_id, &task.id, step, StepStatus::Running, None),
            ));

            let mut result = self.invoke(step).await;
            if result.is_success() {
                steps[pos] = StepStatus::Succeeded;
                self.emit(self.event(
                    types::STEP_SUCCEEDED,
                    &aggregate_id,
                    step_payload(run_id, &task.id, step, StepStatus::Succeeded, Some(&result)),
                ));
            } else {
                steps[pos] = StepStatus::Failed;
                let step_error = result
                    .error
                    .get_or_insert_with(|| {
                        ErrorInfo::new(
                            codes::STEP_FAILED,
                            format!("step '{}' reported failure", step.id),
                        )
                    })
                    .clone();
                tracing::debug!(
                    task_id = %task.id,
                    step_id = %step.id,
                    code = %step_error.code,
                    "step failed"
                );
                self.emit(self.event(
                    types::STEP_FAILED,
                    &aggregate_id,
                    step_payload(run_id, &task.id, step, StepStatus::Failed, Some(&result)),
                ));
                error = Some(step_error);
            }
            results.push((step.id.clone(), result));
        }

        let status = if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Succeeded
        };
        let event_type = if error.is_some() {
            types::TASK_FAILED
        } else {
            types::TASK_SUCCEEDED
        };
        self.emit(self.event(
            event_type,
            &task.id,
            task_payload(run_id, &task, status, &steps, error.as_ref()),
        ));

        TaskOutcome {
            index,
            status,
            steps,
            results,
            error,
        }
    }

    /// Resolve and invoke the handler for one step, mapping every failure
    /// mode to a failed `StepResult`.
    async fn invoke(&self, step: &Step) -> StepResult {
        let Some(handler) = self.registry.get_executor(&step.kind) else {
            return StepResult::failed(
                ErrorInfo::new(
                    codes::HANDLER_NOT_FOUND,
                    format!("no handler registered for step kind '{}'", step.kind),
                )
                .with_details(json!({ "kind": step.kind })),
            );
        };

        match AssertUnwindSafe(handler.execute(step, &self.ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(step_id = %step.id, kind = %step.kind, error = %e, "step handler returned an error");
                StepResult::failed(ErrorInfo::new(codes::HANDLER_ERROR, format!("{e:#}")))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(step_id = %step.id, kind = %step.kind, panic = %message, "step handler panicked");
                StepResult::failed(ErrorInfo::new(codes::HANDLER_PANICKED, message))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Batches as task indices into `plan.tasks`.
fn batch_indices(plan: &Plan) -> Result<Vec<Vec<usize>>, PlanError> {
    let index_of: HashMap<&str, usize> = plan
        .tasks
        .iter()
        .enumerate()
        .map(|(idx, task)| (task.id.as_str(), idx))
        .collect();
    Ok(build_batches(&plan.tasks)?
        .into_iter()
        .map(|batch| {
            batch
                .into_iter()
                .filter_map(|task| index_of.get(task.id.as_str()).copied())
                .collect()
        })
        .collect())
}

/// Seed the shared bag from the plan's context.
fn seed_bag(ctx: &RunContext, context: Option<&Value>) {
    match context {
        Some(Value::Object(entries)) => {
            for (key, value) in entries {
                ctx.set(key.clone(), value.clone());
            }
        }
        Some(other) => {
            ctx.set(CONTEXT_BAG_KEY, other.clone());
        }
        None => {}
    }
}

fn halt_reason(token: &CancellationToken, deadline: Option<Instant>) -> Option<ErrorInfo> {
    if token.is_cancelled() {
        return Some(ErrorInfo::new(
            codes::CANCELLED,
            "run cancelled before the task was scheduled",
        ));
    }
    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        return Some(ErrorInfo::new(
            codes::TIMEOUT,
            "plan timeout elapsed before the task was scheduled",
        ));
    }
    None
}

/// Skip every idle task downstream of `failed`.
fn skip_dependents(
    state: &mut RunState,
    plan: &Plan,
    index_of: &HashMap<&str, usize>,
    failed: usize,
    run_id: &str,
) {
    let upstream = plan.tasks[failed].id.as_str();
    for dependent in dependents_of(upstream, &plan.tasks) {
        let Some(&idx) = index_of.get(dependent) else {
            continue;
        };
        if state.skip(idx) {
            tracing::debug!(
                run_id = %run_id,
                task_id = %dependent,
                upstream = %upstream,
                "task skipped"
            );
        }
    }
}

fn plan_payload(plan: &Plan, state: &RunState, run_id: &str) -> Value {
    let mut payload = json!({
        "runId": run_id,
        "planId": plan.id,
        "title": plan.title,
        "status": state.plan_status(),
        "taskCount": plan.tasks.len(),
    });
    if let Some(error) = state.first_failure() {
        payload["error"] = json!(error);
    }
    payload
}

fn step_payload(
    run_id: &str,
    task_id: &str,
    step: &Step,
    status: StepStatus,
    result: Option<&StepResult>,
) -> Value {
    let mut payload = json!({
        "runId": run_id,
        "taskId": task_id,
        "stepId": step.id,
        "name": step.name,
        "kind": step.kind,
        "status": status,
    });
    if let Some(result) = result {
        payload["result"] = json!(result);
        if let Some(error) = &result.error {
            payload["error"] = json!(error);
        }
    }
    payload
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "step handler panicked".to_string()
    }
}
