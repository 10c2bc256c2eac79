//! Per-run mutable execution state.
//!
//! The submitted `Plan` is never mutated while a run is in flight. Status
//! transitions are recorded here, in a table indexed by task position, and
//! folded back into a finished `Plan` record once the run ends. Every run
//! starts from `idle`, whatever statuses the submitted plan carried.

use std::collections::HashMap;

use serde_json::{Value, json};
use xskynet_types::plan::{Plan, PlanStatus, StepId, StepStatus, Task, TaskId, TaskStatus};
use xskynet_types::result::{ErrorInfo, StepResult};

/// What a task run reports back to the scheduler.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub index: usize,
    pub status: TaskStatus,
    pub steps: Vec<StepStatus>,
    pub results: Vec<(StepId, StepResult)>,
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone)]
struct TaskState {
    status: TaskStatus,
    steps: Vec<StepStatus>,
    error: Option<ErrorInfo>,
    results: HashMap<StepId, StepResult>,
}

/// Execution-state table for one run.
#[derive(Debug)]
pub struct RunState {
    plan_status: PlanStatus,
    tasks: Vec<TaskState>,
    first_failure: Option<ErrorInfo>,
}

impl RunState {
    pub fn new(plan: &Plan) -> Self {
        Self {
            plan_status: PlanStatus::Draft,
            tasks: plan
                .tasks
                .iter()
                .map(|t| TaskState {
                    status: TaskStatus::Idle,
                    steps: vec![StepStatus::Idle; t.steps.len()],
                    error: None,
                    results: HashMap::new(),
                })
                .collect(),
            first_failure: None,
        }
    }

    pub fn plan_status(&self) -> PlanStatus {
        self.plan_status
    }

    pub fn set_plan_status(&mut self, status: PlanStatus) {
        self.plan_status = status;
    }

    pub fn task_status(&self, index: usize) -> TaskStatus {
        self.tasks[index].status
    }

    pub fn mark_running(&mut self, index: usize) {
        self.tasks[index].status = TaskStatus::Running;
    }

    /// Mark an idle task skipped, along with all of its steps.
    ///
    /// Returns `false` when the task had already left `idle`.
    pub fn skip(&mut self, index: usize) -> bool {
        let task = &mut self.tasks[index];
        if task.status != TaskStatus::Idle {
            return false;
        }
        task.status = TaskStatus::Skipped;
        task.steps.fill(StepStatus::Skipped);
        true
    }

    /// Fail a task that was never started (timeout or cancellation).
    pub fn fail_unstarted(&mut self, index: usize, task_id: &str, error: ErrorInfo) -> bool {
        let task = &mut self.tasks[index];
        if task.status != TaskStatus::Idle {
            return false;
        }
        task.status = TaskStatus::Failed;
        task.steps.fill(StepStatus::Skipped);
        task.error = Some(error.clone());
        self.record_failure(task_id, None, &error);
        true
    }

    /// Fold a finished task run into the table.
    pub fn apply(&mut self, task_id: &str, outcome: TaskOutcome) {
        let failed_step = outcome
            .results
            .iter()
            .find(|(_, r)| !r.is_success())
            .map(|(id, _)| id.clone());

        let task = &mut self.tasks[outcome.index];
        task.status = outcome.status;
        task.steps = outcome.steps;
        task.error = outcome.error.clone();
        task.results.extend(outcome.results);

        if let Some(error) = &outcome.error {
            self.record_failure(task_id, failed_step.as_deref(), error);
        }
    }

    /// Keep the first task failure as the plan-level error.
    fn record_failure(&mut self, task_id: &str, step_id: Option<&str>, error: &ErrorInfo) {
        if self.first_failure.is_some() {
            return;
        }
        let mut details = json!({ "taskId": task_id, "code": error.code });
        if let Some(step_id) = step_id {
            details["stepId"] = json!(step_id);
        }
        self.first_failure = Some(
            ErrorInfo::new(
                error.code.clone(),
                format!("task '{task_id}' failed: {}", error.message),
            )
            .with_details(details),
        );
    }

    pub fn first_failure(&self) -> Option<&ErrorInfo> {
        self.first_failure.as_ref()
    }

    pub fn all_succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Succeeded)
    }

    /// Snapshot payload for task events.
    pub fn task_payload(&self, index: usize, task: &Task, run_id: &str) -> Value {
        let state = &self.tasks[index];
        task_payload(run_id, task, state.status, &state.steps, state.error.as_ref())
    }

    /// Consume the table, producing the finished plan and per-step results.
    pub fn finish(
        self,
        mut plan: Plan,
    ) -> (Plan, HashMap<TaskId, HashMap<StepId, StepResult>>) {
        let mut results = HashMap::new();
        plan.status = self.plan_status;
        plan.error = self.first_failure;
        for (task, state) in plan.tasks.iter_mut().zip(self.tasks) {
            task.status = state.status;
            for (step, status) in task.steps.iter_mut().zip(&state.steps) {
                step.status = *status;
            }
            if !state.results.is_empty() {
                results.insert(task.id.clone(), state.results);
            }
        }
        (plan, results)
    }
}

/// Owned JSON snapshot of a task, as carried by `task.*` events.
pub fn task_payload(
    run_id: &str,
    task: &Task,
    status: TaskStatus,
    steps: &[StepStatus],
    error: Option<&ErrorInfo>,
) -> Value {
    let mut payload = json!({
        "runId": run_id,
        "taskId": task.id,
        "name": task.name,
        "status": status,
        "dependsOn": task.depends_on,
        "steps": task
            .steps
            .iter()
            .zip(steps)
            .map(|(step, status)| json!({ "stepId": step.id, "status": status }))
            .collect::<Vec<_>>(),
    });
    if let Some(error) = error {
        payload["error"] = json!(error);
    }
    payload
}
