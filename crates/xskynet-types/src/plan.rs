//! Plan, task, and step definitions.
//!
//! A `Plan` is the unit submitted to the executor: an ordered list of `Task`s
//! whose `depends_on` edges form a DAG, each task holding an ordered list of
//! `Step`s dispatched to handlers by `kind`. Field names serialize in
//! camelCase so plans produced by external loaders deserialize directly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::result::ErrorInfo;

/// Identifier of a plan.
pub type PlanId = String;

/// Identifier of a task, unique within its plan.
pub type TaskId = String;

/// Identifier of a step, unique within its task.
pub type StepId = String;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a plan: `draft -> running -> {succeeded | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    Running,
    Succeeded,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Succeeded | PlanStatus::Failed)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Draft => write!(f, "draft"),
            PlanStatus::Running => write!(f, "running"),
            PlanStatus::Succeeded => write!(f, "succeeded"),
            PlanStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle status of a task.
///
/// `idle -> running -> {succeeded | failed}`; `skipped` is reachable from
/// `idle` only, when an upstream dependency fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Idle => write!(f, "idle"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Lifecycle status of a step. Same state machine as [`TaskStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Idle => write!(f, "idle"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan / Task / Step
// ---------------------------------------------------------------------------

/// Top-level DAG of tasks submitted for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: PlanId,
    pub title: String,
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Ordered tasks. Declaration order breaks ties inside a batch.
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Free-form context handed to every handler through the run bag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Populated from the first task failure when the plan fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Plan {
    /// Create an empty draft plan.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: PlanStatus::Draft,
            created_at: Utc::now(),
            tasks: Vec::new(),
            context: None,
            error: None,
        }
    }

    /// Builder-style task append.
    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Look up a task by ID.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// A dependency-graph node: a group of sequentially executed steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// IDs of tasks in the same plan that must be terminal before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: TaskStatus::Idle,
            created_at: Utc::now(),
            steps: Vec::new(),
            depends_on: Vec::new(),
            description: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The smallest unit of work, dispatched to exactly one handler by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: StepId,
    pub name: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Handler-selecting tag (e.g. "shell", "http").
    pub kind: String,
    /// Handler-specific parameters.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: StepStatus::Idle,
            created_at: Utc::now(),
            kind: kind.into(),
            metadata: HashMap::new(),
            description: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
