//! Step results, error payloads, and artifacts produced by handlers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes produced by the runtime itself (handlers may use their own).
pub mod codes {
    /// No handler is registered for the step's kind.
    pub const HANDLER_NOT_FOUND: &str = "handler_not_found";
    /// The handler returned `Err` instead of a `StepResult`.
    pub const HANDLER_ERROR: &str = "handler_error";
    /// The handler panicked while executing.
    pub const HANDLER_PANICKED: &str = "handler_panicked";
    /// The handler reported failure without attaching an error.
    pub const STEP_FAILED: &str = "step_failed";
    /// The task's spawned future was aborted before reporting back.
    pub const TASK_ABORTED: &str = "task_aborted";
    /// The plan timeout elapsed before the task was admitted.
    pub const TIMEOUT: &str = "timeout";
    /// The run was cancelled before the task was admitted.
    pub const CANCELLED: &str = "cancelled";
}

/// Structured error carried by failed steps and failed plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Terminal outcome reported by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

/// Optional usage counters a handler may report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStats {
    /// Retries performed internally by the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_input: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_output: Option<u64>,
    #[serde(default, rename = "costUSD", skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Result returned by a handler for one step execution.
///
/// Business failures are expressed as `status: failed` with an `error`,
/// never as an `Err` from the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StepStats>,
}

impl StepResult {
    pub fn succeeded() -> Self {
        Self {
            status: StepOutcome::Succeeded,
            output: None,
            error: None,
            metadata: None,
            stats: None,
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            status: StepOutcome::Failed,
            output: None,
            error: Some(error),
            metadata: None,
            stats: None,
        }
    }

    pub fn with_output(mut self, artifact: Artifact) -> Self {
        self.output = Some(artifact);
        self
    }

    pub fn with_stats(mut self, stats: StepStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepOutcome::Succeeded
    }
}

/// Typed output or reference produced by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl Artifact {
    /// Create an artifact with a fresh UUIDv7 ID.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            kind: kind.into(),
            created_at: Utc::now(),
            name: None,
            mime: None,
            metadata: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }
}
