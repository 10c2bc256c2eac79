//! Runtime configuration types for X-Skynet.
//!
//! `RuntimeConfig` represents the optional `xskynet.toml` that controls where
//! the event log lives, whether events are persisted, and how plans are
//! scheduled. Every field has a serde default so a partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Local state directory, relative to the working directory unless absolute.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// File name of the JSONL event log inside `state_dir`.
    #[serde(default = "default_events_file")]
    pub events_file: String,

    /// Whether the event bus appends emitted events to the store.
    #[serde(default = "default_persist_events")]
    pub persist_events: bool,

    /// Capacity of the bus's in-memory history ring.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Maximum tasks running at once within a batch (0 = unbounded).
    #[serde(default)]
    pub max_parallelism: usize,

    /// Best-effort overall plan timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_timeout_secs: Option<u64>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".xskynet")
}

fn default_events_file() -> String {
    "events.jsonl".to_string()
}

fn default_persist_events() -> bool {
    true
}

fn default_max_history() -> usize {
    1000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            events_file: default_events_file(),
            persist_events: default_persist_events(),
            max_history: default_max_history(),
            max_parallelism: 0,
            plan_timeout_secs: None,
        }
    }
}

impl RuntimeConfig {
    /// Path of the event log, resolved against `base` when `state_dir` is relative.
    pub fn events_path(&self, base: &Path) -> PathBuf {
        base.join(&self.state_dir).join(&self.events_file)
    }

    pub fn plan_timeout(&self) -> Option<Duration> {
        self.plan_timeout_secs.map(Duration::from_secs)
    }
}
