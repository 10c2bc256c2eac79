//! Per-run context handed to every handler invocation.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::plan::PlanId;

/// Shared state for one plan run.
///
/// Cloning is cheap and yields a view of the same `bag`, so values written by
/// one handler are visible to handlers that run later in the same run
/// (including handlers of concurrently running tasks).
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub plan_id: PlanId,
    pub env: HashMap<String, String>,
    pub bag: Arc<DashMap<String, Value>>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            plan_id: plan_id.into(),
            env: HashMap::new(),
            bag: Arc::new(DashMap::new()),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Read a value from the shared bag.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.bag.get(key).map(|entry| entry.value().clone())
    }

    /// Write a value into the shared bag, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.bag.insert(key.into(), value)
    }
}
