//! Domain events and the query types used to filter them.
//!
//! `DomainEvent` is the immutable record of a state transition. It is what the
//! event bus dispatches and what event stores persist (one JSON object per
//! line in the file-backed store).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard event vocabulary emitted by the plan executor.
pub mod types {
    pub const PLAN_STARTED: &str = "plan.started";
    pub const PLAN_SUCCEEDED: &str = "plan.succeeded";
    pub const PLAN_FAILED: &str = "plan.failed";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_SUCCEEDED: &str = "task.succeeded";
    pub const TASK_FAILED: &str = "task.failed";
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_SUCCEEDED: &str = "step.succeeded";
    pub const STEP_FAILED: &str = "step.failed";
}

/// Metadata key matched by [`EventFilter::source`].
pub const METADATA_SOURCE: &str = "source";

/// Metadata key set to `true` on events re-delivered by replay.
pub const METADATA_REPLAYED: &str = "replayed";

// ---------------------------------------------------------------------------
// Monotonic clock
// ---------------------------------------------------------------------------

static LAST_TIMESTAMP_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Current UTC time, strictly increasing across calls within this process.
///
/// When the wall clock has not advanced (or went backwards) since the last
/// call, the previous value plus one microsecond is returned instead.
pub fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_TIMESTAMP_MICROS.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_TIMESTAMP_MICROS.compare_exchange_weak(
            last,
            next,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
            Err(observed) => last = observed,
        }
    }
}

// ---------------------------------------------------------------------------
// DomainEvent
// ---------------------------------------------------------------------------

/// Immutable record of something that happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    /// ID of the plan/task/step the event is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl DomainEvent {
    /// Create an event with a fresh UUIDv7 ID and a monotonic timestamp.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            event_type: event_type.into(),
            occurred_at: monotonic_now(),
            aggregate_id: None,
            payload: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_aggregate(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The `metadata.source` value, if it is a string.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get(METADATA_SOURCE).and_then(Value::as_str)
    }

    /// Whether this event was re-delivered by a replay.
    pub fn is_replayed(&self) -> bool {
        self.metadata
            .get(METADATA_REPLAYED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Filters and list options
// ---------------------------------------------------------------------------

/// Structured event filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Accepted event types; empty accepts any type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,
    /// Matched against `metadata.source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EventFilter {
    /// A filter that matches every event.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self {
            types: vec![event_type.into()],
            ..Self::default()
        }
    }

    pub fn of_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_aggregate(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn matches(&self, event: &DomainEvent) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| *t == event.event_type) {
            return false;
        }
        if let Some(aggregate_id) = &self.aggregate_id {
            if event.aggregate_id.as_deref() != Some(aggregate_id.as_str()) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if event.source() != Some(source.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A bare event-type string is shorthand for a single-type filter.
impl From<&str> for EventFilter {
    fn from(event_type: &str) -> Self {
        Self::of_type(event_type)
    }
}

impl From<String> for EventFilter {
    fn from(event_type: String) -> Self {
        Self::of_type(event_type)
    }
}

/// Query options for listing stored events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Inclusive lower bound on `occurred_at`.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `occurred_at`.
    pub until: Option<DateTime<Utc>>,
    pub filter: EventFilter,
    /// Keep at most this many matches (the first ones in store order).
    pub limit: Option<usize>,
}

impl ListOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(filter: impl Into<EventFilter>) -> Self {
        Self {
            filter: filter.into(),
            ..Self::default()
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes the time bounds and the filter.
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if self.since.is_some_and(|since| event.occurred_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.occurred_at > until) {
            return false;
        }
        self.filter.matches(event)
    }

    /// Apply bounds, filter, and limit to events already in store order.
    pub fn apply<I>(&self, events: I) -> Vec<DomainEvent>
    where
        I: IntoIterator<Item = DomainEvent>,
    {
        let matching = events.into_iter().filter(|e| self.matches(e));
        match self.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }
}
