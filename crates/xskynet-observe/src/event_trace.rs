//! Mirrors bus events into the tracing pipeline.
//!
//! Register [`EventTraceIntegration`] on a plugin (or attach it directly) and
//! every emitted event shows up as a structured log line, so runs can be
//! followed with `RUST_LOG=xskynet_observe=debug` without reading the JSONL
//! log.

use serde_json::Value;
use xskynet_core::event::bus::{EventBus, Subscription};
use xskynet_core::registry::Integration;
use xskynet_types::event::{DomainEvent, EventFilter};

#[derive(Debug, Clone, Default)]
pub struct EventTraceIntegration {
    filter: EventFilter,
}

impl EventTraceIntegration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only mirror events matching `filter`.
    pub fn with_filter(filter: impl Into<EventFilter>) -> Self {
        Self {
            filter: filter.into(),
        }
    }
}

impl Integration for EventTraceIntegration {
    fn name(&self) -> &str {
        "event-trace"
    }

    fn attach(&self, bus: &EventBus) -> Vec<Subscription> {
        vec![bus.on(self.filter.clone(), trace_event)]
    }
}

/// Log one event. Failures and replays go out at `info`, the rest at `debug`.
pub fn trace_event(event: &DomainEvent) {
    let run_id = event
        .metadata
        .get("runId")
        .and_then(Value::as_str)
        .unwrap_or("");
    let aggregate_id = event.aggregate_id.as_deref().unwrap_or("");

    if event.event_type.ends_with(".failed") || event.is_replayed() {
        tracing::info!(
            event_type = %event.event_type,
            aggregate_id = %aggregate_id,
            run_id = %run_id,
            replayed = event.is_replayed(),
            "event"
        );
    } else {
        tracing::debug!(
            event_type = %event.event_type,
            aggregate_id = %aggregate_id,
            run_id = %run_id,
            "event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use xskynet_core::event::bus::EventBusConfig;
    use xskynet_core::event::store::InMemoryEventStore;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(InMemoryEventStore::new()), EventBusConfig::default())
    }

    #[test]
    fn attaches_one_subscription() {
        let bus = bus();
        let subs = EventTraceIntegration::new().attach(&bus);
        assert_eq!(subs.len(), 1);
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(DomainEvent::new("task.failed").with_aggregate("t1")).unwrap();

        subs[0].unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn filtered_integration_keeps_its_filter() {
        let integration = EventTraceIntegration::with_filter("plan.failed");
        assert_eq!(integration.filter, EventFilter::of_type("plan.failed"));
        assert_eq!(integration.name(), "event-trace");
    }
}
