//! Event bus: the single place event emission and subscription meet.
//!
//! `EventBus` wraps one [`EventStore`]. Emitting appends to the store (when
//! persistence is enabled), records the event in a bounded in-memory history
//! ring, then dispatches it synchronously to every matching subscriber in
//! registration order. Replay re-delivers stored events to the current
//! subscribers without writing them again.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use xskynet_types::config::RuntimeConfig;
use xskynet_types::error::StoreError;
use xskynet_types::event::{DomainEvent, EventFilter, ListOptions, METADATA_REPLAYED};

use super::store::EventStore;

/// Default capacity of the history ring.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Callback invoked for every matching event.
pub type EventHandler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

/// Construction-time bus settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBusConfig {
    /// Append emitted events to the store.
    pub persist: bool,
    /// Capacity of the in-memory history ring.
    pub max_history: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            persist: true,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

impl From<&RuntimeConfig> for EventBusConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            persist: config.persist_events,
            max_history: config.max_history,
        }
    }
}

struct Subscriber {
    id: u64,
    filter: EventFilter,
    target: Target,
}

/// A handler plus the liveness flag shared with its [`Subscription`].
#[derive(Clone)]
struct Target {
    live: Arc<AtomicBool>,
    handler: EventHandler,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Subscriber>,
    history: VecDeque<DomainEvent>,
    next_subscriber_id: u64,
}

struct BusInner {
    store: Arc<dyn EventStore>,
    config: EventBusConfig,
    state: Mutex<BusState>,
}

impl BusInner {
    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_subscriber(&self, id: u64) {
        self.state().subscribers.retain(|s| s.id != id);
    }
}

/// In-process publish/subscribe over an event store.
///
/// Cloning the bus yields another handle to the same subscribers, history,
/// and store.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>, config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                store,
                config,
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    pub fn config(&self) -> EventBusConfig {
        self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    /// Persist (if enabled), record in history, and dispatch one event.
    ///
    /// When the append fails the error is returned and the event is neither
    /// recorded nor dispatched.
    pub fn emit(&self, event: DomainEvent) -> Result<(), StoreError> {
        let targets = {
            let mut state = self.inner.state();
            if self.inner.config.persist {
                self.inner.store.append(&event)?;
            }

            let capacity = self.inner.config.max_history;
            if capacity > 0 {
                if state.history.len() == capacity {
                    state.history.pop_front();
                }
                state.history.push_back(event.clone());
            }

            matching_handlers(&state.subscribers, &event)
        };

        dispatch(&targets, &event);
        Ok(())
    }

    /// Register `handler` for events matching `filter`.
    ///
    /// `filter` accepts a bare event-type string or a full [`EventFilter`].
    pub fn on<F>(&self, filter: impl Into<EventFilter>, handler: F) -> Subscription
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        let mut state = self.inner.state();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        let live = Arc::new(AtomicBool::new(true));
        state.subscribers.push(Subscriber {
            id,
            filter: filter.into(),
            target: Target {
                live: Arc::clone(&live),
                handler: Arc::new(handler),
            },
        });
        tracing::debug!(subscriber_id = id, "event subscriber registered");

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            active: live,
        }
    }

    /// Alias of [`EventBus::on`].
    pub fn subscribe<F>(&self, filter: impl Into<EventFilter>, handler: F) -> Subscription
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        self.on(filter, handler)
    }

    /// The most recent `limit` events (all retained when `None`), oldest first.
    ///
    /// Served from the in-memory ring only; never touches the store.
    pub fn history(&self, limit: Option<usize>) -> Vec<DomainEvent> {
        let state = self.inner.state();
        let len = state.history.len();
        let skip = limit.map_or(0, |limit| len.saturating_sub(limit));
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Pass-through to the store's `list`. Does not dispatch.
    pub fn list(&self, options: &ListOptions) -> Result<Vec<DomainEvent>, StoreError> {
        self.inner.store.list(options)
    }

    /// Re-deliver stored events matching `options` to the current subscribers.
    ///
    /// Each delivered copy carries `metadata.replayed = true`. Nothing is
    /// appended to the store or the history ring. The subscriber set is fixed
    /// when replay starts. Returns the number of events replayed.
    pub fn replay(&self, options: &ListOptions) -> Result<usize, StoreError> {
        let events = self.inner.store.list(options)?;
        let subscribers: Vec<(EventFilter, Target)> = {
            let state = self.inner.state();
            state
                .subscribers
                .iter()
                .map(|s| (s.filter.clone(), s.target.clone()))
                .collect()
        };

        for mut event in events.iter().cloned() {
            event
                .metadata
                .insert(METADATA_REPLAYED.to_string(), Value::Bool(true));
            let targets: Vec<Target> = subscribers
                .iter()
                .filter(|(filter, _)| filter.matches(&event))
                .map(|(_, target)| target.clone())
                .collect();
            dispatch(&targets, &event);
        }

        tracing::debug!(count = events.len(), "replayed events");
        Ok(events.len())
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state().subscribers.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("subscribers", &state.subscribers.len())
            .field("history_len", &state.history.len())
            .finish()
    }
}

fn matching_handlers(subscribers: &[Subscriber], event: &DomainEvent) -> Vec<Target> {
    subscribers
        .iter()
        .filter(|s| s.filter.matches(event))
        .map(|s| s.target.clone())
        .collect()
}

/// Invoke handlers in order. A panicking handler is logged and does not
/// prevent delivery to the remaining ones.
///
/// Each handler's liveness is re-checked right before its call, so one that
/// was unsubscribed after the snapshot was taken is not invoked. A call that
/// has already begun is not waited for.
fn dispatch(targets: &[Target], event: &DomainEvent) {
    for target in targets {
        if !target.live.load(Ordering::Acquire) {
            continue;
        }
        let handler = &target.handler;
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            tracing::error!(
                event_id = event.id.as_str(),
                event_type = event.event_type.as_str(),
                "event subscriber panicked"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle returned by [`EventBus::on`].
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
/// Once `unsubscribe` returns, no new invocation of the handler starts, even
/// for an `emit` already dispatching on another thread.
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Remove exactly this subscriber. Later calls are no-ops.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_subscriber(self.id);
            tracing::debug!(subscriber_id = self.id, "event subscriber removed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
