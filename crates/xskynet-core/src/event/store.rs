//! EventStore trait and the in-memory implementation.
//!
//! Stores are append-only logs of `DomainEvent`s queried in store order. The
//! trait is synchronous: an append is a single write completed before `emit`
//! moves on to dispatch. The file-backed store lives in `xskynet-infra`.

use std::sync::RwLock;

use xskynet_types::error::StoreError;
use xskynet_types::event::{DomainEvent, ListOptions};

/// Durable or ephemeral log of domain events.
pub trait EventStore: Send + Sync {
    /// Append one event. Never drops silently: failures are returned.
    fn append(&self, event: &DomainEvent) -> Result<(), StoreError>;

    /// Events matching `options`, in store (append) order.
    fn list(&self, options: &ListOptions) -> Result<Vec<DomainEvent>, StoreError>;
}

/// Event store held in process memory. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    pub fn len(&self) -> Result<usize, StoreError> {
        let events = self.events.read().map_err(|_| StoreError::Lock)?;
        Ok(events.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, event: &DomainEvent) -> Result<(), StoreError> {
        let mut events = self.events.write().map_err(|_| StoreError::Lock)?;
        events.push(event.clone());
        Ok(())
    }

    fn list(&self, options: &ListOptions) -> Result<Vec<DomainEvent>, StoreError> {
        let events = self.events.read().map_err(|_| StoreError::Lock)?;
        Ok(options.apply(events.iter().cloned()))
    }
}
