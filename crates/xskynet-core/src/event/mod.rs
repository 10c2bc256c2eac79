//! Event bus and event store.

pub mod bus;
pub mod store;

pub use bus::{EventBus, EventBusConfig, EventHandler, Subscription};
pub use store::{EventStore, InMemoryEventStore};
