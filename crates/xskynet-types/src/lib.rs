//! Shared domain types for X-Skynet.
//!
//! This crate contains the value types of the workflow runtime: Plan, Task,
//! Step, StepResult, Artifact, DomainEvent, RunContext, and the runtime
//! configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror,
//! and dashmap for the shared run bag.

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod plan;
pub mod result;
