//! Execution engine for X-Skynet.
//!
//! Holds the executor registry (step kind to handler bindings contributed by
//! plugins), the event bus with its pluggable store, and the plan executor
//! that runs task DAGs in batches. Depends only on `xskynet-types`; the
//! file-backed event store and config loading live in `xskynet-infra`.

pub mod event;
pub mod plan;
pub mod registry;
