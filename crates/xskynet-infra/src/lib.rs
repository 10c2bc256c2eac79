//! Infrastructure layer for X-Skynet.
//!
//! Contains the JSONL implementation of the `EventStore` trait defined in
//! `xskynet-core`, the `xskynet.toml` loader, and bootstrap wiring that
//! assembles a bus and executor from them.

pub mod bootstrap;
pub mod config;
pub mod event_log;
