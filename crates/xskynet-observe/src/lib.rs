//! Observability for X-Skynet: tracing subscriber setup with optional
//! OpenTelemetry export, and an integration that mirrors bus events into
//! tracing.

pub mod event_trace;
pub mod tracing_setup;
