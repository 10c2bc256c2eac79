//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use xskynet_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
//!
//! init_tracing(&TracingOptions::default()).unwrap();
//! // ... run plans ...
//! shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Tracer name reported on exported spans.
pub const TRACER_NAME: &str = "xskynet";

/// Filter applied when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// Bridge spans to OpenTelemetry with a stdout exporter.
    pub otel: bool,
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
    /// Filter directives used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            otel: false,
            json: false,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer (plain or JSON) with targets and span close timing.
/// - When `options.otel` is set, also bridges spans to OpenTelemetry using a
///   stdout exporter.
/// - `RUST_LOG` takes precedence over `options.default_filter`.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been set.
pub fn init_tracing(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.default_filter))?;

    let fmt_layer = if options.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    let otel_layer = if options.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(TRACER_NAME);
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

/// Flush pending spans and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
