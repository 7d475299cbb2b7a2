//! Error types for tracer construction.

use thiserror::Error;

/// Errors that can occur while building a backend tracer from the
/// environment.
///
/// Construction failures are surfaced to the caller of
/// [`enable`](crate::registry::TracerRegistry::enable); the affected service
/// simply stays untraced. No other failure mode in this crate is fatal:
/// propagation and instrumentation problems degrade to "operate without
/// tracing for this call".
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configured collector endpoint is not a valid URL.
    #[error("invalid collector endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    /// The span exporter could not be constructed.
    #[error("failed to build span exporter: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),
}
