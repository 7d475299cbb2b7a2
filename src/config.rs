//! Backend tracer configuration sourced from the environment.
//!
//! # Responsibilities
//! - Read and validate the collector endpoint from the environment
//! - Build an OTLP-backed tracer provider per service name
//!
//! # Design Decisions
//! - Constant (always-on) sampling; sampling policy belongs to the backend
//! - Unset endpoint falls back to the exporter's own default

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::registry::TracerBackend;

/// Environment variable naming the OTLP collector endpoint.
pub const ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Configuration for one backend tracer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Service name reported on every span.
    pub service_name: String,
    /// Collector endpoint override; `None` uses the exporter default.
    pub endpoint: Option<String>,
}

impl BackendConfig {
    /// Read configuration for `service_name` from the environment.
    ///
    /// The endpoint is validated eagerly so a misconfigured collector URL
    /// fails at enable time rather than on the export path.
    pub fn from_env(service_name: &str) -> Result<Self, ConfigError> {
        let endpoint = match std::env::var(ENDPOINT_ENV) {
            Ok(value) if !value.is_empty() => {
                Url::parse(&value)?;
                Some(value)
            }
            _ => None,
        };
        Ok(Self {
            service_name: service_name.to_string(),
            endpoint,
        })
    }

    /// Build the tracer and its owning provider.
    pub fn build(&self) -> Result<TracerBackend, ConfigError> {
        let mut exporter = opentelemetry_otlp::SpanExporter::builder().with_tonic();
        if let Some(endpoint) = &self.endpoint {
            exporter = exporter.with_endpoint(endpoint.clone());
        }
        let exporter = exporter.build()?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(
                Resource::builder()
                    .with_service_name(self.service_name.clone())
                    .build(),
            )
            .build();
        let tracer = provider.tracer(self.service_name.clone());

        Ok(TracerBackend { tracer, provider })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_without_endpoint() {
        // The variable is process-global; only assert the unset/empty path
        // when nothing else in the environment has set it.
        if std::env::var(ENDPOINT_ENV).is_err() {
            let config = BackendConfig::from_env("svc").expect("config should build");
            assert_eq!(config.service_name, "svc");
            assert_eq!(config.endpoint, None);
        }
    }

    #[test]
    fn test_endpoint_must_be_a_url() {
        let result: Result<(), ConfigError> = Url::parse("not a url")
            .map(|_| ())
            .map_err(ConfigError::from);
        assert!(matches!(result, Err(ConfigError::Endpoint(_))));
    }
}
