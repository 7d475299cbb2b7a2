//! Span context propagation across transport boundaries.
//!
//! # Responsibilities
//! - Inject the active span's context into outgoing headers or metadata
//! - Extract a remote parent context from incoming headers or metadata
//! - Provide one carrier pair per transport kind
//!
//! # Design Decisions
//! - W3C Trace Context is the wire encoding for every transport
//! - Injection is best-effort: invalid keys or values are logged and skipped
//! - An absent `traceparent` is the expected root-span case, not a failure

use std::sync::LazyLock;

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tonic::metadata::{KeyRef, MetadataKey, MetadataMap, MetadataValue};

/// Header key carrying the serialized span context.
const TRACEPARENT: &str = "traceparent";

static PROPAGATOR: LazyLock<TraceContextPropagator> = LazyLock::new(TraceContextPropagator::new);

/// Outcome of extracting a span context from a carrier.
pub enum Extraction {
    /// A valid remote parent context was found.
    Found(Context),
    /// The carrier holds no span context; start a root span.
    Missing,
    /// The carrier holds a context that could not be parsed. Callers log
    /// this and bypass tracing for the call while still executing it.
    Malformed,
}

/// Serialize the context's active span into `carrier`.
///
/// Never fails; a carrier that rejects an entry leaves propagation
/// incomplete and the downstream call proceeds untraced.
pub fn inject(cx: &Context, carrier: &mut dyn Injector) {
    PROPAGATOR.inject_context(cx, carrier);
}

/// Deserialize a remote parent context from `carrier`.
pub fn extract(carrier: &dyn Extractor) -> Extraction {
    if carrier.get(TRACEPARENT).is_none() {
        return Extraction::Missing;
    }
    let cx = PROPAGATOR.extract_with_context(&Context::new(), carrier);
    if cx.span().span_context().is_valid() {
        Extraction::Found(cx)
    } else {
        Extraction::Malformed
    }
}

/// Injects entries into HTTP headers.
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let name = match HeaderName::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(key, error = %err, "dropping invalid propagation header name");
                return;
            }
        };
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                self.0.append(name, value);
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "dropping invalid propagation header value");
            }
        }
    }
}

/// Reads entries from HTTP headers.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

/// Injects entries into RPC metadata. Keys are lower-cased by the
/// metadata encoding itself.
pub struct MetadataInjector<'a>(pub &'a mut MetadataMap);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let name = match MetadataKey::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(key, error = %err, "dropping invalid propagation metadata key");
                return;
            }
        };
        match MetadataValue::try_from(&value) {
            Ok(value) => {
                self.0.append(name, value);
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "dropping invalid propagation metadata value");
            }
        }
    }
}

/// Reads entries from RPC metadata.
pub struct MetadataExtractor<'a>(pub &'a MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .filter_map(|key| match key {
                KeyRef::Ascii(key) => Some(key.as_str()),
                KeyRef::Binary(_) => None,
            })
            .collect()
    }
}
