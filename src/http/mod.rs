//! Inbound HTTP request instrumentation.
//!
//! # Responsibilities
//! - Extract a remote parent context from request headers
//! - Open one server span per request and close it when the response is
//!   ready
//! - Expose the span's context to handlers through request extensions
//!
//! # Design Decisions
//! - Plain tower `Layer`/`Service` pair so any router can mount it
//! - 5xx responses and service errors tag the span with `error=true`

use std::fmt::Display;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_util::future::BoxFuture;
use http::{Request, Response};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer as _};
use opentelemetry::{Context, KeyValue};
use tower::{Layer, Service};

use crate::propagation::{self, Extraction, HeaderExtractor};
use crate::registry::TracerRegistry;

const COMPONENT_TAG: &str = "component";
const ERROR_TAG: &str = "error";
const HTTP_METHOD_TAG: &str = "http.method";
const HTTP_URL_TAG: &str = "http.url";
const HTTP_STATUS_TAG: &str = "http.status_code";

/// Layer wrapping inbound requests of one named service.
#[derive(Clone)]
pub struct HttpTraceLayer {
    registry: Arc<TracerRegistry>,
    service: String,
}

impl HttpTraceLayer {
    /// Create a layer bound to `service`'s tracer in `registry`.
    pub fn new(registry: Arc<TracerRegistry>, service: impl Into<String>) -> Self {
        Self {
            registry,
            service: service.into(),
        }
    }
}

impl<S> Layer<S> for HttpTraceLayer {
    type Service = HttpTrace<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpTrace {
            inner,
            registry: Arc::clone(&self.registry),
            service: self.service.clone(),
        }
    }
}

/// Middleware service produced by [`HttpTraceLayer`].
#[derive(Clone)]
pub struct HttpTrace<S> {
    inner: S,
    registry: Arc<TracerRegistry>,
    service: String,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for HttpTrace<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Display,
    ReqB: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqB>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let tracer = self.registry.get(&self.service);
        let service = self.service.clone();

        Box::pin(async move {
            let Some(tracer) = tracer else {
                return inner.call(req).await;
            };

            let parent = match propagation::extract(&HeaderExtractor(req.headers())) {
                Extraction::Found(cx) => cx,
                Extraction::Missing => Context::new(),
                Extraction::Malformed => {
                    tracing::error!(
                        uri = %req.uri(),
                        "span context extraction failed, skipping trace"
                    );
                    return inner.call(req).await;
                }
            };

            let span = tracer
                .span_builder(format!("HTTP {} {}", req.method(), req.uri().path()))
                .with_kind(SpanKind::Server)
                .with_attributes([
                    KeyValue::new(COMPONENT_TAG, format!("{service} HTTP")),
                    KeyValue::new(HTTP_METHOD_TAG, req.method().to_string()),
                    KeyValue::new(HTTP_URL_TAG, req.uri().to_string()),
                ])
                .start_with_context(&tracer, &parent);
            let cx = parent.with_span(span);
            req.extensions_mut().insert(cx.clone());

            let result = inner.call(req).await;
            {
                let span = cx.span();
                match &result {
                    Ok(response) => {
                        if response.status().is_server_error() {
                            span.set_attribute(KeyValue::new(ERROR_TAG, true));
                        }
                        span.set_attribute(KeyValue::new(
                            HTTP_STATUS_TAG,
                            i64::from(response.status().as_u16()),
                        ));
                    }
                    Err(err) => {
                        span.set_attribute(KeyValue::new(ERROR_TAG, true));
                        tracing::debug!(error = %err, "traced request failed in inner service");
                    }
                }
                span.end();
            }
            result
        })
    }
}
