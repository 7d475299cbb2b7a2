//! Unary call wrappers: one request, one response, synchronous span
//! lifetime around the call.

use std::fmt::Debug;
use std::future::Future;

use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer as _};
use opentelemetry::{Context, KeyValue};
use tonic::{Request, Response, Status};

use crate::propagation::{self, Extraction, MetadataExtractor, MetadataInjector};
use crate::rpc::{RpcTracer, COMPONENT_TAG, ERROR_EVENT, ERROR_TAG, MESSAGE_KEY};

impl RpcTracer {
    /// Perform a unary client call under a child span of `cx`.
    ///
    /// The span is finished before this returns, whatever the outcome, and
    /// the call's result is passed back unchanged.
    pub async fn unary_client<Req, Resp, F, Fut>(
        &self,
        cx: &Context,
        method: &str,
        mut request: Request<Req>,
        call: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Debug,
        Resp: Debug,
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let Some(tracer) = self.registry().get(self.service()) else {
            return call(request).await;
        };

        let span = tracer
            .span_builder(method.to_string())
            .with_kind(SpanKind::Client)
            .with_attributes([KeyValue::new(COMPONENT_TAG, "gRPC")])
            .start_with_context(&tracer, cx);
        let cx = cx.with_span(span);
        propagation::inject(&cx, &mut MetadataInjector(request.metadata_mut()));
        cx.span().add_event(
            "request",
            vec![KeyValue::new(MESSAGE_KEY, format!("{:?}", request.get_ref()))],
        );

        let result = call(request).await;
        {
            let span = cx.span();
            match &result {
                Ok(response) => span.add_event(
                    "response",
                    vec![KeyValue::new(MESSAGE_KEY, format!("{:?}", response.get_ref()))],
                ),
                Err(status) => {
                    span.set_attribute(KeyValue::new(ERROR_TAG, true));
                    span.add_event(
                        ERROR_EVENT,
                        vec![KeyValue::new(MESSAGE_KEY, status.message().to_string())],
                    );
                }
            }
            span.end();
        }
        result
    }

    /// Run a unary server handler under a span parented on the incoming
    /// metadata.
    ///
    /// An absent remote context starts a root span; an unparseable one is
    /// logged and the handler runs untraced.
    pub async fn unary_server<Req, Resp, F, Fut>(
        &self,
        method: &str,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: Debug,
        Resp: Debug,
        F: FnOnce(Context, Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let Some(tracer) = self.registry().get(self.service()) else {
            return handler(Context::current(), request).await;
        };

        let parent = match propagation::extract(&MetadataExtractor(request.metadata())) {
            Extraction::Found(cx) => cx,
            Extraction::Missing => Context::new(),
            Extraction::Malformed => {
                tracing::error!(method, "span context extraction failed, skipping trace");
                return handler(Context::current(), request).await;
            }
        };

        let span = tracer
            .span_builder(method.to_string())
            .with_kind(SpanKind::Server)
            .with_attributes([KeyValue::new(
                COMPONENT_TAG,
                format!("{} gRPC", self.service()),
            )])
            .start_with_context(&tracer, &parent);
        let cx = parent.with_span(span);
        cx.span().add_event(
            "request",
            vec![KeyValue::new(MESSAGE_KEY, format!("{:?}", request.get_ref()))],
        );

        let result = handler(cx.clone(), request).await;
        {
            let span = cx.span();
            match &result {
                Ok(response) => span.add_event(
                    "response",
                    vec![KeyValue::new(MESSAGE_KEY, format!("{:?}", response.get_ref()))],
                ),
                Err(status) => {
                    span.set_attribute(KeyValue::new(ERROR_TAG, true));
                    span.add_event(
                        ERROR_EVENT,
                        vec![KeyValue::new(MESSAGE_KEY, status.message().to_string())],
                    );
                }
            }
            span.end();
        }
        result
    }
}
