//! Streaming call lifecycle.
//!
//! # Responsibilities
//! - Finish a streaming call's span exactly once, no matter which terminal
//!   event wins: observed end-of-stream, observed error, ambient
//!   cancellation, or wrapper release without any terminal signal
//! - Watch the ambient call context so abandoned streams still close
//!
//! # Design Decisions
//! - Single-fire guard: the span lives in a `Mutex<Option<_>>` and the
//!   first taker ends it; later triggers take `None` and do nothing
//! - The cancellation watcher blocks only on the completion signal and the
//!   call token, so it exits as soon as either fires
//! - Dropping the primary wrapper finishes the span; a caller that infers
//!   completion and never observes end-of-stream still closes it when the
//!   wrapper goes away

use std::fmt::Display;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context as TaskContext, Poll};

use futures_util::{Sink, Stream};
use opentelemetry::trace::{Span as _, SpanKind, TraceContextExt, Tracer as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::Span as SdkSpan;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::propagation::{self, Extraction, MetadataExtractor, MetadataInjector};
use crate::rpc::{RpcTracer, StreamDescriptor, COMPONENT_TAG, ERROR_EVENT, ERROR_TAG, MESSAGE_KEY};

/// Exactly-once completion guard for one in-flight streaming call.
pub struct StreamLifecycle {
    span: Mutex<Option<SdkSpan>>,
    done: CancellationToken,
}

impl StreamLifecycle {
    pub(crate) fn new(span: SdkSpan) -> Arc<Self> {
        Arc::new(Self {
            span: Mutex::new(Some(span)),
            done: CancellationToken::new(),
        })
    }

    /// Lifecycle for a call made while tracing is inactive; already
    /// completed, every trigger is a no-op.
    pub(crate) fn inactive() -> Arc<Self> {
        let done = CancellationToken::new();
        done.cancel();
        Arc::new(Self {
            span: Mutex::new(None),
            done,
        })
    }

    /// Finish the span without an error. No-op after the first transition.
    pub fn finish_ok(&self) {
        self.complete(None);
    }

    /// Finish the span tagged with `error=true` and `message`.
    pub fn finish_err(&self, message: impl Into<String>) {
        self.complete(Some(message.into()));
    }

    /// Observe the outcome of a header read; an error is a terminal event.
    pub fn observe_headers<T, E: Display>(&self, result: &Result<T, E>) {
        if let Err(err) = result {
            self.finish_err(err.to_string());
        }
    }

    /// Whether the span has already been finished.
    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolve once the span has been finished, by any trigger.
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    /// Race the stream's lifetime against the ambient call token.
    ///
    /// If `call` fires while the stream is still open the span finishes as
    /// an error; either way the task exits as soon as any transition
    /// occurs, so it never outlives the stream.
    pub fn watch(self: &Arc<Self>, call: CancellationToken) -> tokio::task::JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = lifecycle.done.cancelled() => {}
                _ = call.cancelled() => {
                    lifecycle.complete(Some("call canceled".to_string()));
                }
            }
        })
    }

    fn complete(&self, error: Option<String>) {
        let span = self
            .span
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut span) = span {
            if let Some(message) = error {
                span.set_attribute(KeyValue::new(ERROR_TAG, true));
                span.add_event(ERROR_EVENT, vec![KeyValue::new(MESSAGE_KEY, message)]);
            }
            span.end();
        }
        self.done.cancel();
    }
}

/// A stream (or sink) half of an in-flight call, bound to its lifecycle.
///
/// Receive and send operations report terminal events to the shared
/// [`StreamLifecycle`]; the wrapper created by the interceptor also
/// finishes the span when it is dropped without ever seeing one.
pub struct TracedStream<S> {
    inner: S,
    lifecycle: Arc<StreamLifecycle>,
    desc: StreamDescriptor,
    primary: bool,
}

impl<S> TracedStream<S> {
    pub(crate) fn primary(inner: S, lifecycle: Arc<StreamLifecycle>, desc: StreamDescriptor) -> Self {
        Self {
            inner,
            lifecycle,
            desc,
            primary: true,
        }
    }

    pub(crate) fn untracked(inner: S, desc: StreamDescriptor) -> Self {
        Self {
            inner,
            lifecycle: StreamLifecycle::inactive(),
            desc,
            primary: false,
        }
    }

    /// Wrap the other half of a call (typically the send side) so it
    /// reports to an existing lifecycle. Dropping a wrapper made this way
    /// is not a terminal event.
    pub fn attach(inner: S, lifecycle: Arc<StreamLifecycle>, desc: StreamDescriptor) -> Self {
        Self {
            inner,
            lifecycle,
            desc,
            primary: false,
        }
    }

    /// The completion guard shared by every half of this call.
    pub fn lifecycle(&self) -> &Arc<StreamLifecycle> {
        &self.lifecycle
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S> Drop for TracedStream<S> {
    fn drop(&mut self) {
        // Last-resort cleanup for callers that infer completion and stop
        // receiving: releasing the wrapper finishes the span untagged.
        if self.primary {
            self.lifecycle.finish_ok();
        }
    }
}

impl<S, M, E> Stream for TracedStream<S>
where
    S: Stream<Item = Result<M, E>> + Unpin,
    E: Display,
{
    type Item = Result<M, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(message))) => {
                // A single-response shape is complete after its first
                // message even though the transport never yields its end.
                if !this.desc.server_streaming {
                    this.lifecycle.finish_ok();
                }
                Poll::Ready(Some(Ok(message)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.lifecycle.finish_err(err.to_string());
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.lifecycle.finish_ok();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S, M> Sink<M> for TracedStream<S>
where
    S: Sink<M> + Unpin,
    S::Error: Display,
{
    type Error = S::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Err(err)) => {
                this.lifecycle.finish_err(err.to_string());
                Poll::Ready(Err(err))
            }
            other => other,
        }
    }

    fn start_send(self: Pin<&mut Self>, item: M) -> Result<(), Self::Error> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).start_send(item) {
            Err(err) => {
                this.lifecycle.finish_err(err.to_string());
                Err(err)
            }
            ok => ok,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(Err(err)) => {
                this.lifecycle.finish_err(err.to_string());
                Poll::Ready(Err(err))
            }
            other => other,
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_close(cx) {
            Poll::Ready(Err(err)) => {
                // A failed close-send is terminal; a clean one is not, the
                // server may still be replying.
                this.lifecycle.finish_err(err.to_string());
                Poll::Ready(Err(err))
            }
            other => other,
        }
    }
}

impl RpcTracer {
    /// Initiate a streaming client call.
    ///
    /// The span is started and injected before the call; if initiation
    /// fails it is tagged and finished immediately. On success the response
    /// stream comes back wrapped in [`TracedStream`] and a watcher races
    /// the stream's lifetime against `cancel`.
    pub async fn streaming_client<Req, S, F, Fut>(
        &self,
        cx: &Context,
        method: &str,
        desc: StreamDescriptor,
        mut request: Request<Req>,
        cancel: CancellationToken,
        call: F,
    ) -> Result<Response<TracedStream<S>>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: std::future::Future<Output = Result<Response<S>, Status>>,
    {
        let Some(tracer) = self.registry().get(self.service()) else {
            let response = call(request).await?;
            let (metadata, inner, extensions) = response.into_parts();
            return Ok(Response::from_parts(
                metadata,
                TracedStream::untracked(inner, desc),
                extensions,
            ));
        };

        let mut span = tracer
            .span_builder(method.to_string())
            .with_kind(SpanKind::Client)
            .with_attributes([KeyValue::new(COMPONENT_TAG, "gRPC")])
            .start_with_context(&tracer, cx);
        let inject_cx = cx.with_remote_span_context(span.span_context().clone());
        propagation::inject(&inject_cx, &mut MetadataInjector(request.metadata_mut()));

        match call(request).await {
            Ok(response) => {
                let lifecycle = StreamLifecycle::new(span);
                let _ = lifecycle.watch(cancel);
                let (metadata, inner, extensions) = response.into_parts();
                Ok(Response::from_parts(
                    metadata,
                    TracedStream::primary(inner, lifecycle, desc),
                    extensions,
                ))
            }
            Err(status) => {
                span.set_attribute(KeyValue::new(ERROR_TAG, true));
                span.add_event(
                    ERROR_EVENT,
                    vec![KeyValue::new(MESSAGE_KEY, status.message().to_string())],
                );
                span.end();
                Err(status)
            }
        }
    }

    /// Run a streaming server handler under a span.
    ///
    /// The handler's return is the call's completion, so the span finishes
    /// synchronously afterwards; there is no asynchronous lifecycle here.
    pub async fn streaming_server<Req, Resp, F, Fut>(
        &self,
        method: &str,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<Resp>, Status>
    where
        F: FnOnce(Context, Request<Req>) -> Fut,
        Fut: std::future::Future<Output = Result<Response<Resp>, Status>>,
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

        let result = handler(cx.clone(), request).await;
        if let Err(status) = &result {
            let span = cx.span();
            span.set_attribute(KeyValue::new(ERROR_TAG, true));
            span.add_event(
                ERROR_EVENT,
                vec![KeyValue::new(MESSAGE_KEY, status.message().to_string())],
            );
        }
        cx.span().end();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use futures_util::{stream, SinkExt, StreamExt};
    use opentelemetry::trace::{Tracer as _, TracerProvider as _};
    use opentelemetry::Value;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracer, SdkTracerProvider, SpanData};
    use tokio_util::sync::PollSender;

    use super::*;

    fn test_tracer() -> (SdkTracer, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (provider.tracer("test"), exporter)
    }

    fn stream_lifecycle(tracer: &SdkTracer) -> Arc<StreamLifecycle> {
        let span = tracer
            .span_builder("stream")
            .start_with_context(tracer, &Context::new());
        StreamLifecycle::new(span)
    }

    fn has_error_tag(span: &SpanData) -> bool {
        span.attributes
            .iter()
            .any(|kv| kv.key.as_str() == ERROR_TAG && kv.value == Value::Bool(true))
    }

    fn bidi() -> StreamDescriptor {
        StreamDescriptor::bidi()
    }

    #[tokio::test]
    async fn test_end_of_stream_finishes_exactly_once() {
        let (tracer, exporter) = test_tracer();
        let lifecycle = stream_lifecycle(&tracer);
        let inner = stream::iter(vec![Ok::<_, Status>(1u32)]);
        let mut traced = TracedStream::primary(inner, lifecycle.clone(), bidi());

        assert!(matches!(traced.next().await, Some(Ok(1))));
        assert!(traced.next().await.is_none());
        assert!(lifecycle.is_finished());

        // Later triggers must not double-finish.
        lifecycle.finish_err("too late");
        drop(traced);

        let spans = exporter.get_finished_spans().expect("exported spans");
        assert_eq!(spans.len(), 1);
        assert!(!has_error_tag(&spans[0]));
    }

    #[tokio::test]
    async fn test_receive_error_finishes_with_error() {
        let (tracer, exporter) = test_tracer();
        let lifecycle = stream_lifecycle(&tracer);
        let inner = stream::iter(vec![Err::<u32, _>(Status::internal("stream broke"))]);
        let mut traced = TracedStream::primary(inner, lifecycle, bidi());

        assert!(matches!(traced.next().await, Some(Err(_))));
        drop(traced);

        let spans = exporter.get_finished_spans().expect("exported spans");
        assert_eq!(spans.len(), 1);
        assert!(has_error_tag(&spans[0]));
        assert!(spans[0]
            .events
            .iter()
            .any(|event| event.name == ERROR_EVENT));
    }

    #[tokio::test]
    async fn test_single_response_shape_finishes_on_first_message() {
        let (tracer, exporter) = test_tracer();
        let lifecycle = stream_lifecycle(&tracer);
        let desc = StreamDescriptor {
            client_streaming: true,
            server_streaming: false,
        };
        let inner = stream::iter(vec![Ok::<_, Status>(1u32), Ok(2)]);
        let mut traced = TracedStream::primary(inner, lifecycle.clone(), desc);

        assert!(matches!(traced.next().await, Some(Ok(1))));
        assert!(lifecycle.is_finished());
        assert_eq!(exporter.get_finished_spans().expect("spans").len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_finishes_open_stream() {
        let (tracer, exporter) = test_tracer();
        let lifecycle = stream_lifecycle(&tracer);
        let inner = stream::pending::<Result<u32, Status>>();
        let traced = TracedStream::primary(inner, lifecycle.clone(), bidi());

        let call = CancellationToken::new();
        let _ = lifecycle.watch(call.clone());
        call.cancel();
        lifecycle.finished().await;

        drop(traced);
        let spans = exporter.get_finished_spans().expect("exported spans");
        assert_eq!(spans.len(), 1);
        assert!(has_error_tag(&spans[0]));
    }

    #[tokio::test]
    async fn test_drop_without_use_finishes_untagged() {
        let (tracer, exporter) = test_tracer();
        let lifecycle = stream_lifecycle(&tracer);
        let inner = stream::pending::<Result<u32, Status>>();
        let traced = TracedStream::primary(inner, lifecycle, bidi());
        drop(traced);

        let spans = exporter.get_finished_spans().expect("exported spans");
        assert_eq!(spans.len(), 1);
        assert!(!has_error_tag(&spans[0]));
    }

    #[tokio::test]
    async fn test_sends_without_receive_then_cancel() {
        let (tracer, exporter) = test_tracer();
        let lifecycle = stream_lifecycle(&tracer);

        let (tx, mut rx) = tokio::sync::mpsc::channel::<u32>(8);
        let mut sender = TracedStream::attach(PollSender::new(tx), lifecycle.clone(), bidi());
        for n in 0..5 {
            sender.send(n).await.expect("send should succeed");
        }

        let call = CancellationToken::new();
        let watcher = lifecycle.watch(call.clone());
        call.cancel();
        lifecycle.finished().await;
        watcher.await.expect("watcher should exit");

        // The sender half is secondary; dropping it is not a trigger, and
        // the cancellation already finished the span exactly once.
        drop(sender);
        rx.close();

        let spans = exporter.get_finished_spans().expect("exported spans");
        assert_eq!(spans.len(), 1);
        assert!(has_error_tag(&spans[0]));
    }

    struct FailingCloseSink;

    impl Sink<u32> for FailingCloseSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, _: u32) -> Result<(), io::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed early")))
        }
    }

    #[tokio::test]
    async fn test_close_send_error_is_terminal() {
        let (tracer, exporter) = test_tracer();
        let lifecycle = stream_lifecycle(&tracer);
        let mut traced = TracedStream::attach(FailingCloseSink, lifecycle.clone(), bidi());

        assert!(traced.close().await.is_err());
        assert!(lifecycle.is_finished());

        let spans = exporter.get_finished_spans().expect("exported spans");
        assert_eq!(spans.len(), 1);
        assert!(has_error_tag(&spans[0]));
    }

    #[tokio::test]
    async fn test_header_read_error_is_terminal() {
        let (tracer, exporter) = test_tracer();
        let lifecycle = stream_lifecycle(&tracer);
        lifecycle.observe_headers::<(), _>(&Err(Status::internal("no headers")));
        assert!(lifecycle.is_finished());

        let spans = exporter.get_finished_spans().expect("exported spans");
        assert_eq!(spans.len(), 1);
        assert!(has_error_tag(&spans[0]));
    }

    #[tokio::test]
    async fn test_watcher_exits_once_stream_completes() {
        let (tracer, _exporter) = test_tracer();
        let lifecycle = stream_lifecycle(&tracer);
        let call = CancellationToken::new();
        let watcher = lifecycle.watch(call.clone());

        lifecycle.finish_ok();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watcher should exit without cancellation")
            .expect("watcher task should not panic");
        assert!(!call.is_cancelled());
    }

    #[tokio::test]
    async fn test_streaming_client_bypasses_when_inactive() {
        let registry = Arc::new(crate::registry::TracerRegistry::with_builder(|_| {
            unreachable!("no tracer should be built")
        }));
        let rpc = RpcTracer::new(registry, "svc");

        let response = rpc
            .streaming_client(
                &Context::new(),
                "/echo.Echo/BidiEcho",
                bidi(),
                Request::new(()),
                CancellationToken::new(),
                |_req| async {
                    Ok(Response::new(stream::iter(vec![Ok::<_, Status>(7u32)])))
                },
            )
            .await
            .expect("call should succeed");

        let mut stream = response.into_inner();
        assert!(matches!(stream.next().await, Some(Ok(7))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_streaming_client_failed_initiation_finishes_span() {
        let (tracer, exporter) = test_tracer();
        let provider_tracer = tracer.clone();
        let registry = Arc::new(crate::registry::TracerRegistry::with_builder(move |_| {
            Ok(crate::registry::TracerBackend {
                tracer: provider_tracer.clone(),
                provider: SdkTracerProvider::builder().build(),
            })
        }));
        registry.enable("svc").expect("enable should succeed");
        let rpc = RpcTracer::new(registry, "svc");

        let result: Result<Response<TracedStream<stream::Pending<Result<u32, Status>>>>, Status> =
            rpc.streaming_client(
                &Context::new(),
                "/echo.Echo/BidiEcho",
                bidi(),
                Request::new(()),
                CancellationToken::new(),
                |_req| async { Err(Status::unavailable("connection refused")) },
            )
            .await;

        assert!(result.is_err());
        let spans = exporter.get_finished_spans().expect("exported spans");
        assert_eq!(spans.len(), 1);
        assert!(has_error_tag(&spans[0]));
    }

    #[tokio::test]
    async fn test_streaming_client_injects_and_wraps() {
        let (tracer, exporter) = test_tracer();
        let provider_tracer = tracer.clone();
        let registry = Arc::new(crate::registry::TracerRegistry::with_builder(move |_| {
            Ok(crate::registry::TracerBackend {
                tracer: provider_tracer.clone(),
                provider: SdkTracerProvider::builder().build(),
            })
        }));
        registry.enable("svc").expect("enable should succeed");
        let rpc = RpcTracer::new(registry, "svc");

        let response = rpc
            .streaming_client(
                &Context::new(),
                "/echo.Echo/ServerEcho",
                StreamDescriptor {
                    client_streaming: false,
                    server_streaming: true,
                },
                Request::new(()),
                CancellationToken::new(),
                |req| async move {
                    assert!(
                        req.metadata().get("traceparent").is_some(),
                        "context must be injected before the call"
                    );
                    Ok(Response::new(stream::iter(vec![
                        Ok::<_, Status>(1u32),
                        Ok(2),
                    ])))
                },
            )
            .await
            .expect("call should succeed");

        let mut stream = response.into_inner();
        while let Some(message) = stream.next().await {
            message.expect("messages should be ok");
        }
        drop(stream);

        let spans = exporter.get_finished_spans().expect("exported spans");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "/echo.Echo/ServerEcho");
        assert!(!has_error_tag(&spans[0]));
    }
}
