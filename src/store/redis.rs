//! Cache-store command instrumentation.
//!
//! # Responsibilities
//! - Span per issued command, named by the command verb
//! - One parent span plus one child per queued command for pipelines
//!
//! # Design Decisions
//! - Implements the client's own connection seam so every command issued
//!   through the wrapped connection is covered, transparently
//! - Parent context is the ambient one at command time

use std::sync::Arc;

use opentelemetry::trace::{Span as _, TraceContextExt, Tracer as _};
use opentelemetry::{Context, KeyValue};
use redis::aio::ConnectionLike;
use redis::{Arg, Cmd, Pipeline, RedisFuture, Value};

use crate::registry::TracerRegistry;
use crate::store::{DB_STATEMENT_TAG, DB_TYPE_TAG, ERROR_EVENT, ERROR_TAG, MESSAGE_KEY};

const STORE_TYPE: &str = "redis";
const PIPELINE_SPAN: &str = "PIPELINE";

/// A connection wrapper tracing every command it carries.
///
/// Wrap any async connection and use it wherever the plain connection
/// would go; commands issued while the service's tracer is inactive pass
/// straight through.
pub struct TracedConnection<C> {
    inner: C,
    registry: Arc<TracerRegistry>,
    service: String,
}

impl<C> TracedConnection<C> {
    /// Wrap `inner`, binding it to `service`'s tracer in `registry`.
    pub fn new(inner: C, registry: Arc<TracerRegistry>, service: impl Into<String>) -> Self {
        Self {
            inner,
            registry,
            service: service.into(),
        }
    }

    /// Unwrap back to the underlying connection.
    pub fn into_inner(self) -> C {
        self.inner
    }
}

fn command_name(cmd: &Cmd) -> String {
    cmd.args_iter()
        .next()
        .map(|arg| match arg {
            Arg::Simple(bytes) => String::from_utf8_lossy(bytes).to_uppercase(),
            Arg::Cursor => "SCAN".to_string(),
        })
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn command_statement(cmd: &Cmd) -> String {
    let mut statement = String::new();
    for arg in cmd.args_iter() {
        if !statement.is_empty() {
            statement.push(' ');
        }
        match arg {
            Arg::Simple(bytes) => statement.push_str(&String::from_utf8_lossy(bytes)),
            Arg::Cursor => statement.push('0'),
        }
    }
    statement
}

impl<C> ConnectionLike for TracedConnection<C>
where
    C: ConnectionLike + Send,
{
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        Box::pin(async move {
            let Some(tracer) = self.registry.get(&self.service) else {
                return self.inner.req_packed_command(cmd).await;
            };

            let parent = Context::current();
            let mut span = tracer
                .span_builder(command_name(cmd))
                .with_attributes([
                    KeyValue::new(DB_TYPE_TAG, STORE_TYPE),
                    KeyValue::new(DB_STATEMENT_TAG, command_statement(cmd)),
                ])
                .start_with_context(&tracer, &parent);

            let result = self.inner.req_packed_command(cmd).await;
            if let Err(err) = &result {
                span.set_attribute(KeyValue::new(ERROR_TAG, true));
                span.add_event(
                    ERROR_EVENT,
                    vec![KeyValue::new(MESSAGE_KEY, err.to_string())],
                );
            }
            span.end();
            result
        })
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        pipeline: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let Some(tracer) = self.registry.get(&self.service) else {
                return self.inner.req_packed_commands(pipeline, offset, count).await;
            };

            let parent = Context::current();
            let batch = tracer
                .span_builder(PIPELINE_SPAN)
                .with_attributes([KeyValue::new(DB_TYPE_TAG, STORE_TYPE)])
                .start_with_context(&tracer, &parent);
            let batch_cx = parent.with_span(batch);

            // Children in enqueue order; the batch executes as one unit so
            // they share its duration.
            let mut children: Vec<_> = pipeline
                .cmd_iter()
                .map(|cmd| {
                    tracer
                        .span_builder(command_name(cmd))
                        .with_attributes([
                            KeyValue::new(DB_TYPE_TAG, STORE_TYPE),
                            KeyValue::new(DB_STATEMENT_TAG, command_statement(cmd)),
                        ])
                        .start_with_context(&tracer, &batch_cx)
                })
                .collect();

            let result = self.inner.req_packed_commands(pipeline, offset, count).await;
            if let Err(err) = &result {
                for child in &mut children {
                    child.set_attribute(KeyValue::new(ERROR_TAG, true));
                }
                let batch = batch_cx.span();
                batch.set_attribute(KeyValue::new(ERROR_TAG, true));
                batch.add_event(
                    ERROR_EVENT,
                    vec![KeyValue::new(MESSAGE_KEY, err.to_string())],
                );
            }
            for mut child in children {
                child.end();
            }
            batch_cx.span().end();
            result
        })
    }

    fn get_db(&self) -> i64 {
        self.inner.get_db()
    }
}
