//! Relational-store connectivity checks.

use std::fmt::Display;
use std::future::Future;

use opentelemetry::trace::{Span as _, Tracer as _};
use opentelemetry::{Context, KeyValue};
use sqlx::{Connection, Database};

use crate::registry::TracerRegistry;
use crate::store::{DB_STATEMENT_TAG, DB_TYPE_TAG, ERROR_EVENT, ERROR_TAG, MESSAGE_KEY};

/// Run a connectivity check under a span named by the upper-cased
/// operation, tagged with the store type.
///
/// Bypasses tracing when `service`'s tracer is inactive; the check runs
/// either way and its outcome is returned unchanged.
pub async fn check<F, Fut, E>(
    registry: &TracerRegistry,
    service: &str,
    cx: &Context,
    store: &'static str,
    operation: &str,
    run: F,
) -> Result<(), E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let Some(tracer) = registry.get(service) else {
        return run().await;
    };

    let mut span = tracer
        .span_builder(operation.to_uppercase())
        .with_attributes([
            KeyValue::new(DB_TYPE_TAG, store),
            KeyValue::new(DB_STATEMENT_TAG, operation.to_string()),
        ])
        .start_with_context(&tracer, cx);

    let result = run().await;
    if let Err(err) = &result {
        span.set_attribute(KeyValue::new(ERROR_TAG, true));
        span.add_event(ERROR_EVENT, vec![KeyValue::new(MESSAGE_KEY, err.to_string())]);
    }
    span.end();
    result
}

/// Ping a live database connection under a span; the store type comes
/// from the connection's driver.
pub async fn ping<C>(
    registry: &TracerRegistry,
    service: &str,
    cx: &Context,
    conn: &mut C,
) -> Result<(), sqlx::Error>
where
    C: Connection,
{
    check(
        registry,
        service,
        cx,
        <C::Database as Database>::NAME,
        "ping",
        || conn.ping(),
    )
    .await
}
