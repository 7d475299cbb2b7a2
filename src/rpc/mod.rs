//! RPC call instrumentation.
//!
//! # Responsibilities
//! - Wrap unary client/server calls with spans and context propagation
//! - Wrap streaming calls so span lifetime matches true call lifetime
//!
//! # Design Decisions
//! - The underlying call's outcome is recorded, then re-raised unchanged
//! - When the service's tracer is inactive every wrapper degrades to a
//!   plain passthrough of the call

use std::sync::Arc;

use crate::registry::TracerRegistry;

mod unary;
pub mod stream;

pub use stream::{StreamLifecycle, TracedStream};

pub(crate) const COMPONENT_TAG: &str = "component";
pub(crate) const ERROR_TAG: &str = "error";
pub(crate) const ERROR_EVENT: &str = "error";
pub(crate) const MESSAGE_KEY: &str = "message";

/// Shape of a streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// The client sends a stream of messages.
    pub client_streaming: bool,
    /// The server replies with a stream of messages.
    pub server_streaming: bool,
}

impl StreamDescriptor {
    /// Descriptor for a bidirectional stream.
    pub fn bidi() -> Self {
        Self {
            client_streaming: true,
            server_streaming: true,
        }
    }
}

/// Interceptor for unary and streaming RPC calls of one named service.
#[derive(Clone)]
pub struct RpcTracer {
    registry: Arc<TracerRegistry>,
    service: String,
}

impl RpcTracer {
    /// Create an interceptor bound to `service`'s tracer in `registry`.
    pub fn new(registry: Arc<TracerRegistry>, service: impl Into<String>) -> Self {
        Self {
            registry,
            service: service.into(),
        }
    }

    pub(crate) fn service(&self) -> &str {
        &self.service
    }

    pub(crate) fn registry(&self) -> &TracerRegistry {
        &self.registry
    }
}
