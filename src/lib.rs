//! Distributed tracing instrumentation for named services.
//!
//! A [`registry::TracerRegistry`] maps service names to backend tracers
//! that can be enabled and disabled at runtime. The call wrappers (RPC
//! interceptors, HTTP middleware, store command instrumentation) look the
//! tracer up per call, propagate span context across process boundaries,
//! and open/close spans to match true call lifetime. A name whose tracer
//! is inactive costs one map lookup; every wrapper degrades to a plain
//! passthrough.

pub mod config;
pub mod error;
pub mod http;
pub mod propagation;
pub mod registry;
pub mod rpc;
pub mod store;

pub use error::ConfigError;
pub use http::HttpTraceLayer;
pub use registry::{disable, enable, get, global, TracerRegistry};
pub use rpc::{RpcTracer, StreamDescriptor, StreamLifecycle, TracedStream};
