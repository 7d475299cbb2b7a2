//! Named tracer registry.
//!
//! # Responsibilities
//! - Map service names to backend tracer instances
//! - Enable, disable, and look up tracers from concurrent call paths
//! - Release backend resources at process exit
//!
//! # Design Decisions
//! - Lookups vastly outnumber updates; every update inserts a freshly built
//!   handle so readers never observe a partially constructed one
//! - `get` returning `None` means "tracing inactive", never an error
//! - Disabling keeps the backend alive; re-enabling never rebuilds it

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};

use crate::config::BackendConfig;
use crate::error::ConfigError;

/// A constructed backend tracer together with the provider that owns its
/// exporter resources.
pub struct TracerBackend {
    pub(crate) tracer: SdkTracer,
    pub(crate) provider: SdkTracerProvider,
}

impl TracerBackend {
    /// Pair a tracer with the provider that owns its resources. Custom
    /// builders hand one of these back per service name.
    pub fn new(tracer: SdkTracer, provider: SdkTracerProvider) -> Self {
        Self { tracer, provider }
    }
}

/// One registered service: its backend plus the active flag.
struct TracerHandle {
    tracer: SdkTracer,
    provider: SdkTracerProvider,
    enabled: bool,
}

type BackendBuilder = Arc<dyn Fn(&str) -> Result<TracerBackend, ConfigError> + Send + Sync>;

/// Process-wide mapping from service name to tracer state.
///
/// Intended to be constructed once at startup and shared by reference; a
/// default instance is available through [`global`] for call sites that
/// have nothing to thread it through.
pub struct TracerRegistry {
    handles: DashMap<String, Arc<TracerHandle>>,
    build: BackendBuilder,
}

impl TracerRegistry {
    /// Create a registry whose backends are built from the environment.
    pub fn new() -> Self {
        Self::with_builder(|name| BackendConfig::from_env(name)?.build())
    }

    /// Create a registry with a custom backend builder.
    pub fn with_builder<F>(build: F) -> Self
    where
        F: Fn(&str) -> Result<TracerBackend, ConfigError> + Send + Sync + 'static,
    {
        Self {
            handles: DashMap::new(),
            build: Arc::new(build),
        }
    }

    /// Activate tracing for `name`.
    ///
    /// If a handle already exists this only flips it active; the backend is
    /// constructed exactly once per name. On a build failure nothing is
    /// stored and the service stays untraced.
    pub fn enable(&self, name: &str) -> Result<(), ConfigError> {
        let existing = self.handles.get(name).map(|entry| Arc::clone(entry.value()));
        if let Some(handle) = existing {
            if !handle.enabled {
                self.handles.insert(
                    name.to_string(),
                    Arc::new(TracerHandle {
                        tracer: handle.tracer.clone(),
                        provider: handle.provider.clone(),
                        enabled: true,
                    }),
                );
            }
            return Ok(());
        }

        let backend = (self.build)(name)?;
        let handle = Arc::new(TracerHandle {
            tracer: backend.tracer,
            provider: backend.provider,
            enabled: true,
        });
        // Two first-enables can race the build; keep the winner's handle.
        self.handles.entry(name.to_string()).or_insert(handle);
        Ok(())
    }

    /// Deactivate tracing for `name` without releasing the backend.
    ///
    /// No-op for unknown names. The provider and its exporter connections
    /// stay alive until [`shutdown`](Self::shutdown).
    pub fn disable(&self, name: &str) {
        let existing = self.handles.get(name).map(|entry| Arc::clone(entry.value()));
        if let Some(handle) = existing {
            if handle.enabled {
                self.handles.insert(
                    name.to_string(),
                    Arc::new(TracerHandle {
                        tracer: handle.tracer.clone(),
                        provider: handle.provider.clone(),
                        enabled: false,
                    }),
                );
            }
        }
    }

    /// Look up the active tracer for `name`.
    ///
    /// Returns `None` when the name was never enabled or is currently
    /// disabled. Call sites must treat `None` as "bypass tracing for this
    /// call".
    pub fn get(&self, name: &str) -> Option<SdkTracer> {
        self.handles
            .get(name)
            .filter(|entry| entry.value().enabled)
            .map(|entry| entry.value().tracer.clone())
    }

    /// Flush and shut down every held provider.
    ///
    /// Intended for process exit. Failures are logged, not returned.
    pub fn shutdown(&self) {
        for entry in self.handles.iter() {
            if let Err(err) = entry.value().provider.shutdown() {
                tracing::warn!(service = %entry.key(), error = %err, "tracer provider shutdown failed");
            }
        }
    }
}

impl Default for TracerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: LazyLock<TracerRegistry> = LazyLock::new(TracerRegistry::new);

/// The process-wide default registry.
pub fn global() -> &'static TracerRegistry {
    &GLOBAL
}

/// Activate tracing for `name` on the default registry.
pub fn enable(name: &str) -> Result<(), ConfigError> {
    global().enable(name)
}

/// Deactivate tracing for `name` on the default registry.
pub fn disable(name: &str) {
    global().disable(name)
}

/// Look up the active tracer for `name` on the default registry.
pub fn get(name: &str) -> Option<SdkTracer> {
    global().get(name)
}
