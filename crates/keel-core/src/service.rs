//! Service trait and descriptors.

use crate::config::DEFAULT_STOP_TIMEOUT_MS;
use crate::error::ServiceError;
use async_trait::async_trait;
use keel_sandbox::Sandbox;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A kernel service driven by the supervisor.
///
/// Hooks take `&self`; services keep their own interior state. `stop` runs
/// on a separate task and is cancelled at its next await point once its
/// stop timeout elapses, so it must not block the thread.
#[async_trait]
pub trait Service: Send + Sync {
    /// Bring the service up. An error aborts boot and rolls back.
    async fn start(&self, ctx: &ServiceContext) -> Result<(), ServiceError>;

    /// Tear the service down.
    async fn stop(&self) -> Result<(), ServiceError>;

    /// Advisory notice that shutdown has begun. Not awaited.
    async fn on_shutdown_warning(&self) {}
}

/// What a service gets to see when it starts.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    name: String,
    boot_id: Uuid,
    sandbox: Arc<Sandbox>,
}

impl ServiceContext {
    pub(crate) fn new(name: impl Into<String>, boot_id: Uuid, sandbox: Arc<Sandbox>) -> Self {
        Self {
            name: name.into(),
            boot_id,
            sandbox,
        }
    }

    /// Name the service was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of the boot this start belongs to.
    pub fn boot_id(&self) -> Uuid {
        self.boot_id
    }

    /// The shared sandbox.
    ///
    /// Services that keep a clone must drop it in `stop`, or the sandbox
    /// outlives the kernel.
    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }
}

/// Registration record for one service. Immutable once registered.
#[derive(Clone)]
pub struct ServiceDescriptor {
    /// Unique service name.
    pub name: String,
    /// Services that must be started first.
    pub dependencies: Vec<String>,
    /// Budget for the stop hook before the service is forced.
    pub stop_timeout: Duration,
    /// The hooks.
    pub service: Arc<dyn Service>,
}

impl ServiceDescriptor {
    /// Descriptor with no dependencies and the default stop timeout.
    pub fn new(name: impl Into<String>, service: Arc<dyn Service>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            service,
        }
    }

    /// Set the dependencies.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Set the stop timeout.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}
