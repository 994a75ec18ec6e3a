//! Interfaces to things the kernel drives but does not implement.
//!
//! Network control, the container runtime and the cluster orchestrator are
//! reached only through the gateway; the front-end is attached by the kernel
//! once boot completes.

use crate::gateway::SyscallGateway;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Error returned by a collaborator implementation.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// Networking on/off switch.
pub trait NetworkControl: Send + Sync {
    /// True when networking is enabled.
    fn is_enabled(&self) -> Result<bool, CollaboratorError>;

    /// Enable or disable networking.
    fn set_enabled(&self, enabled: bool) -> Result<(), CollaboratorError>;
}

/// One container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub status: String,
}

/// Container runtime passthrough.
pub trait ContainerRuntime: Send + Sync {
    fn list(&self) -> Result<Vec<ContainerSummary>, CollaboratorError>;

    /// Start a container and return its id.
    fn run(
        &self,
        image: &str,
        name: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<String, CollaboratorError>;

    fn stop(&self, id: &str) -> Result<(), CollaboratorError>;
}

/// One pod as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub phase: String,
}

/// Cluster orchestrator passthrough.
pub trait ClusterOrchestrator: Send + Sync {
    fn pods(&self, namespace: &str) -> Result<Vec<PodSummary>, CollaboratorError>;

    fn scale(&self, namespace: &str, deployment: &str, replicas: u32)
        -> Result<(), CollaboratorError>;
}

/// The initial front-end process: shell, GUI sidecar or socket server.
///
/// Attached after all services are running; detached before any of them
/// stop.
pub trait FrontEnd: Send + Sync {
    /// Start serving callers through `gateway`.
    fn attach(&self, gateway: Arc<SyscallGateway>) -> Result<(), CollaboratorError>;

    /// Stop accepting new calls.
    fn detach(&self) {}
}
