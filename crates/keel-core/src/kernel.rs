//! Composition root.
//!
//! Boot builds everything in a fixed order: configuration, sandbox and
//! mounts, permission store, supervisor, gateway. It then starts the
//! services and attaches the front-end. Shutdown undoes it front to back.

use crate::collaborators::{ClusterOrchestrator, ContainerRuntime, FrontEnd, NetworkControl};
use crate::config::KernelConfig;
use crate::error::{CoreError, Result};
use crate::gateway::SyscallGateway;
use crate::rbac::PermissionStore;
use crate::service::{Service, ServiceDescriptor};
use crate::status::{StatusBoard, SupervisorPhase};
use crate::supervisor::{ServiceSupervisor, ShutdownReport};
use keel_sandbox::Sandbox;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Collects services and collaborators, then boots a [`Kernel`].
pub struct KernelBuilder {
    config: KernelConfig,
    services: Vec<ServiceDescriptor>,
    front_end: Option<Arc<dyn FrontEnd>>,
    network: Option<Arc<dyn NetworkControl>>,
    containers: Option<Arc<dyn ContainerRuntime>>,
    cluster: Option<Arc<dyn ClusterOrchestrator>>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            services: Vec::new(),
            front_end: None,
            network: None,
            containers: None,
            cluster: None,
        }
    }

    /// Add a service; dependencies and stop timeout come from the
    /// matching `[[services]]` entry, if any.
    pub fn service(mut self, name: impl Into<String>, service: Arc<dyn Service>) -> Self {
        let name = name.into();
        let dependencies = self
            .config
            .service(&name)
            .map(|s| s.dependencies.clone())
            .unwrap_or_default();
        let descriptor = ServiceDescriptor::new(name.clone(), service)
            .depends_on(dependencies)
            .stop_timeout(self.config.stop_timeout(&name));
        self.services.push(descriptor);
        self
    }

    /// Add a fully specified service, ignoring the config entry.
    pub fn descriptor(mut self, descriptor: ServiceDescriptor) -> Self {
        self.services.push(descriptor);
        self
    }

    pub fn front_end(mut self, front_end: Arc<dyn FrontEnd>) -> Self {
        self.front_end = Some(front_end);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkControl>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn containers(mut self, containers: Arc<dyn ContainerRuntime>) -> Self {
        self.containers = Some(containers);
        self
    }

    pub fn cluster(mut self, cluster: Arc<dyn ClusterOrchestrator>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Build and boot the kernel.
    ///
    /// # Errors
    /// - `Configuration` for an invalid config, a service declared in the
    ///   config but never provided, or an unusable sandbox root
    /// - `DependencyCycle`, `StartupFailure` from the supervisor
    /// - `Collaborator` if the front-end refuses to attach; services are
    ///   shut down again first
    pub async fn boot(self) -> Result<Kernel> {
        let Self {
            config,
            services,
            front_end,
            network,
            containers,
            cluster,
        } = self;
        let boot_id = Uuid::new_v4();

        config
            .validate()
            .map_err(|e| CoreError::Configuration(e.to_string()))?;
        for declared in &config.services {
            if !services.iter().any(|s| s.name == declared.name) {
                return Err(CoreError::Configuration(format!(
                    "service '{}' is declared but not provided",
                    declared.name
                )));
            }
        }

        let sandbox = Sandbox::open(&config.sandbox_root)?.with_toolchain(config.toolchain.clone());
        for mount in &config.mounts {
            sandbox.make_dir(mount)?;
        }
        let sandbox = Arc::new(sandbox);
        let root = sandbox.root().to_path_buf();

        let permissions = Arc::new(PermissionStore::from_config(&config.rbac)?);

        let mut supervisor = ServiceSupervisor::new(Arc::clone(&sandbox)).with_boot_id(boot_id);
        for descriptor in services {
            supervisor.register(descriptor)?;
        }
        let board = supervisor.status_board();

        let mut gateway = SyscallGateway::new(Arc::clone(&sandbox), permissions);
        if let Some(network) = network {
            gateway = gateway.with_network(network);
        }
        if let Some(containers) = containers {
            gateway = gateway.with_containers(containers);
        }
        if let Some(cluster) = cluster {
            gateway = gateway.with_cluster(cluster);
        }
        let gateway = Arc::new(gateway);

        info!(boot_id = %boot_id, root = %root.display(), "kernel booting");
        if let Err(e) = supervisor.boot().await {
            gateway.go_offline();
            return Err(e);
        }

        if let Some(front_end) = &front_end {
            if let Err(e) = front_end.attach(Arc::clone(&gateway)) {
                warn!(error = %e, "front-end failed to attach, shutting down");
                gateway.go_offline();
                supervisor.shutdown().await;
                return Err(CoreError::Collaborator {
                    collaborator: "front-end",
                    message: e.to_string(),
                });
            }
        }

        info!(boot_id = %boot_id, "kernel running");
        Ok(Kernel {
            boot_id,
            root,
            supervisor: Mutex::new(supervisor),
            board,
            gateway,
            front_end,
            sandbox: std::sync::Mutex::new(Some(sandbox)),
        })
    }
}

/// A booted kernel.
pub struct Kernel {
    boot_id: Uuid,
    root: PathBuf,
    supervisor: Mutex<ServiceSupervisor>,
    board: StatusBoard,
    gateway: Arc<SyscallGateway>,
    front_end: Option<Arc<dyn FrontEnd>>,
    sandbox: std::sync::Mutex<Option<Arc<Sandbox>>>,
}

impl Kernel {
    pub fn builder(config: KernelConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    /// Boot a kernel with no services and no front-end.
    pub async fn boot(config: KernelConfig) -> Result<Self> {
        KernelBuilder::new(config).boot().await
    }

    /// Detach the front-end, take the gateway offline, stop every service
    /// and release the sandbox. Safe to call more than once.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.phase() != SupervisorPhase::Stopped {
            info!(boot_id = %self.boot_id, "kernel shutting down");
            if let Some(front_end) = &self.front_end {
                front_end.detach();
            }
        }

        self.gateway.go_offline();
        let report = supervisor.shutdown().await;

        let released = self
            .sandbox
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().take());
        if released.is_some() {
            info!(boot_id = %self.boot_id, "kernel stopped");
        }
        report
    }

    /// The agent-facing gateway.
    pub fn gateway(&self) -> Arc<SyscallGateway> {
        Arc::clone(&self.gateway)
    }

    /// Read handle onto service and supervisor state.
    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.board.phase()
    }

    pub fn boot_id(&self) -> Uuid {
        self.boot_id
    }

    /// Canonical sandbox root.
    pub fn sandbox_root(&self) -> &Path {
        &self.root
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("boot_id", &self.boot_id)
            .field("root", &self.root)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
