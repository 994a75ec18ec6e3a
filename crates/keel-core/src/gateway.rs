//! The syscall gateway: the only way callers reach the sandbox.
//!
//! Every operation checks the caller's permission first, then resolves paths
//! through the sandbox. Each call leaves one audit event under the
//! `keel::audit` target.

use crate::collaborators::{
    ClusterOrchestrator, CollaboratorError, ContainerRuntime, ContainerSummary, NetworkControl,
    PodSummary,
};
use crate::error::{CoreError, Result};
use crate::rbac::{Caller, Permission, PermissionStore};
use keel_sandbox::{ExecutionResult, FileEntry, Sandbox};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// Permission-gated operations over the shared sandbox.
///
/// Operations are synchronous and may block on child processes; async
/// callers should use `spawn_blocking`.
pub struct SyscallGateway {
    sandbox: RwLock<Option<Arc<Sandbox>>>,
    permissions: Arc<PermissionStore>,
    network: Option<Arc<dyn NetworkControl>>,
    containers: Option<Arc<dyn ContainerRuntime>>,
    cluster: Option<Arc<dyn ClusterOrchestrator>>,
}

impl SyscallGateway {
    /// Gateway over `sandbox` with no collaborators attached.
    pub fn new(sandbox: Arc<Sandbox>, permissions: Arc<PermissionStore>) -> Self {
        Self {
            sandbox: RwLock::new(Some(sandbox)),
            permissions,
            network: None,
            containers: None,
            cluster: None,
        }
    }

    /// Attach network control.
    pub fn with_network(mut self, network: Arc<dyn NetworkControl>) -> Self {
        self.network = Some(network);
        self
    }

    /// Attach a container runtime.
    pub fn with_containers(mut self, containers: Arc<dyn ContainerRuntime>) -> Self {
        self.containers = Some(containers);
        self
    }

    /// Attach a cluster orchestrator.
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterOrchestrator>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// False once the kernel has shut down.
    pub fn is_online(&self) -> bool {
        self.sandbox
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Refuse every further call and hand back the sandbox handle.
    ///
    /// Calls already in flight keep their own handle and finish normally.
    pub(crate) fn go_offline(&self) -> Option<Arc<Sandbox>> {
        let released = match self.sandbox.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if released.is_some() {
            tracing::info!("gateway offline");
        }
        released
    }

    fn sandbox(&self) -> Result<Arc<Sandbox>> {
        let guard = self.sandbox.read().unwrap_or_else(|e| e.into_inner());
        guard.clone().ok_or_else(|| CoreError::InvalidState {
            expected: "gateway online".into(),
            actual: "kernel shut down".into(),
        })
    }

    /// Effective permissions of a caller.
    pub fn permissions(&self, caller: &Caller) -> BTreeSet<Permission> {
        self.permissions.permissions_for(caller)
    }

    fn invoke<T>(
        &self,
        caller: &Caller,
        op: &'static str,
        permission: Permission,
        f: impl FnOnce(&Sandbox) -> Result<T>,
    ) -> Result<T> {
        let outcome = self.sandbox().and_then(|sandbox| {
            self.permissions.check(caller, permission)?;
            f(&sandbox)
        });

        match &outcome {
            Ok(_) => tracing::info!(target: "keel::audit", caller = %caller, op, "allowed"),
            Err(e) if e.is_access_denied() => {
                tracing::warn!(target: "keel::audit", caller = %caller, op, error = %e, "denied")
            }
            Err(e) => {
                tracing::info!(target: "keel::audit", caller = %caller, op, error = %e, "failed")
            }
        }
        outcome
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Read a UTF-8 file. Requires `read_files`.
    pub fn read_file(&self, caller: &Caller, path: &str) -> Result<String> {
        self.invoke(caller, "read_file", Permission::ReadFiles, |sb| {
            Ok(sb.read_file(path)?)
        })
    }

    /// Create or overwrite a file, creating parent directories. Requires `write_files`.
    pub fn write_file(&self, caller: &Caller, path: &str, content: &str) -> Result<()> {
        self.invoke(caller, "write_file", Permission::WriteFiles, |sb| {
            Ok(sb.write_file(path, content)?)
        })
    }

    /// Append to a file, creating it if missing. Requires `write_files`.
    pub fn append_file(&self, caller: &Caller, path: &str, content: &str) -> Result<()> {
        self.invoke(caller, "append_file", Permission::WriteFiles, |sb| {
            Ok(sb.append_file(path, content)?)
        })
    }

    /// List a directory, sorted by name. Requires `read_files`.
    pub fn list_dir(&self, caller: &Caller, path: &str) -> Result<Vec<FileEntry>> {
        self.invoke(caller, "list_dir", Permission::ReadFiles, |sb| {
            Ok(sb.list_dir(path)?)
        })
    }

    /// Delete a file or directory tree. Requires `write_files`; the sandbox
    /// root cannot be deleted.
    pub fn delete(&self, caller: &Caller, path: &str) -> Result<()> {
        self.invoke(caller, "delete", Permission::WriteFiles, |sb| Ok(sb.remove(path)?))
    }

    /// Create a directory and its parents. Requires `write_files`.
    pub fn mkdir(&self, caller: &Caller, path: &str) -> Result<()> {
        self.invoke(caller, "mkdir", Permission::WriteFiles, |sb| Ok(sb.make_dir(path)?))
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Run a host command in the sandbox root with captured output.
    ///
    /// Requires `execute_process`. A non-zero exit is a normal result; only
    /// a failed launch is an error.
    pub fn run_process(
        &self,
        caller: &Caller,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExecutionResult> {
        self.invoke(caller, "run_process", Permission::ExecuteProcess, |sb| {
            Ok(sb.executor().execute(command, args, env, true)?)
        })
    }

    /// Assemble, link and run `source`. Requires `execute_code`. The result
    /// carries the stage tag.
    pub fn compile_and_run(
        &self,
        caller: &Caller,
        source: &str,
        output_name: &str,
    ) -> Result<ExecutionResult> {
        self.invoke(caller, "compile_and_run", Permission::ExecuteCode, |sb| {
            Ok(sb.executor().compile_and_run(source, output_name)?)
        })
    }

    // ========================================================================
    // Passthroughs
    // ========================================================================

    /// Whether networking is enabled. Requires `use_network`.
    pub fn network_status(&self, caller: &Caller) -> Result<bool> {
        self.invoke(caller, "network_status", Permission::UseNetwork, |_| {
            let network = self.network.as_ref().ok_or(CoreError::Unavailable("network control"))?;
            network.is_enabled().map_err(|e| collaborator("network", e))
        })
    }

    /// Enable or disable networking. Requires `manage_network`.
    pub fn set_network(&self, caller: &Caller, enabled: bool) -> Result<()> {
        self.invoke(caller, "set_network", Permission::ManageNetwork, |_| {
            let network = self.network.as_ref().ok_or(CoreError::Unavailable("network control"))?;
            network
                .set_enabled(enabled)
                .map_err(|e| collaborator("network", e))
        })
    }

    /// List containers. Requires `manage_docker`.
    pub fn container_list(&self, caller: &Caller) -> Result<Vec<ContainerSummary>> {
        self.invoke(caller, "container_list", Permission::ManageDocker, |_| {
            self.containers()?
                .list()
                .map_err(|e| collaborator("container runtime", e))
        })
    }

    /// Start a container from `image` and return its id. Requires `manage_docker`.
    pub fn container_run(
        &self,
        caller: &Caller,
        image: &str,
        name: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<String> {
        self.invoke(caller, "container_run", Permission::ManageDocker, |_| {
            self.containers()?
                .run(image, name, env)
                .map_err(|e| collaborator("container runtime", e))
        })
    }

    /// Stop a container by id. Requires `manage_docker`.
    pub fn container_stop(&self, caller: &Caller, id: &str) -> Result<()> {
        self.invoke(caller, "container_stop", Permission::ManageDocker, |_| {
            self.containers()?
                .stop(id)
                .map_err(|e| collaborator("container runtime", e))
        })
    }

    /// List pods in `namespace`. Requires `manage_k8s`.
    pub fn cluster_pods(&self, caller: &Caller, namespace: &str) -> Result<Vec<PodSummary>> {
        self.invoke(caller, "cluster_pods", Permission::ManageK8s, |_| {
            self.cluster()?
                .pods(namespace)
                .map_err(|e| collaborator("cluster orchestrator", e))
        })
    }

    /// Scale a deployment to `replicas`. Requires `manage_k8s`.
    pub fn cluster_scale(
        &self,
        caller: &Caller,
        namespace: &str,
        deployment: &str,
        replicas: u32,
    ) -> Result<()> {
        self.invoke(caller, "cluster_scale", Permission::ManageK8s, |_| {
            self.cluster()?
                .scale(namespace, deployment, replicas)
                .map_err(|e| collaborator("cluster orchestrator", e))
        })
    }

    fn containers(&self) -> Result<&Arc<dyn ContainerRuntime>> {
        self.containers
            .as_ref()
            .ok_or(CoreError::Unavailable("container runtime"))
    }

    fn cluster(&self) -> Result<&Arc<dyn ClusterOrchestrator>> {
        self.cluster
            .as_ref()
            .ok_or(CoreError::Unavailable("cluster orchestrator"))
    }
}

fn collaborator(collaborator: &'static str, err: CollaboratorError) -> CoreError {
    CoreError::Collaborator {
        collaborator,
        message: err.to_string(),
    }
}

impl std::fmt::Debug for SyscallGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallGateway")
            .field("online", &self.is_online())
            .field("network", &self.network.is_some())
            .field("containers", &self.containers.is_some())
            .field("cluster", &self.cluster.is_some())
            .finish()
    }
}
