//! Kernel configuration.
//!
//! Loaded from a TOML file, with a couple of environment overrides on top.
//!
//! ```toml
//! sandbox_root = "/home/guest/sandbox"
//! mounts = ["/home", "/tmp", "/var/log/journal"]
//! default_stop_timeout_ms = 5000
//!
//! [[services]]
//! name = "journal"
//!
//! [[services]]
//! name = "planner"
//! dependencies = ["journal"]
//! stop_timeout_ms = 2000
//!
//! [rbac.grants]
//! alice = ["admin"]
//!
//! [toolchain]
//! assembler = "nasm"
//! ```

use crate::rbac::{PermissionStore, RbacConfig};
use keel_sandbox::Toolchain;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "KEEL_CONFIG";

/// Environment variable overriding `sandbox_root`.
pub const SANDBOX_ROOT_ENV: &str = "KEEL_SANDBOX_ROOT";

/// Stop timeout used when neither the service nor the config sets one.
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("sandbox root must be an absolute path: {0}")]
    RelativeSandboxRoot(PathBuf),

    #[error("mount point must be an absolute virtual path: {0}")]
    InvalidMount(String),

    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("service '{0}' is declared more than once")]
    DuplicateService(String),

    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("stop timeout for '{0}' must be greater than zero")]
    ZeroTimeout(String),

    #[error("invalid rbac policy: {0}")]
    Rbac(String),
}

/// One `[[services]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name.
    pub name: String,
    /// Services that must start first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Graceful stop budget; falls back to `default_stop_timeout_ms`.
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,
}

/// Top-level kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Host directory every virtual path is confined to.
    pub sandbox_root: PathBuf,
    /// Virtual directories created inside the sandbox at boot.
    pub mounts: Vec<String>,
    /// Stop timeout for services that do not set their own.
    pub default_stop_timeout_ms: u64,
    /// Service declarations: dependencies and stop timeouts.
    pub services: Vec<ServiceConfig>,
    /// Roles and identity grants.
    pub rbac: RbacConfig,
    /// Assembler and linker used by `compile_and_run`.
    pub toolchain: Toolchain,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            sandbox_root: default_sandbox_root(),
            mounts: vec!["/home".into(), "/tmp".into(), "/var/log/journal".into()],
            default_stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            services: Vec::new(),
            rbac: RbacConfig::default(),
            toolchain: Toolchain::default(),
        }
    }
}

fn default_sandbox_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".keel").join("sandbox"),
        None => std::env::temp_dir().join("keel").join("sandbox"),
    }
}

impl KernelConfig {
    /// Parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load configuration using environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KEEL_CONFIG` | none, built-in defaults are used |
    /// | `KEEL_SANDBOX_ROOT` | `$HOME/.keel/sandbox` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path))?,
            None => Self::default(),
        };

        if let Some(root) = std::env::var_os(SANDBOX_ROOT_ENV) {
            config.sandbox_root = PathBuf::from(root);
        }

        Ok(config)
    }

    /// Check the configuration for consistency.
    ///
    /// Dependency cycles are not detected here; they surface when the boot
    /// order is computed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sandbox_root.is_absolute() {
            return Err(ConfigError::RelativeSandboxRoot(self.sandbox_root.clone()));
        }

        for mount in &self.mounts {
            if !mount.starts_with('/') || mount.contains('\0') {
                return Err(ConfigError::InvalidMount(mount.clone()));
            }
        }

        if self.default_stop_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("default".into()));
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(ConfigError::EmptyServiceName);
            }
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
            if service.stop_timeout_ms == Some(0) {
                return Err(ConfigError::ZeroTimeout(service.name.clone()));
            }
        }

        for service in &self.services {
            if let Some(dependency) = service
                .dependencies
                .iter()
                .find(|dep| !seen.contains(dep.as_str()))
            {
                return Err(ConfigError::UnknownDependency {
                    service: service.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        PermissionStore::from_config(&self.rbac).map_err(|e| ConfigError::Rbac(e.to_string()))?;

        Ok(())
    }

    /// Declaration for a service, if the config has one.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Effective stop timeout for a service.
    pub fn stop_timeout(&self, name: &str) -> Duration {
        let ms = self
            .service(name)
            .and_then(|s| s.stop_timeout_ms)
            .unwrap_or(self.default_stop_timeout_ms);
        Duration::from_millis(ms)
    }
}
