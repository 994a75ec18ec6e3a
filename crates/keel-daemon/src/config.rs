//! Configuration for the daemon.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use keel_core::{ConfigError, KernelConfig};
use std::path::PathBuf;

/// Default path of the JSON-RPC socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/keel.sock";

/// Configuration for the keel daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path of the Unix socket the front-end listens on.
    pub socket_path: PathBuf,

    /// Kernel configuration.
    pub kernel: KernelConfig,
}

impl DaemonConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KEEL_SOCKET` | `/tmp/keel.sock` |
    /// | `KEEL_CONFIG` | none, built-in kernel defaults |
    /// | `KEEL_SANDBOX_ROOT` | `$HOME/.keel/sandbox` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let socket_path = std::env::var("KEEL_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH));

        Ok(Self {
            socket_path,
            kernel: KernelConfig::from_env()?,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kernel.validate()
    }
}
