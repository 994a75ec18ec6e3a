//! Error types for keel-core.

use keel_sandbox::SandboxError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for keel-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error type returned by service hooks.
pub type ServiceError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the kernel, supervisor or gateway.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Path escape or missing permission. Always fail-closed.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Invalid configuration or service registration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The service graph has a cycle.
    #[error("configuration error: dependency cycle among services: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// A start hook failed; already-started services were rolled back.
    #[error("service '{service}' failed to start: {reason}")]
    StartupFailure {
        /// Service whose start hook failed
        service: String,
        /// Error reported by the hook
        reason: String,
    },

    /// A stop hook did not finish within its timeout and was forced.
    #[error("service '{service}' did not stop within {timeout:?}")]
    ShutdownTimeout {
        /// Service that was forced
        service: String,
        /// Configured stop timeout
        timeout: Duration,
    },

    /// A stop hook returned an error (the service is still marked stopped).
    #[error("service '{service}' failed to stop cleanly: {reason}")]
    StopFailure {
        /// Service whose stop hook failed
        service: String,
        /// Error reported by the hook
        reason: String,
    },

    /// A process could not be launched.
    #[error("execution failed: cannot launch '{command}': {message}")]
    ExecutionFailure {
        /// Program that failed to launch
        command: String,
        /// Failure description
        message: String,
    },

    /// Fork, pipe or wait failure; fatal to one operation only.
    #[error("resource error: {0}")]
    Resource(String),

    /// Operation issued in the wrong lifecycle phase.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// An external collaborator is not attached to the kernel.
    #[error("{0} is not available")]
    Unavailable(&'static str),

    /// A collaborator call failed.
    #[error("{collaborator} error: {message}")]
    Collaborator {
        /// Which collaborator failed
        collaborator: &'static str,
        /// Error reported by it
        message: String,
    },

    /// Filesystem failure inside the sandbox.
    #[error(transparent)]
    Sandbox(SandboxError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// True for path escapes and permission refusals.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }

    /// True for configuration errors, including dependency cycles.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::DependencyCycle(_))
    }
}

impl From<SandboxError> for CoreError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::AccessDenied { path, reason } => {
                Self::AccessDenied(format!("{}: {}", path, reason))
            }
            SandboxError::Spawn { command, source } => Self::ExecutionFailure {
                command,
                message: source.to_string(),
            },
            SandboxError::Resource(message) => Self::Resource(message),
            SandboxError::Initialization { .. } => Self::Configuration(err.to_string()),
            other => Self::Sandbox(other),
        }
    }
}
