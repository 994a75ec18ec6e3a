//! Error types for keel-sandbox.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for keel-sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors raised by the sandbox primitives.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The sandbox root could not be created or canonicalized.
    #[error("failed to initialize sandbox root {root}: {source}")]
    Initialization {
        /// Root directory requested by the caller
        root: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// A virtual path escapes the sandbox root, or names something that may not be touched.
    #[error("access denied: {path}: {reason}")]
    AccessDenied {
        /// Virtual path as supplied by the caller
        path: String,
        /// Why the path was rejected
        reason: &'static str,
    },

    /// A child process could not be launched.
    #[error("failed to launch '{command}': {source}")]
    Spawn {
        /// Program that failed to start
        command: String,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Pipe or wait failure while supervising a child.
    #[error("resource error: {0}")]
    Resource(String),

    /// A file exceeded the read limit.
    #[error("file '{path}' is too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Virtual path of the file
        path: String,
        /// Actual size in bytes
        size: u64,
        /// Configured limit in bytes
        max: u64,
    },

    /// Filesystem failure on a resolved path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Virtual path the operation was issued for
        path: String,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub(crate) fn denied(path: &str, reason: &'static str) -> Self {
        Self::AccessDenied {
            path: path.to_string(),
            reason,
        }
    }

    pub(crate) fn io(path: &str, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }

    /// True for path escapes and other containment refusals.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied { .. })
    }
}
