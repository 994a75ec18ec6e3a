//! Virtual path resolution confined to the sandbox root.
//!
//! Every virtual path is interpreted relative to the root, whatever its
//! leading separators. `.` and `..` are collapsed lexically (no filesystem
//! lookups, no symlink resolution) and the result must stay under the root.
//!
//! Symlinks created inside the sandbox after resolution are not re-checked.
//! A sandboxed process that plants a link pointing outside the root can use
//! it on a later access; containment here is path discipline, not a jail.

use crate::error::{Result, SandboxError};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace, warn};

/// Maps virtual paths onto the canonical sandbox root.
///
/// Immutable after construction, so `resolve` can be called from any number
/// of threads without locking.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Create the root if missing and canonicalize it once.
    ///
    /// # Errors
    /// Returns [`SandboxError::Initialization`] when the directory cannot be
    /// created, canonicalized, or is not a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let requested = root.as_ref();
        let init_err = |source| SandboxError::Initialization {
            root: requested.to_path_buf(),
            source,
        };

        if !requested.exists() {
            debug!(root = %requested.display(), "creating sandbox root");
            fs::create_dir_all(requested).map_err(init_err)?;
        }

        let root = fs::canonicalize(requested).map_err(init_err)?;
        if !root.is_dir() {
            return Err(init_err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "sandbox root is not a directory",
            )));
        }

        debug!(root = %root.display(), "sandbox root canonicalized");
        Ok(Self { root })
    }

    /// The canonical sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path to a host path under the root.
    ///
    /// # Errors
    /// Returns [`SandboxError::AccessDenied`] when the normalized path would
    /// leave the root.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        if virtual_path.contains('\0') {
            warn!(path = %virtual_path.escape_debug(), "rejected path with NUL byte");
            return Err(SandboxError::denied(virtual_path, "path contains a NUL byte"));
        }

        let relative = virtual_path.trim_start_matches('/');
        let mut resolved = self.root.clone();

        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }

        if !resolved.starts_with(&self.root) {
            warn!(
                path = %virtual_path,
                root = %self.root.display(),
                "path escapes sandbox"
            );
            return Err(SandboxError::denied(virtual_path, "path escapes sandbox"));
        }

        trace!(path = %virtual_path, resolved = %resolved.display(), "path resolved");
        Ok(resolved)
    }
}
