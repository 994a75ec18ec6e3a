//! # keel-sandbox
//!
//! Containment primitives for the keel kernel: a path resolver that pins
//! every virtual path under one canonical root, and a process executor that
//! runs host commands in that root with a scrubbed environment.
//!
//! ## Quick Start
//!
//! ```no_run
//! use keel_sandbox::Sandbox;
//! use std::collections::HashMap;
//!
//! # fn example() -> keel_sandbox::Result<()> {
//! let sandbox = Sandbox::open("/tmp/keel/sandbox")?;
//!
//! sandbox.write_file("/notes.txt", "hello")?;
//! assert!(sandbox.resolve("/../../etc/passwd").is_err());
//!
//! let result = sandbox
//!     .executor()
//!     .execute("cat", &["notes.txt".into()], &HashMap::new(), true)?;
//! assert_eq!(result.stdout, "hello");
//! # Ok(())
//! # }
//! ```

mod error;
mod exec;
mod fs;
mod pipeline;
mod resolver;

pub use error::{Result, SandboxError};
pub use exec::{ExecutionResult, ProcessExecutor, Stage, MAX_OUTPUT_SIZE, SIGNALED_RETURN_CODE};
pub use fs::{FileEntry, MAX_READ_SIZE};
pub use pipeline::{Toolchain, LAUNCH_FAILURE_RETURN_CODE};
pub use resolver::PathResolver;

use std::path::{Path, PathBuf};

/// The sandbox handle: one resolver and one executor bound to the same root.
///
/// Created once and shared by reference (`Arc<Sandbox>`) between the kernel
/// services and the agent-facing gateway; never cloned.
#[derive(Debug)]
pub struct Sandbox {
    resolver: PathResolver,
    executor: ProcessExecutor,
}

impl Sandbox {
    /// Open (creating if needed) the sandbox rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let resolver = PathResolver::new(root)?;
        let executor = ProcessExecutor::new(resolver.root());
        tracing::info!(root = %resolver.root().display(), "sandbox opened");
        Ok(Self { resolver, executor })
    }

    /// Use a custom toolchain for `compile_and_run`.
    pub fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.executor = self.executor.with_toolchain(toolchain);
        self
    }

    /// Canonical sandbox root.
    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    /// Path resolver bound to this sandbox.
    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Process executor bound to this sandbox.
    pub fn executor(&self) -> &ProcessExecutor {
        &self.executor
    }

    /// Shorthand for `resolver().resolve(path)`.
    pub fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        self.resolver.resolve(virtual_path)
    }
}
