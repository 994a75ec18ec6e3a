//! # keel-core
//!
//! Service supervision, access control and the syscall gateway for the keel
//! kernel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Kernel                           │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌──────────────────┐     ┌─────────────────────────┐    │
//! │  │ ServiceSupervisor│────▶│ ServiceGraph            │    │
//! │  │  - boot()        │     │  - topological_order()  │    │
//! │  │  - shutdown()    │     └─────────────────────────┘    │
//! │  └──────────────────┘                                    │
//! │           │ StatusBoard                                  │
//! │           ▼                                              │
//! │  ┌──────────────────┐     ┌─────────────────────────┐    │
//! │  │ SyscallGateway   │────▶│ PermissionStore (RBAC)  │    │
//! │  │  - read_file()   │     └─────────────────────────┘    │
//! │  │  - run_process() │                                    │
//! │  └──────────────────┘                                    │
//! │           │                                              │
//! └───────────┼──────────────────────────────────────────────┘
//!             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │          keel-sandbox: PathResolver + ProcessExecutor    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use keel_core::{Caller, Kernel, KernelConfig};
//!
//! # async fn example() -> keel_core::Result<()> {
//! let mut config = KernelConfig::default();
//! config.rbac.grants.insert("alice".into(), vec![keel_core::Role::Admin]);
//!
//! let kernel = Kernel::boot(config).await?;
//! let alice = Caller::identity("alice");
//!
//! kernel.gateway().write_file(&alice, "/home/notes.txt", "hello")?;
//! let result = kernel
//!     .gateway()
//!     .run_process(&alice, "cat", &["home/notes.txt".into()], &Default::default())?;
//! assert_eq!(result.stdout, "hello");
//!
//! let report = kernel.shutdown().await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod gateway;
pub mod graph;
pub mod kernel;
pub mod rbac;
pub mod service;
pub mod status;
pub mod supervisor;

pub use collaborators::{
    ClusterOrchestrator, CollaboratorError, ContainerRuntime, ContainerSummary, FrontEnd,
    NetworkControl, PodSummary,
};
pub use config::{ConfigError, KernelConfig, ServiceConfig};
pub use error::{CoreError, Result, ServiceError};
pub use gateway::SyscallGateway;
pub use graph::ServiceGraph;
pub use kernel::{Kernel, KernelBuilder};
pub use rbac::{Caller, Permission, PermissionStore, RbacConfig, Role, RoleGrant};
pub use service::{Service, ServiceContext, ServiceDescriptor};
pub use status::{ServiceState, ServiceStatus, StatusBoard, SupervisorPhase};
pub use supervisor::{ServiceSupervisor, ShutdownReport};

// Re-export the sandbox types callers see in gateway results.
pub use keel_sandbox::{ExecutionResult, FileEntry, Stage, Toolchain};
