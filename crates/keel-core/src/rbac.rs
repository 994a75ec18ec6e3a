//! Role-based access control for gateway operations.
//!
//! Identities map to roles, roles map to permission tags. A caller with no
//! identity, an empty identity, or an identity the store does not know gets
//! the empty permission set. There is no implicit privileged identity.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Permission tag required by a gateway operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Read files and list directories.
    ReadFiles,
    /// Create, modify and delete files and directories.
    WriteFiles,
    /// Launch host processes in the sandbox.
    ExecuteProcess,
    /// Use the assemble/link/run pipeline.
    ExecuteCode,
    /// Query network state.
    UseNetwork,
    /// Enable or disable networking.
    ManageNetwork,
    /// Container runtime passthrough.
    ManageDocker,
    /// Cluster orchestration passthrough.
    ManageK8s,
}

impl Permission {
    /// Every permission tag.
    pub const ALL: [Permission; 8] = [
        Self::ReadFiles,
        Self::WriteFiles,
        Self::ExecuteProcess,
        Self::ExecuteCode,
        Self::UseNetwork,
        Self::ManageNetwork,
        Self::ManageDocker,
        Self::ManageK8s,
    ];

    /// Tag name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadFiles => "read_files",
            Self::WriteFiles => "write_files",
            Self::ExecuteProcess => "execute_process",
            Self::ExecuteCode => "execute_code",
            Self::UseNetwork => "use_network",
            Self::ManageNetwork => "manage_network",
            Self::ManageDocker => "manage_docker",
            Self::ManageK8s => "manage_k8s",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Every permission.
    Admin,
    /// Files, processes, code and network queries.
    Developer,
    /// Files, processes and code.
    Agent,
    /// Read-only file access.
    Guest,
}

impl Role {
    /// Every role.
    pub const ALL: [Role; 4] = [Self::Admin, Self::Developer, Self::Agent, Self::Guest];

    /// Permission set used when configuration does not override the role.
    pub fn default_permissions(&self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Self::Admin => &Permission::ALL,
            Self::Developer => &[ReadFiles, WriteFiles, ExecuteProcess, ExecuteCode, UseNetwork],
            Self::Agent => &[ReadFiles, WriteFiles, ExecuteProcess, ExecuteCode],
            Self::Guest => &[ReadFiles],
        }
    }

    /// Role name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Developer => "developer",
            Self::Agent => "agent",
            Self::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| CoreError::Configuration(format!("unknown role '{}'", s)))
    }
}

/// The identity behind a gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    /// No identity, or one that failed to authenticate.
    Anonymous,
    /// A named identity, looked up in the permission store.
    Identity(String),
}

impl Caller {
    /// Build a caller from a name. Blank names become [`Caller::Anonymous`].
    pub fn identity(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.trim().is_empty() {
            Self::Anonymous
        } else {
            Self::Identity(name)
        }
    }

    /// Build a caller from an optional name.
    pub fn from_optional(name: Option<&str>) -> Self {
        name.map(Self::identity).unwrap_or(Self::Anonymous)
    }

    /// Identity name, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::Identity(name) => Some(name),
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("anonymous"),
            Self::Identity(name) => f.write_str(name),
        }
    }
}

/// RBAC section of the kernel configuration.
///
/// ```toml
/// [rbac.roles]
/// guest = ["read_files", "use_network"]
///
/// [rbac.grants]
/// alice = ["admin"]
/// planner = ["agent"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbacConfig {
    /// Per-role permission overrides, keyed by role name.
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<Permission>>,
    /// Identity to role assignments.
    #[serde(default)]
    pub grants: BTreeMap<String, Vec<Role>>,
}

/// The roles and effective permissions of one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGrant {
    /// Identity this grant belongs to.
    pub identity: String,
    /// Roles assigned to the identity.
    pub roles: Vec<Role>,
    /// Union of the roles' permissions.
    pub permissions: BTreeSet<Permission>,
}

impl RoleGrant {
    /// True when the grant carries `permission`.
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Read-only identity to permission lookup, validated when built.
#[derive(Debug, Clone, Default)]
pub struct PermissionStore {
    grants: HashMap<String, RoleGrant>,
}

impl PermissionStore {
    /// Build the store, rejecting unknown role names and blank identities.
    pub fn from_config(config: &RbacConfig) -> Result<Self> {
        let mut role_table: HashMap<Role, BTreeSet<Permission>> = Role::ALL
            .into_iter()
            .map(|role| (role, role.default_permissions().iter().copied().collect()))
            .collect();

        for (name, permissions) in &config.roles {
            let role: Role = name.parse()?;
            role_table.insert(role, permissions.iter().copied().collect());
        }

        let mut grants = HashMap::with_capacity(config.grants.len());
        for (identity, roles) in &config.grants {
            if identity.trim().is_empty() || identity != identity.trim() {
                return Err(CoreError::Configuration(format!(
                    "invalid identity name '{}'",
                    identity
                )));
            }
            if roles.is_empty() {
                tracing::warn!(identity = %identity, "identity granted no roles");
            }

            let permissions = roles
                .iter()
                .flat_map(|role| role_table[role].iter().copied())
                .collect();
            grants.insert(
                identity.clone(),
                RoleGrant {
                    identity: identity.clone(),
                    roles: roles.clone(),
                    permissions,
                },
            );
        }

        tracing::debug!(identities = grants.len(), "permission store loaded");
        Ok(Self { grants })
    }

    /// Grant for a caller, `None` for anonymous or unknown identities.
    pub fn grant_for(&self, caller: &Caller) -> Option<&RoleGrant> {
        caller.name().and_then(|name| self.grants.get(name))
    }

    /// Effective permissions; empty unless the caller holds a grant.
    pub fn permissions_for(&self, caller: &Caller) -> BTreeSet<Permission> {
        self.grant_for(caller)
            .map(|grant| grant.permissions.clone())
            .unwrap_or_default()
    }

    /// Fail with `AccessDenied` unless the caller holds `permission`.
    pub fn check(&self, caller: &Caller, permission: Permission) -> Result<()> {
        match self.grant_for(caller) {
            Some(grant) if grant.has(permission) => Ok(()),
            _ => Err(CoreError::AccessDenied(format!(
                "caller '{}' lacks permission '{}'",
                caller, permission
            ))),
        }
    }
}
