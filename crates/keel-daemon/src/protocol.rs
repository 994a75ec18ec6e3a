//! JSON-RPC 2.0 protocol types for the keel socket.
//!
//! One request per line, one response per line. Requests name the calling
//! identity in `caller`; a missing or blank caller has no permissions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// JSON-RPC 2.0 error codes, standard and keel-specific.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The caller lacks the permission, or the path escapes the sandbox.
    pub const ACCESS_DENIED: i32 = -32001;
    /// The kernel is shutting down or a collaborator is not attached.
    pub const UNAVAILABLE: i32 = -32002;
    /// A process could not be launched.
    pub const EXECUTION_FAILED: i32 = -32003;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Protocol version, must be "2.0".
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// Request identifier.
    pub id: u64,
    /// Method name to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
    /// Identity the call is made as.
    #[serde(default)]
    pub caller: Option<String>,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct Response {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request identifier (matches request).
    pub id: u64,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct RpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

// Parameter types for the gateway methods

/// Parameters for methods that take a single path.
#[derive(Debug, Deserialize)]
pub struct PathParams {
    pub path: String,
}

/// Parameters for `write_file` and `append_file`.
#[derive(Debug, Deserialize)]
pub struct WriteParams {
    pub path: String,
    pub content: String,
}

/// Parameters for `run_process`.
#[derive(Debug, Deserialize)]
pub struct RunProcessParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Parameters for `compile_and_run`.
#[derive(Debug, Deserialize)]
pub struct CompileParams {
    pub source: String,
    #[serde(default = "default_output_name")]
    pub output_name: String,
}

fn default_output_name() -> String {
    "program".to_string()
}

/// Parameters for `set_network`.
#[derive(Debug, Deserialize)]
pub struct SetNetworkParams {
    pub enabled: bool,
}

/// Parameters for `container_run`.
#[derive(Debug, Deserialize)]
pub struct ContainerRunParams {
    pub image: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Parameters for `container_stop`.
#[derive(Debug, Deserialize)]
pub struct ContainerStopParams {
    pub id: String,
}

/// Parameters for `cluster_pods`.
#[derive(Debug, Deserialize)]
pub struct NamespaceParams {
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Parameters for `cluster_scale`.
#[derive(Debug, Deserialize)]
pub struct ScaleParams {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub deployment: String,
    pub replicas: u32,
}

fn default_namespace() -> String {
    "default".to_string()
}
