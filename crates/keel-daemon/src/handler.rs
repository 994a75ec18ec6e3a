//! Request handler for the keel socket.
//!
//! Routes JSON-RPC requests to the syscall gateway as the named caller.

use crate::protocol::{
    error_codes, CompileParams, ContainerRunParams, ContainerStopParams, NamespaceParams,
    PathParams, Request, Response, RunProcessParams, ScaleParams, SetNetworkParams, WriteParams,
};
use keel_core::{Caller, CoreError, SyscallGateway};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

/// Handle a JSON-RPC request and return a response.
///
/// Supported methods:
/// - `ping` - Health check, returns `{pong: true}`.
/// - `whoami` - The caller's effective permissions.
/// - `read_file`, `write_file`, `append_file`, `list_dir`, `delete`, `mkdir`
/// - `run_process`, `compile_and_run`
/// - `network_status`, `set_network`
/// - `container_list`, `container_run`, `container_stop`
/// - `cluster_pods`, `cluster_scale`
///
/// Blocks while a process runs; call from a blocking context.
pub fn handle_request(gateway: &SyscallGateway, req: Request) -> Response {
    let id = req.id;
    let caller = Caller::from_optional(req.caller.as_deref());
    debug!(method = %req.method, id, caller = %caller, "handling request");
    trace!(params = ?req.params, "request params");

    let params = req.params;
    let response = match req.method.as_str() {
        "ping" => Response::success(id, json!({"pong": true})),

        "whoami" => Response::success(
            id,
            json!({
                "caller": caller.to_string(),
                "permissions": gateway.permissions(&caller),
            }),
        ),

        "read_file" => with_params(id, params, |p: PathParams| {
            gateway
                .read_file(&caller, &p.path)
                .map(|content| json!({"content": content}))
        }),

        "write_file" => with_params(id, params, |p: WriteParams| {
            gateway
                .write_file(&caller, &p.path, &p.content)
                .map(|()| json!({"success": true}))
        }),

        "append_file" => with_params(id, params, |p: WriteParams| {
            gateway
                .append_file(&caller, &p.path, &p.content)
                .map(|()| json!({"success": true}))
        }),

        "list_dir" => with_params(id, params, |p: PathParams| {
            gateway
                .list_dir(&caller, &p.path)
                .map(|entries| json!({"entries": entries}))
        }),

        "delete" => with_params(id, params, |p: PathParams| {
            gateway
                .delete(&caller, &p.path)
                .map(|()| json!({"success": true}))
        }),

        "mkdir" => with_params(id, params, |p: PathParams| {
            gateway
                .mkdir(&caller, &p.path)
                .map(|()| json!({"success": true}))
        }),

        "run_process" => with_params(id, params, |p: RunProcessParams| {
            gateway.run_process(&caller, &p.command, &p.args, &p.env)
        }),

        "compile_and_run" => with_params(id, params, |p: CompileParams| {
            gateway.compile_and_run(&caller, &p.source, &p.output_name)
        }),

        "network_status" => respond(
            id,
            gateway
                .network_status(&caller)
                .map(|enabled| json!({"enabled": enabled})),
        ),

        "set_network" => with_params(id, params, |p: SetNetworkParams| {
            gateway
                .set_network(&caller, p.enabled)
                .map(|()| json!({"enabled": p.enabled}))
        }),

        "container_list" => respond(
            id,
            gateway
                .container_list(&caller)
                .map(|containers| json!({"containers": containers})),
        ),

        "container_run" => with_params(id, params, |p: ContainerRunParams| {
            gateway
                .container_run(&caller, &p.image, p.name.as_deref(), &p.env)
                .map(|container_id| json!({"id": container_id}))
        }),

        "container_stop" => with_params(id, params, |p: ContainerStopParams| {
            gateway
                .container_stop(&caller, &p.id)
                .map(|()| json!({"success": true}))
        }),

        "cluster_pods" => with_params(id, params, |p: NamespaceParams| {
            gateway
                .cluster_pods(&caller, &p.namespace)
                .map(|pods| json!({"pods": pods}))
        }),

        "cluster_scale" => with_params(id, params, |p: ScaleParams| {
            gateway
                .cluster_scale(&caller, &p.namespace, &p.deployment, p.replicas)
                .map(|()| json!({"success": true}))
        }),

        _ => {
            warn!(method = %req.method, "unknown method");
            Response::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {}", req.method),
            )
        }
    };

    if response.error.is_some() {
        debug!(id, error = ?response.error, "request failed");
    } else {
        debug!(id, "request succeeded");
    }

    response
}

/// Decode params, run the call and encode its result.
fn with_params<P, T, F>(id: u64, params: Value, f: F) -> Response
where
    P: DeserializeOwned,
    T: Serialize,
    F: FnOnce(P) -> keel_core::Result<T>,
{
    // Methods without required fields accept a missing params member.
    let params = if params.is_null() { json!({}) } else { params };
    match serde_json::from_value::<P>(params) {
        Ok(p) => respond(id, f(p)),
        Err(e) => {
            warn!(id, error = %e, "invalid params");
            Response::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("invalid params: {}", e),
            )
        }
    }
}

fn respond<T: Serialize>(id: u64, result: keel_core::Result<T>) -> Response {
    match result.and_then(|value| serde_json::to_value(value).map_err(CoreError::from)) {
        Ok(value) => Response::success(id, value),
        Err(e) => Response::error(id, error_code(&e), e.to_string()),
    }
}

fn error_code(err: &CoreError) -> i32 {
    match err {
        CoreError::AccessDenied(_) => error_codes::ACCESS_DENIED,
        CoreError::InvalidState { .. } | CoreError::Unavailable(_) => error_codes::UNAVAILABLE,
        CoreError::ExecutionFailure { .. } => error_codes::EXECUTION_FAILED,
        _ => error_codes::INTERNAL_ERROR,
    }
}
