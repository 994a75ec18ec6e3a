//! Unix socket front-end.
//!
//! Listens on a Unix socket and serves newline-delimited JSON-RPC requests
//! against the kernel's syscall gateway.

use crate::handler::handle_request;
use crate::protocol::{error_codes, Request, Response};
use keel_core::{CollaboratorError, FrontEnd, SyscallGateway};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Front-end that serves the gateway over a Unix socket.
pub struct SocketFrontEnd {
    path: PathBuf,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketFrontEnd {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            accept_task: Mutex::new(None),
        }
    }
}

impl FrontEnd for SocketFrontEnd {
    fn attach(&self, gateway: Arc<SyscallGateway>) -> Result<(), CollaboratorError> {
        let runtime = tokio::runtime::Handle::try_current()?;

        // Remove existing socket file if it exists
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            debug!("removed existing socket file");
        }

        let listener = bind_private(&self.path)?;
        listener.set_nonblocking(true)?;

        let listener = {
            let _guard = runtime.enter();
            UnixListener::from_std(listener)?
        };
        info!(path = %self.path.display(), "listening for connections");

        let task = runtime.spawn(accept_loop(listener, gateway));
        if let Ok(mut slot) = self.accept_task.lock() {
            *slot = Some(task);
        }
        Ok(())
    }

    fn detach(&self) {
        let task = self.accept_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            task.abort();
            info!(path = %self.path.display(), "socket closed");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(error = %e, "socket file already gone");
        }
    }
}

/// Bind a socket that is never reachable with looser permissions than 0600.
///
/// The socket is created inside a fresh 0700 directory, restricted, and only
/// then renamed to `path`.
fn bind_private(path: &Path) -> std::io::Result<std::os::unix::net::UnixListener> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let staging = parent.join(format!(".keel-{}", uuid::Uuid::new_v4().simple()));
    std::fs::DirBuilder::new().mode(0o700).create(&staging)?;

    let staged = staging.join("sock");
    let bound = std::os::unix::net::UnixListener::bind(&staged).and_then(|listener| {
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600))?;
        std::fs::rename(&staged, path)?;
        Ok(listener)
    });

    if let Err(e) = std::fs::remove_dir_all(&staging) {
        warn!(path = %staging.display(), error = %e, "failed to remove staging directory");
    }
    bound
}

async fn accept_loop(listener: UnixListener, gateway: Arc<SyscallGateway>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!("accepted new connection");
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, gateway).await {
                        warn!(error = %e, "connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }
}

/// Handle a single client connection.
///
/// Reads newline-delimited JSON-RPC requests and writes responses.
async fn handle_connection(
    stream: UnixStream,
    gateway: Arc<SyscallGateway>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            debug!("client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!(len = trimmed.len(), "received request");

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => {
                let gateway = Arc::clone(&gateway);
                let id = req.id;
                // Gateway calls block on child processes.
                tokio::task::spawn_blocking(move || handle_request(&gateway, req))
                    .await
                    .unwrap_or_else(|e| {
                        Response::error(id, error_codes::INTERNAL_ERROR, e.to_string())
                    })
            }
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                Response::error(0, error_codes::PARSE_ERROR, format!("parse error: {}", e))
            }
        };

        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}
