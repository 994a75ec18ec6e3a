//! Boot and shutdown sequencing.
//!
//! # Shutdown
//!
//! Services are visited in the reverse of the order they started:
//!
//! 1. **Warning**: every warning hook is started and left to run.
//! 2. **Graceful**: one service at a time, the stop hook runs on its own
//!    thread and the supervisor waits for it no longer than the service's
//!    stop timeout. A hook that overruns is cancelled and the next service
//!    starts its own clock immediately.
//! 3. **Force**: overrunning services are marked stopped and reported.
//! 4. **Cleanup**: registries are cleared, leftover warning hooks cancelled
//!    and the sandbox handle released.
//!
//! Hooks never run on the supervisor's own thread. A hook that blocks its
//! thread (a stuck syscall, `std::thread::sleep`) cannot hold up the
//! timeout, even on a single-threaded runtime. Such a hook cannot be
//! cancelled either; its thread is abandoned and exits whenever the hook
//! returns.
//!
//! Failures are collected into the [`ShutdownReport`]; nothing aborts the
//! sequence part way.

use crate::error::{CoreError, Result, ServiceError};
use crate::graph::ServiceGraph;
use crate::service::{Service, ServiceContext, ServiceDescriptor};
use crate::status::{ServiceState, StatusBoard, SupervisorPhase};
use keel_sandbox::Sandbox;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a cancelled stop hook gets to unwind before it is abandoned.
const ABORT_GRACE: Duration = Duration::from_millis(100);

/// Outcome of one `shutdown()` call.
#[derive(Debug, Default, Serialize)]
pub struct ShutdownReport {
    /// Services in the order they were visited.
    pub order: Vec<String>,
    /// Services whose stop hook returned in time, with or without an error.
    pub stopped: Vec<String>,
    /// Services that overran their stop timeout.
    pub forced: Vec<String>,
    /// Stop failures and forced-shutdown diagnostics.
    #[serde(serialize_with = "serialize_errors")]
    pub failed: Vec<CoreError>,
    /// True if the supervisor was already stopped and nothing was done.
    pub already_stopped: bool,
    /// Wall time spent in this call.
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// True when every service stopped in time without an error.
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty() && self.failed.is_empty()
    }
}

fn serialize_errors<S: serde::Serializer>(
    errors: &[CoreError],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}

enum StopOutcome {
    Stopped,
    Failed(String),
    TimedOut(HookTask<std::result::Result<(), ServiceError>>),
}

/// A lifecycle hook running on a dedicated thread.
///
/// Dropping `cancel` cancels the hook at its next await point. `done`
/// yields the hook's output, or an error if it was cancelled or panicked.
struct HookTask<T> {
    cancel: oneshot::Sender<()>,
    done: oneshot::Receiver<T>,
}

/// Run `hook` on its own thread, driven by the current runtime's handle.
fn spawn_hook<F>(
    thread_name: String,
    hook: F,
) -> std::result::Result<HookTask<F::Output>, String>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let runtime = Handle::try_current().map_err(|e| e.to_string())?;
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let output = runtime.block_on(async move {
                tokio::select! {
                    biased;
                    output = hook => Some(output),
                    _ = cancel_rx => None,
                }
            });
            if let Some(output) = output {
                let _ = done_tx.send(output);
            }
        })
        .map_err(|e| format!("failed to spawn hook thread: {}", e))?;

    Ok(HookTask {
        cancel: cancel_tx,
        done: done_rx,
    })
}

/// Drives services through boot and the phased shutdown.
///
/// Owns the only writable handle to the [`StatusBoard`]; all mutation goes
/// through `&mut self`, so sequencing is serial by construction.
pub struct ServiceSupervisor {
    graph: ServiceGraph,
    descriptors: HashMap<String, ServiceDescriptor>,
    started: Vec<String>,
    board: StatusBoard,
    sandbox: Option<Arc<Sandbox>>,
    boot_id: Uuid,
    warnings: Vec<HookTask<()>>,
}

impl ServiceSupervisor {
    /// Create an idle supervisor that hands `sandbox` to its services.
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            graph: ServiceGraph::new(),
            descriptors: HashMap::new(),
            started: Vec::new(),
            board: StatusBoard::new(),
            sandbox: Some(sandbox),
            boot_id: Uuid::new_v4(),
            warnings: Vec::new(),
        }
    }

    /// Use a specific boot identifier in service contexts.
    pub fn with_boot_id(mut self, boot_id: Uuid) -> Self {
        self.boot_id = boot_id;
        self
    }

    /// Register a service. Only allowed before boot.
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<()> {
        self.expect_phase(SupervisorPhase::Idle)?;
        self.graph
            .add(descriptor.name.clone(), descriptor.dependencies.iter().cloned())?;
        self.board.register(&descriptor.name);
        debug!(
            service = %descriptor.name,
            dependencies = ?descriptor.dependencies,
            stop_timeout_ms = descriptor.stop_timeout.as_millis() as u64,
            "service registered"
        );
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Current phase.
    pub fn phase(&self) -> SupervisorPhase {
        self.board.phase()
    }

    /// Read handle onto service and supervisor state.
    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Services started so far, in start order.
    pub fn started_order(&self) -> &[String] {
        &self.started
    }

    /// Boot order that `boot()` would use.
    pub fn boot_order(&self) -> Result<Vec<String>> {
        self.graph.topological_order()
    }

    fn expect_phase(&self, expected: SupervisorPhase) -> Result<()> {
        let actual = self.phase();
        if actual != expected {
            return Err(CoreError::InvalidState {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Start every service in dependency order.
    ///
    /// # Errors
    /// - `InvalidState` unless the supervisor is idle
    /// - `Configuration`/`DependencyCycle` if no boot order exists; nothing
    ///   is started and the supervisor stays idle
    /// - `StartupFailure` if a start hook fails; already-started services
    ///   are stopped in reverse order and the supervisor ends up stopped
    pub async fn boot(&mut self) -> Result<()> {
        self.expect_phase(SupervisorPhase::Idle)?;
        let order = self.graph.topological_order()?;
        let sandbox = match &self.sandbox {
            Some(sandbox) => Arc::clone(sandbox),
            None => {
                return Err(CoreError::InvalidState {
                    expected: "sandbox attached".into(),
                    actual: "sandbox released".into(),
                })
            }
        };

        self.board.set_phase(SupervisorPhase::Booting);
        info!(services = order.len(), boot_id = %self.boot_id, "booting services");

        for name in order {
            let Some(descriptor) = self.descriptors.get(&name).cloned() else {
                continue;
            };
            let ctx = ServiceContext::new(&name, self.boot_id, Arc::clone(&sandbox));
            let started_at = Instant::now();

            match descriptor.service.start(&ctx).await {
                Ok(()) => {
                    self.board.transition(&name, ServiceState::Started);
                    info!(
                        service = %name,
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        "service started"
                    );
                    self.started.push(name);
                }
                Err(e) => {
                    error!(service = %name, error = %e, "service failed to start, rolling back");
                    self.board.transition(&name, ServiceState::Failed);
                    self.rollback().await;
                    return Err(CoreError::StartupFailure {
                        service: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.board.set_phase(SupervisorPhase::Running);
        info!(services = self.started.len(), "all services started");
        Ok(())
    }

    /// Stop what a failed boot had started, newest first, then clean up.
    async fn rollback(&mut self) {
        let order: Vec<String> = self.started.iter().rev().cloned().collect();
        for name in &order {
            match self.stop_service(name).await {
                StopOutcome::Stopped => {}
                StopOutcome::Failed(reason) => {
                    warn!(service = %name, error = %reason, "rollback stop failed");
                }
                StopOutcome::TimedOut(task) => {
                    self.board.transition(name, ServiceState::Force);
                    warn!(service = %name, "rollback stop timed out, forcing");
                    abandon(name, task).await;
                }
            }
            self.board.transition(name, ServiceState::Stopped);
        }
        self.cleanup();
    }

    /// Shut every started service down in reverse start order.
    ///
    /// Calling this again once stopped is a no-op that reports
    /// `already_stopped`.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let began = Instant::now();
        let mut report = ShutdownReport::default();

        if self.phase() == SupervisorPhase::Stopped {
            debug!("shutdown requested but supervisor already stopped");
            report.already_stopped = true;
            return report;
        }

        report.order = self.started.iter().rev().cloned().collect();
        info!(services = report.order.len(), "shutdown: warning phase");

        self.board.set_phase(SupervisorPhase::Warning);
        for name in &report.order {
            self.board.transition(name, ServiceState::Warning);
            if let Some(descriptor) = self.descriptors.get(name) {
                let service = Arc::clone(&descriptor.service);
                match spawn_hook(format!("keel-warn-{}", name), async move {
                    service.on_shutdown_warning().await
                }) {
                    Ok(task) => self.warnings.push(task),
                    Err(e) => warn!(service = %name, error = %e, "warning hook not delivered"),
                }
            }
        }

        self.board.set_phase(SupervisorPhase::Graceful);
        let mut overrun = Vec::new();
        for name in &report.order {
            match self.stop_service(name).await {
                StopOutcome::Stopped => {
                    self.board.transition(name, ServiceState::Stopped);
                    report.stopped.push(name.clone());
                }
                StopOutcome::Failed(reason) => {
                    error!(service = %name, error = %reason, "service failed to stop cleanly");
                    self.board.transition(name, ServiceState::Stopped);
                    report.stopped.push(name.clone());
                    report.failed.push(CoreError::StopFailure {
                        service: name.clone(),
                        reason,
                    });
                }
                StopOutcome::TimedOut(task) => {
                    self.board.transition(name, ServiceState::Force);
                    overrun.push((name.clone(), task));
                }
            }
        }

        if !overrun.is_empty() {
            self.board.set_phase(SupervisorPhase::Force);
            for (name, task) in overrun {
                let timeout = self.stop_timeout(&name);
                warn!(
                    service = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "service did not stop in time, forced"
                );
                abandon(&name, task).await;
                self.board.transition(&name, ServiceState::Stopped);
                report.failed.push(CoreError::ShutdownTimeout {
                    service: name.clone(),
                    timeout,
                });
                report.forced.push(name);
            }
        }

        self.cleanup();
        report.elapsed = began.elapsed();
        info!(
            stopped = report.stopped.len(),
            forced = report.forced.len(),
            failed = report.failed.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "shutdown complete"
        );
        report
    }

    fn stop_timeout(&self, name: &str) -> Duration {
        self.descriptors
            .get(name)
            .map(|d| d.stop_timeout)
            .unwrap_or_default()
    }

    /// Run one stop hook on its own thread, bounded by the service's timeout.
    async fn stop_service(&self, name: &str) -> StopOutcome {
        let Some(descriptor) = self.descriptors.get(name) else {
            return StopOutcome::Failed(format!("service '{}' is not registered", name));
        };
        let service: Arc<dyn Service> = Arc::clone(&descriptor.service);
        let timeout = descriptor.stop_timeout;

        self.board.transition(name, ServiceState::Graceful);
        debug!(service = %name, timeout_ms = timeout.as_millis() as u64, "stopping service");

        let mut task = match spawn_hook(format!("keel-stop-{}", name), async move {
            service.stop().await
        }) {
            Ok(task) => task,
            Err(reason) => return StopOutcome::Failed(reason),
        };
        match tokio::time::timeout(timeout, &mut task.done).await {
            Ok(Ok(Ok(()))) => {
                info!(service = %name, "service stopped");
                StopOutcome::Stopped
            }
            Ok(Ok(Err(e))) => StopOutcome::Failed(e.to_string()),
            Ok(Err(_)) => StopOutcome::Failed("stop hook panicked".into()),
            Err(_) => StopOutcome::TimedOut(task),
        }
    }

    fn cleanup(&mut self) {
        self.board.set_phase(SupervisorPhase::Cleanup);
        self.started.clear();
        if !self.warnings.is_empty() {
            debug!(hooks = self.warnings.len(), "cancelling leftover warning hooks");
            self.warnings.clear();
        }
        if self.sandbox.take().is_some() {
            debug!("sandbox handle released");
        }
        self.board.set_phase(SupervisorPhase::Stopped);
    }
}

/// Cancel an overrunning stop hook and give it [`ABORT_GRACE`] to unwind.
async fn abandon<T>(name: &str, task: HookTask<T>) {
    let HookTask { cancel, done } = task;
    drop(cancel);
    if tokio::time::timeout(ABORT_GRACE, done).await.is_err() {
        warn!(service = %name, "stop hook is still running, thread abandoned");
    }
}
