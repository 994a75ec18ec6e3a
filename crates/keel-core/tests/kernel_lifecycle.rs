//! End-to-end kernel lifecycle tests: boot ordering, phased shutdown,
//! forced teardown and fail-closed access.

use async_trait::async_trait;
use keel_core::{
    Caller, CollaboratorError, CoreError, FrontEnd, Kernel, KernelConfig, Role, Service,
    ServiceConfig, ServiceContext, ServiceError, ServiceState, SupervisorPhase, SyscallGateway,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn config(name: &str) -> (KernelConfig, PathBuf) {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let root = std::env::temp_dir().join(format!(
        "keel-kernel-{}-{}-{}",
        name,
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&root);

    let mut config = KernelConfig {
        sandbox_root: root.clone(),
        ..Default::default()
    };
    config.rbac.grants.insert("alice".into(), vec![Role::Admin]);
    config.rbac.grants.insert("planner".into(), vec![Role::Agent]);
    (config, root)
}

fn declare(config: &mut KernelConfig, name: &str, deps: &[&str], stop_timeout_ms: Option<u64>) {
    config.services.push(ServiceConfig {
        name: name.into(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        stop_timeout_ms,
    });
}

#[derive(Default)]
struct Log(Mutex<Vec<String>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

enum StopBehavior {
    Return,
    Sleep(Duration),
    Hang,
    /// Blocks the hook's thread without ever yielding.
    Block(Duration),
}

struct TestService {
    name: &'static str,
    log: Arc<Log>,
    stop: StopBehavior,
    fail_start: bool,
    stops: AtomicUsize,
    warnings: AtomicUsize,
}

impl TestService {
    fn new(name: &'static str, log: &Arc<Log>) -> Self {
        Self {
            name,
            log: Arc::clone(log),
            stop: StopBehavior::Return,
            fail_start: false,
            stops: AtomicUsize::new(0),
            warnings: AtomicUsize::new(0),
        }
    }

    fn stopping(mut self, stop: StopBehavior) -> Self {
        self.stop = stop;
        self
    }
}

#[async_trait]
impl Service for TestService {
    async fn start(&self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        self.log.push(format!("start:{}", self.name));
        if self.fail_start {
            return Err(format!("{} cannot start", self.name).into());
        }
        ctx.sandbox()
            .write_file(&format!("/tmp/{}.started", ctx.name()), &ctx.boot_id().to_string())?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("stop:{}", self.name));
        match self.stop {
            StopBehavior::Return => {}
            StopBehavior::Sleep(d) => tokio::time::sleep(d).await,
            StopBehavior::Hang => std::future::pending::<()>().await,
            StopBehavior::Block(d) => std::thread::sleep(d),
        }
        Ok(())
    }

    async fn on_shutdown_warning(&self) {
        self.warnings.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn boot_follows_dependencies_and_shutdown_reverses_it() {
    let (mut config, root) = config("order");
    declare(&mut config, "B", &[], None);
    declare(&mut config, "A", &["B"], None);
    let log = Arc::new(Log::default());

    let kernel = Kernel::builder(config)
        .service("A", Arc::new(TestService::new("A", &log)))
        .service("B", Arc::new(TestService::new("B", &log)))
        .boot()
        .await
        .expect("kernel should boot");

    assert_eq!(kernel.phase(), SupervisorPhase::Running);
    assert_eq!(log.entries(), vec!["start:B", "start:A"]);

    let report = kernel.shutdown().await;
    assert_eq!(report.order, vec!["A", "B"]);
    assert!(report.is_clean());
    assert_eq!(log.entries(), vec!["start:B", "start:A", "stop:A", "stop:B"]);
    assert_eq!(kernel.phase(), SupervisorPhase::Stopped);

    std::fs::remove_dir_all(root).ok();
}

#[tokio::test]
async fn shutdown_twice_runs_hooks_once() {
    let (config, root) = config("idempotent");
    let log = Arc::new(Log::default());
    let service = Arc::new(TestService::new("only", &log));

    let kernel = Kernel::builder(config)
        .service("only", Arc::clone(&service) as Arc<dyn Service>)
        .boot()
        .await
        .expect("kernel should boot");

    let first = kernel.shutdown().await;
    let second = kernel.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!first.already_stopped);
    assert!(second.already_stopped);
    assert_eq!(service.stops.load(Ordering::SeqCst), 1);
    assert!(service.warnings.load(Ordering::SeqCst) <= 1);

    std::fs::remove_dir_all(root).ok();
}

#[tokio::test]
async fn hanging_stop_is_forced_and_kernel_still_stops() {
    let (mut config, root) = config("force");
    declare(&mut config, "next", &[], Some(500));
    declare(&mut config, "stuck", &["next"], Some(2_000));
    let log = Arc::new(Log::default());

    let kernel = Kernel::builder(config)
        .service(
            "next",
            Arc::new(
                TestService::new("next", &log)
                    .stopping(StopBehavior::Sleep(Duration::from_millis(200))),
            ),
        )
        .service(
            "stuck",
            Arc::new(TestService::new("stuck", &log).stopping(StopBehavior::Hang)),
        )
        .boot()
        .await
        .expect("kernel should boot");
    let board = kernel.status_board();

    let began = Instant::now();
    let report = kernel.shutdown().await;

    assert_eq!(report.order, vec!["stuck", "next"]);
    assert_eq!(report.forced, vec!["stuck"]);
    assert_eq!(report.stopped, vec!["next"]);
    assert!(matches!(
        &report.failed[..],
        [CoreError::ShutdownTimeout { service, timeout }]
            if service == "stuck" && *timeout == Duration::from_secs(2)
    ));

    let history = board.history("stuck");
    let forced_at = history
        .iter()
        .find(|s| s.state == ServiceState::Force)
        .expect("stuck service should pass through Force")
        .since;
    let waited = forced_at.duration_since(began);
    assert!(waited >= Duration::from_secs(2), "forced too early: {waited:?}");
    assert!(waited < Duration::from_secs(3), "forced too late: {waited:?}");

    // The next service got its own full budget and stopped cleanly.
    assert_eq!(board.state("next"), Some(ServiceState::Stopped));
    assert_eq!(board.state("stuck"), Some(ServiceState::Stopped));
    assert_eq!(kernel.phase(), SupervisorPhase::Stopped);
    assert!(report.elapsed < Duration::from_secs(4));

    std::fs::remove_dir_all(root).ok();
}

async fn blocked_stop_is_forced(label: &str) {
    let (mut config, root) = config(label);
    declare(&mut config, "next", &[], Some(1_000));
    declare(&mut config, "blocked", &["next"], Some(500));
    let log = Arc::new(Log::default());

    let kernel = Kernel::builder(config)
        .service(
            "next",
            Arc::new(
                TestService::new("next", &log)
                    .stopping(StopBehavior::Sleep(Duration::from_millis(100))),
            ),
        )
        .service(
            "blocked",
            Arc::new(
                TestService::new("blocked", &log)
                    .stopping(StopBehavior::Block(Duration::from_secs(10))),
            ),
        )
        .boot()
        .await
        .expect("kernel should boot");
    let board = kernel.status_board();

    let began = Instant::now();
    let report = kernel.shutdown().await;

    assert_eq!(report.forced, vec!["blocked"]);
    assert_eq!(report.stopped, vec!["next"]);
    assert!(matches!(
        &report.failed[..],
        [CoreError::ShutdownTimeout { service, .. }] if service == "blocked"
    ));

    let forced_at = board
        .history("blocked")
        .iter()
        .find(|s| s.state == ServiceState::Force)
        .expect("blocked service should pass through Force")
        .since;
    let waited = forced_at.duration_since(began);
    assert!(waited >= Duration::from_millis(500), "forced too early: {waited:?}");
    assert!(waited < Duration::from_millis(1_500), "forced too late: {waited:?}");

    assert_eq!(board.state("next"), Some(ServiceState::Stopped));
    assert_eq!(kernel.phase(), SupervisorPhase::Stopped);
    assert!(report.elapsed < Duration::from_secs(3));

    std::fs::remove_dir_all(root).ok();
}

#[tokio::test(flavor = "current_thread")]
async fn blocking_stop_is_forced_on_current_thread_runtime() {
    blocked_stop_is_forced("block-current").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn blocking_stop_is_forced_with_one_worker() {
    blocked_stop_is_forced("block-worker").await;
}

#[tokio::test]
async fn unauthenticated_callers_get_nothing() {
    let (config, root) = config("auth");
    let kernel = Kernel::boot(config).await.expect("kernel should boot");
    let gateway = kernel.gateway();

    gateway
        .write_file(&Caller::identity("alice"), "/home/secret.txt", "s3cret")
        .expect("admin write should succeed");

    for caller in [
        Caller::Anonymous,
        Caller::identity(""),
        Caller::identity("root"),
        Caller::identity("admin"),
        Caller::from_optional(None),
    ] {
        assert!(gateway
            .read_file(&caller, "/home/secret.txt")
            .unwrap_err()
            .is_access_denied());
        assert!(gateway
            .run_process(&caller, "true", &[], &Default::default())
            .unwrap_err()
            .is_access_denied());
        assert!(gateway.set_network(&caller, true).unwrap_err().is_access_denied());
    }

    let planner = Caller::identity("planner");
    assert_eq!(
        gateway.read_file(&planner, "/home/secret.txt").unwrap(),
        "s3cret"
    );
    assert!(gateway
        .container_list(&planner)
        .unwrap_err()
        .is_access_denied());

    kernel.shutdown().await;
    std::fs::remove_dir_all(root).ok();
}

#[tokio::test]
async fn services_and_gateway_share_one_sandbox() {
    let (config, root) = config("shared");
    let log = Arc::new(Log::default());

    let kernel = Kernel::builder(config)
        .service("writer", Arc::new(TestService::new("writer", &log)))
        .boot()
        .await
        .expect("kernel should boot");

    let alice = Caller::identity("alice");
    let gateway = kernel.gateway();
    let boot_id = gateway.read_file(&alice, "/tmp/writer.started").unwrap();
    assert_eq!(boot_id, kernel.boot_id().to_string());

    for mount in ["home", "tmp", "var/log/journal"] {
        assert!(kernel.sandbox_root().join(mount).is_dir(), "missing mount {mount}");
    }
    assert!(gateway
        .read_file(&alice, "/../../etc/passwd")
        .unwrap_err()
        .is_access_denied());

    kernel.shutdown().await;
    assert!(!gateway.is_online());
    assert!(matches!(
        gateway.read_file(&alice, "/tmp/writer.started"),
        Err(CoreError::InvalidState { .. })
    ));

    std::fs::remove_dir_all(root).ok();
}

#[tokio::test]
async fn failed_start_unwinds_and_fails_boot() {
    let (mut config, root) = config("rollback");
    declare(&mut config, "db", &[], None);
    declare(&mut config, "api", &["db"], None);
    let log = Arc::new(Log::default());

    let mut api = TestService::new("api", &log);
    api.fail_start = true;

    let err = Kernel::builder(config)
        .service("db", Arc::new(TestService::new("db", &log)))
        .service("api", Arc::new(api))
        .boot()
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::StartupFailure { ref service, .. } if service == "api"));
    assert_eq!(log.entries(), vec!["start:db", "start:api", "stop:db"]);

    std::fs::remove_dir_all(root).ok();
}

#[tokio::test]
async fn dependency_cycle_is_a_configuration_error() {
    let (mut config, root) = config("cycle");
    declare(&mut config, "a", &["b"], None);
    declare(&mut config, "b", &["a"], None);
    let log = Arc::new(Log::default());

    let err = Kernel::builder(config)
        .service("a", Arc::new(TestService::new("a", &log)))
        .service("b", Arc::new(TestService::new("b", &log)))
        .boot()
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert!(matches!(err, CoreError::DependencyCycle(ref names) if names.len() == 2));
    assert!(log.entries().is_empty());

    std::fs::remove_dir_all(root).ok();
}

#[tokio::test]
async fn declared_service_must_be_provided() {
    let (mut config, root) = config("missing");
    declare(&mut config, "ghost", &[], None);

    let err = Kernel::boot(config).await.unwrap_err();
    assert!(matches!(err, CoreError::Configuration(ref msg) if msg.contains("ghost")));

    std::fs::remove_dir_all(root).ok();
}

#[derive(Default)]
struct RecordingFrontEnd {
    refuse: bool,
    gateway: Mutex<Option<Arc<SyscallGateway>>>,
    detached: AtomicBool,
}

impl FrontEnd for RecordingFrontEnd {
    fn attach(&self, gateway: Arc<SyscallGateway>) -> Result<(), CollaboratorError> {
        if self.refuse {
            return Err("display unavailable".into());
        }
        *self.gateway.lock().unwrap() = Some(gateway);
        Ok(())
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.gateway.lock().unwrap().take();
    }
}

#[tokio::test]
async fn front_end_attached_last_and_detached_first() {
    let (config, root) = config("frontend");
    let front_end = Arc::new(RecordingFrontEnd::default());

    let kernel = Kernel::builder(config)
        .front_end(Arc::clone(&front_end) as Arc<dyn FrontEnd>)
        .boot()
        .await
        .expect("kernel should boot");

    let attached = front_end.gateway.lock().unwrap().clone().unwrap();
    assert!(attached.is_online());

    kernel.shutdown().await;
    assert!(front_end.detached.load(Ordering::SeqCst));
    assert!(!attached.is_online());

    std::fs::remove_dir_all(root).ok();
}

#[tokio::test]
async fn front_end_refusal_shuts_services_down() {
    let (config, root) = config("frontend-refused");
    let log = Arc::new(Log::default());
    let front_end = Arc::new(RecordingFrontEnd {
        refuse: true,
        ..Default::default()
    });

    let err = Kernel::builder(config)
        .service("svc", Arc::new(TestService::new("svc", &log)))
        .front_end(front_end)
        .boot()
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Collaborator { collaborator: "front-end", .. }));
    assert_eq!(log.entries(), vec!["start:svc", "stop:svc"]);

    std::fs::remove_dir_all(root).ok();
}
