//! keel-daemon: boots the keel kernel and serves its gateway.
//!
//! Loads the kernel configuration, registers the journal service, attaches a
//! Unix-socket JSON-RPC front-end and shuts everything down on Ctrl-C.

mod config;
mod handler;
mod journal;
mod protocol;
mod server;

use anyhow::Context;
use config::DaemonConfig;
use journal::{JournalService, JOURNAL_SERVICE};
use keel_core::Kernel;
use server::SocketFrontEnd;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log to stderr; stdout stays free for tooling.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("keel_daemon=info".parse()?)
                .add_directive("keel_core=info".parse()?),
        )
        .init();

    info!("keel-daemon starting...");

    let config = DaemonConfig::from_env().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    info!(
        sandbox_root = %config.kernel.sandbox_root.display(),
        socket = %config.socket_path.display(),
        services = config.kernel.services.len(),
        "configuration loaded"
    );

    let front_end = Arc::new(SocketFrontEnd::new(&config.socket_path));
    let kernel = Kernel::builder(config.kernel)
        .service(JOURNAL_SERVICE, Arc::new(JournalService::new()))
        .front_end(front_end)
        .boot()
        .await
        .context("kernel failed to boot")?;

    info!(boot_id = %kernel.boot_id(), "keel-daemon ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal");

    let report = kernel.shutdown().await;
    for failure in &report.failed {
        warn!(error = %failure, "shutdown diagnostic");
    }
    info!(
        elapsed_ms = report.elapsed.as_millis() as u64,
        clean = report.is_clean(),
        "keel-daemon stopped"
    );

    Ok(())
}
