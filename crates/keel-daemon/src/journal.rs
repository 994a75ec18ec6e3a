//! Kernel journal service.
//!
//! Appends one line per lifecycle event to a log file inside the sandbox.

use async_trait::async_trait;
use keel_core::{Service, ServiceContext, ServiceError};
use keel_sandbox::Sandbox;
use std::sync::{Arc, Mutex};

/// Virtual path of the kernel journal.
pub const JOURNAL_PATH: &str = "/var/log/journal/kernel.log";

/// Service name used in the kernel configuration.
pub const JOURNAL_SERVICE: &str = "journal";

/// Writes boot and shutdown lines to [`JOURNAL_PATH`].
#[derive(Default)]
pub struct JournalService {
    sandbox: Mutex<Option<(Arc<Sandbox>, String)>>,
}

impl JournalService {
    pub fn new() -> Self {
        Self::default()
    }
}

fn line(event: &str, boot_id: &str) -> String {
    format!(
        "{} [{}] {}\n",
        chrono::Utc::now().to_rfc3339(),
        boot_id,
        event
    )
}

#[async_trait]
impl Service for JournalService {
    async fn start(&self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        let boot_id = ctx.boot_id().to_string();
        ctx.sandbox()
            .append_file(JOURNAL_PATH, &line("kernel boot", &boot_id))?;
        *self.sandbox.lock().map_err(|e| e.to_string())? =
            Some((Arc::clone(ctx.sandbox()), boot_id));
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        let held = self.sandbox.lock().map_err(|e| e.to_string())?.take();
        if let Some((sandbox, boot_id)) = held {
            sandbox.append_file(JOURNAL_PATH, &line("kernel shutdown", &boot_id))?;
        }
        Ok(())
    }

    async fn on_shutdown_warning(&self) {
        tracing::debug!("journal: shutdown warning received");
    }
}
