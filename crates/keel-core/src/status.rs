//! Observable lifecycle state for the supervisor and its services.
//!
//! The supervisor is the only writer. Everyone else gets a cheap clone of
//! the [`StatusBoard`] and reads from it, even while a shutdown is running.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// Lifecycle state of one service. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Pending,
    Started,
    Warning,
    Graceful,
    Force,
    Stopped,
    /// The start hook failed. Terminal.
    Failed,
}

impl ServiceState {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Started => 1,
            Self::Warning => 2,
            Self::Graceful => 3,
            Self::Force => 4,
            Self::Stopped | Self::Failed => 5,
        }
    }

    /// True for `Stopped` and `Failed`.
    pub fn is_terminal(self) -> bool {
        self.rank() == 5
    }

    /// Whether `self -> next` is a forward transition.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Warning => "warning",
            Self::Graceful => "graceful",
            Self::Force => "force",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the supervisor as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorPhase {
    #[default]
    Idle,
    Booting,
    Running,
    Warning,
    Graceful,
    Force,
    Cleanup,
    Stopped,
}

impl SupervisorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Warning => "warning",
            Self::Graceful => "graceful",
            Self::Force => "force",
            Self::Cleanup => "cleanup",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of a service and when it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub since: Instant,
}

#[derive(Debug)]
struct ServiceRecord {
    history: Vec<ServiceStatus>,
}

impl ServiceRecord {
    fn current(&self) -> ServiceStatus {
        // history is never empty: records are created with a Pending entry
        self.history[self.history.len() - 1]
    }
}

#[derive(Debug, Default)]
struct Board {
    phase: SupervisorPhase,
    services: HashMap<String, ServiceRecord>,
}

/// Shared, read-mostly view of lifecycle state.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Board>>,
}

impl StatusBoard {
    /// Create an empty board in the `Idle` phase.
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the board half-written,
    // so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Board> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Board> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Supervisor phase.
    pub fn phase(&self) -> SupervisorPhase {
        self.read().phase
    }

    /// Current state of a service.
    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.status(name).map(|s| s.state)
    }

    /// Current state of a service and when it was entered.
    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.read().services.get(name).map(ServiceRecord::current)
    }

    /// Every state a service has been in, oldest first.
    pub fn history(&self, name: &str) -> Vec<ServiceStatus> {
        self.read()
            .services
            .get(name)
            .map(|r| r.history.clone())
            .unwrap_or_default()
    }

    /// Current state of every service, by name.
    pub fn snapshot(&self) -> BTreeMap<String, ServiceState> {
        self.read()
            .services
            .iter()
            .map(|(name, record)| (name.clone(), record.current().state))
            .collect()
    }

    pub(crate) fn set_phase(&self, phase: SupervisorPhase) {
        let mut board = self.write();
        tracing::debug!(from = %board.phase, to = %phase, "supervisor phase");
        board.phase = phase;
    }

    pub(crate) fn register(&self, name: &str) {
        self.write().services.insert(
            name.to_string(),
            ServiceRecord {
                history: vec![ServiceStatus {
                    state: ServiceState::Pending,
                    since: Instant::now(),
                }],
            },
        );
    }

    /// Record a transition. Backward or repeated transitions are refused.
    pub(crate) fn transition(&self, name: &str, next: ServiceState) -> bool {
        let mut board = self.write();
        let Some(record) = board.services.get_mut(name) else {
            tracing::warn!(service = %name, state = %next, "transition for unknown service");
            return false;
        };

        let current = record.current().state;
        if !current.can_transition_to(next) {
            tracing::warn!(
                service = %name,
                from = %current,
                to = %next,
                "refused state regression"
            );
            return false;
        }

        record.history.push(ServiceStatus {
            state: next,
            since: Instant::now(),
        });
        tracing::debug!(service = %name, from = %current, to = %next, "service state");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let board = StatusBoard::new();
        board.register("db");

        for state in [
            ServiceState::Started,
            ServiceState::Warning,
            ServiceState::Graceful,
            ServiceState::Stopped,
        ] {
            assert!(board.transition("db", state));
        }
        assert_eq!(board.state("db"), Some(ServiceState::Stopped));

        let states: Vec<_> = board.history("db").iter().map(|s| s.state).collect();
        assert_eq!(
            states,
            vec![
                ServiceState::Pending,
                ServiceState::Started,
                ServiceState::Warning,
                ServiceState::Graceful,
                ServiceState::Stopped
            ]
        );
    }

    #[test]
    fn test_no_regression() {
        let board = StatusBoard::new();
        board.register("db");
        assert!(board.transition("db", ServiceState::Started));
        assert!(board.transition("db", ServiceState::Stopped));

        assert!(!board.transition("db", ServiceState::Started));
        assert!(!board.transition("db", ServiceState::Stopped));
        assert!(!board.transition("db", ServiceState::Failed));
        assert_eq!(board.state("db"), Some(ServiceState::Stopped));
    }

    #[test]
    fn test_failed_is_terminal() {
        let board = StatusBoard::new();
        board.register("db");
        assert!(board.transition("db", ServiceState::Failed));
        assert!(!board.transition("db", ServiceState::Stopped));
        assert!(ServiceState::Failed.is_terminal());
    }

    #[test]
    fn test_clones_share_state() {
        let board = StatusBoard::new();
        let observer = board.clone();
        board.register("db");
        board.set_phase(SupervisorPhase::Running);

        assert_eq!(observer.phase(), SupervisorPhase::Running);
        assert_eq!(observer.snapshot().get("db"), Some(&ServiceState::Pending));
        assert!(observer.state("missing").is_none());
        assert!(!board.transition("missing", ServiceState::Started));
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(serde_json::to_string(&ServiceState::Force).unwrap(), "\"force\"");
        assert_eq!(
            serde_json::to_string(&SupervisorPhase::Cleanup).unwrap(),
            "\"cleanup\""
        );
    }
}
