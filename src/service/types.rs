use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a supervised process.
///
/// # State Transitions
///
/// ```text
/// Initialized ──► Running ──► Stable
///                  ▲  │         │
///                  │  ▼         ▼
///             Restarting ◄── Failed
///
/// any non-terminal state ──► Killed
/// ```
///
/// `Killed` is only left through an explicit operator restart; the
/// supervisor itself never restarts a killed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Configured but never started
    Initialized,
    /// Process is running, still inside the stability window
    Running,
    /// Process has run past the stability window without exiting
    Stable,
    /// Process exited without being asked to
    Failed,
    /// A restart is in flight
    Restarting,
    /// Process was stopped on request and will not be restarted automatically
    Killed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Initialized => "initialized",
            Status::Running => "running",
            Status::Stable => "stable",
            Status::Failed => "failed",
            Status::Restarting => "restarting",
            Status::Killed => "killed",
        }
    }

    /// Whether an OS process is expected to exist in this state.
    pub fn is_alive(&self) -> bool {
        matches!(self, Status::Running | Status::Stable)
    }

    /// Check if a status transition is valid according to the state machine.
    ///
    /// # Examples
    ///
    /// ```
    /// use service_hive::service::Status;
    ///
    /// assert!(Status::Initialized.is_valid_transition(Status::Running));
    /// assert!(Status::Failed.is_valid_transition(Status::Restarting));
    /// assert!(!Status::Initialized.is_valid_transition(Status::Stable));
    /// ```
    pub fn is_valid_transition(&self, to: Status) -> bool {
        use Status::*;
        match (self, to) {
            (Initialized, Running) => true,

            (Running, Stable) => true,
            (Running | Stable, Failed) => true,
            (Running | Stable, Restarting) => true,

            // Manual restart of a failed or killed process goes through Restarting too
            (Failed | Killed, Restarting) => true,

            (Restarting, Running) => true,
            // The relaunch itself can fail
            (Restarting, Failed) => true,

            (s, Killed) => *s != Killed,

            (s1, s2) if *s1 == s2 => true,

            _ => false,
        }
    }
}

/// Point-in-time view of a supervised process, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub status: Status,
    pub start_time: Option<DateTime<Utc>>,
    pub death_time: Option<DateTime<Utc>>,
    /// -1 when no process is running
    pub pid: i32,
    /// Automatic restarts in the current crash run
    pub restart_count: u32,
    /// Failures that led to an automatic restart
    pub fail_count: u32,
    /// Restarts requested by a caller
    pub manual_restarts: u32,
    pub errors: Vec<String>,
}
