// thiserror's codegen for struct variants trips this lint
#![allow(unused_assignments)]

use crate::protocol::ErrorCode;
use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(hive::config::error),
        help("Check the node config file and the service manifests it points at")
    )]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Service '{service}' failed to launch: {reason}")]
    #[diagnostic(
        code(hive::process::launch),
        help("Check that the binary exists and is executable")
    )]
    Launch { service: String, reason: String },

    #[error("Process error: {0}")]
    #[diagnostic(code(hive::process::error))]
    Process(String),

    #[error("Service '{0}' is already restarting")]
    #[diagnostic(code(hive::process::restart_in_progress))]
    RestartInProgress(String),

    #[error("Service '{0}' was never started")]
    #[diagnostic(code(hive::process::not_started))]
    NotStarted(String),

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(hive::service::not_found),
        help("List known services with `hive list`")
    )]
    ServiceNotFound(String),

    #[error("Unknown identity '{0}'")]
    #[diagnostic(code(hive::registry::unknown))]
    UnknownIdentity(String),

    #[error("Name '{0}' is already registered by a live holder")]
    #[diagnostic(
        code(hive::registry::duplicate),
        help("Stop the running instance first, or register under a different name")
    )]
    DuplicateName(String),

    #[error("Alias '{alias}' is already taken by '{owner}'")]
    #[diagnostic(code(hive::registry::alias_collision))]
    AliasCollision { alias: String, owner: String },

    #[error("Fingerprint mismatch for '{0}'")]
    #[diagnostic(
        code(hive::registry::fingerprint),
        help("The registration was superseded; the holder must register again")
    )]
    FingerprintMismatch(String),

    #[error("'{0}' has already shut down")]
    #[diagnostic(code(hive::registry::shutdown))]
    AlreadyShutdown(String),

    #[error("Address range {low}..{high} is exhausted")]
    #[diagnostic(
        code(hive::port::exhausted),
        help("Widen the `ports` range in the node config, or restart the node")
    )]
    AddressExhausted { low: u16, high: u16 },

    #[error("Peer '{0}' is unavailable")]
    #[diagnostic(code(hive::transport::unavailable))]
    Unavailable(String),

    #[error("Timeout waiting for '{0}'")]
    #[diagnostic(code(hive::transport::timeout))]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote rejected request ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: i32, reason: String },

    #[error("Invalid target '{0}'")]
    #[diagnostic(
        code(hive::target::invalid),
        help("Targets are `all`, a service id, or `<parentID>-<serviceID>`")
    )]
    InvalidTarget(String),

    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wire code used when this error is returned to a remote caller.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ServiceNotFound(_) | Error::UnknownIdentity(_) => ErrorCode::NotFound,
            Error::DuplicateName(_) => ErrorCode::DuplicateName,
            Error::AliasCollision { .. } => ErrorCode::AliasCollision,
            Error::FingerprintMismatch(_) => ErrorCode::FingerprintMismatch,
            Error::AlreadyShutdown(_) => ErrorCode::AlreadyShutdown,
            Error::AddressExhausted { .. } => ErrorCode::Exhausted,
            Error::Unavailable(_) | Error::Timeout(_) => ErrorCode::Unavailable,
            Error::RestartInProgress(_) | Error::NotStarted(_) => ErrorCode::Conflict,
            Error::InvalidTarget(_) | Error::Parse(_) => ErrorCode::InvalidRequest,
            Error::Rejected { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether the operation may succeed if simply tried again later.
    ///
    /// Only "the other side is not there" qualifies. Everything else (a
    /// duplicate name, a bad fingerprint) is a decision the peer made.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Unavailable(_) | Error::Timeout(_) => true,
            Error::Rejected { code, .. } => *code == ErrorCode::Unavailable,
            _ => false,
        }
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::ServiceNotFound(id) => Some(format!(
                "No service '{}' is known to this node. Check `hive list` for valid ids.",
                id
            )),
            Error::Launch { .. } => {
                Some("Check that the command exists and is executable".to_string())
            }
            Error::Unavailable(addr) => Some(format!(
                "Nothing answered at {}. Is the node running and is --node correct?",
                addr
            )),
            Error::DuplicateName(name) => Some(format!(
                "Another live instance holds '{}'. Stop it before starting a new one.",
                name
            )),
            Error::AddressExhausted { .. } => {
                Some("Widen the `ports` range in the node config.".to_string())
            }
            Error::Config(_) => Some("Validate the node config file and manifests.".to_string()),
            Error::InvalidTarget(_) => {
                Some("Use `all`, a service id, or `<parentID>-<serviceID>`.".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

/// Validates a supervisor PID before it is used as a signal target.
/// Rejects "no process" (-1 and other negatives), PID 0 (process group) and PID 1 (init).
pub fn validate_pid(pid: i32, service_name: &str) -> Result<nix::unistd::Pid> {
    if pid < 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("service '{}' has no running process", service_name),
        });
    }
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for service '{}' (refers to process group, not a process)",
                service_name
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "refusing to operate on PID 1 (init) for service '{}'",
                service_name
            ),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_pid_rejects_reserved_values() {
        assert!(validate_pid(-1, "svc").is_err());
        assert!(validate_pid(0, "svc").is_err());
        assert!(validate_pid(1, "svc").is_err());
        assert_eq!(validate_pid(4242, "svc").unwrap().as_raw(), 4242);
    }

    #[test]
    fn only_unavailability_is_retryable() {
        assert!(Error::Unavailable("127.0.0.1:1".into()).is_retryable());
        assert!(Error::Rejected {
            code: ErrorCode::Unavailable,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!Error::DuplicateName("a".into()).is_retryable());
        assert!(!Error::Rejected {
            code: ErrorCode::DuplicateName,
            message: "a".into()
        }
        .is_retryable());
    }

    #[test]
    fn codes_survive_a_round_trip_through_rejected() {
        let err = Error::AliasCollision {
            alias: "a1".into(),
            owner: "A".into(),
        };
        let rejected = Error::Rejected {
            code: err.code(),
            message: err.to_string(),
        };
        assert_eq!(rejected.code(), ErrorCode::AliasCollision);
    }

    #[test]
    fn multiple_lists_every_failure() {
        let err = Error::Multiple(vec![
            Error::Process("'a' (PID 10) survived SIGKILL".into()),
            Error::Process("'b' (PID 11) survived SIGKILL".into()),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("Multiple errors occurred:"));
        assert!(text.contains("  - Process error: 'a' (PID 10) survived SIGKILL"));
        assert!(text.contains("'b' (PID 11)"));
        assert_eq!(err.code(), ErrorCode::Internal);
    }
}
