//! Control-plane messages exchanged between nodes and the operator CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Reason carried by `UpdateRegistration` when the parent is going away.
pub const CORE_SHUTDOWN: &str = "core.shutdown";

/// Machine-readable error class carried in [`Response::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    DuplicateName,
    AliasCollision,
    FingerprintMismatch,
    AlreadyShutdown,
    Unavailable,
    Exhausted,
    Conflict,
    InvalidRequest,
    Unsupported,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::DuplicateName => "duplicate_name",
            ErrorCode::AliasCollision => "alias_collision",
            ErrorCode::FingerprintMismatch => "fingerprint_mismatch",
            ErrorCode::AlreadyShutdown => "already_shutdown",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Exhausted => "exhausted",
            ErrorCode::Conflict => "conflict",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a registered entity is supervised by the node that holds its
/// record, or attached from elsewhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Managed,
    Remote,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Managed => f.write_str("managed"),
            Mode::Remote => f.write_str("remote"),
        }
    }
}

/// Which services an action or summary applies to.
///
/// On the wire and on the command line this is either `all` or an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Target {
    All,
    One(String),
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" => Err(Error::InvalidTarget(s.to_string())),
            "all" => Ok(Target::All),
            id if id.chars().any(char::is_whitespace) => {
                Err(Error::InvalidTarget(id.to_string()))
            }
            id => Ok(Target::One(id.to_string())),
        }
    }
}

impl TryFrom<String> for Target {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Target> for String {
    fn from(target: Target) -> Self {
        target.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => f.write_str("all"),
            Target::One(id) => f.write_str(id),
        }
    }
}

/// Join a parent-assigned id and a locally assigned service id.
pub fn compound_id(parent: &str, service: &str) -> String {
    format!("{}-{}", parent, service)
}

/// Split `<parentID>-<serviceID>` at the first dash. The service part may
/// itself be compound when more than two tiers are involved.
pub fn split_compound(id: &str) -> Option<(&str, &str)> {
    id.split_once('-')
        .filter(|(parent, service)| !parent.is_empty() && !service.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Restart,
    /// Stop auto-restarting on next exit; processes are left running
    GracefulShutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Child asks its parent for an identity.
    Register {
        name: String,
        #[serde(default)]
        aliases: Vec<String>,
        #[serde(default)]
        mode: Mode,
    },
    /// Heartbeat from a registered child.
    Alive {
        id: u64,
        name: String,
        fingerprint: String,
        timestamp: DateTime<Utc>,
    },
    /// Parent tells a child its registration is changing, e.g. `core.shutdown`.
    UpdateRegistration { reason: String },
    NotifyAction { action: Action, target: Target },
    Summary { target: Target },
    StopServer,
    Ping,
    /// Child tells its parent it has shut down.
    NotifyShutdown { name: String, fingerprint: String },
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Register { .. } => "register",
            Request::Alive { .. } => "alive",
            Request::UpdateRegistration { .. } => "update_registration",
            Request::NotifyAction { .. } => "notify_action",
            Request::Summary { .. } => "summary",
            Request::StopServer => "stop_server",
            Request::Ping => "ping",
            Request::NotifyShutdown { .. } => "notify_shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartOutcome {
    pub id: String,
    /// -1 if the restart failed
    pub pid: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Registered {
        id: u64,
        address: String,
        fingerprint: String,
    },
    Ack,
    Pong,
    Restarted { services: Vec<RestartOutcome> },
    Summary { services: Vec<ServiceRecord> },
    Message { text: String },
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Rejected { code, message } => Response::Error {
                code: *code,
                message: message.clone(),
            },
            other => Response::Error {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }

    /// Turn an error response into [`Error::Rejected`].
    pub fn into_result(self) -> crate::Result<Response> {
        match self {
            Response::Error { code, message } => Err(Error::Rejected { code, message }),
            other => Ok(other),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Response::Message { text: text.into() }
    }
}

/// Outward view of one supervised service or attached node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub status: String,
    /// When `status` last changed, for registry entries
    #[serde(default)]
    pub state_updated: Option<DateTime<Utc>>,
    pub pid: i32,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fail_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub fail_count: u32,
    #[serde(default)]
    pub errors: Vec<String>,
    pub mode: Mode,
}

impl ServiceRecord {
    /// Placeholder for a subordinate that could not be asked for its summary.
    pub fn unreachable(id: impl Into<String>, name: impl Into<String>, err: &Error) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            aliases: Vec::new(),
            address: None,
            status: "unreachable".to_string(),
            state_updated: None,
            pid: -1,
            start_time: None,
            fail_time: None,
            restart_count: 0,
            fail_count: 0,
            errors: vec![err.to_string()],
            mode: Mode::Remote,
        }
    }

    /// Prefix the id with the id of the node that reported it.
    pub fn under_parent(mut self, parent: &str) -> Self {
        self.id = compound_id(parent, &self.id);
        self
    }
}
