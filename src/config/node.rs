//! Node configuration.
//!
//! One YAML file per node. Only `role` and `name` are required; every timing
//! has a default matching the control protocol's documented cadence.
//!
//! ```yaml
//! role: remote
//! name: host-a
//! parent: 127.0.0.1:7600
//! manifest_dir: ./services
//! heartbeat_interval: 45s
//! ports:
//!   host: 127.0.0.1
//!   low: 20000
//!   high: 21000
//! supervisor:
//!   retry_budget: 3
//!   backoff: 2s
//! ```

use super::duration::humane;
use crate::error::{Error, Result};
use crate::service::SupervisorPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which part of the hierarchy a node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Top-level registry for services on the same host.
    Core,
    /// Middle tier that supervises remote agents.
    Procm,
    /// Owns and supervises actual service processes.
    Remote,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Core => write!(f, "core"),
            Role::Procm => write!(f, "procm"),
            Role::Remote => write!(f, "remote"),
        }
    }
}

/// What a child does after its parent announces that it is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParentShutdownPolicy {
    /// The child is managed by the parent and shuts down with it.
    #[default]
    Exit,
    /// The child is standalone and keeps trying to register again.
    Reconnect,
}

/// When an existing registry slot may be handed to a new registrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Reclaim slots marked shutdown, and slots whose holder fails a liveness probe.
    #[default]
    OnUnreachable,
    /// Only reclaim slots whose holder reported shutdown.
    Never,
}

/// Port range the registry hands addresses out of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRange {
    #[serde(default = "default_host")]
    pub host: String,
    pub low: u16,
    pub high: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            host: default_host(),
            low: 20000,
            high: 30000,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: Role,

    /// Name this node registers under with its parent.
    pub name: String,

    /// Control listener address. Required for core and procm; optional for a
    /// remote agent, which also listens on the address its parent assigns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// Parent control address to register with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Address handed to supervised services via `HIVE_PARENT_ADDR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_parent: Option<String>,

    /// Directory scanned for service manifests at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_dir: Option<PathBuf>,

    #[serde(default = "default_heartbeat_interval", with = "humane")]
    pub heartbeat_interval: Duration,

    #[serde(default = "default_registration_retry", with = "humane")]
    pub registration_retry: Duration,

    #[serde(default = "default_reconnect_delay", with = "humane")]
    pub reconnect_delay: Duration,

    /// Timeout for forwarded actions and other single control calls.
    #[serde(default = "default_call_timeout", with = "humane")]
    pub call_timeout: Duration,

    /// Per-target timeout for shutdown notices and the final goodbye.
    #[serde(default = "default_notice_timeout", with = "humane")]
    pub shutdown_notice_timeout: Duration,

    #[serde(default)]
    pub ports: PortRange,

    #[serde(default)]
    pub supervisor: SupervisorPolicy,

    #[serde(default)]
    pub on_parent_shutdown: ParentShutdownPolicy,

    #[serde(default)]
    pub reclaim: ReclaimPolicy,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(45)
}

fn default_registration_retry() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_notice_timeout() -> Duration {
    Duration::from_millis(500)
}

impl NodeConfig {
    /// A config with every default applied; mostly useful for tests and embedding.
    pub fn new(role: Role, name: impl Into<String>) -> Self {
        Self {
            role,
            name: name.into(),
            listen: None,
            parent: None,
            service_parent: None,
            manifest_dir: None,
            heartbeat_interval: default_heartbeat_interval(),
            registration_retry: default_registration_retry(),
            reconnect_delay: default_reconnect_delay(),
            call_timeout: default_call_timeout(),
            shutdown_notice_timeout: default_notice_timeout(),
            ports: PortRange::default(),
            supervisor: SupervisorPolicy::default(),
            on_parent_shutdown: ParentShutdownPolicy::default(),
            reclaim: ReclaimPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("node name must not be empty".to_string()));
        }
        if matches!(self.role, Role::Core | Role::Procm) && self.listen.is_none() {
            return Err(Error::Config(format!(
                "a {} node needs a `listen` address",
                self.role
            )));
        }
        if self.role == Role::Remote && self.listen.is_none() && self.parent.is_none() {
            return Err(Error::Config(
                "a remote agent needs a `listen` address, a `parent`, or both".to_string(),
            ));
        }
        if self.ports.low >= self.ports.high {
            return Err(Error::Config(format!(
                "port range {}..{} is empty",
                self.ports.low, self.ports.high
            )));
        }
        if self.registration_retry.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(Error::Config(
                "registration_retry and heartbeat_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
