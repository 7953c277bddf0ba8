//! # Service Hive
//!
//! A runtime that keeps service processes alive across a tree of nodes.
//!
//! ## Roles
//!
//! - **Core**: the top node. Services and process managers register with it
//!   and keep their registration alive with heartbeats.
//! - **Process manager (procm)**: registers with a core, accepts remote
//!   agents as children and forwards operator actions to them.
//! - **Remote agent**: supervises local service processes, restarting them
//!   within a retry budget, and reports to its parent.
//!
//! Nodes talk a newline-delimited JSON protocol over TCP; see [`protocol`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use service_hive::{NodeConfig, Role};
//!
//! # async fn example() -> Result<(), service_hive::Error> {
//! let mut config = NodeConfig::new(Role::Remote, "agent-a");
//! config.listen = Some("127.0.0.1:7700".into());
//! config.manifest_dir = Some("services".into());
//!
//! let node = service_hive::start_node(config).await?;
//! node.stopped().await;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod orchestrator;
pub mod port;
pub mod protocol;
pub mod registry;
pub mod service;

// Re-export commonly used types
pub use config::{NodeConfig, Parser, Role, ServiceManifest};
pub use error::{Error, Result};
pub use orchestrator::{run_node, start_node, RunningNode};
pub use registry::Registry;
pub use service::{Status, Supervisor, SupervisorPolicy};
