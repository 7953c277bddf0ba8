//! Node roles and the wiring that runs them.
//!
//! - [`RemoteAgent`] supervises service processes
//! - [`ProcessManager`] supervises remote agents through its registry
//! - [`CoreNode`] is the top node that services and managers register with
//!
//! [`start_node`] builds whichever role the config names; [`run_node`]
//! also waits for a stop request and runs the [`ShutdownSequence`].

mod context;
mod core;
mod fanout;
mod node;
mod procm;
mod registrar;
mod remote;
mod services;
mod shutdown;

pub use context::NodeContext;
pub use core::CoreNode;
pub use fanout::Subordinates;
pub use node::{run_node, start_node, RunningNode};
pub use procm::ProcessManager;
pub use registrar::RegistrarHandler;
pub use remote::RemoteAgent;
pub use services::{ServiceSet, PARENT_ADDR_ENV, SUPERVISED_BY_ENV};
pub use shutdown::{ShutdownOutcome, ShutdownSequence};
