mod list;
mod restart;
mod run;
mod shutdown;

pub use list::run_list;
pub use restart::run_restart;
pub use run::run_node_command;
pub use shutdown::run_shutdown;

use service_hive::protocol::Response;

/// Error for a response of the wrong kind.
pub(crate) fn unexpected(node: &str, response: &Response) -> anyhow::Error {
    anyhow::anyhow!("Unexpected response from {}: {:?}", node, response)
}
