use clap::{Parser, Subcommand};
use service_hive::config::parse_duration;
use std::path::PathBuf;
use std::time::Duration;

/// Control address `list`, `restart` and `shutdown` talk to by default.
pub const DEFAULT_NODE: &str = "127.0.0.1:7600";

#[derive(Parser)]
#[command(name = "hive")]
#[command(about = "Service Hive - Supervise services across core, process-manager and agent nodes")]
pub struct Cli {
    /// Timeout for each call to a node (e.g. 500ms, 5s)
    #[arg(long, global = true, default_value = "5s", value_parser = parse_duration)]
    pub timeout: Duration,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node until it is stopped
    Run {
        /// Node config file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List services known to a node
    List {
        /// Service id, `<parentID>-<serviceID>` for a child's service (defaults to all)
        id: Option<String>,

        /// Control address of the node to ask
        #[arg(short, long, default_value = DEFAULT_NODE)]
        node: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Restart one service, or all of them
    Restart {
        /// `all`, a service id, or `<parentID>-<serviceID>`
        #[arg(default_value = "all")]
        target: String,

        /// Control address of the node to ask
        #[arg(short, long, default_value = DEFAULT_NODE)]
        node: String,
    },
    /// Ask a node to shut down
    Shutdown {
        /// Control address of the node to stop
        #[arg(short, long, default_value = DEFAULT_NODE)]
        node: String,
    },
}
