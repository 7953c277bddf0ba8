mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use output::CliOutput;
use service_hive::Error as HiveError;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(hive_error) = e.downcast_ref::<HiveError>() {
            eprintln!("Error: {}", hive_error);
            if let Some(suggestion) = hive_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing()?;
    let out = CliOutput;

    match cli.command {
        Commands::Run { config } => commands::run_node_command(&config, &out).await,
        Commands::List { id, node, json } => {
            commands::run_list(&node, id, json, cli.timeout, &out).await
        }
        Commands::Restart { target, node } => {
            commands::run_restart(&node, &target, cli.timeout, &out).await
        }
        Commands::Shutdown { node } => commands::run_shutdown(&node, cli.timeout, &out).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
