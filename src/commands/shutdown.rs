use super::unexpected;
use crate::output::UserOutput;
use service_hive::protocol::{self, Request, Response};
use std::time::Duration;

pub async fn run_shutdown(node: &str, timeout: Duration, out: &dyn UserOutput) -> anyhow::Result<()> {
    match protocol::call(node, &Request::StopServer, timeout).await? {
        Response::Message { text } => out.success(&format!("{}: {}", node, text)),
        Response::Ack => out.success(&format!("{}: shutdown started", node)),
        other => return Err(unexpected(node, &other)),
    }
    Ok(())
}
