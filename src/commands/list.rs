use super::unexpected;
use crate::output::UserOutput;
use service_hive::protocol::{self, Request, Response, ServiceRecord, Target};
use std::time::Duration;

pub async fn run_list(
    node: &str,
    id: Option<String>,
    json: bool,
    timeout: Duration,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let target = match id {
        Some(id) => id.parse::<Target>()?,
        None => Target::All,
    };

    let services = match protocol::call(node, &Request::Summary { target }, timeout).await? {
        Response::Summary { services } => services,
        other => return Err(unexpected(node, &other)),
    };

    if json {
        out.status(&serde_json::to_string_pretty(&services)?);
    } else {
        for line in render_table(&services) {
            out.status(&line);
        }
    }
    Ok(())
}

fn render_table(services: &[ServiceRecord]) -> Vec<String> {
    let mut lines = vec![
        format!(
            "  {:<8} {:<24} {:<12} {:>7} {:>8} {:>6}  {}",
            "ID", "NAME", "STATUS", "PID", "RESTARTS", "FAILS", "STARTED"
        ),
        format!("{:-<90}", ""),
    ];

    if services.is_empty() {
        lines.push("  No services".to_string());
        return lines;
    }

    for record in services {
        let icon = match record.status.as_str() {
            "running" | "stable" => "+",
            "failed" | "unreachable" => "x",
            "restarting" | "initialized" => ".",
            _ => "o",
        };
        let started = record
            .start_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "{} {:<8} {:<24} {:<12} {:>7} {:>8} {:>6}  {}",
            icon,
            record.id,
            record.name,
            record.status,
            record.pid,
            record.restart_count,
            record.fail_count,
            started
        ));
        if !record.aliases.is_empty() {
            lines.push(format!("           aliases: {}", record.aliases.join(", ")));
        }
        if let Some(last) = record.errors.last() {
            lines.push(format!("           last error: {}", last));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_hive::protocol::Mode;

    fn record(id: &str, status: &str) -> ServiceRecord {
        ServiceRecord {
            id: id.to_string(),
            name: format!("svc-{}", id),
            aliases: Vec::new(),
            address: None,
            status: status.to_string(),
            state_updated: None,
            pid: 4242,
            start_time: None,
            fail_time: None,
            restart_count: 1,
            fail_count: 0,
            errors: Vec::new(),
            mode: Mode::Managed,
        }
    }

    #[test]
    fn test_empty_table() {
        let lines = render_table(&[]);
        assert_eq!(lines.last().map(String::as_str), Some("  No services"));
    }

    #[test]
    fn test_rows_and_last_error() {
        let mut failed = record("2-1", "failed");
        failed.errors = vec!["first".into(), "exited with status 1".into()];
        let lines = render_table(&[record("1", "stable"), failed]);

        assert!(lines[2].starts_with("+ 1"));
        assert!(lines[3].starts_with("x 2-1"));
        assert!(lines[3].contains("svc-2-1"));
        assert!(lines[4].contains("exited with status 1"));
        assert!(!lines.iter().any(|l| l.contains("first")));
    }

    #[test]
    fn test_aliases_line() {
        let mut web = record("1", "running");
        web.aliases = vec!["frontend".into(), "www".into()];
        let lines = render_table(&[web]);
        assert_eq!(lines[3], "           aliases: frontend, www");
    }
}
