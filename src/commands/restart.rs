use super::unexpected;
use crate::output::UserOutput;
use service_hive::protocol::{self, Action, Request, Response, RestartOutcome, Target};
use std::time::Duration;

pub async fn run_restart(
    node: &str,
    target: &str,
    timeout: Duration,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let target: Target = target.parse()?;
    match &target {
        Target::All => out.status(&format!("Restarting all services on {}...", node)),
        Target::One(id) => out.status(&format!("Restarting {} on {}...", id, node)),
    }

    let request = Request::NotifyAction {
        action: Action::Restart,
        target,
    };
    let outcomes = match protocol::call(node, &request, timeout).await? {
        Response::Restarted { services } => services,
        other => return Err(unexpected(node, &other)),
    };

    let failed = report(&outcomes, out);
    if failed > 0 {
        anyhow::bail!("{} of {} service(s) failed to restart", failed, outcomes.len());
    }
    if outcomes.is_empty() {
        out.status("No services to restart");
    } else {
        out.success(&format!("Restarted {} service(s)", outcomes.len()));
    }
    Ok(())
}

/// Print one line per outcome and return how many failed.
fn report(outcomes: &[RestartOutcome], out: &dyn UserOutput) -> usize {
    let mut failed = 0;
    for outcome in outcomes {
        match &outcome.error {
            None => out.status(&format!("  + {:<10} pid {}", outcome.id, outcome.pid)),
            Some(error) => {
                failed += 1;
                out.error(&format!("  x {:<10} {}", outcome.id, error));
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::CapturedOutput;

    #[test]
    fn test_report_counts_failures() {
        let out = CapturedOutput::default();
        let outcomes = vec![
            RestartOutcome {
                id: "1".into(),
                pid: 100,
                error: None,
            },
            RestartOutcome {
                id: "2-3".into(),
                pid: -1,
                error: Some("connection refused".into()),
            },
        ];

        assert_eq!(report(&outcomes, &out), 1);
        let text = out.text();
        assert!(text.contains("pid 100"));
        assert!(text.contains("connection refused"));
    }
}
