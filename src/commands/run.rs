use crate::output::UserOutput;
use service_hive::config::NodeConfig;
use service_hive::orchestrator::PARENT_ADDR_ENV;
use service_hive::{Parser as ConfigParser, Role};
use std::path::Path;

pub async fn run_node_command(config_path: &Path, out: &dyn UserOutput) -> anyhow::Result<()> {
    let mut config = ConfigParser::new().load_node_config(config_path)?;
    inherit_parent(&mut config, std::env::var(PARENT_ADDR_ENV).ok());

    out.status(&format!(
        "Starting {} node '{}'{}",
        config.role,
        config.name,
        config
            .parent
            .as_deref()
            .map(|parent| format!(" (parent {})", parent))
            .unwrap_or_default()
    ));

    if config.manifest_dir.is_none() && config.role == Role::Remote {
        out.warning("No manifest_dir configured; this agent starts with no services");
    }

    service_hive::run_node(config).await?;
    out.success("Node stopped");
    Ok(())
}

/// A node launched by another node's supervisor registers with whoever
/// launched it unless its config names a parent. A core never has one.
fn inherit_parent(config: &mut NodeConfig, launched_by: Option<String>) {
    if config.parent.is_none() && config.role != Role::Core {
        config.parent = launched_by.filter(|addr| !addr.trim().is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_from_environment_when_unset() {
        let mut config = NodeConfig::new(Role::Remote, "agent");
        inherit_parent(&mut config, Some("127.0.0.1:7600".into()));
        assert_eq!(config.parent.as_deref(), Some("127.0.0.1:7600"));
    }

    #[test]
    fn test_configured_parent_wins() {
        let mut config = NodeConfig::new(Role::Remote, "agent");
        config.parent = Some("10.0.0.1:7600".into());
        inherit_parent(&mut config, Some("127.0.0.1:7600".into()));
        assert_eq!(config.parent.as_deref(), Some("10.0.0.1:7600"));
    }

    #[test]
    fn test_core_never_inherits() {
        let mut config = NodeConfig::new(Role::Core, "core");
        inherit_parent(&mut config, Some("127.0.0.1:7600".into()));
        assert!(config.parent.is_none());
    }

    #[test]
    fn test_blank_environment_ignored() {
        let mut config = NodeConfig::new(Role::Procm, "pm");
        inherit_parent(&mut config, Some("  ".into()));
        assert!(config.parent.is_none());
    }
}
