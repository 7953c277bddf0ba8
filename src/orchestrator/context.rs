use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::ServiceSet;
use crate::config::NodeConfig;

/// Everything a node's components share, built once at startup and handed
/// to each component explicitly.
pub struct NodeContext {
    pub config: NodeConfig,
    /// Cancelled when the node should run its shutdown sequence
    pub shutdown: CancellationToken,
    pub services: ServiceSet,
}

impl NodeContext {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let services = ServiceSet::from_config(&config);
        Arc::new(Self {
            config,
            shutdown: CancellationToken::new(),
            services,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Ask the node to shut down. The caller does not wait for it.
    pub fn request_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Shutdown of '{}' requested", self.config.name);
        }
        self.shutdown.cancel();
    }
}
