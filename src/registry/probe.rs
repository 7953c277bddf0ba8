use async_trait::async_trait;
use std::time::Duration;

use crate::protocol::{self, Request};

/// Decides whether the current holder of a registry slot is still there.
#[async_trait]
pub trait LivenessProbe: Send + Sync + 'static {
    async fn is_alive(&self, address: &str) -> bool;
}

/// Pings the holder over the control protocol.
///
/// Any answer, even an error response, proves the holder is alive. Only a
/// refused connection or a timeout counts as gone.
#[derive(Debug, Clone)]
pub struct ControlProbe {
    timeout: Duration,
}

impl ControlProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ControlProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl LivenessProbe for ControlProbe {
    async fn is_alive(&self, address: &str) -> bool {
        match protocol::call(address, &Request::Ping, self.timeout).await {
            Ok(_) => true,
            Err(e) if e.is_retryable() => {
                tracing::debug!("Liveness probe of {} failed: {}", address, e);
                false
            }
            Err(_) => true,
        }
    }
}
