use std::sync::atomic::{AtomicBool, Ordering};

use super::ServiceSet;
use crate::link::Uplink;
use crate::registry::{Registry, ShutdownReport};

/// What a completed shutdown did.
#[derive(Debug, Default)]
pub struct ShutdownOutcome {
    pub notices: ShutdownReport,
    pub parent_notified: bool,
}

/// Ordered teardown every node goes through:
///
/// 1. stop heartbeats and close the link to the parent
/// 2. send shutdown notices to registered children and wait for them
/// 3. kill directly supervised processes
/// 4. tell the parent (best effort)
/// 5. return, so the caller can exit
pub struct ShutdownSequence<'a> {
    uplink: Option<&'a Uplink>,
    children: Option<&'a Registry>,
    services: &'a ServiceSet,
    started: AtomicBool,
}

impl<'a> ShutdownSequence<'a> {
    pub fn new(services: &'a ServiceSet) -> Self {
        Self {
            uplink: None,
            children: None,
            services,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_uplink(mut self, uplink: Option<&'a Uplink>) -> Self {
        self.uplink = uplink;
        self
    }

    pub fn with_children(mut self, children: Option<&'a Registry>) -> Self {
        self.children = children;
        self
    }

    /// Run the sequence. Later calls return immediately.
    pub async fn run(&self) -> ShutdownOutcome {
        let mut outcome = ShutdownOutcome::default();
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Shutdown already in progress or completed, skipping");
            return outcome;
        }

        tracing::debug!("Shutdown: closing link to parent");
        let registration = match self.uplink {
            Some(uplink) => uplink.disconnect().await,
            None => None,
        };

        if let Some(children) = self.children {
            tracing::debug!("Shutdown: notifying children");
            outcome.notices = children.send_shutdown_notices().await;
            if outcome.notices.attempted() > 0 {
                tracing::info!(
                    "Shutdown notices delivered to {}/{} children",
                    outcome.notices.delivered.len(),
                    outcome.notices.attempted()
                );
            }
        }

        tracing::debug!("Shutdown: stopping supervised services");
        if let Err(e) = self.services.kill_all().await {
            tracing::warn!("Some services did not stop cleanly: {}", e);
        }

        if let (Some(uplink), Some(registration)) = (self.uplink, registration) {
            tracing::debug!("Shutdown: notifying parent");
            uplink.notify_shutdown(&registration).await;
            outcome.parent_notified = true;
        }

        tracing::debug!("Shutdown: complete");
        outcome
    }
}
