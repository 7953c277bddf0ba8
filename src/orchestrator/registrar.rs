use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{ErrorCode, Request, Response};
use crate::registry::Registry;

/// Parent-side handling of registration traffic: `Register`, `Alive` and
/// `NotifyShutdown`. Shared by every node role that accepts children.
pub struct RegistrarHandler {
    registry: Arc<Registry>,
}

impl RegistrarHandler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether `request` is registration traffic.
    pub fn accepts(request: &Request) -> bool {
        matches!(
            request,
            Request::Register { .. } | Request::Alive { .. } | Request::NotifyShutdown { .. }
        )
    }

    pub async fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::Register {
                name,
                aliases,
                mode,
            } => {
                let record = self.registry.add_service(&name, &aliases, mode).await?;
                Ok(Response::Registered {
                    id: record.id,
                    address: record.address,
                    fingerprint: record.fingerprint,
                })
            }
            Request::Alive {
                id,
                name,
                fingerprint,
                ..
            } => {
                self.registry.verify(&name, &fingerprint).map_err(|e| {
                    tracing::debug!(registry.id = id, "Heartbeat from '{}' rejected: {}", name, e);
                    e
                })?;
                tracing::trace!(registry.id = id, "Heartbeat from '{}'", name);
                Ok(Response::Ack)
            }
            Request::NotifyShutdown { name, fingerprint } => {
                self.registry.mark_shutdown(&name, &fingerprint)?;
                Ok(Response::Ack)
            }
            other => Err(unsupported(other.kind(), "registrar")),
        }
    }
}

/// Rejection for a request the receiving node does not serve.
pub(crate) fn unsupported(kind: &str, role: &str) -> Error {
    Error::Rejected {
        code: ErrorCode::Unsupported,
        message: format!("{} requests are not served by a {}", kind, role),
    }
}
