use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use super::fanout::{is_forwarded, Subordinates};
use super::procm::{dispatch_action, hub_registry, on_registration_update};
use super::{NodeContext, RegistrarHandler};
use crate::error::Result;
use crate::protocol::{ControlHandler, Request, Response, Target};
use crate::registry::Registry;

/// Top node. Services, process managers and standalone agents register
/// with it directly, and it may supervise processes of its own.
///
/// Its `all` summary lists its own processes plus one entry per
/// registration; details of a child are fetched with a compound id.
pub struct CoreNode {
    ctx: Arc<NodeContext>,
    registrar: RegistrarHandler,
    subordinates: Subordinates,
}

impl CoreNode {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let registry = hub_registry(&ctx);
        let subordinates = Subordinates::new(registry.clone(), ctx.config.call_timeout);
        Self {
            registrar: RegistrarHandler::new(registry),
            subordinates,
            ctx,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.registrar.registry()
    }
}

#[async_trait]
impl ControlHandler for CoreNode {
    #[tracing::instrument(skip(self, request), fields(node.name = %self.ctx.name(), request = request.kind()))]
    async fn handle(&self, request: Request, _peer: SocketAddr) -> Result<Response> {
        if RegistrarHandler::accepts(&request) {
            return self.registrar.handle(request).await;
        }

        match request {
            Request::Ping => Ok(Response::Pong),
            Request::NotifyAction { action, target } => {
                dispatch_action(&self.ctx, &self.subordinates, action, target).await
            }
            Request::Summary { target } => {
                let services = match &target {
                    Target::One(id) if is_forwarded(&target) => self.subordinates.summary(id).await?,
                    Target::One(_) => self.ctx.services.summary(&target)?,
                    Target::All => {
                        let mut services = self.ctx.services.summary(&Target::All)?;
                        services.extend(
                            self.registry()
                                .records()
                                .iter()
                                .map(|record| record.to_service_record()),
                        );
                        services
                    }
                };
                Ok(Response::Summary { services })
            }
            Request::UpdateRegistration { reason } => Ok(on_registration_update(&self.ctx, &reason)),
            Request::StopServer => {
                self.ctx.request_shutdown();
                Ok(Response::message("shutdown started"))
            }
            other => self.registrar.handle(other).await,
        }
    }
}
