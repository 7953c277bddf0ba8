use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use super::fanout::{is_forwarded, Subordinates};
use super::{NodeContext, RegistrarHandler};
use crate::config::ParentShutdownPolicy;
use crate::error::Result;
use crate::port::AddressAllocator;
use crate::protocol::{Action, ControlHandler, Request, Response, Target, CORE_SHUTDOWN};
use crate::registry::Registry;

/// Build the registry a hub node hands child addresses out of.
pub(super) fn hub_registry(ctx: &NodeContext) -> Arc<Registry> {
    let ports = &ctx.config.ports;
    Arc::new(
        Registry::new(
            AddressAllocator::new(ports.host.clone(), ports.low, ports.high),
            ctx.config.reclaim,
        )
        .with_notice_timeout(ctx.config.shutdown_notice_timeout),
    )
}

/// Apply an action locally, on one child, or everywhere.
pub(super) async fn dispatch_action(
    ctx: &NodeContext,
    subordinates: &Subordinates,
    action: Action,
    target: Target,
) -> Result<Response> {
    match &target {
        Target::One(id) if is_forwarded(&target) => subordinates.forward_action(action, id).await,
        Target::One(_) => ctx.services.apply(action, &target).await,
        Target::All => {
            let local = ctx.services.apply(action, &Target::All).await?;
            let forwarded = subordinates.forward_action_all(action).await;
            match local {
                Response::Restarted { mut services } => {
                    services.extend(forwarded);
                    Ok(Response::Restarted { services })
                }
                other => Ok(other),
            }
        }
    }
}

/// Parent-shutdown handling shared by hub nodes.
pub(super) fn on_registration_update(ctx: &NodeContext, reason: &str) -> Response {
    if reason == CORE_SHUTDOWN && ctx.config.on_parent_shutdown == ParentShutdownPolicy::Exit {
        ctx.services.graceful_shutdown();
    }
    Response::Ack
}

/// Process manager: supervises remote agents rather than raw processes.
///
/// Remote agents register with it and heartbeat to it. Restarts and
/// summaries addressed to `<agentID>-<serviceID>` are forwarded to the
/// agent; `all` fans out to every running agent.
pub struct ProcessManager {
    ctx: Arc<NodeContext>,
    registrar: RegistrarHandler,
    subordinates: Subordinates,
}

impl ProcessManager {
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
impl ControlHandler for ProcessManager {
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
                        services.extend(self.subordinates.summary_all().await);
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
            // Registration traffic is handled above
            other => self.registrar.handle(other).await,
        }
    }
}
