use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use super::registrar::unsupported;
use super::NodeContext;
use crate::config::ParentShutdownPolicy;
use crate::error::Result;
use crate::protocol::{ControlHandler, Request, Response, CORE_SHUTDOWN};

/// A node that supervises actual service processes and answers to a parent.
pub struct RemoteAgent {
    ctx: Arc<NodeContext>,
}

impl RemoteAgent {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }
}

#[async_trait]
impl ControlHandler for RemoteAgent {
    #[tracing::instrument(skip(self, request), fields(node.name = %self.ctx.name(), request = request.kind()))]
    async fn handle(&self, request: Request, _peer: SocketAddr) -> Result<Response> {
        let services = &self.ctx.services;
        match request {
            Request::Ping => Ok(Response::Pong),
            Request::NotifyAction { action, target } => services.apply(action, &target).await,
            Request::Summary { target } => Ok(Response::Summary {
                services: services.summary(&target)?,
            }),
            Request::UpdateRegistration { reason } => {
                // Children finish their own work when the parent goes away
                if reason == CORE_SHUTDOWN
                    && self.ctx.config.on_parent_shutdown == ParentShutdownPolicy::Exit
                {
                    services.graceful_shutdown();
                }
                Ok(Response::Ack)
            }
            Request::StopServer => {
                self.ctx.request_shutdown();
                Ok(Response::message("shutdown started"))
            }
            other => Err(unsupported(other.kind(), "remote agent")),
        }
    }
}
