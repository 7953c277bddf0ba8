use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use super::{CoreNode, NodeContext, ProcessManager, RemoteAgent, ShutdownOutcome, ShutdownSequence};
use crate::config::{NodeConfig, Parser, Role};
use crate::error::{Error, Result};
use crate::link::{Uplink, UplinkConfig};
use crate::protocol::{ControlHandler, ControlServer};
use crate::registry::Registry;

/// A node that has been started and is serving.
pub struct RunningNode {
    ctx: Arc<NodeContext>,
    server: Option<ControlServer>,
    uplink: Option<Uplink>,
    children: Option<Arc<Registry>>,
}

impl RunningNode {
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Address of the operator-facing listener, if the node has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(ControlServer::local_addr)
    }

    pub fn uplink(&self) -> Option<&Uplink> {
        self.uplink.as_ref()
    }

    /// Registry of registered children, for hub roles.
    pub fn children(&self) -> Option<&Arc<Registry>> {
        self.children.as_ref()
    }

    /// Resolves once something asked the node to stop.
    pub async fn stopped(&self) {
        self.ctx.shutdown.cancelled().await
    }

    /// Run the shutdown sequence and stop listening.
    pub async fn shutdown(self) -> ShutdownOutcome {
        self.ctx.shutdown.cancel();
        let outcome = ShutdownSequence::new(&self.ctx.services)
            .with_uplink(self.uplink.as_ref())
            .with_children(self.children.as_deref())
            .run()
            .await;
        if let Some(server) = self.server {
            server.stop().await;
        }
        tracing::info!("Node '{}' stopped", self.ctx.name());
        outcome
    }
}

/// Build the node for its role, bind its listener, link it to its parent
/// and launch the services found in its manifest directory.
///
/// Failing to bind the listener is the only startup error; manifests that
/// fail to load or launch are logged and skipped.
#[tracing::instrument(skip(config), fields(node.name = %config.name, node.role = %config.role))]
pub async fn start_node(config: NodeConfig) -> Result<RunningNode> {
    config.validate()?;
    let ctx = NodeContext::new(config);

    let (handler, children): (Arc<dyn ControlHandler>, Option<Arc<Registry>>) = match ctx.config.role {
        Role::Core => {
            let core = Arc::new(CoreNode::new(ctx.clone()));
            let registry = core.registry().clone();
            (core, Some(registry))
        }
        Role::Procm => {
            let procm = Arc::new(ProcessManager::new(ctx.clone()));
            let registry = procm.registry().clone();
            (procm, Some(registry))
        }
        Role::Remote => (Arc::new(RemoteAgent::new(ctx.clone())), None),
    };

    let server = match &ctx.config.listen {
        Some(listen) => Some(ControlServer::bind(listen, handler.clone()).await?),
        None => None,
    };

    let uplink = ctx.config.parent.clone().map(|parent| {
        Uplink::start(
            UplinkConfig::from_node(&ctx.config, parent),
            handler.clone(),
            ctx.shutdown.clone(),
        )
    });

    if let Some(dir) = ctx.config.manifest_dir.clone() {
        load_manifests(&ctx, &dir).await;
    }

    tracing::info!(
        "Node '{}' ({}) running with {} service(s)",
        ctx.name(),
        ctx.config.role,
        ctx.services.len()
    );
    Ok(RunningNode {
        ctx,
        server,
        uplink,
        children,
    })
}

async fn load_manifests(ctx: &NodeContext, dir: &Path) {
    let paths = match Parser::new().scan_manifests(dir) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::error!("{}", e.with_suggestion());
            return;
        }
    };

    for path in paths {
        match ctx.services.add_service(&path).await {
            Ok(_) => {}
            // The entry stays in the set so `restart` can retry it
            Err(e @ Error::Launch { .. }) => tracing::error!(
                "Service from {} is registered but failed to start: {}",
                path.display(),
                e.with_suggestion()
            ),
            Err(e) => tracing::error!("Skipping manifest {}: {}", path.display(), e.with_suggestion()),
        }
    }
}

/// Run a node until it is told to stop (a `StopServer` request, the
/// parent going away, Ctrl-C or SIGTERM), then shut it down in order.
pub async fn run_node(config: NodeConfig) -> Result<()> {
    let node = start_node(config).await?;

    tokio::select! {
        _ = node.stopped() => {}
        signal = wait_for_signal() => tracing::info!("Received {}, shutting down", signal),
    }

    let outcome = node.shutdown().await;
    if !outcome.notices.failed.is_empty() {
        tracing::debug!(
            "Children not reached during shutdown: {}",
            outcome.notices.failed.join(", ")
        );
    }
    Ok(())
}

async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            return match tokio::signal::ctrl_c().await {
                Ok(()) => "Ctrl-C",
                Err(_) => std::future::pending().await,
            };
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => "Ctrl-C",
            Err(e) => {
                tracing::warn!("Cannot listen for Ctrl-C: {}", e);
                terminate.recv().await;
                "SIGTERM"
            }
        },
        _ = terminate.recv() => "SIGTERM",
    }
}
