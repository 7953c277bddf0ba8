use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{PingSignal, PingSignals, Registration, RegistrationHandle};
use crate::config::{NodeConfig, ParentShutdownPolicy};
use crate::error::{Error, Result};
use crate::protocol::{self, ControlConnection, ControlHandler, ControlServer, Mode, Request, Response};

/// Settings for one child-to-parent link.
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub name: String,
    pub aliases: Vec<String>,
    pub mode: Mode,
    /// Control address of the parent
    pub parent: String,
    pub heartbeat_interval: Duration,
    pub registration_retry: Duration,
    pub reconnect_delay: Duration,
    pub call_timeout: Duration,
    pub on_parent_shutdown: ParentShutdownPolicy,
}

impl UplinkConfig {
    pub fn from_node(config: &NodeConfig, parent: impl Into<String>) -> Self {
        Self {
            name: config.name.clone(),
            aliases: Vec::new(),
            mode: Mode::Remote,
            parent: parent.into(),
            heartbeat_interval: config.heartbeat_interval,
            registration_retry: config.registration_retry,
            reconnect_delay: config.reconnect_delay,
            call_timeout: config.call_timeout,
            on_parent_shutdown: config.on_parent_shutdown,
        }
    }
}

/// Why a registration's heartbeat loop ended.
#[derive(Debug)]
enum LinkEnd {
    Closed,
    ConnectionLost(Error),
    ParentShutdown,
}

/// Wraps the node's handler on inbound connections: a shutdown notice from
/// the parent raises every heartbeat signal before the node sees it.
struct UplinkHandler {
    inner: Arc<dyn ControlHandler>,
    signals: Arc<PingSignals>,
}

#[async_trait]
impl ControlHandler for UplinkHandler {
    async fn handle(&self, request: Request, peer: SocketAddr) -> Result<Response> {
        match request {
            Request::UpdateRegistration { reason } => {
                let raised = self.signals.broadcast();
                tracing::info!(
                    "Parent {} updated registration ({}), stopped {} heartbeat loop(s)",
                    peer,
                    reason,
                    raised
                );
                let forwarded = Request::UpdateRegistration { reason };
                if let Err(e) = self.inner.handle(forwarded, peer).await {
                    tracing::warn!("Node handler rejected registration update: {}", e);
                }
                Ok(Response::Ack)
            }
            other => self.inner.handle(other, peer).await,
        }
    }
}

struct UplinkInner {
    config: UplinkConfig,
    handler: Arc<dyn ControlHandler>,
    registration: RegistrationHandle,
    signals: Arc<PingSignals>,
    /// Cancelled by `disconnect`
    closed: CancellationToken,
    /// The node's own shutdown token, cancelled under the `Exit` policy
    node_shutdown: CancellationToken,
    last_error: Mutex<Option<String>>,
}

/// Keeps a node registered with its parent.
///
/// Registers (retrying while the parent is unavailable), serves control
/// requests on the address the parent assigned, heartbeats on a fixed
/// interval, and starts over with a fresh registration whenever the link
/// breaks.
pub struct Uplink {
    inner: Arc<UplinkInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Uplink {
    pub fn start(
        config: UplinkConfig,
        handler: Arc<dyn ControlHandler>,
        node_shutdown: CancellationToken,
    ) -> Self {
        let signals = Arc::new(PingSignals::new());
        let handler: Arc<dyn ControlHandler> = Arc::new(UplinkHandler {
            inner: handler,
            signals: signals.clone(),
        });
        let inner = Arc::new(UplinkInner {
            config,
            handler,
            registration: RegistrationHandle::empty(),
            signals,
            closed: CancellationToken::new(),
            node_shutdown,
            last_error: Mutex::new(None),
        });

        tracing::info!(
            "Linking '{}' to parent {}",
            inner.config.name,
            inner.config.parent
        );
        let task = tokio::spawn(inner.clone().run());
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn registration(&self) -> RegistrationHandle {
        self.inner.registration.clone()
    }

    pub fn signals(&self) -> Arc<PingSignals> {
        self.inner.signals.clone()
    }

    /// Why the link gave up, if registration was refused for good.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Stop heartbeating and close the link for good. Returns the
    /// registration that was active, if any.
    pub async fn disconnect(&self) -> Option<Registration> {
        let current = self.inner.registration.get();
        self.inner.closed.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.registration.clear();
        current
    }

    /// Tell the parent this node is gone. Best effort.
    pub async fn notify_shutdown(&self, registration: &Registration) {
        let timeout = self.inner.config.call_timeout.min(Duration::from_secs(1));
        match protocol::call(&registration.parent, &registration.shutdown_notice(), timeout).await {
            Ok(_) => tracing::debug!("Parent {} acknowledged shutdown", registration.parent),
            Err(e) => tracing::debug!("Parent {} not told about shutdown: {}", registration.parent, e),
        }
    }
}

impl UplinkInner {
    async fn run(self: Arc<Self>) {
        loop {
            let Some(registration) = self.register().await else {
                break;
            };

            let server = match ControlServer::bind(&registration.address, self.handler.clone()).await {
                Ok(server) => server,
                Err(e) => {
                    tracing::warn!(
                        "Cannot serve on assigned address {}: {}",
                        registration.address,
                        e
                    );
                    if self.pause(self.config.reconnect_delay).await {
                        break;
                    }
                    continue;
                }
            };

            self.registration.update(Some(registration.clone()));
            let end = self.heartbeat(&registration).await;
            self.registration.clear();
            // Stop answering on the old address so the parent can hand the
            // slot back to us on re-registration
            server.stop().await;

            match end {
                LinkEnd::Closed => break,
                LinkEnd::ConnectionLost(e) => {
                    tracing::warn!(
                        "Lost connection to parent {}: {}; re-registering in {:?}",
                        self.config.parent,
                        e,
                        self.config.reconnect_delay
                    );
                }
                LinkEnd::ParentShutdown => match self.config.on_parent_shutdown {
                    ParentShutdownPolicy::Exit => {
                        tracing::info!("Parent is shutting down, shutting down too");
                        self.node_shutdown.cancel();
                        break;
                    }
                    ParentShutdownPolicy::Reconnect => {
                        tracing::info!(
                            "Parent is shutting down, will re-register in {:?}",
                            self.config.reconnect_delay
                        );
                    }
                },
            }

            if self.pause(self.config.reconnect_delay).await {
                break;
            }
        }
        tracing::debug!("Uplink for '{}' closed", self.config.name);
    }

    /// Sleep unless the link is closed first. Returns `true` if closed.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.closed.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn register(&self) -> Option<Registration> {
        let config = &self.config;
        let request = Request::Register {
            name: config.name.clone(),
            aliases: config.aliases.clone(),
            mode: config.mode,
        };

        loop {
            if self.closed.is_cancelled() {
                return None;
            }
            match protocol::call(&config.parent, &request, config.call_timeout).await {
                Ok(Response::Registered {
                    id,
                    address,
                    fingerprint,
                }) => {
                    tracing::info!(
                        "Registered '{}' with {} as id {} at {}",
                        config.name,
                        config.parent,
                        id,
                        address
                    );
                    *self.last_error.lock() = None;
                    return Some(Registration {
                        id,
                        name: config.name.clone(),
                        address,
                        fingerprint,
                        parent: config.parent.clone(),
                    });
                }
                Ok(other) => {
                    self.give_up(Error::Protocol(format!(
                        "unexpected registration response: {:?}",
                        other
                    )));
                    return None;
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        "Parent {} unavailable ({}), retrying in {:?}",
                        config.parent,
                        e,
                        config.registration_retry
                    );
                    if self.pause(config.registration_retry).await {
                        return None;
                    }
                }
                Err(e) => {
                    self.give_up(e);
                    return None;
                }
            }
        }
    }

    fn give_up(&self, err: Error) {
        tracing::error!(
            "Registration of '{}' with {} refused: {}",
            self.config.name,
            self.config.parent,
            err.with_suggestion()
        );
        *self.last_error.lock() = Some(err.to_string());
    }

    async fn heartbeat(&self, registration: &Registration) -> LinkEnd {
        let signal = self.signals.arm();
        let end = self.heartbeat_loop(registration, &signal).await;
        signal.retire();
        end
    }

    async fn heartbeat_loop(&self, registration: &Registration, signal: &PingSignal) -> LinkEnd {
        let config = &self.config;
        let mut conn: Option<ControlConnection> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return LinkEnd::Closed,
                _ = signal.raised() => {}
                _ = tokio::time::sleep(config.heartbeat_interval) => {}
            }

            // A shutdown notice raced this tick; never ping under it
            if signal.take() {
                return LinkEnd::ParentShutdown;
            }

            if conn.is_none() {
                match ControlConnection::connect(&config.parent, config.call_timeout).await {
                    Ok(c) => conn = Some(c),
                    Err(e) => return LinkEnd::ConnectionLost(e),
                }
            }
            let Some(c) = conn.as_mut() else {
                continue;
            };

            match c.call(&registration.alive()).await {
                Ok(Response::Ack) => {
                    tracing::trace!("Heartbeat to {} acknowledged", config.parent);
                }
                Ok(other) => {
                    return LinkEnd::ConnectionLost(Error::Protocol(format!(
                        "unexpected heartbeat response: {:?}",
                        other
                    )))
                }
                Err(e) => return LinkEnd::ConnectionLost(e),
            }
        }
    }
}
