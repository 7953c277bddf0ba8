//! Newline-delimited JSON over TCP.
//!
//! Every frame is one JSON document followed by `\n`. A connection carries
//! any number of request/response pairs, strictly in turn.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::{ErrorCode, Request, Response};
use crate::error::{Error, Result};

/// Upper bound on a single frame; summaries of a few dozen services fit easily.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion)
/// does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Node-side handler for inbound control requests.
///
/// Errors are sent back to the caller as [`Response::Error`]; they never
/// close the connection.
#[async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request, peer: SocketAddr) -> Result<Response>;
}

/// A listening control endpoint. Dropping it stops accepting and closes all
/// of its connections.
pub struct ControlServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind and start serving. Failing to bind is the one error a node
    /// cannot recover from, so it is returned rather than retried.
    pub async fn bind(addr: &str, handler: Arc<dyn ControlHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("cannot listen on {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        tracing::info!("Control server listening on {}", local_addr);
        let task = tokio::spawn(accept_loop(listener, handler, cancel.clone()));

        Ok(Self {
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close open connections and wait for the accept loop.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::debug!("Control server on {} stopped", self.local_addr);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn ControlHandler>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!("Accepted control connection from {}", peer);
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        handler.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Failed to accept control connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn ControlHandler>,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    tracing::debug!("Dropping connection from {}: {}", peer, e);
                    break;
                }
                None => break,
            },
        };

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let kind = request.kind();
                tracing::trace!("{} request from {}", kind, peer);
                handler.handle(request, peer).await.unwrap_or_else(|e| {
                    tracing::debug!("{} request from {} failed: {}", kind, peer, e);
                    Response::from_error(&e)
                })
            }
            Err(e) => Response::Error {
                code: ErrorCode::InvalidRequest,
                message: format!("malformed request: {}", e),
            },
        };

        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to encode response for {}: {}", peer, e);
                break;
            }
        };
        if framed.send(encoded).await.is_err() {
            break;
        }
    }
}

/// A persistent client connection. Each call is bounded by the connection's
/// timeout; a timed-out connection should be discarded since a late reply
/// would be read as the answer to the next call.
pub struct ControlConnection {
    addr: String,
    framed: Framed<TcpStream, LinesCodec>,
    timeout: Duration,
}

impl ControlConnection {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(addr.to_string()))?
            .map_err(|e| {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                Error::Unavailable(addr.to_string())
            })?;
        // Heartbeats are tiny; don't let Nagle hold them back
        let _ = stream.set_nodelay(true);

        Ok(Self {
            addr: addr.to_string(),
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
            timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and wait for its response. Error responses come
    /// back as [`Error::Rejected`].
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        let encoded = serde_json::to_string(request)?;
        let addr = self.addr.as_str();
        let framed = &mut self.framed;

        let exchange = async {
            framed.send(encoded).await.map_err(|e| {
                tracing::debug!("Send to {} failed: {}", addr, e);
                Error::Unavailable(addr.to_string())
            })?;
            match framed.next().await {
                Some(Ok(line)) => Ok(serde_json::from_str::<Response>(&line)?),
                Some(Err(e)) => Err(Error::Protocol(format!("bad frame from {}: {}", addr, e))),
                None => Err(Error::Unavailable(addr.to_string())),
            }
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(addr.to_string()))??;
        response.into_result()
    }
}

/// Connect, send a single request, and hang up.
pub async fn call(addr: &str, request: &Request, timeout: Duration) -> Result<Response> {
    let mut conn = ControlConnection::connect(addr, timeout).await?;
    conn.call(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Target;

    struct Echo;

    #[async_trait]
    impl ControlHandler for Echo {
        async fn handle(&self, request: Request, _peer: SocketAddr) -> Result<Response> {
            match request {
                Request::Ping => Ok(Response::Pong),
                Request::Summary { target } => Err(Error::ServiceNotFound(target.to_string())),
                other => Ok(Response::message(other.kind())),
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_on_one_connection() {
        let server = ControlServer::bind("127.0.0.1:0", Arc::new(Echo)).await.unwrap();
        let addr = server.local_addr().to_string();

        let mut conn = ControlConnection::connect(&addr, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(conn.call(&Request::Ping).await.unwrap(), Response::Pong);
        assert_eq!(
            conn.call(&Request::StopServer).await.unwrap(),
            Response::message("stop_server")
        );

        let err = conn
            .call(&Request::Summary {
                target: Target::One("9".into()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        // Connection is still usable after an error response
        assert_eq!(conn.call(&Request::Ping).await.unwrap(), Response::Pong);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_server_is_unavailable() {
        let server = ControlServer::bind("127.0.0.1:0", Arc::new(Echo)).await.unwrap();
        let addr = server.local_addr().to_string();
        server.stop().await;

        let err = call(&addr, &Request::Ping, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "unexpected error {:?}", err);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let server = ControlServer::bind("127.0.0.1:0", Arc::new(Echo)).await.unwrap();
        let taken = server.local_addr().to_string();
        assert!(matches!(
            ControlServer::bind(&taken, Arc::new(Echo)).await,
            Err(Error::Config(_))
        ));
    }
}
