//! Public server implementation
//!
//! Accepts raw TCP connections from the public side, takes one read per
//! connection, resolves the target agent from the domain line, and forwards
//! the bytes through the agent's tunnel. The reply comes back through the
//! pending-exchange table under the public peer address, so concurrent
//! requests over one tunnel cannot cross.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pylon_control::PendingExchanges;
use pylon_directory::{AgentDirectory, OutboundMessage};
use pylon_proto::http::{
    extract_domain, not_found_response, BAD_GATEWAY, BAD_REQUEST, GATEWAY_TIMEOUT,
};
use pylon_proto::{RelayFrame, MAX_REQUEST_SIZE};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Public server errors
#[derive(Debug, Error)]
pub enum PublicServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Public server configuration
#[derive(Debug, Clone)]
pub struct PublicServerConfig {
    pub bind_addr: SocketAddr,
    /// How long one exchange may wait for its reply.
    pub exchange_timeout: Duration,
}

impl Default for PublicServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            exchange_timeout: Duration::from_secs(30),
        }
    }
}

/// What the wait for a reply ended with.
enum ReplyOutcome {
    Reply(Bytes),
    AgentFailed,
    TimedOut,
    ClientClosed,
}

/// Public-facing TCP server routing requests through agent tunnels.
pub struct PublicServer {
    config: PublicServerConfig,
    directory: Arc<AgentDirectory>,
    pending: Arc<PendingExchanges>,
    listener: TcpListener,
}

impl PublicServer {
    /// Bind the public listener. No connections are accepted until
    /// [`Self::run`].
    pub async fn bind(
        config: PublicServerConfig,
        directory: Arc<AgentDirectory>,
        pending: Arc<PendingExchanges>,
    ) -> Result<Self, PublicServerError> {
        let listener =
            TcpListener::bind(config.bind_addr)
                .await
                .map_err(|e| PublicServerError::BindError {
                    address: config.bind_addr.ip().to_string(),
                    port: config.bind_addr.port(),
                    reason: e.to_string(),
                })?;

        let local_addr = listener.local_addr()?;
        info!("Public server listening on {}", local_addr);

        Ok(Self {
            config,
            directory,
            pending,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, PublicServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept public connections forever.
    pub async fn run(&self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted public connection from {}", peer_addr);
                    let directory = self.directory.clone();
                    let pending = self.pending.clone();
                    let exchange_timeout = self.config.exchange_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(
                            socket,
                            peer_addr,
                            directory,
                            pending,
                            exchange_timeout,
                        )
                        .await
                        {
                            error!("Failed to handle public connection from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept public connection: {}", e);
                }
            }
        }
    }

    /// Serve one public connection: one read, one exchange, one reply.
    async fn handle_connection(
        mut socket: TcpStream,
        peer_addr: SocketAddr,
        directory: Arc<AgentDirectory>,
        pending: Arc<PendingExchanges>,
        exchange_timeout: Duration,
    ) -> Result<(), PublicServerError> {
        let mut buffer = vec![0u8; MAX_REQUEST_SIZE];
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }

        // The request is only inspected far enough to find the routing
        // domain; the bytes themselves are forwarded untouched.
        let request = String::from_utf8_lossy(&buffer[..n]);
        let domain = match extract_domain(&request) {
            Some(domain) => domain.to_string(),
            None => {
                warn!(peer = %peer_addr, "Request carried no domain line");
                socket.write_all(BAD_REQUEST).await?;
                return Ok(());
            }
        };

        let agent_id = match directory.resolve_domain(&domain) {
            Some(agent_id) => agent_id,
            None => {
                debug!(domain = %domain, "No agent for domain");
                socket.write_all(&not_found_response(&domain)).await?;
                return Ok(());
            }
        };

        let handle = match directory.get_connection(&agent_id) {
            Some(handle) => handle,
            None => {
                debug!(domain = %domain, agent_id = %agent_id, "Agent has no live connection");
                socket.write_all(&not_found_response(&domain)).await?;
                return Ok(());
            }
        };

        // The peer address doubles as the correlation key; the kernel will
        // not hand out the same source port twice while this socket lives.
        let key = peer_addr.to_string();
        let reply_rx = pending.register(&key, &agent_id, handle.connection_id());

        let frame = RelayFrame::new(key.clone(), Bytes::copy_from_slice(&buffer[..n]));
        if handle.send(OutboundMessage::Binary(frame.encode())).await.is_err() {
            pending.cancel(&key);
            debug!(domain = %domain, agent_id = %agent_id, "Tunnel went away before the request was queued");
            socket.write_all(&not_found_response(&domain)).await?;
            return Ok(());
        }

        debug!(
            domain = %domain,
            agent_id = %agent_id,
            key = %key,
            bytes = n,
            "Request forwarded through tunnel"
        );

        match Self::await_reply(&mut socket, &mut buffer, reply_rx, exchange_timeout).await {
            ReplyOutcome::Reply(payload) => {
                socket.write_all(&payload).await?;
                debug!(key = %key, bytes = payload.len(), "Reply written to public client");
            }
            ReplyOutcome::AgentFailed => {
                warn!(key = %key, agent_id = %agent_id, "Tunnel dropped while a reply was pending");
                socket.write_all(BAD_GATEWAY).await?;
            }
            ReplyOutcome::TimedOut => {
                pending.cancel(&key);
                warn!(key = %key, agent_id = %agent_id, "Timeout waiting for agent reply");
                socket.write_all(GATEWAY_TIMEOUT).await?;
            }
            ReplyOutcome::ClientClosed => {
                pending.cancel(&key);
                debug!(key = %key, "Public client hung up while waiting");
            }
        }

        Ok(())
    }

    /// Wait for the exchange to resolve.
    ///
    /// While waiting, the client socket is still read: extra bytes are
    /// drained and dropped (one read, one exchange), and a hangup is
    /// detected so the exchange can be cancelled instead of running out the
    /// clock.
    async fn await_reply(
        socket: &mut TcpStream,
        scratch: &mut [u8],
        mut reply_rx: oneshot::Receiver<Bytes>,
        exchange_timeout: Duration,
    ) -> ReplyOutcome {
        let outcome = tokio::time::timeout(exchange_timeout, async {
            loop {
                tokio::select! {
                    reply = &mut reply_rx => {
                        return match reply {
                            Ok(payload) => ReplyOutcome::Reply(payload),
                            Err(_) => ReplyOutcome::AgentFailed,
                        };
                    }
                    read = socket.read(scratch) => {
                        match read {
                            Ok(n) if n > 0 => continue,
                            _ => return ReplyOutcome::ClientClosed,
                        }
                    }
                }
            }
        })
        .await;

        outcome.unwrap_or(ReplyOutcome::TimedOut)
    }
}
