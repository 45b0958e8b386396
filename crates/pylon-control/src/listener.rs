//! WebSocket listener for agent tunnel connections

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::handler::TunnelHandler;

/// Agent listener errors
#[derive(Debug, Error)]
pub enum AgentListenerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Accepts agent WebSocket connections and hands each one to the handler.
pub struct AgentListener {
    tcp_listener: TcpListener,
    handler: Arc<TunnelHandler>,
}

impl AgentListener {
    /// Bind the listener. No connections are accepted until [`Self::run`].
    pub async fn bind(
        bind_addr: SocketAddr,
        handler: Arc<TunnelHandler>,
    ) -> Result<Self, AgentListenerError> {
        let tcp_listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|e| AgentListenerError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                })?;

        let local_addr = tcp_listener.local_addr()?;
        info!("Agent listener bound to ws://{}", local_addr);

        Ok(Self {
            tcp_listener,
            handler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AgentListenerError> {
        Ok(self.tcp_listener.local_addr()?)
    }

    /// Accept agent connections forever. Each connection runs in its own
    /// task; the WebSocket upgrade happens there so a slow handshake cannot
    /// stall the accept loop.
    pub async fn run(&self) {
        loop {
            match self.tcp_listener.accept().await {
                Ok((tcp_stream, peer_addr)) => {
                    debug!("Incoming agent connection from {}", peer_addr);

                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        let ws_stream = match tokio_tungstenite::accept_async(tcp_stream).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!("WebSocket handshake failed from {}: {}", peer_addr, e);
                                return;
                            }
                        };

                        handler.handle_connection(ws_stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept agent connection: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingExchanges;
    use pylon_directory::AgentDirectory;
    use pylon_store::MemoryStore;

    #[tokio::test]
    async fn test_bind_assigns_ephemeral_port() {
        let handler = Arc::new(TunnelHandler::new(
            Arc::new(AgentDirectory::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(PendingExchanges::new()),
        ));

        let listener = AgentListener::bind("127.0.0.1:0".parse().unwrap(), handler)
            .await
            .unwrap();

        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
