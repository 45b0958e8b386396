//! Live tunnel connection handles

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Message queued for a tunnel connection's writer task.
#[derive(Debug)]
pub enum OutboundMessage {
    /// Control-plane text (handshake prompts, acks, listings).
    Text(String),
    /// An encoded relay frame.
    Binary(Bytes),
    /// Ask the writer task to close the underlying socket.
    Close,
}

/// The tunnel connection was already closed.
#[derive(Debug, Error)]
#[error("tunnel connection closed")]
pub struct HandleClosed;

/// Handle to a live agent connection.
///
/// Cloning shares the writer channel; the handle is live while the writer
/// task keeps its receiver open. Every connection carries a unique id so
/// teardown can tell a stale handle from its successor after a reconnect.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    agent_id: String,
    connection_id: String,
    sender: mpsc::Sender<OutboundMessage>,
    connected_at: chrono::DateTime<chrono::Utc>,
}

impl TunnelHandle {
    pub fn new(
        agent_id: impl Into<String>,
        connection_id: impl Into<String>,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            connection_id: connection_id.into(),
            sender,
            connected_at: chrono::Utc::now(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }

    /// Queue a message for the connection's writer task.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), HandleClosed> {
        self.sender.send(message).await.map_err(|_| HandleClosed)
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Ask the writer task to shut the connection down. A no-op when the
    /// writer is already gone.
    pub async fn close(&self) {
        let _ = self.sender.send(OutboundMessage::Close).await;
    }
}
