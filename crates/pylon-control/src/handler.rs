//! Agent tunnel handler
//!
//! Drives one WebSocket agent connection through its whole lifecycle:
//! credential prompt, authentication against the store, domain registration,
//! then the relay phase where reply frames coming back from the agent are
//! routed to the public connections waiting on them.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pylon_directory::{AgentDirectory, OutboundMessage, TunnelHandle};
use pylon_proto::handshake::{format_domain_list, parse_credentials};
use pylon_proto::{RelayFrame, AUTH_FAILED, LOGIN_PROMPT, REGISTER_OK, STORE_UNAVAILABLE};
use pylon_store::KvStore;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::pending::PendingExchanges;

type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Queue depth for messages headed to one agent connection.
const OUTBOUND_QUEUE: usize = 256;

/// Default page size for the domain listing scan.
pub const DEFAULT_DOMAIN_LIMIT: u64 = 5;

/// Handles agent connections: authentication, registration, reply relay.
pub struct TunnelHandler {
    directory: Arc<AgentDirectory>,
    store: Arc<dyn KvStore>,
    pending: Arc<PendingExchanges>,
    domain_limit: u64,
}

impl TunnelHandler {
    pub fn new(
        directory: Arc<AgentDirectory>,
        store: Arc<dyn KvStore>,
        pending: Arc<PendingExchanges>,
    ) -> Self {
        Self {
            directory,
            store,
            pending,
            domain_limit: DEFAULT_DOMAIN_LIMIT,
        }
    }

    pub fn with_domain_limit(mut self, limit: u64) -> Self {
        self.domain_limit = limit;
        self
    }

    /// Drive a freshly accepted agent connection until it closes.
    pub async fn handle_connection(&self, ws_stream: WsStream, peer_addr: SocketAddr) {
        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
        info!(connection_id = %connection_id, peer = %peer_addr, "Agent connected");

        let (sink, mut source) = ws_stream.split();

        // Writer task owns the sink; the handshake, the proxy side, and the
        // teardown path all send through the same outbound queue.
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer_conn_id = connection_id.clone();
        tokio::spawn(async move {
            Self::write_outbound(sink, outbound_rx, writer_conn_id).await;
        });

        let agent_id = match self
            .handshake(&mut source, &outbound_tx, &connection_id, peer_addr)
            .await
        {
            Some(agent_id) => agent_id,
            None => {
                let _ = outbound_tx.send(OutboundMessage::Close).await;
                return;
            }
        };

        self.relay(&mut source, &agent_id, &connection_id).await;

        // Teardown is guarded by connection id: if a reconnect superseded
        // this connection, the successor's directory state stays intact.
        if self.directory.drop_agent_connection(&agent_id, &connection_id) {
            debug!(agent_id = %agent_id, connection_id = %connection_id, "Routing state removed");
        }
        let failed = self.pending.fail_connection(&connection_id);
        if failed > 0 {
            warn!(
                agent_id = %agent_id,
                connection_id = %connection_id,
                failed,
                "Failed in-flight exchanges on disconnect"
            );
        }

        let _ = outbound_tx.send(OutboundMessage::Close).await;
        info!(agent_id = %agent_id, connection_id = %connection_id, "Agent connection closed");
    }

    /// Run the login and registration exchange.
    ///
    /// Returns the authenticated agent id once the agent is fully installed
    /// in the directory, or `None` if the connection must be dropped. Nothing
    /// is mutated before both store reads have succeeded, so a failed
    /// handshake never leaves a half-registered agent behind.
    async fn handshake(
        &self,
        source: &mut WsSource,
        outbound: &mpsc::Sender<OutboundMessage>,
        connection_id: &str,
        peer_addr: SocketAddr,
    ) -> Option<String> {
        if outbound
            .send(OutboundMessage::Text(LOGIN_PROMPT.to_string()))
            .await
            .is_err()
        {
            return None;
        }

        let credentials = Self::read_data_message(source).await?;
        let (identity, secret) = match parse_credentials(&credentials) {
            Some(parts) => parts,
            None => {
                warn!(peer = %peer_addr, "Malformed credential message");
                let _ = outbound
                    .send(OutboundMessage::Text(AUTH_FAILED.to_string()))
                    .await;
                return None;
            }
        };

        match self.store.get(identity).await {
            Ok(Some(stored)) if stored == secret => {}
            Ok(_) => {
                // Unknown identity and wrong secret get the same reply, so
                // the error does not confirm which identities exist.
                warn!(identity = %identity, peer = %peer_addr, "Credential check failed");
                let _ = outbound
                    .send(OutboundMessage::Text(AUTH_FAILED.to_string()))
                    .await;
                return None;
            }
            Err(e) => {
                error!(identity = %identity, error = %e, "Credential store unavailable");
                let _ = outbound
                    .send(OutboundMessage::Text(STORE_UNAVAILABLE.to_string()))
                    .await;
                return None;
            }
        }

        let mappings = match self
            .store
            .scan_hash(identity, "", "", self.domain_limit)
            .await
        {
            Ok(mappings) => mappings,
            Err(e) => {
                error!(identity = %identity, error = %e, "Domain listing unavailable");
                let _ = outbound
                    .send(OutboundMessage::Text(STORE_UNAVAILABLE.to_string()))
                    .await;
                return None;
            }
        };

        for (domain, _target) in &mappings {
            self.directory.bind_domain(domain, identity);
        }

        let handle = TunnelHandle::new(identity, connection_id, outbound.clone());
        if let Some(superseded) = self.directory.set_connection(handle) {
            superseded.close().await;
        }

        // Past this point the agent is live; if the ack sends fail the relay
        // loop ends immediately and the normal teardown cleans up.
        let _ = outbound
            .send(OutboundMessage::Text(REGISTER_OK.to_string()))
            .await;
        let _ = outbound
            .send(OutboundMessage::Text(format_domain_list(&mappings)))
            .await;

        info!(
            agent_id = %identity,
            connection_id = %connection_id,
            domains = mappings.len(),
            "Agent registered"
        );
        Some(identity.to_string())
    }

    /// Pump reply frames from the agent back to their waiting exchanges.
    async fn relay(&self, source: &mut WsSource, agent_id: &str, connection_id: &str) {
        while let Some(result) = source.next().await {
            match result {
                Ok(Message::Binary(data)) => {
                    let frame = match RelayFrame::parse(Bytes::from(data)) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(agent_id = %agent_id, error = %e, "Discarding malformed reply frame");
                            continue;
                        }
                    };
                    // A false return means the waiter already gave up;
                    // fulfill logs it, the reply is dropped.
                    self.pending.fulfill(&frame.key, frame.payload);
                }
                Ok(Message::Text(text)) => {
                    debug!(agent_id = %agent_id, len = text.len(), "Ignoring text message during relay");
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong is handled by tungstenite.
                }
                Ok(Message::Close(_)) => {
                    debug!(agent_id = %agent_id, connection_id = %connection_id, "Agent sent close");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        agent_id = %agent_id,
                        connection_id = %connection_id,
                        error = %e,
                        "WebSocket read error"
                    );
                    break;
                }
            }
        }
    }

    /// Read the next data message during the handshake, skipping pings and
    /// pongs. Binary frames are accepted as credential bytes since older
    /// agents send them instead of text.
    async fn read_data_message(source: &mut WsSource) -> Option<String> {
        while let Some(result) = source.next().await {
            match result {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Binary(data)) => {
                    return Some(String::from_utf8_lossy(&data).into_owned())
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "WebSocket error during handshake");
                    return None;
                }
            }
        }
        None
    }

    /// Writer task owning the sink half of one agent connection.
    async fn write_outbound(
        mut sink: WsSink,
        mut rx: mpsc::Receiver<OutboundMessage>,
        connection_id: String,
    ) {
        while let Some(message) = rx.recv().await {
            let frame = match message {
                OutboundMessage::Text(text) => Message::Text(text),
                OutboundMessage::Binary(payload) => Message::Binary(payload.to_vec()),
                OutboundMessage::Close => break,
            };

            if let Err(e) = sink.send(frame).await {
                error!(connection_id = %connection_id, error = %e, "WebSocket send error");
                break;
            }
        }

        debug!(connection_id = %connection_id, "Writer task ended");
        let _ = sink.close().await;
    }
}
