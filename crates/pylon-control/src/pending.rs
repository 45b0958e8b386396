//! Pending exchange tracker
//!
//! Tracks public requests forwarded over agent tunnels and routes each reply
//! back to the public connection that is waiting for it. Exchanges are keyed
//! by correlation key, and each one remembers which agent connection it was
//! sent over so a dying connection can fail exactly its own exchanges.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct PendingEntry {
    agent_id: String,
    connection_id: String,
    reply_tx: oneshot::Sender<Bytes>,
    opened_at: Instant,
}

/// Tracks in-flight exchanges awaiting agent replies
#[derive(Clone)]
pub struct PendingExchanges {
    /// Maps correlation key -> entry holding the reply channel
    exchanges: Arc<DashMap<String, PendingEntry>>,
}

impl PendingExchanges {
    pub fn new() -> Self {
        Self {
            exchanges: Arc::new(DashMap::new()),
        }
    }

    /// Register a new exchange under a correlation key.
    /// Returns the receiver the reply payload will arrive on. Registering a
    /// key that is already in flight replaces the old entry, dropping its
    /// sender so the stale waiter sees a closed channel.
    pub fn register(
        &self,
        key: &str,
        agent_id: &str,
        connection_id: &str,
    ) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            agent_id: agent_id.to_string(),
            connection_id: connection_id.to_string(),
            reply_tx: tx,
            opened_at: Instant::now(),
        };
        if self.exchanges.insert(key.to_string(), entry).is_some() {
            warn!(key = %key, "Correlation key reused while still in flight");
        }
        debug!(key = %key, agent_id = %agent_id, "Registered pending exchange");
        rx
    }

    /// Deliver a reply payload for a correlation key.
    /// Returns true if a waiter received it. A missing key is routine: the
    /// waiter may have timed out or hung up before the agent replied.
    pub fn fulfill(&self, key: &str, payload: Bytes) -> bool {
        if let Some((_, entry)) = self.exchanges.remove(key) {
            let elapsed = entry.opened_at.elapsed();
            if entry.reply_tx.send(payload).is_err() {
                debug!(key = %key, "Reply arrived after the waiter hung up");
                return false;
            }
            debug!(key = %key, elapsed_ms = elapsed.as_millis() as u64, "Reply delivered");
            return true;
        }
        debug!(key = %key, "Discarding reply with no pending exchange");
        false
    }

    /// Cancel an exchange (e.g. on timeout or client hangup).
    /// Returns true if an entry was removed.
    pub fn cancel(&self, key: &str) -> bool {
        if self.exchanges.remove(key).is_some() {
            debug!(key = %key, "Cancelled pending exchange");
            return true;
        }
        false
    }

    /// Fail every exchange that was sent over the given agent connection.
    /// Dropping the entries closes their reply channels, so each waiter
    /// observes the failure immediately instead of running out its timeout.
    /// Returns the number of exchanges failed.
    pub fn fail_connection(&self, connection_id: &str) -> usize {
        let keys: Vec<String> = self
            .exchanges
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for key in keys {
            // Guard against the key having been fulfilled and re-registered
            // over a different connection since the scan.
            if let Some((_, entry)) = self
                .exchanges
                .remove_if(&key, |_, entry| entry.connection_id == connection_id)
            {
                debug!(key = %key, agent_id = %entry.agent_id, "Failing exchange, connection lost");
                failed += 1;
            }
        }
        failed
    }

    /// Number of exchanges currently in flight.
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

impl Default for PendingExchanges {
    fn default() -> Self {
        Self::new()
    }
}
