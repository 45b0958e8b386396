//! Domain and connection tables for routing public traffic to agents
//!
//! Two maps make up the routing state: domain -> owning agent, and agent ->
//! live tunnel connection. Both sit behind one lock so removing an agent is
//! observed fully applied or not at all; no reader can see a connection
//! without its domains or the other way around.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::handle::TunnelHandle;

#[derive(Debug, Default)]
struct DirectoryInner {
    /// domain -> owning agent id
    domains: HashMap<String, String>,
    /// agent id -> live connection
    connections: HashMap<String, TunnelHandle>,
}

/// Routing directory mapping public domains to agents and agents to their
/// live tunnel connections.
#[derive(Debug, Clone)]
pub struct AgentDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(DirectoryInner::default())),
        }
    }

    /// Bind a domain to an agent. Rebinding is last-writer-wins; the
    /// previous owner (if any) is returned so callers can observe the move.
    pub fn bind_domain(&self, domain: &str, agent_id: &str) -> Option<String> {
        let mut inner = self.inner.write().unwrap();
        let previous = inner
            .domains
            .insert(domain.to_string(), agent_id.to_string());

        match previous {
            Some(ref prior) if prior != agent_id => {
                tracing::info!(
                    domain = %domain,
                    from = %prior,
                    to = %agent_id,
                    "Domain rebound to a different agent"
                );
            }
            Some(_) => {}
            None => {
                tracing::debug!(domain = %domain, agent_id = %agent_id, "Domain bound");
            }
        }

        previous
    }

    /// Look up the agent owning a domain.
    pub fn resolve_domain(&self, domain: &str) -> Option<String> {
        let inner = self.inner.read().unwrap();
        inner.domains.get(domain).cloned()
    }

    /// Install the live connection for an agent, returning any superseded
    /// handle. The caller is responsible for closing the old connection.
    pub fn set_connection(&self, handle: TunnelHandle) -> Option<TunnelHandle> {
        let mut inner = self.inner.write().unwrap();
        let agent_id = handle.agent_id().to_string();
        let connection_id = handle.connection_id().to_string();
        let superseded = inner.connections.insert(agent_id.clone(), handle);

        if let Some(ref old) = superseded {
            tracing::info!(
                agent_id = %agent_id,
                connection_id = %connection_id,
                superseded = %old.connection_id(),
                "Replaced live agent connection"
            );
        } else {
            tracing::info!(
                agent_id = %agent_id,
                connection_id = %connection_id,
                "Agent connection installed"
            );
        }

        superseded
    }

    /// Get the live connection for an agent.
    pub fn get_connection(&self, agent_id: &str) -> Option<TunnelHandle> {
        let inner = self.inner.read().unwrap();
        inner.connections.get(agent_id).cloned()
    }

    /// Remove an agent's connection and every domain it owns, atomically.
    /// Returns the number of domain bindings removed.
    pub fn drop_agent(&self, agent_id: &str) -> usize {
        let mut inner = self.inner.write().unwrap();
        let had_connection = inner.connections.remove(agent_id).is_some();
        let before = inner.domains.len();
        inner.domains.retain(|_, owner| owner != agent_id);
        let removed = before - inner.domains.len();

        if had_connection || removed > 0 {
            tracing::info!(agent_id = %agent_id, domains = removed, "Agent dropped from directory");
        }

        removed
    }

    /// Guarded teardown: remove the agent's connection and domains only
    /// while `connection_id` still owns the entry. A connection that was
    /// superseded by a reconnect finds someone else's id here and leaves
    /// the successor's state alone.
    pub fn drop_agent_connection(&self, agent_id: &str, connection_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();

        let owns_entry = inner
            .connections
            .get(agent_id)
            .map(|handle| handle.connection_id() == connection_id)
            .unwrap_or(false);
        if !owns_entry {
            tracing::debug!(
                agent_id = %agent_id,
                connection_id = %connection_id,
                "Skipping teardown for superseded connection"
            );
            return false;
        }

        inner.connections.remove(agent_id);
        let before = inner.domains.len();
        inner.domains.retain(|_, owner| owner != agent_id);

        tracing::info!(
            agent_id = %agent_id,
            connection_id = %connection_id,
            domains = before - inner.domains.len(),
            "Agent connection dropped"
        );
        true
    }

    /// Number of bound domains.
    pub fn domain_count(&self) -> usize {
        self.inner.read().unwrap().domains.len()
    }

    /// Number of live agent connections.
    pub fn connection_count(&self) -> usize {
        self.inner.read().unwrap().connections.len()
    }
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_handle(agent_id: &str, connection_id: &str) -> TunnelHandle {
        let (tx, rx) = mpsc::channel(4);
        std::mem::forget(rx);
        TunnelHandle::new(agent_id, connection_id, tx)
    }

    #[test]
    fn test_bind_and_resolve() {
        let directory = AgentDirectory::new();

        assert_eq!(directory.bind_domain("app.example.com", "alice"), None);
        assert_eq!(
            directory.resolve_domain("app.example.com"),
            Some("alice".to_string())
        );
    }

    #[test]
    fn test_resolve_unknown_domain() {
        let directory = AgentDirectory::new();
        assert_eq!(directory.resolve_domain("nope.example.com"), None);
    }

    #[test]
    fn test_rebinding_same_pair_is_idempotent() {
        let directory = AgentDirectory::new();

        directory.bind_domain("app.example.com", "alice");
        let previous = directory.bind_domain("app.example.com", "alice");

        assert_eq!(previous, Some("alice".to_string()));
        assert_eq!(directory.domain_count(), 1);
        assert_eq!(
            directory.resolve_domain("app.example.com"),
            Some("alice".to_string())
        );
    }

    #[test]
    fn test_rebinding_is_last_writer_wins() {
        let directory = AgentDirectory::new();

        directory.bind_domain("app.example.com", "alice");
        let previous = directory.bind_domain("app.example.com", "bob");

        assert_eq!(previous, Some("alice".to_string()));
        assert_eq!(
            directory.resolve_domain("app.example.com"),
            Some("bob".to_string())
        );
        assert_eq!(directory.domain_count(), 1);
    }

    #[test]
    fn test_set_and_get_connection() {
        let directory = AgentDirectory::new();

        assert!(directory.set_connection(test_handle("alice", "ws-1")).is_none());

        let handle = directory.get_connection("alice").unwrap();
        assert_eq!(handle.agent_id(), "alice");
        assert_eq!(handle.connection_id(), "ws-1");
        assert!(directory.get_connection("bob").is_none());
    }

    #[test]
    fn test_set_connection_supersedes_previous() {
        let directory = AgentDirectory::new();

        directory.set_connection(test_handle("alice", "ws-1"));
        let superseded = directory.set_connection(test_handle("alice", "ws-2"));

        assert_eq!(superseded.unwrap().connection_id(), "ws-1");
        assert_eq!(
            directory.get_connection("alice").unwrap().connection_id(),
            "ws-2"
        );
        assert_eq!(directory.connection_count(), 1);
    }

    #[test]
    fn test_drop_agent_removes_connection_and_all_domains() {
        let directory = AgentDirectory::new();

        directory.set_connection(test_handle("alice", "ws-1"));
        directory.bind_domain("a.example.com", "alice");
        directory.bind_domain("b.example.com", "alice");
        directory.bind_domain("c.example.com", "alice");
        directory.bind_domain("other.example.com", "bob");

        let removed = directory.drop_agent("alice");

        assert_eq!(removed, 3);
        assert!(directory.get_connection("alice").is_none());
        assert_eq!(directory.resolve_domain("a.example.com"), None);
        assert_eq!(directory.resolve_domain("b.example.com"), None);
        assert_eq!(directory.resolve_domain("c.example.com"), None);
        assert_eq!(
            directory.resolve_domain("other.example.com"),
            Some("bob".to_string())
        );
    }

    #[test]
    fn test_drop_unknown_agent_removes_nothing() {
        let directory = AgentDirectory::new();
        directory.bind_domain("app.example.com", "alice");

        assert_eq!(directory.drop_agent("nobody"), 0);
        assert_eq!(directory.domain_count(), 1);
    }

    #[test]
    fn test_guarded_drop_matches_owning_connection() {
        let directory = AgentDirectory::new();

        directory.set_connection(test_handle("alice", "ws-1"));
        directory.bind_domain("app.example.com", "alice");

        assert!(directory.drop_agent_connection("alice", "ws-1"));
        assert!(directory.get_connection("alice").is_none());
        assert_eq!(directory.resolve_domain("app.example.com"), None);
    }

    #[test]
    fn test_guarded_drop_ignores_superseded_connection() {
        let directory = AgentDirectory::new();

        directory.set_connection(test_handle("alice", "ws-1"));
        directory.bind_domain("app.example.com", "alice");
        // Reconnect replaces the entry before the old connection tears down.
        directory.set_connection(test_handle("alice", "ws-2"));

        assert!(!directory.drop_agent_connection("alice", "ws-1"));
        assert_eq!(
            directory.get_connection("alice").unwrap().connection_id(),
            "ws-2"
        );
        assert_eq!(
            directory.resolve_domain("app.example.com"),
            Some("alice".to_string())
        );
    }

    #[test]
    fn test_counts() {
        let directory = AgentDirectory::new();
        assert_eq!(directory.domain_count(), 0);
        assert_eq!(directory.connection_count(), 0);

        directory.set_connection(test_handle("alice", "ws-1"));
        directory.bind_domain("a.example.com", "alice");
        directory.bind_domain("b.example.com", "alice");

        assert_eq!(directory.domain_count(), 2);
        assert_eq!(directory.connection_count(), 1);
    }
}
