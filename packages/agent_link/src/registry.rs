use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{AgentConnection, AgentStatusInfo};

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Arc<AgentConnection>>,
    id_by_url: HashMap<String, String>,
}

impl Inner {
    fn insert(&mut self, agent_id: String, url: &str) -> Arc<AgentConnection> {
        let conn = Arc::new(AgentConnection::new(agent_id.clone(), url));
        self.by_id.insert(agent_id.clone(), conn.clone());
        self.id_by_url.insert(url.to_string(), agent_id);
        conn
    }

    fn next_generated_id(&self) -> String {
        let mut n = self.by_id.len() + 1;
        loop {
            let candidate = format!("agent_{n}");
            if !self.by_id.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// All known agent connections, keyed by agent id and by endpoint URL.
///
/// Lookup-or-create is atomic: concurrent callers asking for the same URL
/// always receive the same [`AgentConnection`].
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection for `url`, creating one with a generated `agent_{n}` id if
    /// the URL has not been seen before.
    pub fn get_or_create(&self, url: &str) -> Arc<AgentConnection> {
        let mut inner = self.inner.lock();
        if let Some(conn) = inner
            .id_by_url
            .get(url)
            .and_then(|id| inner.by_id.get(id))
        {
            return conn.clone();
        }
        let agent_id = inner.next_generated_id();
        debug!(%agent_id, url, "registering agent on first use");
        inner.insert(agent_id, url)
    }

    /// Register a statically configured agent under a chosen id.
    ///
    /// A URL that is already known keeps its existing connection. An id
    /// that is already bound to another URL is left untouched.
    pub fn register(&self, agent_id: &str, url: &str) -> Arc<AgentConnection> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .id_by_url
            .get(url)
            .and_then(|id| inner.by_id.get(id))
        {
            if existing.agent_id() != agent_id {
                warn!(
                    requested = agent_id,
                    existing = existing.agent_id(),
                    url,
                    "endpoint already registered under another id"
                );
            }
            return existing.clone();
        }
        if let Some(existing) = inner.by_id.get(agent_id) {
            warn!(
                agent_id,
                url,
                existing_url = existing.endpoint_url(),
                "agent id already bound to another endpoint; keeping the original"
            );
            return existing.clone();
        }
        info!(agent_id, url, "registered agent");
        inner.insert(agent_id.to_string(), url)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.inner.lock().by_id.get(agent_id).cloned()
    }

    pub fn find_by_url(&self, url: &str) -> Option<Arc<AgentConnection>> {
        let inner = self.inner.lock();
        inner
            .id_by_url
            .get(url)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Every connection, ordered by agent id.
    pub fn connections(&self) -> Vec<Arc<AgentConnection>> {
        let mut conns: Vec<_> = self.inner.lock().by_id.values().cloned().collect();
        conns.sort_by(|a, b| a.agent_id().cmp(b.agent_id()));
        conns
    }

    pub fn all(&self) -> Vec<AgentStatusInfo> {
        self.connections().iter().map(|c| c.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every connection, returning them so the caller can close them.
    pub fn clear(&self) -> Vec<Arc<AgentConnection>> {
        let mut inner = self.inner.lock();
        inner.id_by_url.clear();
        inner.by_id.drain().map(|(_, conn)| conn).collect()
    }
}
