use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::LinkConfig;
use crate::connection::AgentStatusInfo;
use crate::connector::Connector;
use crate::dispatcher::Dispatcher;
use crate::error::LinkError;
use crate::monitor::HealthMonitor;
use crate::protocol::{ChatRequest, ChatResponse};
use crate::registry::Registry;
use crate::sink::UnsolicitedSink;

/// A statically configured agent, connected eagerly on [`AgentManager::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAgent {
    pub agent_id: String,
    pub endpoint_url: String,
}

impl StaticAgent {
    pub fn new(agent_id: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            endpoint_url: endpoint_url.into(),
        }
    }
}

/// Owns the registry, the connector and the background monitor.
pub struct AgentManager {
    registry: Arc<Registry>,
    connector: Arc<Connector>,
    dispatcher: Dispatcher,
    monitor: Arc<HealthMonitor>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl AgentManager {
    pub fn new(config: LinkConfig, sink: Arc<dyn UnsolicitedSink>) -> Self {
        let registry = Arc::new(Registry::new());
        let shutdown = CancellationToken::new();
        let connector = Arc::new(Connector::new(Arc::new(config), sink, shutdown.clone()));
        Self {
            dispatcher: Dispatcher::new(registry.clone(), connector.clone()),
            monitor: Arc::new(HealthMonitor::new(registry.clone(), connector.clone())),
            registry,
            connector,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register `agents`, start connecting them in the background and launch
    /// the monitor loops. Later calls are no-ops.
    pub fn start(&self, agents: &[StaticAgent]) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let conns: Vec<_> = agents
            .iter()
            .map(|agent| self.registry.register(&agent.agent_id, &agent.endpoint_url))
            .collect();

        let mut tasks = self.monitor.spawn(self.shutdown.child_token());
        if !conns.is_empty() {
            let connector = self.connector.clone();
            let shutdown = self.shutdown.child_token();
            tasks.push(tokio::spawn(async move {
                let total = conns.len();
                let attempts = join_all(conns.iter().map(|conn| connector.ensure_connected(conn)));
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    results = attempts => {
                        let connected = results.into_iter().filter(|ok| *ok).count();
                        info!(connected, total, "initial agent connections settled");
                    }
                }
            }));
        }
        self.tasks.lock().extend(tasks);
        info!(agents = agents.len(), "agent manager started");
    }

    /// Stop the background loops, close every socket and empty the registry.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        let conns = self.registry.clear();
        for conn in &conns {
            self.connector.disconnect(conn);
        }
        info!(closed = conns.len(), "agent manager stopped");
    }

    pub async fn send_sync(
        &self,
        url: &str,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Option<ChatResponse> {
        self.dispatcher.send_sync(url, request, timeout).await
    }

    pub async fn try_send_sync(
        &self,
        url: &str,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, LinkError> {
        self.dispatcher.try_send_sync(url, request, timeout).await
    }

    pub async fn send_async(&self, url: &str, request: &ChatRequest) -> Result<(), LinkError> {
        self.dispatcher.send_async(url, request).await
    }

    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatusInfo> {
        self.registry.get(agent_id).map(|conn| conn.snapshot())
    }

    pub fn all_agent_status(&self) -> BTreeMap<String, AgentStatusInfo> {
        self.registry
            .all()
            .into_iter()
            .map(|info| (info.agent_id.clone(), info))
            .collect()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }
}
