//! Background upkeep: heartbeats for live sockets and a periodic sweep that
//! revives dead ones.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{AgentConnection, ConnectionStatus};
use crate::connector::Connector;
use crate::registry::Registry;

pub struct HealthMonitor {
    registry: Arc<Registry>,
    connector: Arc<Connector>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, connector: Arc<Connector>) -> Self {
        Self {
            registry,
            connector,
        }
    }

    /// Spawn the heartbeat loop and the reconnect sweep. Both stop when
    /// `shutdown` is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let config = self.connector.config();
        let health = {
            let monitor = self.clone();
            let shutdown = shutdown.clone();
            let period = config.ping_interval;
            tokio::spawn(async move {
                monitor
                    .run_every(period, shutdown, "health check", |m| async move {
                        m.check_all().await;
                    })
                    .await
            })
        };
        let sweep = {
            let monitor = self.clone();
            let period = config.reconnect_interval;
            tokio::spawn(async move {
                monitor
                    .run_every(period, shutdown, "reconnect sweep", |m| async move {
                        m.sweep_once().await;
                    })
                    .await
            })
        };
        vec![health, sweep]
    }

    async fn run_every<F, Fut>(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
        name: &'static str,
        pass: F,
    ) where
        F: Fn(Arc<Self>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let period = period.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(loop_name = name, period_ms = period.as_millis() as u64, "monitor loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = pass(self.clone()) => {}
            }
        }
        debug!(loop_name = name, "monitor loop stopped");
    }

    /// Ping every connected agent once. Returns how many answered.
    pub async fn check_all(&self) -> usize {
        let connected: Vec<_> = self
            .registry
            .connections()
            .into_iter()
            .filter(|conn| conn.is_connected())
            .collect();
        let results = join_all(connected.into_iter().map(|conn| {
            let connector = self.connector.clone();
            contained(conn.clone(), "health check", async move {
                probe_with(&connector, &conn).await
            })
        }))
        .await;
        results.into_iter().filter(|healthy| *healthy).count()
    }

    /// Send a protocol ping and wait for the pong. On silence the socket is
    /// closed and the connection marked `Error`.
    pub async fn probe(&self, conn: &AgentConnection) -> bool {
        probe_with(&self.connector, conn).await
    }

    /// Retry every idle connection whose last attempt is older than the
    /// cooldown. Returns how many came back.
    pub async fn sweep_once(&self) -> usize {
        let cooldown = self.connector.config().reconnect_cooldown;
        let now = Utc::now();
        let due: Vec<Arc<AgentConnection>> = self
            .registry
            .connections()
            .into_iter()
            .filter(|conn| conn.due_for_reconnect(now, cooldown))
            .collect();
        if due.is_empty() {
            return 0;
        }

        let results = join_all(due.iter().map(|conn| {
            let connector = self.connector.clone();
            let target = conn.clone();
            contained(conn.clone(), "reconnect", async move {
                info!(agent_id = %target.agent_id(), status = %target.status(), "attempting reconnect");
                connector.reconnect(&target).await
            })
        }))
        .await;
        let revived = results.into_iter().filter(|ok| *ok).count();
        info!(due = due.len(), revived, "reconnect sweep finished");
        revived
    }
}

async fn probe_with(connector: &Connector, conn: &AgentConnection) -> bool {
    let Some((pong_rx, outbound)) = conn.expect_pong() else {
        return false;
    };
    let timeout = connector.config().ping_timeout;
    let healthy = outbound.send(Message::Ping(Vec::new().into())).await.is_ok()
        && matches!(tokio::time::timeout(timeout, pong_rx).await, Ok(Ok(())));

    if healthy {
        debug!(agent_id = %conn.agent_id(), "agent answered ping");
    } else {
        warn!(
            agent_id = %conn.agent_id(),
            timeout_ms = timeout.as_millis() as u64,
            "agent failed health check"
        );
        connector.disconnect_with(conn, ConnectionStatus::Error);
    }
    healthy
}

/// Run one per-connection job in its own task so a panic fails only that
/// connection's pass. A panicked job counts as `false`.
async fn contained<F>(conn: Arc<AgentConnection>, job: &'static str, fut: F) -> bool
where
    F: Future<Output = bool> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(ok) => ok,
        Err(err) => {
            error!(agent_id = %conn.agent_id(), job, error = %err, "monitor job crashed");
            false
        }
    }
}
