//! Bridge metrics for observability

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use agent_link::{UnsolicitedMessage, UnsolicitedSink};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct BridgeMetrics {
    // Webhook metrics
    pub webhooks_received: AtomicU64,
    /// Rejected by signature verification or unparseable
    pub webhooks_rejected: AtomicU64,
    pub webhooks_ignored: AtomicU64,

    // Agent traffic
    pub sync_replies: AtomicU64,
    /// Fallback message posted instead of an agent reply
    pub fallbacks: AtomicU64,
    pub async_forwards: AtomicU64,
    pub unsolicited_received: AtomicU64,

    // Chatwoot delivery
    pub unsolicited_relayed: AtomicU64,
    pub chatwoot_failures: AtomicU64,

    start_time: Option<Instant>,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            webhooks: WebhookMetrics {
                received: load(&self.webhooks_received),
                rejected: load(&self.webhooks_rejected),
                ignored: load(&self.webhooks_ignored),
            },
            agents: AgentTrafficMetrics {
                sync_replies: load(&self.sync_replies),
                fallbacks: load(&self.fallbacks),
                async_forwards: load(&self.async_forwards),
                unsolicited_received: load(&self.unsolicited_received),
            },
            chatwoot: ChatwootMetrics {
                unsolicited_relayed: load(&self.unsolicited_relayed),
                failures: load(&self.chatwoot_failures),
            },
        }
    }
}

/// Counts unsolicited messages as they leave the listener.
pub struct CountingSink(pub Arc<BridgeMetrics>);

impl UnsolicitedSink for CountingSink {
    fn deliver(&self, _message: UnsolicitedMessage) {
        BridgeMetrics::incr(&self.0.unsolicited_received);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub webhooks: WebhookMetrics,
    pub agents: AgentTrafficMetrics,
    pub chatwoot: ChatwootMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMetrics {
    pub received: u64,
    pub rejected: u64,
    pub ignored: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTrafficMetrics {
    pub sync_replies: u64,
    pub fallbacks: u64,
    pub async_forwards: u64,
    pub unsolicited_received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatwootMetrics {
    pub unsolicited_relayed: u64,
    pub failures: u64,
}
