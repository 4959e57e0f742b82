use std::collections::BTreeMap;

use axum::{Json, extract::State, response::IntoResponse};
use serde::{Deserialize, Serialize};

use crate::AppState;

pub const SERVICE_NAME: &str = "chatwoot-bridge";

#[derive(Debug, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub service: String,
    pub status: String,
    pub chatwoot_api: String,
    pub agents: AgentSummary,
    pub inboxes: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSummary {
    pub total: usize,
    pub connected: usize,
    /// Connection count keyed by status name
    pub by_status: BTreeMap<String, usize>,
}

/// Liveness probe
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Bridge status: agent connections plus a live Chatwoot API probe
pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let agents = state.agents.all_agent_status();
    let mut by_status = BTreeMap::new();
    for info in agents.values() {
        *by_status.entry(info.status.to_string()).or_insert(0) += 1;
    }
    let api_healthy = state.chatwoot.health_check().await;

    Json(BridgeStatus {
        service: SERVICE_NAME.to_string(),
        status: "running".to_string(),
        chatwoot_api: if api_healthy { "healthy" } else { "unhealthy" }.to_string(),
        agents: AgentSummary {
            total: agents.len(),
            connected: agents.values().filter(|a| a.connected).count(),
            by_status,
        },
        inboxes: state.routing.len(),
        uptime_secs: state.metrics.uptime_secs(),
    })
}

/// Bridge counters
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
