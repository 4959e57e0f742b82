pub mod agents;
pub mod health;
pub mod webhook;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

pub use agents::{get_agent_status, list_agent_status};
pub use health::{health_handler, metrics_handler, status_handler};
pub use webhook::chatwoot_webhook;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/webhook/chatwoot", post(chatwoot_webhook))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/agents", get(list_agent_status))
        .route("/agents/{agent_id}", get(get_agent_status))
}
