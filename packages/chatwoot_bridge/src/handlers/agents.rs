use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;

/// Every known agent connection, keyed by agent id
pub async fn list_agent_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.agents.all_agent_status())
}

pub async fn get_agent_status(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Response {
    match state.agents.agent_status(&agent_id) {
        Some(info) => Json(info).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("unknown agent {agent_id}"),
                "error_code": "agent_not_found"
            })),
        )
            .into_response(),
    }
}
