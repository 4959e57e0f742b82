use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::AppState;
use crate::metrics::BridgeMetrics;
use crate::signature::{SIGNATURE_HEADER, SignatureError, TIMESTAMP_HEADER};
use crate::webhook::{self, WebhookReply};

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid webhook signature: {0}")]
    Signature(#[from] SignatureError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            WebhookError::Signature(_) => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            WebhookError::InvalidJson(_) => (StatusCode::BAD_REQUEST, "invalid_json"),
        };
        (
            status,
            Json(serde_json::json!({ "error": self.to_string(), "error_code": code })),
        )
            .into_response()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Chatwoot agent-bot webhook. The raw body is verified before it is parsed.
pub async fn chatwoot_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookReply>, WebhookError> {
    BridgeMetrics::incr(&state.metrics.webhooks_received);
    debug!(
        bytes = body.len(),
        signed = headers.contains_key(SIGNATURE_HEADER),
        "webhook received"
    );

    let checked = state
        .verifier
        .verify(
            &body,
            header(&headers, SIGNATURE_HEADER),
            header(&headers, TIMESTAMP_HEADER),
        )
        .map_err(WebhookError::from)
        .and_then(|()| webhook::parse_body(&body).map_err(WebhookError::from));
    let payload = match checked {
        Ok(payload) => payload,
        Err(err) => {
            BridgeMetrics::incr(&state.metrics.webhooks_rejected);
            error!(error = %err, "rejecting webhook");
            return Err(err);
        }
    };

    Ok(Json(webhook::process(&state, payload).await))
}
