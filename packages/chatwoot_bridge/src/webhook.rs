//! Chatwoot webhook events and the per-message trip through an agent.
//!
//! Payloads are read leniently: Chatwoot sends ids as numbers or strings
//! depending on version and event, so the nested objects stay as raw JSON
//! and are picked apart with the helpers below.

use agent_link::{ChatRequest, MessageContext, MessageSender, ResponseMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

use crate::AppState;
use crate::config::InboxRoute;
use crate::metrics::BridgeMetrics;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: Value,
    #[serde(default)]
    pub created_at: Value,
    #[serde(default)]
    pub sender: Value,
    #[serde(default)]
    pub conversation: Value,
    #[serde(default)]
    pub inbox: Value,
    #[serde(default)]
    pub account: Value,
}

impl WebhookEvent {
    /// Chatwoot encodes `incoming` as either the string or the enum ordinal 0.
    pub fn is_incoming(&self) -> bool {
        match &self.message_type {
            Value::String(s) => s == "incoming",
            Value::Number(n) => n.as_u64() == Some(0),
            _ => false,
        }
    }

    /// `conversation.inbox_id`, falling back to `inbox.id`.
    pub fn inbox_id(&self) -> Option<String> {
        id_string(self.conversation.get("inbox_id")).or_else(|| id_string(self.inbox.get("id")))
    }

    pub fn conversation_id(&self) -> Option<i64> {
        id_i64(self.conversation.get("id"))
    }

    pub fn account_id(&self) -> Option<u64> {
        id_i64(self.account.get("id")).and_then(|id| u64::try_from(id).ok())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        parse_timestamp(&self.created_at).unwrap_or_else(Utc::now)
    }

    fn sender(&self) -> MessageSender {
        let text = |key: &str| self.sender.get(key).and_then(Value::as_str).map(str::to_string);
        MessageSender {
            id: id_string(self.sender.get("id")).unwrap_or_else(|| "unknown".to_string()),
            name: text("name").unwrap_or_else(|| "Unknown".to_string()),
            email: text("email"),
            kind: text("type").unwrap_or_else(|| "contact".to_string()),
        }
    }

    fn context(&self) -> MessageContext {
        MessageContext {
            channel: self
                .conversation
                .get("channel")
                .and_then(Value::as_str)
                .unwrap_or("web_widget")
                .to_string(),
            created_at: self.created_at(),
            additional_attributes: self
                .conversation
                .get("additional_attributes")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Build the agent request for this message under `route`.
    pub fn to_request(&self, route: &InboxRoute, conversation_id: i64) -> ChatRequest {
        ChatRequest {
            message_id: uuid::Uuid::new_v4().to_string(),
            inbox_id: route.inbox_id.clone(),
            conversation_id,
            content: self.content.clone().unwrap_or_default(),
            sender: self.sender(),
            context: self.context(),
            response_mode: route.response_mode,
            timeout_seconds: Some(route.timeout.as_secs()),
        }
    }
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn id_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// RFC 3339 strings (with or without `Z`) or unix seconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => DateTime::from_timestamp(n.as_i64()?, 0),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    ProcessedSync,
    ProcessedFallback,
    ForwardedAsync,
    Acknowledged,
    Ignored,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookReply {
    pub status: WebhookStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WebhookReply {
    fn new(status: WebhookStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Decode a verified webhook body. An empty body is treated as `{}`.
pub fn parse_body(body: &[u8]) -> Result<Value, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(body)
}

pub async fn process(state: &AppState, payload: Value) -> WebhookReply {
    let event: WebhookEvent = match serde_json::from_value(payload) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "webhook payload has an unexpected shape");
            return WebhookReply::new(WebhookStatus::Error, "invalid_payload");
        }
    };

    let reply = match event.event.as_str() {
        "message_created" => message_created(state, &event).await,
        "conversation_created" => {
            info!(conversation_id = ?event.conversation_id(), "conversation created");
            WebhookReply::new(WebhookStatus::Acknowledged, "Conversation created")
        }
        "webwidget_triggered" => {
            WebhookReply::new(WebhookStatus::Acknowledged, "Web widget triggered")
        }
        other => WebhookReply::new(
            WebhookStatus::Ignored,
            format!("Event type {other} not handled"),
        ),
    };

    if reply.status == WebhookStatus::Ignored {
        BridgeMetrics::incr(&state.metrics.webhooks_ignored);
    }
    reply
}

async fn message_created(state: &AppState, event: &WebhookEvent) -> WebhookReply {
    if !event.is_incoming() {
        return WebhookReply::new(WebhookStatus::Ignored, "Outgoing message ignored");
    }

    let Some(inbox_id) = event.inbox_id() else {
        error!("could not extract inbox_id from webhook payload");
        return WebhookReply::new(
            WebhookStatus::Error,
            "Could not extract inbox_id from payload",
        );
    };
    let Some(route) = state.routing.route(&inbox_id) else {
        warn!(%inbox_id, "no agent configured for inbox");
        return WebhookReply::new(
            WebhookStatus::Ignored,
            format!("No agent configured for inbox {inbox_id}"),
        );
    };
    let Some(conversation_id) = event.conversation_id() else {
        error!(%inbox_id, "could not extract conversation id from webhook payload");
        return WebhookReply::new(
            WebhookStatus::Error,
            "Could not extract conversation id from payload",
        );
    };
    let account_id = event
        .account_id()
        .unwrap_or_else(|| state.chatwoot.default_account_id());

    let request = event.to_request(route, conversation_id);
    info!(
        message_id = %request.message_id,
        agent_id = %route.agent_id,
        %inbox_id,
        conversation_id,
        mode = ?route.response_mode,
        "forwarding message to agent"
    );

    match route.response_mode {
        ResponseMode::Sync => {
            let reply = state
                .agents
                .send_sync(&route.websocket_url, &request, route.timeout)
                .await
                .filter(|response| response.success);
            match reply {
                Some(response) => {
                    BridgeMetrics::incr(&state.metrics.sync_replies);
                    post(state, account_id, conversation_id, &response.content).await;
                    WebhookReply::new(
                        WebhookStatus::ProcessedSync,
                        "Message processed and response sent",
                    )
                    .with_data(json!({ "response_content": response.content }))
                }
                None => fallback(state, account_id, conversation_id).await,
            }
        }
        ResponseMode::Async => {
            match state.agents.send_async(&route.websocket_url, &request).await {
                Ok(()) => {
                    BridgeMetrics::incr(&state.metrics.async_forwards);
                    WebhookReply::new(WebhookStatus::ForwardedAsync, "Message forwarded to agent")
                        .with_data(json!({ "message_id": request.message_id }))
                }
                Err(err) => {
                    warn!(
                        message_id = %request.message_id,
                        code = err.error_code(),
                        error = %err,
                        "async forward failed"
                    );
                    fallback(state, account_id, conversation_id).await
                }
            }
        }
    }
}

async fn fallback(state: &AppState, account_id: u64, conversation_id: i64) -> WebhookReply {
    BridgeMetrics::incr(&state.metrics.fallbacks);
    post(state, account_id, conversation_id, state.routing.fallback_message()).await;
    WebhookReply::new(
        WebhookStatus::ProcessedFallback,
        "Fallback response sent due to agent timeout",
    )
}

/// Failures are logged and counted; the webhook reply does not change.
async fn post(state: &AppState, account_id: u64, conversation_id: i64, content: &str) {
    if let Err(err) = state
        .chatwoot
        .post_reply(account_id, conversation_id, content)
        .await
    {
        BridgeMetrics::incr(&state.metrics.chatwoot_failures);
        error!(account_id, conversation_id, error = %err, "failed to post reply to chatwoot");
    }
}
