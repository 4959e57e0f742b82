//! A scriptable stand-in agent for local testing.
//!
//! Serves the agent side of the bridge protocol on `/` and two helper
//! endpoints: `POST /push` sends an unsolicited `chat_message` to every
//! connected bridge, `GET /status` reports counters.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use agent_link::protocol::{ErrorReport, FrameKind, StatusReport, encode_frame};
use agent_link::{ChatRequest, ChatResponse, ResponseMetadata, ResponseMode};
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const MODEL_VERSION: &str = "mock-v1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    /// Reply `Echo: {content}`
    Echo,
    /// Echo after `--delay-secs`
    Delay,
    /// Never reply to chat messages
    Silent,
    /// Reply with `success = false`
    Error,
}

#[derive(clap::Args, Debug, Clone)]
pub struct MockAgentArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value = "8085")]
    pub port: u16,

    #[arg(long, value_enum, default_value = "echo")]
    pub behavior: Behavior,

    /// Reply delay for `--behavior delay`
    #[arg(long, default_value = "2")]
    pub delay_secs: u64,

    /// Reported in reply metadata and status frames
    #[arg(long, default_value = "mock_agent")]
    pub agent_id: String,
}

pub struct MockAgent {
    agent_id: String,
    behavior: Behavior,
    delay: Duration,
    push_tx: broadcast::Sender<String>,
    connections: AtomicU64,
    messages_processed: AtomicU64,
    started: Instant,
}

impl MockAgent {
    pub fn new(agent_id: impl Into<String>, behavior: Behavior, delay: Duration) -> Self {
        let (push_tx, _) = broadcast::channel(64);
        Self {
            agent_id: agent_id.into(),
            behavior,
            delay,
            push_tx,
            connections: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn metadata(&self, started: Instant) -> ResponseMetadata {
        ResponseMetadata {
            agent_id: Some(self.agent_id.clone()),
            processing_time_ms: Some(started.elapsed().as_millis() as u64),
            confidence: Some(0.95),
            ai_model_version: Some(MODEL_VERSION.to_string()),
        }
    }

    /// The reply for `request`, or `None` when this agent stays quiet.
    async fn answer(&self, request: &ChatRequest) -> Option<ChatResponse> {
        let started = Instant::now();
        let (content, error_message) = match self.behavior {
            Behavior::Silent => return None,
            Behavior::Echo => (format!("Echo: {}", request.content), None),
            Behavior::Delay => {
                tokio::time::sleep(self.delay).await;
                (
                    format!(
                        "Delayed response after {}s: {}",
                        self.delay.as_secs(),
                        request.content
                    ),
                    None,
                )
            }
            Behavior::Error => (
                String::new(),
                Some("Simulated error for testing".to_string()),
            ),
        };
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        Some(ChatResponse {
            message_id: request.message_id.clone(),
            inbox_id: request.inbox_id.clone(),
            conversation_id: request.conversation_id,
            content,
            response_type: ResponseMode::Sync,
            metadata: Some(self.metadata(started)),
            success: error_message.is_none(),
            error_message,
        })
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            agent_id: Some(self.agent_id.clone()),
            status: Some("online".to_string()),
            capabilities: vec!["chat".to_string()],
            version: Some(MODEL_VERSION.to_string()),
            load_info: Some(json!({
                "messages_processed": self.messages_processed.load(Ordering::Relaxed),
            })),
        }
    }
}

pub fn router(agent: Arc<MockAgent>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/push", post(push_handler))
        .route("/status", get(status_handler))
        .with_state(agent)
}

pub async fn run(args: MockAgentArgs) -> Result<()> {
    let agent = Arc::new(MockAgent::new(
        &args.agent_id,
        args.behavior,
        Duration::from_secs(args.delay_secs),
    ));
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        agent_id = %args.agent_id,
        behavior = ?args.behavior,
        "mock agent listening on ws://{addr}/"
    );
    axum::serve(listener, router(agent))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(agent): State<Arc<MockAgent>>) -> Response {
    ws.on_upgrade(move |socket| serve_bridge(socket, agent))
}

async fn serve_bridge(socket: WebSocket, agent: Arc<MockAgent>) {
    // Subscribe before counting the connection so a push never misses it.
    let mut push_rx = agent.push_tx.subscribe();
    agent.connections.fetch_add(1, Ordering::Relaxed);
    info!(agent_id = %agent.agent_id, "bridge connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    // Pushed messages join the same outbound queue as replies.
    let tx_push = tx.clone();
    let push_task = async move {
        loop {
            match push_rx.recv().await {
                Ok(frame) => {
                    if tx_push.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("push broadcast lagged by {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    let sender_task = async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    };

    let agent_input = agent.clone();
    let input_task = async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => handle_frame(&agent_input, text.as_str(), &tx).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = push_task => {}
        _ = sender_task => {}
        _ = input_task => {}
    }

    agent.connections.fetch_sub(1, Ordering::Relaxed);
    info!(agent_id = %agent.agent_id, "bridge disconnected");
}

#[derive(Deserialize)]
struct IncomingFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

async fn handle_frame(agent: &Arc<MockAgent>, text: &str, tx: &mpsc::Sender<String>) {
    let frame: IncomingFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            let report = error_report(&agent.agent_id, "invalid_json", err.to_string());
            send(tx, FrameKind::Error, &report).await;
            return;
        }
    };

    match frame.kind.as_str() {
        "chat_message" => {
            let request: ChatRequest = match serde_json::from_value(frame.data) {
                Ok(request) => request,
                Err(err) => {
                    let report = error_report(&agent.agent_id, "invalid_message", err.to_string());
                    send(tx, FrameKind::Error, &report).await;
                    return;
                }
            };
            debug!(message_id = %request.message_id, "chat message received");
            // Replies may be delayed; keep reading meanwhile.
            let agent = agent.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(response) = agent.answer(&request).await {
                    send(&tx, FrameKind::ChatMessage, &response).await;
                }
            });
        }
        "ping" => {
            send(tx, FrameKind::Pong, &json!({ "agent_id": agent.agent_id })).await;
        }
        "status" => send(tx, FrameKind::Status, &agent.status_report()).await,
        other => {
            let report = error_report(
                &agent.agent_id,
                "unknown_message_type",
                format!("unknown message type {other}"),
            );
            send(tx, FrameKind::Error, &report).await;
        }
    }
}

fn error_report(agent_id: &str, code: &str, message: String) -> ErrorReport {
    ErrorReport {
        agent_id: Some(agent_id.to_string()),
        error_code: Some(code.to_string()),
        error_message: message,
        recoverable: true,
        context: None,
    }
}

async fn send<T: Serialize>(tx: &mpsc::Sender<String>, kind: FrameKind, data: &T) {
    match encode_frame(kind, data) {
        Ok(frame) => {
            let _ = tx.send(frame).await;
        }
        Err(err) => warn!(error = %err, "failed to encode frame"),
    }
}

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub inbox_id: String,
    pub conversation_id: i64,
    pub content: String,
}

async fn push_handler(
    State(agent): State<Arc<MockAgent>>,
    Json(req): Json<PushRequest>,
) -> Response {
    let message_id = format!("async_{}", chrono::Utc::now().timestamp_millis());
    let response = ChatResponse {
        message_id: message_id.clone(),
        inbox_id: req.inbox_id,
        conversation_id: req.conversation_id,
        content: req.content,
        response_type: ResponseMode::Async,
        metadata: Some(ResponseMetadata {
            processing_time_ms: Some(0),
            ..agent.metadata(Instant::now())
        }),
        success: true,
        error_message: None,
    };
    let frame = match encode_frame(FrameKind::ChatMessage, &response) {
        Ok(frame) => frame,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };
    // No subscribers just means no bridge is connected right now.
    let delivered = agent.push_tx.send(frame).unwrap_or(0);
    info!(%message_id, delivered, "pushed unsolicited message");
    Json(json!({ "status": "sent", "message_id": message_id, "delivered": delivered }))
        .into_response()
}

async fn status_handler(State(agent): State<Arc<MockAgent>>) -> impl IntoResponse {
    Json(json!({
        "agent_id": agent.agent_id,
        "behavior": agent.behavior,
        "websocket_connections": agent.connections.load(Ordering::Relaxed),
        "messages_processed": agent.messages_processed.load(Ordering::Relaxed),
        "uptime_secs": agent.started.elapsed().as_secs(),
    }))
}
