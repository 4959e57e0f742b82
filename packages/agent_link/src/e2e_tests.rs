//! End-to-end tests against loopback WebSocket agents.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use crate::{
    AgentManager, ChannelSink, ChatRequest, ConnectionStatus, LinkConfig, LinkError, LogSink,
    MessageContext, MessageSender, ResponseMode, StaticAgent,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type PeerSocket = WebSocketStream<TcpStream>;

// ── harness ─────────────────────────────────────────────────────────

struct TestAgent {
    url: String,
    task: JoinHandle<()>,
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_agent<F, Fut>(handler: F) -> TestAgent
where
    F: Fn(PeerSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    serve_on(listener, handler)
}

fn serve_on<F, Fut>(listener: TcpListener, handler: F) -> TestAgent
where
    F: Fn(PeerSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(ws) = accept_async(stream).await {
                    handler(ws).await;
                }
            });
        }
    });
    TestAgent {
        url: format!("ws://{addr}/ws"),
        task,
    }
}

/// An address nothing is listening on (until a test binds it).
async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn test_config() -> LinkConfig {
    LinkConfig {
        connect_timeout: Duration::from_secs(2),
        max_connect_attempts: 3,
        initial_backoff: Duration::from_millis(50),
        backoff_multiplier: 1.5,
        max_backoff: Duration::from_secs(1),
        ping_interval: Duration::from_secs(60),
        ping_timeout: Duration::from_millis(300),
        reconnect_interval: Duration::from_millis(100),
        reconnect_cooldown: Duration::from_millis(200),
        send_buffer: 64,
    }
}

fn request(message_id: &str, content: &str) -> ChatRequest {
    ChatRequest {
        message_id: message_id.to_string(),
        inbox_id: "42".to_string(),
        conversation_id: 7,
        content: content.to_string(),
        sender: MessageSender {
            id: "3".to_string(),
            name: "Ada".to_string(),
            email: Some("ada@example.com".to_string()),
            kind: "contact".to_string(),
        },
        context: MessageContext {
            channel: "Channel::WebWidget".to_string(),
            created_at: Utc::now(),
            additional_attributes: Map::new(),
        },
        response_mode: ResponseMode::Sync,
        timeout_seconds: None,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// ── peer behaviours ─────────────────────────────────────────────────

/// Next `chat_message` payload the peer receives.
async fn next_request(ws: &mut PeerSocket) -> Option<Value> {
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(text.as_str()).ok()?;
            if frame["type"] == "chat_message" {
                return Some(frame["data"].clone());
            }
        }
    }
    None
}

fn chat_frame(message_id: &str, content: &str) -> Message {
    let frame = json!({
        "type": "chat_message",
        "data": {
            "message_id": message_id,
            "inbox_id": "42",
            "conversation_id": 7,
            "content": content,
        }
    });
    Message::Text(frame.to_string().into())
}

fn reply_to(request: &Value, content: &str) -> Message {
    chat_frame(request["message_id"].as_str().unwrap_or_default(), content)
}

async fn echo(mut ws: PeerSocket) {
    while let Some(req) = next_request(&mut ws).await {
        let content = format!("Echo: {}", req["content"].as_str().unwrap_or_default());
        if ws.send(reply_to(&req, &content)).await.is_err() {
            break;
        }
    }
}

/// Echoes like `echo`, but sends its replies as binary frames.
async fn binary_echo(mut ws: PeerSocket) {
    while let Some(req) = next_request(&mut ws).await {
        let content = format!("Echo: {}", req["content"].as_str().unwrap_or_default());
        let Message::Text(text) = reply_to(&req, &content) else {
            break;
        };
        let bytes = text.as_str().as_bytes().to_vec();
        if ws.send(Message::Binary(bytes.into())).await.is_err() {
            break;
        }
    }
}

async fn silent(mut ws: PeerSocket) {
    while next_request(&mut ws).await.is_some() {}
}

async fn slow_echo(mut ws: PeerSocket) {
    while let Some(req) = next_request(&mut ws).await {
        tokio::time::sleep(Duration::from_millis(300)).await;
        if ws.send(reply_to(&req, "late")).await.is_err() {
            break;
        }
    }
}

/// Collects five requests, then answers them newest first.
async fn reverse_batch(mut ws: PeerSocket) {
    let mut batch = Vec::new();
    while batch.len() < 5 {
        match next_request(&mut ws).await {
            Some(req) => batch.push(req),
            None => return,
        }
    }
    for req in batch.iter().rev() {
        let content = format!("reply to {}", req["message_id"].as_str().unwrap_or_default());
        if ws.send(reply_to(req, &content)).await.is_err() {
            return;
        }
    }
    silent(ws).await;
}

async fn close_after_three(mut ws: PeerSocket) {
    for _ in 0..3 {
        if next_request(&mut ws).await.is_none() {
            return;
        }
    }
    let _ = ws.close(None).await;
}

/// Pushes a message of its own before answering the first request.
async fn push_then_echo(mut ws: PeerSocket) {
    let Some(req) = next_request(&mut ws).await else {
        return;
    };
    let _ = ws.send(chat_frame("push-1", "proactive hello")).await;
    let _ = ws.send(reply_to(&req, "Echo")).await;
    silent(ws).await;
}

/// Never reads, so protocol pings go unanswered.
async fn deaf(ws: PeerSocket) {
    let _ws = ws;
    std::future::pending::<()>().await;
}

/// Reports status, pings the bridge and announces the pong it got back.
async fn pinger(mut ws: PeerSocket) {
    let status = json!({"type": "status", "data": {"status": "connected", "version": "1.2"}});
    let error = json!({"type": "error", "data": {"error_code": "warmup", "error_message": "cold cache"}});
    let ping = json!({"type": "ping", "data": {}});
    for frame in [status, error, ping] {
        if ws.send(Message::Text(frame.to_string().into())).await.is_err() {
            return;
        }
    }
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap_or_default();
            if frame["type"] == "pong" {
                let _ = ws.send(chat_frame("pong-seen", "got pong")).await;
            }
        }
    }
}

// ── request / reply ─────────────────────────────────────────────────

#[tokio::test]
async fn test_echo_round_trip() {
    let agent = spawn_agent(echo).await;
    let (sink, mut unsolicited) = ChannelSink::new();
    let manager = AgentManager::new(test_config(), Arc::new(sink));

    let started = Instant::now();
    let reply = manager
        .send_sync(&agent.url, &request("m1", "hello"), Duration::from_secs(5))
        .await
        .expect("echo agent should reply");

    assert_eq!(reply.message_id, "m1");
    assert_eq!(reply.content, "Echo: hello");
    assert_eq!(reply.inbox_id, "42");
    assert_eq!(reply.conversation_id, 7);
    assert!(started.elapsed() < Duration::from_secs(2));

    let status = manager.agent_status("agent_1").unwrap();
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert_eq!(status.pending_requests, 0);
    assert_eq!(status.generation, 1);
    assert!(unsolicited.try_recv().is_err());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_binary_reply_resolves_like_text() {
    let agent = spawn_agent(binary_echo).await;
    let manager = AgentManager::new(test_config(), Arc::new(LogSink));

    let reply = manager
        .try_send_sync(&agent.url, &request("b1", "hello"), Duration::from_secs(5))
        .await
        .expect("binary reply should resolve the request");
    assert_eq!(reply.message_id, "b1");
    assert_eq!(reply.content, "Echo: hello");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_silent_agent_times_out_and_cleans_up() {
    let agent = spawn_agent(silent).await;
    let manager = AgentManager::new(test_config(), Arc::new(LogSink));

    let started = Instant::now();
    let reply = manager
        .send_sync(&agent.url, &request("m2", "anyone?"), Duration::from_secs(2))
        .await;
    let elapsed = started.elapsed();

    assert!(reply.is_none());
    assert!(elapsed >= Duration::from_secs(2), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned late: {elapsed:?}");

    let status = manager.agent_status("agent_1").unwrap();
    assert_eq!(status.pending_requests, 0);
    assert_eq!(status.status, ConnectionStatus::Connected);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_replies_route_by_message_id() {
    let agent = spawn_agent(reverse_batch).await;
    let manager = AgentManager::new(test_config(), Arc::new(LogSink));
    let url = agent.url.as_str();
    let manager_ref = &manager;

    let replies = join_all((0..5).map(|i| async move {
        let id = format!("m{i}");
        let reply = manager_ref
            .send_sync(url, &request(&id, "x"), Duration::from_secs(5))
            .await;
        (id, reply)
    }))
    .await;

    for (id, reply) in replies {
        let reply = reply.unwrap_or_else(|| panic!("no reply for {id}"));
        assert_eq!(reply.message_id, id);
        assert_eq!(reply.content, format!("reply to {id}"));
    }
    assert_eq!(manager.registry().len(), 1);
    assert_eq!(manager.agent_status("agent_1").unwrap().generation, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_agent_disconnect_cancels_every_pending_request() {
    let agent = spawn_agent(close_after_three).await;
    let manager = AgentManager::new(test_config(), Arc::new(LogSink));
    let url = agent.url.as_str();
    let manager_ref = &manager;

    let started = Instant::now();
    let results = join_all((0..3).map(|i| async move {
        manager_ref
            .try_send_sync(url, &request(&format!("c{i}"), "x"), Duration::from_secs(10))
            .await
    }))
    .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    for result in results {
        assert!(
            matches!(result, Err(LinkError::Cancelled { .. })),
            "expected cancellation, got {result:?}"
        );
    }
    let status = manager.agent_status("agent_1").unwrap();
    assert_eq!(status.status, ConnectionStatus::Disconnected);
    assert_eq!(status.pending_requests, 0);
    assert!(!status.connected);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_in_flight_message_id_is_rejected() {
    let agent = spawn_agent(silent).await;
    let manager = Arc::new(AgentManager::new(test_config(), Arc::new(LogSink)));

    let first = {
        let manager = manager.clone();
        let url = agent.url.clone();
        tokio::spawn(async move {
            manager
                .send_sync(&url, &request("dup", "first"), Duration::from_secs(1))
                .await
        })
    };
    assert!(
        wait_until(|| manager
            .agent_status("agent_1")
            .is_some_and(|s| s.pending_requests == 1))
        .await
    );

    let second = manager
        .try_send_sync(&agent.url, &request("dup", "second"), Duration::from_secs(1))
        .await;
    assert!(matches!(second, Err(LinkError::DuplicateMessageId { .. })));
    assert_eq!(manager.agent_status("agent_1").unwrap().pending_requests, 1);

    assert!(first.await.unwrap().is_none());
    assert_eq!(manager.agent_status("agent_1").unwrap().pending_requests, 0);

    manager.shutdown().await;
}

// ── unsolicited traffic ─────────────────────────────────────────────

#[tokio::test]
async fn test_proactive_message_reaches_sink_once() {
    let agent = spawn_agent(push_then_echo).await;
    let (sink, mut unsolicited) = ChannelSink::new();
    let manager = AgentManager::new(test_config(), Arc::new(sink));

    let reply = manager
        .send_sync(&agent.url, &request("m1", "hi"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.message_id, "m1");

    let pushed = tokio::time::timeout(TEST_TIMEOUT, unsolicited.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.message_id, "push-1");
    assert_eq!(pushed.agent_id, "agent_1");
    assert_eq!(pushed.content, "proactive hello");
    assert_eq!(pushed.conversation_id, 7);
    assert!(unsolicited.try_recv().is_err());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_late_reply_becomes_unsolicited() {
    let agent = spawn_agent(slow_echo).await;
    let (sink, mut unsolicited) = ChannelSink::new();
    let manager = AgentManager::new(test_config(), Arc::new(sink));

    let result = manager
        .try_send_sync(&agent.url, &request("late-1", "x"), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(LinkError::Timeout { .. })));

    let late = tokio::time::timeout(TEST_TIMEOUT, unsolicited.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(late.message_id, "late-1");
    assert_eq!(manager.agent_status("agent_1").unwrap().pending_requests, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_async_send_reply_surfaces_through_sink() {
    let agent = spawn_agent(echo).await;
    let (sink, mut unsolicited) = ChannelSink::new();
    let manager = AgentManager::new(test_config(), Arc::new(sink));

    manager
        .send_async(&agent.url, &request("a1", "later please"))
        .await
        .unwrap();
    assert_eq!(manager.agent_status("agent_1").unwrap().pending_requests, 0);

    let reply = tokio::time::timeout(TEST_TIMEOUT, unsolicited.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.message_id, "a1");
    assert_eq!(reply.content, "Echo: later please");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_agent_ping_is_answered_and_reports_are_tolerated() {
    let agent = spawn_agent(pinger).await;
    let (sink, mut unsolicited) = ChannelSink::new();
    let manager = AgentManager::new(test_config(), Arc::new(sink));

    let conn = manager.registry().get_or_create(&agent.url);
    assert!(manager.connector().ensure_connected(&conn).await);

    let seen = tokio::time::timeout(TEST_TIMEOUT, unsolicited.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.message_id, "pong-seen");
    assert!(conn.is_connected());

    manager.shutdown().await;
}

// ── connection lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_unreachable_agent_exhausts_retries() {
    let addr = unused_addr().await;
    let manager = AgentManager::new(test_config(), Arc::new(LogSink));
    let url = format!("ws://{addr}/ws");

    let result = manager
        .try_send_sync(&url, &request("m1", "x"), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(LinkError::NotConnected { .. })));

    let status = manager.agent_status("agent_1").unwrap();
    assert_eq!(status.status, ConnectionStatus::Error);
    assert_eq!(status.connection_attempts, 3);
    assert!(status.last_connect_attempt.is_some());
    assert_eq!(status.pending_requests, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_sweep_reconnects_once_agent_comes_up() {
    let addr = unused_addr().await;
    let url = format!("ws://{addr}/ws");
    let manager = AgentManager::new(test_config(), Arc::new(LogSink));
    manager.start(&[StaticAgent::new("support", url.clone())]);

    assert!(
        wait_until(|| manager
            .agent_status("support")
            .is_some_and(|s| s.status == ConnectionStatus::Error && s.connection_attempts >= 3))
        .await
    );

    let _agent = serve_on(TcpListener::bind(addr).await.unwrap(), echo);
    assert!(
        wait_until(|| manager
            .agent_status("support")
            .is_some_and(|s| s.connected))
        .await,
        "sweep never revived the connection"
    );

    let reply = manager
        .send_sync(&url, &request("m1", "back"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.content, "Echo: back");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_sweep_survives_runaway_backoff() {
    let addr = unused_addr().await;
    let url = format!("ws://{addr}/ws");
    let config = LinkConfig {
        backoff_multiplier: 1e12,
        max_backoff: Duration::from_millis(100),
        ..test_config()
    };
    let manager = AgentManager::new(config, Arc::new(LogSink));
    let conn = manager.registry().get_or_create(&url);
    assert!(!manager.connector().connect(&conn).await);
    assert_eq!(conn.connection_attempts(), 3);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(manager.monitor().sweep_once().await, 0);
    assert_eq!(conn.status(), ConnectionStatus::Error);
    assert_eq!(conn.connection_attempts(), 6);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_replaced_socket_is_not_torn_down_by_old_listener() {
    let agent = spawn_agent(echo).await;
    let manager = AgentManager::new(test_config(), Arc::new(LogSink));
    let conn = manager.registry().get_or_create(&agent.url);

    assert!(manager.connector().ensure_connected(&conn).await);
    assert_eq!(conn.generation(), 1);
    manager.connector().disconnect(&conn);
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);

    assert!(manager.connector().ensure_connected(&conn).await);
    assert_eq!(conn.generation(), 2);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(conn.is_connected());

    let reply = manager
        .send_sync(&agent.url, &request("m1", "still here"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.content, "Echo: still here");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_health_probe_tracks_pongs() {
    let agent = spawn_agent(echo).await;
    let manager = AgentManager::new(test_config(), Arc::new(LogSink));
    let conn = manager.registry().get_or_create(&agent.url);
    assert!(manager.connector().ensure_connected(&conn).await);

    assert!(manager.monitor().probe(&conn).await);
    assert!(conn.last_pong().is_some());
    assert!(conn.is_connected());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_ping_marks_connection_error() {
    let agent = spawn_agent(deaf).await;
    let manager = AgentManager::new(test_config(), Arc::new(LogSink));
    let conn = manager.registry().get_or_create(&agent.url);
    assert!(manager.connector().ensure_connected(&conn).await);

    assert_eq!(manager.monitor().check_all().await, 0);
    assert_eq!(conn.status(), ConnectionStatus::Error);
    assert!(!conn.is_connected());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_and_forgets_everything() {
    let agent = spawn_agent(echo).await;
    let manager = AgentManager::new(test_config(), Arc::new(LogSink));
    manager.start(&[StaticAgent::new("support", agent.url.clone())]);
    assert!(
        wait_until(|| manager
            .agent_status("support")
            .is_some_and(|s| s.connected))
        .await
    );
    let conn = manager.registry().get("support").unwrap();

    manager.shutdown().await;

    assert!(manager.registry().is_empty());
    assert!(manager.all_agent_status().is_empty());
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn test_connect_finishing_after_shutdown_is_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let manager = Arc::new(AgentManager::new(test_config(), Arc::new(LogSink)));
    let conn = manager.registry().get_or_create(&url);
    let connecting = tokio::spawn({
        let manager = manager.clone();
        let conn = conn.clone();
        async move { manager.connector().ensure_connected(&conn).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.shutdown().await;

    assert!(!connecting.await.unwrap());
    assert!(!conn.is_connected());
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert!(manager.registry().is_empty());
    tokio::time::timeout(TEST_TIMEOUT, peer)
        .await
        .expect("peer socket was never closed")
        .unwrap();
}
