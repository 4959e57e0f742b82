//! Per-agent connection state.
//!
//! One [`AgentConnection`] exists per endpoint URL for the lifetime of the
//! registry. Its socket, status and pending-reply table live behind a single
//! synchronous lock so that every transition is atomic: a connection holds a
//! socket exactly when it is `Connected`, and the pending table is emptied
//! the moment the socket goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::LinkError;
use crate::protocol::ChatResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one connection, as reported by the status API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusInfo {
    pub agent_id: String,
    pub websocket_url: String,
    pub status: ConnectionStatus,
    pub connected: bool,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
    pub last_connect_attempt: Option<DateTime<Utc>>,
    pub connection_attempts: u64,
    pub pending_requests: usize,
    pub generation: u64,
}

/// The live half of a connection: the writer queue and the token that stops
/// both socket tasks of one generation.
#[derive(Debug)]
pub(crate) struct SocketHandle {
    pub(crate) generation: u64,
    pub(crate) outbound: mpsc::Sender<Message>,
    pub(crate) cancel: CancellationToken,
}

impl SocketHandle {
    /// Stop the socket tasks. The writer sends a close frame on its way out.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

struct PendingReply {
    ticket: u64,
    reply_tx: oneshot::Sender<ChatResponse>,
    created_at: DateTime<Utc>,
}

/// Outcome of offering an inbound reply to the pending table.
#[derive(Debug)]
pub(crate) enum Resolution {
    Delivered,
    /// Nobody was waiting; the reply is handed back for the sink.
    Unmatched(ChatResponse),
}

/// A registered wait for one reply.
pub(crate) struct PendingTicket {
    pub(crate) ticket: u64,
    pub(crate) reply_rx: oneshot::Receiver<ChatResponse>,
    pub(crate) outbound: mpsc::Sender<Message>,
}

struct ConnectionState {
    status: ConnectionStatus,
    socket: Option<SocketHandle>,
    generation: u64,
    last_connect_attempt: Option<DateTime<Utc>>,
    last_ping: Option<DateTime<Utc>>,
    last_pong: Option<DateTime<Utc>>,
    pending: HashMap<String, PendingReply>,
    next_ticket: u64,
    pong_waiter: Option<oneshot::Sender<()>>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            socket: None,
            generation: 0,
            last_connect_attempt: None,
            last_ping: None,
            last_pong: None,
            pending: HashMap::new(),
            next_ticket: 0,
            pong_waiter: None,
        }
    }
}

pub struct AgentConnection {
    agent_id: String,
    endpoint_url: String,
    state: Mutex<ConnectionState>,
    /// Serializes connect attempts so concurrent callers share one socket.
    pub(crate) connect_lock: tokio::sync::Mutex<()>,
    connection_attempts: AtomicU64,
}

impl AgentConnection {
    pub fn new(agent_id: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            endpoint_url: endpoint_url.into(),
            state: Mutex::new(ConnectionState::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            connection_attempts: AtomicU64::new(0),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        let state = self.state.lock();
        state.status == ConnectionStatus::Connected && state.socket.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn last_connect_attempt(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_connect_attempt
    }

    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_pong
    }

    pub fn snapshot(&self) -> AgentStatusInfo {
        let state = self.state.lock();
        AgentStatusInfo {
            agent_id: self.agent_id.clone(),
            websocket_url: self.endpoint_url.clone(),
            status: state.status,
            connected: state.status == ConnectionStatus::Connected && state.socket.is_some(),
            last_ping: state.last_ping,
            last_pong: state.last_pong,
            last_connect_attempt: state.last_connect_attempt,
            connection_attempts: self.connection_attempts(),
            pending_requests: state.pending.len(),
            generation: state.generation,
        }
    }

    /// Whether the reconnect sweep should try this connection again.
    ///
    /// Connections that have never attempted a connect are left alone; they
    /// connect lazily on first use.
    pub fn due_for_reconnect(&self, now: DateTime<Utc>, cooldown: std::time::Duration) -> bool {
        let state = self.state.lock();
        let idle = matches!(
            state.status,
            ConnectionStatus::Disconnected | ConnectionStatus::Error
        );
        let cooled = state.last_connect_attempt.is_some_and(|at| {
            now.signed_duration_since(at)
                .to_std()
                .is_ok_and(|age| age > cooldown)
        });
        idle && cooled
    }

    /// Start a connect attempt. Any socket still attached is torn down first.
    pub(crate) fn begin_attempt(&self) {
        let stale = {
            let mut state = self.state.lock();
            let stale = self.release(&mut state);
            state.status = ConnectionStatus::Connecting;
            state.last_connect_attempt = Some(Utc::now());
            stale
        };
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(socket) = stale {
            socket.close();
        }
    }

    pub(crate) fn mark_failed(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.socket.is_none());
        state.status = ConnectionStatus::Error;
    }

    /// Attach a freshly opened socket and return its generation.
    pub(crate) fn install_socket(
        &self,
        outbound: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        state.socket = Some(SocketHandle {
            generation,
            outbound,
            cancel,
        });
        state.status = ConnectionStatus::Connected;
        state.last_ping = Some(Utc::now());
        generation
    }

    /// Detach the socket, moving to `status` and cancelling every pending wait.
    ///
    /// With `only_generation` set the call is a no-op unless that generation
    /// still owns the socket, so a listener of an old socket can never tear
    /// down its replacement. Returns the detached socket for closing.
    pub(crate) fn detach(
        &self,
        status: ConnectionStatus,
        only_generation: Option<u64>,
    ) -> Option<SocketHandle> {
        let mut state = self.state.lock();
        if let Some(generation) = only_generation {
            match &state.socket {
                Some(socket) if socket.generation == generation => {}
                _ => return None,
            }
        }
        let socket = self.release(&mut state);
        state.status = status;
        socket
    }

    fn release(&self, state: &mut ConnectionState) -> Option<SocketHandle> {
        let cancelled = state.pending.len();
        // Dropping the senders wakes every waiter with a cancellation.
        state.pending.clear();
        state.pong_waiter = None;
        if cancelled > 0 {
            info!(
                agent_id = %self.agent_id,
                cancelled,
                "cancelled pending requests on disconnect"
            );
        }
        state.socket.take()
    }

    /// Register a wait for `message_id` on the live socket.
    pub(crate) fn begin_request(&self, message_id: &str) -> Result<PendingTicket, LinkError> {
        let mut state = self.state.lock();
        let outbound = match (&state.socket, state.status) {
            (Some(socket), ConnectionStatus::Connected) => socket.outbound.clone(),
            _ => {
                return Err(LinkError::NotConnected {
                    agent_id: self.agent_id.clone(),
                });
            }
        };
        if state.pending.contains_key(message_id) {
            return Err(LinkError::DuplicateMessageId {
                message_id: message_id.to_string(),
            });
        }
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        let (reply_tx, reply_rx) = oneshot::channel();
        state.pending.insert(
            message_id.to_string(),
            PendingReply {
                ticket,
                reply_tx,
                created_at: Utc::now(),
            },
        );
        Ok(PendingTicket {
            ticket,
            reply_rx,
            outbound,
        })
    }

    /// Drop the wait registered under `ticket`, if it is still there.
    pub(crate) fn forget_pending(&self, message_id: &str, ticket: u64) -> bool {
        let mut state = self.state.lock();
        match state.pending.get(message_id) {
            Some(pending) if pending.ticket == ticket => {
                state.pending.remove(message_id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn resolve(&self, response: ChatResponse) -> Resolution {
        let pending = self.state.lock().pending.remove(&response.message_id);
        match pending {
            Some(pending) => {
                let waited = Utc::now().signed_duration_since(pending.created_at);
                debug!(
                    agent_id = %self.agent_id,
                    message_id = %response.message_id,
                    waited_ms = waited.num_milliseconds(),
                    "resolved pending request"
                );
                // The waiter may have given up in the meantime; that is fine.
                let _ = pending.reply_tx.send(response);
                Resolution::Delivered
            }
            None => Resolution::Unmatched(response),
        }
    }

    /// Writer queue of the live socket.
    pub(crate) fn outbound(&self) -> Option<mpsc::Sender<Message>> {
        let state = self.state.lock();
        state.socket.as_ref().map(|socket| socket.outbound.clone())
    }

    /// Arm a one-shot waiter for the next pong and record the ping time.
    pub(crate) fn expect_pong(&self) -> Option<(oneshot::Receiver<()>, mpsc::Sender<Message>)> {
        let mut state = self.state.lock();
        let outbound = state.socket.as_ref()?.outbound.clone();
        let (tx, rx) = oneshot::channel();
        state.pong_waiter = Some(tx);
        state.last_ping = Some(Utc::now());
        Some((rx, outbound))
    }

    pub(crate) fn pong_received(&self) {
        let mut state = self.state.lock();
        state.last_pong = Some(Utc::now());
        if let Some(waiter) = state.pong_waiter.take() {
            let _ = waiter.send(());
        }
    }
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("agent_id", &self.agent_id)
            .field("endpoint_url", &self.endpoint_url)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseMode;
    use std::time::Duration;

    fn reply(message_id: &str) -> ChatResponse {
        ChatResponse {
            message_id: message_id.into(),
            inbox_id: "1".into(),
            conversation_id: 1,
            content: "ok".into(),
            response_type: ResponseMode::Sync,
            metadata: None,
            success: true,
            error_message: None,
        }
    }

    fn connected() -> (AgentConnection, mpsc::Receiver<Message>, CancellationToken) {
        let conn = AgentConnection::new("agent_1", "ws://127.0.0.1:9/ws");
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        conn.begin_attempt();
        conn.install_socket(tx, cancel.clone());
        (conn, rx, cancel)
    }

    #[test]
    fn test_starts_disconnected() {
        let conn = AgentConnection::new("agent_1", "ws://x");
        let info = conn.snapshot();
        assert_eq!(info.status, ConnectionStatus::Disconnected);
        assert!(!info.connected);
        assert_eq!(info.connection_attempts, 0);
        assert!(info.last_connect_attempt.is_none());
    }

    #[test]
    fn test_install_marks_connected() {
        let (conn, _rx, _cancel) = connected();
        assert!(conn.is_connected());
        assert_eq!(conn.generation(), 1);
        assert_eq!(conn.connection_attempts(), 1);
        assert!(conn.snapshot().last_ping.is_some());
    }

    #[test]
    fn test_requests_need_a_socket() {
        let conn = AgentConnection::new("agent_1", "ws://x");
        assert!(matches!(
            conn.begin_request("m1"),
            Err(LinkError::NotConnected { .. })
        ));
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_message_id_is_rejected() {
        let (conn, _rx, _cancel) = connected();
        let _first = conn.begin_request("m1").unwrap();
        assert!(matches!(
            conn.begin_request("m1"),
            Err(LinkError::DuplicateMessageId { .. })
        ));
        assert_eq!(conn.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_delivers_to_waiter() {
        let (conn, _rx, _cancel) = connected();
        let ticket = conn.begin_request("m1").unwrap();
        assert!(matches!(conn.resolve(reply("m1")), Resolution::Delivered));
        assert_eq!(ticket.reply_rx.await.unwrap().message_id, "m1");
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_unmatched_reply_is_handed_back() {
        let (conn, _rx, _cancel) = connected();
        let Resolution::Unmatched(back) = conn.resolve(reply("stray")) else {
            panic!("stray reply must not resolve anything");
        };
        assert_eq!(back.message_id, "stray");
    }

    #[test]
    fn test_second_resolution_is_unmatched() {
        let (conn, _rx, _cancel) = connected();
        let _ticket = conn.begin_request("m1").unwrap();
        assert!(matches!(conn.resolve(reply("m1")), Resolution::Delivered));
        assert!(matches!(conn.resolve(reply("m1")), Resolution::Unmatched(_)));
    }

    #[tokio::test]
    async fn test_detach_cancels_pending() {
        let (conn, _rx, cancel) = connected();
        let a = conn.begin_request("a").unwrap();
        let b = conn.begin_request("b").unwrap();

        let socket = conn.detach(ConnectionStatus::Disconnected, None).unwrap();
        socket.close();

        assert!(cancel.is_cancelled());
        assert!(a.reply_rx.await.is_err());
        assert!(b.reply_rx.await.is_err());
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_stale_generation_cannot_detach() {
        let (conn, _rx, _cancel) = connected();
        let (tx, _rx2) = mpsc::channel(8);
        conn.begin_attempt();
        let generation = conn.install_socket(tx, CancellationToken::new());
        assert_eq!(generation, 2);

        assert!(conn.detach(ConnectionStatus::Disconnected, Some(1)).is_none());
        assert!(conn.is_connected());
        assert!(conn.detach(ConnectionStatus::Disconnected, Some(2)).is_some());
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_begin_attempt_tears_down_previous_socket() {
        let (conn, _rx, cancel) = connected();
        let _pending = conn.begin_request("m1").unwrap();
        conn.begin_attempt();
        assert!(cancel.is_cancelled());
        assert_eq!(conn.status(), ConnectionStatus::Connecting);
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.connection_attempts(), 2);
    }

    #[test]
    fn test_forget_only_removes_own_ticket() {
        let (conn, _rx, _cancel) = connected();
        let first = conn.begin_request("m1").unwrap();
        assert!(matches!(conn.resolve(reply("m1")), Resolution::Delivered));
        let second = conn.begin_request("m1").unwrap();

        assert!(!conn.forget_pending("m1", first.ticket));
        assert_eq!(conn.pending_count(), 1);
        assert!(conn.forget_pending("m1", second.ticket));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pong_resolves_waiter() {
        let (conn, _rx, _cancel) = connected();
        let (pong_rx, _outbound) = conn.expect_pong().unwrap();
        conn.pong_received();
        pong_rx.await.unwrap();
        assert!(conn.last_pong().is_some());
    }

    #[test]
    fn test_reconnect_due_after_cooldown() {
        let conn = AgentConnection::new("agent_1", "ws://x");
        let now = Utc::now();
        assert!(!conn.due_for_reconnect(now, Duration::from_secs(30)));

        conn.begin_attempt();
        conn.mark_failed();
        assert!(!conn.due_for_reconnect(Utc::now(), Duration::from_secs(30)));
        let later = Utc::now() + chrono::Duration::seconds(31);
        assert!(conn.due_for_reconnect(later, Duration::from_secs(30)));
    }

    #[test]
    fn test_connected_is_never_due_for_reconnect() {
        let (conn, _rx, _cancel) = connected();
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert!(!conn.due_for_reconnect(later, Duration::from_secs(30)));
    }
}
