use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connection::AgentConnection;
use crate::connector::Connector;
use crate::error::LinkError;
use crate::protocol::{self, ChatRequest, ChatResponse, FrameKind};
use crate::registry::Registry;

/// Removes a pending entry when the waiting future finishes or is dropped,
/// so an abandoned wait never leaks into the table.
struct PendingGuard<'a> {
    conn: &'a AgentConnection,
    message_id: &'a str,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.conn.forget_pending(self.message_id, self.ticket);
    }
}

/// Sends chat requests to agents and correlates their replies.
pub struct Dispatcher {
    registry: Arc<Registry>,
    connector: Arc<Connector>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, connector: Arc<Connector>) -> Self {
        Self {
            registry,
            connector,
        }
    }

    /// Send `request` and wait up to `timeout` for the matching reply.
    ///
    /// Every failure (unreachable agent, timeout, disconnect while waiting)
    /// is logged and collapses to `None`.
    pub async fn send_sync(
        &self,
        url: &str,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Option<ChatResponse> {
        match self.try_send_sync(url, request, timeout).await {
            Ok(response) => Some(response),
            Err(err) => {
                warn!(
                    url,
                    message_id = %request.message_id,
                    code = err.error_code(),
                    error = %err,
                    "no reply from agent"
                );
                None
            }
        }
    }

    /// Like [`send_sync`](Self::send_sync), but reports why no reply came.
    pub async fn try_send_sync(
        &self,
        url: &str,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, LinkError> {
        let conn = self.connected(url).await?;
        let frame = protocol::encode_frame(FrameKind::ChatMessage, request)?;

        let pending = conn.begin_request(&request.message_id)?;
        let _guard = PendingGuard {
            conn: &conn,
            message_id: &request.message_id,
            ticket: pending.ticket,
        };

        let started = Instant::now();
        pending
            .outbound
            .send(Message::Text(frame.into()))
            .await
            .map_err(|_| LinkError::ChannelClosed {
                agent_id: conn.agent_id().to_string(),
            })?;
        debug!(
            agent_id = %conn.agent_id(),
            message_id = %request.message_id,
            "request sent, awaiting reply"
        );

        match tokio::time::timeout(timeout, pending.reply_rx).await {
            Ok(Ok(response)) => {
                info!(
                    agent_id = %conn.agent_id(),
                    message_id = %request.message_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "agent replied"
                );
                Ok(response)
            }
            Ok(Err(_)) => Err(LinkError::Cancelled {
                message_id: request.message_id.clone(),
            }),
            Err(_) => Err(LinkError::Timeout {
                message_id: request.message_id.clone(),
                timeout,
            }),
        }
    }

    /// Fire-and-forget: send `request` without registering a wait. Any reply
    /// the agent sends later surfaces through the unsolicited sink.
    pub async fn send_async(&self, url: &str, request: &ChatRequest) -> Result<(), LinkError> {
        let conn = self.connected(url).await?;
        let frame = protocol::encode_frame(FrameKind::ChatMessage, request)?;
        let outbound = conn.outbound().ok_or_else(|| LinkError::NotConnected {
            agent_id: conn.agent_id().to_string(),
        })?;
        outbound
            .send(Message::Text(frame.into()))
            .await
            .map_err(|_| LinkError::ChannelClosed {
                agent_id: conn.agent_id().to_string(),
            })?;
        info!(
            agent_id = %conn.agent_id(),
            message_id = %request.message_id,
            "async request sent"
        );
        Ok(())
    }

    async fn connected(&self, url: &str) -> Result<Arc<AgentConnection>, LinkError> {
        let conn = self.registry.get_or_create(url);
        if self.connector.ensure_connected(&conn).await {
            Ok(conn)
        } else {
            Err(LinkError::NotConnected {
                agent_id: conn.agent_id().to_string(),
            })
        }
    }
}
