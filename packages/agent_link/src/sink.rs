//! Consumers of agent messages that no caller is waiting for.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::ChatResponse;

/// A `chat_message` from an agent with no matching pending request: either
/// a proactive push or a reply that arrived after its caller gave up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnsolicitedMessage {
    pub agent_id: String,
    pub message_id: String,
    pub inbox_id: String,
    pub conversation_id: i64,
    pub content: String,
    pub success: bool,
}

impl UnsolicitedMessage {
    pub fn from_response(agent_id: &str, response: ChatResponse) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            message_id: response.message_id,
            inbox_id: response.inbox_id,
            conversation_id: response.conversation_id,
            content: response.content,
            success: response.success,
        }
    }
}

/// Receives unsolicited messages from listener tasks.
///
/// Called inline on the socket read path, so implementations must not block.
pub trait UnsolicitedSink: Send + Sync + 'static {
    fn deliver(&self, message: UnsolicitedMessage);
}

/// Logs and discards.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl UnsolicitedSink for LogSink {
    fn deliver(&self, message: UnsolicitedMessage) {
        info!(
            agent_id = %message.agent_id,
            message_id = %message.message_id,
            inbox_id = %message.inbox_id,
            conversation_id = message.conversation_id,
            "unsolicited agent message (no consumer)"
        );
    }
}

/// Forwards into an unbounded channel for a worker task to drain.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UnsolicitedMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UnsolicitedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UnsolicitedSink for ChannelSink {
    fn deliver(&self, message: UnsolicitedMessage) {
        if let Err(err) = self.tx.send(message) {
            warn!(
                message_id = %err.0.message_id,
                "unsolicited message dropped: consumer has gone away"
            );
        }
    }
}

/// Hands every message to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn UnsolicitedSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn UnsolicitedSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl UnsolicitedSink for FanoutSink {
    fn deliver(&self, message: UnsolicitedMessage) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.deliver(message.clone());
            }
            last.deliver(message);
        }
    }
}
