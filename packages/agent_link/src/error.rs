use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Errors produced while talking to an agent.
///
/// Connection failures are split into retryable transport problems
/// (`Connect`, `ConnectTimeout`) and everything else, which the connector
/// gives up on immediately.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connection to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("connection to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    #[error("handshake with {url} failed: {source}")]
    Handshake {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("agent {agent_id} is not connected")]
    NotConnected { agent_id: String },

    #[error("message {message_id} is already awaiting a reply")]
    DuplicateMessageId { message_id: String },

    #[error("no reply to {message_id} within {timeout:?}")]
    Timeout {
        message_id: String,
        timeout: Duration,
    },

    #[error("wait for {message_id} was cancelled by a disconnect")]
    Cancelled { message_id: String },

    #[error("socket writer for agent {agent_id} has stopped")]
    ChannelClosed { agent_id: String },

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl LinkError {
    /// Classify a failed `connect_async` call.
    ///
    /// Closed sockets, OS-level I/O errors and malformed URLs are retried;
    /// rejected upgrades, TLS and protocol failures are not.
    pub fn from_connect(url: &str, err: tungstenite::Error) -> Self {
        let retryable = matches!(
            err,
            tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Io(_)
                | tungstenite::Error::Url(_)
        );
        if retryable {
            Self::Connect {
                url: url.to_string(),
                source: err,
            }
        } else {
            Self::Handshake {
                url: url.to_string(),
                source: err,
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::ConnectTimeout { .. })
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect_failed",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Handshake { .. } => "handshake_failed",
            Self::NotConnected { .. } => "not_connected",
            Self::DuplicateMessageId { .. } => "duplicate_message_id",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::ChannelClosed { .. } => "channel_closed",
            Self::Encode(_) => "encode_failed",
        }
    }
}
