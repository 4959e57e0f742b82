//! Read side of an agent socket.
//!
//! Each connected generation gets one reader task. It routes replies to
//! their waiters, forwards everything else to the unsolicited sink, and on
//! exit detaches the socket, but only if its own generation still owns it.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::SplitStream;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{AgentConnection, ConnectionStatus, Resolution};
use crate::connector::WsStream;
use crate::protocol::{self, FrameKind, InboundFrame};
use crate::sink::{UnsolicitedMessage, UnsolicitedSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Cancelled,
    ClosedByAgent,
    StreamEnded,
    ReadError,
    Panicked,
}

impl Exit {
    fn status(self) -> ConnectionStatus {
        match self {
            Exit::ReadError | Exit::Panicked => ConnectionStatus::Error,
            Exit::Cancelled | Exit::ClosedByAgent | Exit::StreamEnded => {
                ConnectionStatus::Disconnected
            }
        }
    }
}

pub(crate) fn spawn(
    conn: Arc<AgentConnection>,
    stream: SplitStream<WsStream>,
    generation: u64,
    cancel: CancellationToken,
    sink: Arc<dyn UnsolicitedSink>,
) {
    tokio::spawn(async move {
        // The reader runs in its own task so a panic while handling a frame
        // still reaches the cleanup below.
        let reader = tokio::spawn(read_loop(conn.clone(), stream, cancel.clone(), sink));
        let exit = match reader.await {
            Ok(exit) => exit,
            Err(err) => {
                error!(agent_id = %conn.agent_id(), error = %err, "agent listener crashed");
                Exit::Panicked
            }
        };

        cancel.cancel();
        if conn.detach(exit.status(), Some(generation)).is_some() {
            info!(
                agent_id = %conn.agent_id(),
                generation,
                reason = ?exit,
                "agent connection lost"
            );
        } else {
            debug!(
                agent_id = %conn.agent_id(),
                generation,
                "listener of a replaced socket exited"
            );
        }
    });
}

async fn read_loop(
    conn: Arc<AgentConnection>,
    mut stream: SplitStream<WsStream>,
    cancel: CancellationToken,
    sink: Arc<dyn UnsolicitedSink>,
) -> Exit {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Exit::Cancelled,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&conn, text.as_str(), sink.as_ref()),
                Some(Ok(Message::Pong(_))) => conn.pong_received(),
                Some(Ok(Message::Close(frame))) => {
                    debug!(agent_id = %conn.agent_id(), ?frame, "agent closed the socket");
                    return Exit::ClosedByAgent;
                }
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_text(&conn, text, sink.as_ref()),
                    Err(err) => {
                        warn!(agent_id = %conn.agent_id(), error = %err, "dropping non-UTF-8 binary frame");
                    }
                },
                // Protocol pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(agent_id = %conn.agent_id(), error = %err, "agent socket read failed");
                    return Exit::ReadError;
                }
                None => return Exit::StreamEnded,
            }
        }
    }
}

fn handle_text(conn: &AgentConnection, text: &str, sink: &dyn UnsolicitedSink) {
    let frame = match protocol::decode_frame(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(agent_id = %conn.agent_id(), error = %err, "dropping undecodable frame");
            return;
        }
    };

    match frame {
        InboundFrame::Chat(response) => match conn.resolve(response) {
            Resolution::Delivered => {}
            Resolution::Unmatched(response) => {
                info!(
                    agent_id = %conn.agent_id(),
                    message_id = %response.message_id,
                    "unsolicited message from agent"
                );
                sink.deliver(UnsolicitedMessage::from_response(conn.agent_id(), response));
            }
        },
        InboundFrame::Ping(_) => reply_pong(conn),
        InboundFrame::Pong(_) => conn.pong_received(),
        InboundFrame::Status(report) => {
            info!(
                agent_id = %conn.agent_id(),
                status = report.status.as_deref().unwrap_or("unknown"),
                version = report.version.as_deref().unwrap_or("-"),
                capabilities = ?report.capabilities,
                "agent status report"
            );
        }
        InboundFrame::Error(report) => {
            warn!(
                agent_id = %conn.agent_id(),
                code = report.error_code.as_deref().unwrap_or("unknown"),
                recoverable = report.recoverable,
                "agent reported error: {}",
                report.error_message
            );
        }
    }
}

fn reply_pong(conn: &AgentConnection) {
    let Some(outbound) = conn.outbound() else {
        return;
    };
    let body = json!({ "agent_id": conn.agent_id() });
    match protocol::encode_frame(FrameKind::Pong, &body) {
        Ok(text) => {
            if outbound.try_send(Message::Text(text.into())).is_err() {
                debug!(agent_id = %conn.agent_id(), "pong dropped: writer queue full");
            }
        }
        Err(err) => warn!(agent_id = %conn.agent_id(), error = %err, "failed to encode pong"),
    }
}
