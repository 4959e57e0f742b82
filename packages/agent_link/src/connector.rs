use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::connection::{AgentConnection, ConnectionStatus};
use crate::error::LinkError;
use crate::listener;
use crate::sink::UnsolicitedSink;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long the writer waits for its close frame to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Opens, retries and tears down agent sockets.
///
/// Once `shutdown` fires no new socket is handed out; a handshake that
/// completes afterwards is closed straight away.
pub struct Connector {
    config: Arc<LinkConfig>,
    sink: Arc<dyn UnsolicitedSink>,
    shutdown: CancellationToken,
}

impl Connector {
    pub fn new(
        config: Arc<LinkConfig>,
        sink: Arc<dyn UnsolicitedSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            sink,
            shutdown,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Return once `conn` is connected, connecting it if necessary.
    ///
    /// Concurrent callers on a cold connection share a single connect loop.
    pub async fn ensure_connected(&self, conn: &Arc<AgentConnection>) -> bool {
        if conn.is_connected() {
            return true;
        }
        let _guard = conn.connect_lock.lock().await;
        if conn.is_connected() {
            return true;
        }
        self.connect(conn).await
    }

    /// Reconnect `conn` unless someone else revived it first.
    pub(crate) async fn reconnect(&self, conn: &Arc<AgentConnection>) -> bool {
        let _guard = conn.connect_lock.lock().await;
        match conn.status() {
            ConnectionStatus::Disconnected | ConnectionStatus::Error => self.connect(conn).await,
            _ => conn.is_connected(),
        }
    }

    /// Open a socket to the agent, retrying transport failures with
    /// exponential backoff. Returns whether the connection ended up live.
    pub async fn connect(&self, conn: &Arc<AgentConnection>) -> bool {
        let attempts = self.config.attempts();
        for attempt in 1..=attempts {
            if self.shutdown.is_cancelled() {
                debug!(agent_id = %conn.agent_id(), "shutting down, not connecting");
                return false;
            }
            conn.begin_attempt();
            debug!(
                agent_id = %conn.agent_id(),
                url = %conn.endpoint_url(),
                attempt,
                attempts,
                "connecting to agent"
            );

            let err = match self.open(conn.endpoint_url()).await {
                Ok(ws) => {
                    let generation = self.attach(conn, ws);
                    // Shutdown cancels before it sweeps the registry, so a
                    // socket installed after that sweep is caught here.
                    if self.shutdown.is_cancelled() {
                        self.disconnect(conn);
                        debug!(
                            agent_id = %conn.agent_id(),
                            generation,
                            "shutting down, closed freshly opened socket"
                        );
                        return false;
                    }
                    info!(
                        agent_id = %conn.agent_id(),
                        url = %conn.endpoint_url(),
                        generation,
                        "connected to agent"
                    );
                    return true;
                }
                Err(err) => err,
            };

            conn.mark_failed();
            if !err.is_retryable() {
                error!(
                    agent_id = %conn.agent_id(),
                    error = %err,
                    "agent connection failed permanently"
                );
                return false;
            }
            if attempt == attempts {
                error!(
                    agent_id = %conn.agent_id(),
                    error = %err,
                    attempts,
                    "giving up on agent after repeated failures"
                );
                return false;
            }
            let delay = self.config.backoff_for(attempt - 1);
            warn!(
                agent_id = %conn.agent_id(),
                error = %err,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "agent connection attempt failed"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        false
    }

    /// Close the socket and mark the connection `Disconnected`.
    pub fn disconnect(&self, conn: &AgentConnection) {
        self.disconnect_with(conn, ConnectionStatus::Disconnected);
    }

    pub(crate) fn disconnect_with(&self, conn: &AgentConnection, status: ConnectionStatus) {
        if let Some(socket) = conn.detach(status, None) {
            socket.close();
            info!(
                agent_id = %conn.agent_id(),
                generation = socket.generation,
                %status,
                "disconnected from agent"
            );
        }
    }

    async fn open(&self, url: &str) -> Result<WsStream, LinkError> {
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, connect_async(url)).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(err)) => Err(LinkError::from_connect(url, err)),
            Err(_) => Err(LinkError::ConnectTimeout {
                url: url.to_string(),
                timeout,
            }),
        }
    }

    fn attach(&self, conn: &Arc<AgentConnection>, ws: WsStream) -> u64 {
        let (ws_tx, ws_rx) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.send_buffer.max(1));
        let cancel = CancellationToken::new();
        let generation = conn.install_socket(outbound_tx, cancel.clone());

        tokio::spawn(write_loop(
            conn.agent_id().to_string(),
            ws_tx,
            outbound_rx,
            cancel.clone(),
        ));
        listener::spawn(conn.clone(), ws_rx, generation, cancel, self.sink.clone());
        generation
    }
}

async fn write_loop(
    agent_id: String,
    mut ws_tx: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(err) = ws_tx.send(message).await {
                    warn!(%agent_id, error = %err, "agent socket write failed");
                    cancel.cancel();
                    return;
                }
            }
        }
    }
    if tokio::time::timeout(CLOSE_GRACE, ws_tx.close()).await.is_err() {
        debug!(%agent_id, "close frame not flushed in time");
    }
}
