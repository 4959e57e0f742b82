//! Posts unsolicited agent messages into their Chatwoot conversations.

use std::sync::Arc;

use agent_link::UnsolicitedMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chatwoot::ChatwootClient;
use crate::metrics::BridgeMetrics;

/// Drain `rx` until it closes or `shutdown` fires. Messages are posted one at
/// a time, so Chatwoot sees them in arrival order. Messages the agent flagged
/// as failed are answered with `fallback`.
pub fn spawn(
    mut rx: mpsc::UnboundedReceiver<UnsolicitedMessage>,
    chatwoot: Arc<ChatwootClient>,
    metrics: Arc<BridgeMetrics>,
    fallback: String,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            relay_one(&chatwoot, &metrics, &fallback, message).await;
        }
        info!("unsolicited relay stopped");
    })
}

async fn relay_one(
    chatwoot: &ChatwootClient,
    metrics: &BridgeMetrics,
    fallback: &str,
    message: UnsolicitedMessage,
) {
    let content = if message.success {
        message.content.as_str()
    } else {
        warn!(
            agent_id = %message.agent_id,
            message_id = %message.message_id,
            "agent reported failure, relaying fallback"
        );
        fallback
    };
    if content.is_empty() {
        warn!(
            agent_id = %message.agent_id,
            message_id = %message.message_id,
            "dropping unsolicited message without content"
        );
        return;
    }

    match chatwoot
        .post_reply(chatwoot.default_account_id(), message.conversation_id, content)
        .await
    {
        Ok(_) => {
            BridgeMetrics::incr(&metrics.unsolicited_relayed);
            info!(
                agent_id = %message.agent_id,
                message_id = %message.message_id,
                conversation_id = message.conversation_id,
                "relayed unsolicited message"
            );
        }
        Err(err) => {
            BridgeMetrics::incr(&metrics.chatwoot_failures);
            error!(
                agent_id = %message.agent_id,
                message_id = %message.message_id,
                error = %err,
                "failed to relay unsolicited message"
            );
        }
    }
}
