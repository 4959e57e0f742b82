//! Minimal Chatwoot REST client: post messages, probe API health.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ChatwootConfig;

#[derive(Debug, thiserror::Error)]
pub enum ChatwootError {
    #[error("chatwoot request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("chatwoot returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("unexpected chatwoot response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct NewMessage<'a> {
    content: &'a str,
    message_type: &'a str,
    private: bool,
    content_type: &'static str,
}

/// The subset of Chatwoot's message resource the bridge looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct PostedMessage {
    #[serde(default)]
    pub id: Option<i64>,
}

pub struct ChatwootClient {
    http: reqwest::Client,
    base_url: String,
    api_access_token: String,
    account_id: u64,
}

impl ChatwootClient {
    pub fn new(config: &ChatwootConfig) -> Result<Self, ChatwootError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_access_token: config.api_access_token.clone(),
            account_id: config.account_id,
        })
    }

    /// Account used when a webhook does not name one.
    pub fn default_account_id(&self) -> u64 {
        self.account_id
    }

    pub async fn send_message(
        &self,
        account_id: u64,
        conversation_id: i64,
        content: &str,
        message_type: &str,
        private: bool,
    ) -> Result<PostedMessage, ChatwootError> {
        let url = format!(
            "{}/api/v1/accounts/{account_id}/conversations/{conversation_id}/messages",
            self.base_url
        );
        let response = self
            .http
            .post(&url)
            .header("api_access_token", &self.api_access_token)
            .json(&NewMessage {
                content,
                message_type,
                private,
                content_type: "text",
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(%status, conversation_id, "chatwoot rejected message");
            return Err(ChatwootError::Status { status, body });
        }
        let posted: PostedMessage = serde_json::from_str(&body)?;
        debug!(conversation_id, message_id = ?posted.id, "posted message to chatwoot");
        Ok(posted)
    }

    /// Post a public outgoing reply into a conversation.
    pub async fn post_reply(
        &self,
        account_id: u64,
        conversation_id: i64,
        content: &str,
    ) -> Result<PostedMessage, ChatwootError> {
        self.send_message(
            account_id,
            conversation_id,
            content,
            "outgoing",
            false,
        )
        .await
    }

    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/v1/accounts", self.base_url);
        match self
            .http
            .get(&url)
            .header("api_access_token", &self.api_access_token)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(error = %err, "chatwoot health check failed");
                false
            }
        }
    }
}
