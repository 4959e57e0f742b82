use std::sync::Arc;
use std::time::Duration;

use agent_link::{AgentManager, LinkConfig, LogSink, ResponseMode};

use crate::AppState;
use crate::chatwoot::ChatwootClient;
use crate::config::{ChatwootConfig, InboxFileConfig, InboxRouting, ResponsesFileConfig};
use crate::metrics::BridgeMetrics;
use crate::mock_agent::{self, Behavior, MockAgent};
use crate::signature::SignatureVerifier;

/// Connection timings short enough that failure paths finish quickly.
pub fn test_link_config() -> LinkConfig {
    LinkConfig {
        connect_timeout: Duration::from_secs(2),
        max_connect_attempts: 2,
        initial_backoff: Duration::from_millis(20),
        backoff_multiplier: 1.5,
        max_backoff: Duration::from_secs(1),
        ping_interval: Duration::from_secs(60),
        ping_timeout: Duration::from_millis(300),
        reconnect_interval: Duration::from_secs(60),
        reconnect_cooldown: Duration::from_secs(30),
        send_buffer: 64,
    }
}

/// Build an `AppState` talking to a Chatwoot at `chatwoot_uri` (usually a
/// wiremock server) with one route per `(inbox_id, agent_url, mode)`.
///
/// Signature checks are off; tests that need them swap in a verifier.
pub fn test_app_state(chatwoot_uri: &str, inboxes: &[(&str, &str, ResponseMode)]) -> AppState {
    let inboxes: Vec<InboxFileConfig> = inboxes
        .iter()
        .enumerate()
        .map(|(i, (inbox_id, url, mode))| InboxFileConfig {
            inbox_id: inbox_id.to_string(),
            agent_id: format!("test_agent_{}", i + 1),
            websocket_url: url.to_string(),
            timeout_secs: Some(5),
            response_mode: *mode,
        })
        .collect();
    let chatwoot = ChatwootClient::new(&ChatwootConfig {
        base_url: chatwoot_uri.trim_end_matches('/').to_string(),
        api_access_token: "test-token".into(),
        account_id: 1,
        request_timeout: Duration::from_secs(5),
    })
    .expect("chatwoot client");

    AppState {
        agents: Arc::new(AgentManager::new(test_link_config(), Arc::new(LogSink))),
        chatwoot: Arc::new(chatwoot),
        routing: Arc::new(InboxRouting::from_file(
            &inboxes,
            &ResponsesFileConfig::default(),
        )),
        verifier: Arc::new(SignatureVerifier::new("", false, Duration::from_secs(300))),
        metrics: Arc::new(BridgeMetrics::new()),
    }
}

/// Serve a mock agent on an ephemeral port. Returns its `ws://` URL.
pub async fn spawn_mock_agent(behavior: Behavior) -> (String, Arc<MockAgent>) {
    let agent = Arc::new(MockAgent::new("mock_agent", behavior, Duration::from_millis(100)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock agent");
    let addr = listener.local_addr().expect("local addr");
    let app = mock_agent::router(agent.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{addr}/"), agent)
}

pub async fn spawn_echo_agent() -> String {
    spawn_mock_agent(Behavior::Echo).await.0
}
