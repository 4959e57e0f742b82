use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use agent_link::{LinkConfig, ResponseMode, StaticAgent};
use serde::{Deserialize, Serialize};
use tracing::warn;

// =============================================================================
// File config (figment-deserialized from defaults / bridge.toml / env vars)
// =============================================================================
//
//   bridge.toml:     [chatwoot]
//                    account_id = 3
//
//   env var:         BRIDGE_CHATWOOT__ACCOUNT_ID=3   (double underscore = nesting)

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "I apologize, but I'm experiencing technical difficulties. Please try again in a moment.";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub chatwoot: ChatwootFileConfig,
    #[serde(default)]
    pub agents: AgentsFileConfig,
    #[serde(default)]
    pub responses: ResponsesFileConfig,
    #[serde(default)]
    pub inboxes: Vec<InboxFileConfig>,
}

/// Lives under `[server]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Lives under `[chatwoot]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatwootFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_access_token: String,
    #[serde(default = "default_account_id")]
    pub account_id: u64,
    /// Empty disables signature verification.
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_true")]
    pub enforce_signatures: bool,
    #[serde(default = "default_signature_tolerance")]
    pub signature_tolerance_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ChatwootFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_access_token: String::new(),
            account_id: default_account_id(),
            webhook_secret: String::new(),
            enforce_signatures: true,
            signature_tolerance_secs: default_signature_tolerance(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Agent connection tuning (lives under `[agents]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentsFileConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_reconnect_cooldown")]
    pub reconnect_cooldown_secs: u64,
}

impl Default for AgentsFileConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            max_connect_attempts: default_max_connect_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_secs: default_max_backoff(),
            reconnect_interval_secs: default_reconnect_interval(),
            reconnect_cooldown_secs: default_reconnect_cooldown(),
        }
    }
}

impl AgentsFileConfig {
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_connect_attempts: self.max_connect_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            reconnect_cooldown: Duration::from_secs(self.reconnect_cooldown_secs),
            ..LinkConfig::default()
        }
    }
}

/// Lives under `[responses]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponsesFileConfig {
    #[serde(default = "default_response_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
}

impl Default for ResponsesFileConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_response_timeout(),
            fallback_message: default_fallback_message(),
        }
    }
}

/// One `[[inboxes]]` entry: which agent answers a Chatwoot inbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboxFileConfig {
    pub inbox_id: String,
    pub agent_id: String,
    pub websocket_url: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub response_mode: ResponseMode,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_account_id() -> u64 {
    1
}
fn default_true() -> bool {
    true
}
fn default_signature_tolerance() -> u64 {
    300
}
fn default_request_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_ping_interval() -> u64 {
    30
}
fn default_ping_timeout() -> u64 {
    5
}
fn default_max_connect_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    2000
}
fn default_backoff_multiplier() -> f64 {
    1.5
}
fn default_max_backoff() -> u64 {
    60
}
fn default_reconnect_interval() -> u64 {
    10
}
fn default_reconnect_cooldown() -> u64 {
    30
}
fn default_response_timeout() -> u64 {
    30
}
fn default_fallback_message() -> String {
    DEFAULT_FALLBACK_MESSAGE.to_string()
}

/// Build a figment that layers: defaults → bridge.toml → BRIDGE_* env vars.
///
/// A missing config file is not an error; every setting has a default.
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("BRIDGE_").split("__"))
}

/// Copy of `fc` safe to print: credentials are masked.
pub fn redacted(fc: &FileConfig) -> FileConfig {
    let mask = |s: &str| if s.is_empty() { String::new() } else { "********".to_string() };
    let mut out = fc.clone();
    out.chatwoot.api_access_token = mask(&fc.chatwoot.api_access_token);
    out.chatwoot.webhook_secret = mask(&fc.chatwoot.webhook_secret);
    out
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ChatwootConfig {
    pub base_url: String,
    pub api_access_token: String,
    pub account_id: u64,
    pub request_timeout: Duration,
}

impl ChatwootConfig {
    pub fn from_file(fc: &ChatwootFileConfig) -> Self {
        Self {
            base_url: fc.base_url.trim_end_matches('/').to_string(),
            api_access_token: fc.api_access_token.clone(),
            account_id: fc.account_id,
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        }
    }
}

/// Where messages for one inbox go.
#[derive(Clone, Debug, PartialEq)]
pub struct InboxRoute {
    pub inbox_id: String,
    pub agent_id: String,
    pub websocket_url: String,
    pub timeout: Duration,
    pub response_mode: ResponseMode,
}

/// Inbox → agent lookup table.
#[derive(Clone, Debug, Default)]
pub struct InboxRouting {
    routes: HashMap<String, InboxRoute>,
    fallback_message: String,
}

impl InboxRouting {
    pub fn from_file(inboxes: &[InboxFileConfig], responses: &ResponsesFileConfig) -> Self {
        let mut routes = HashMap::new();
        for inbox in inboxes {
            let route = InboxRoute {
                inbox_id: inbox.inbox_id.clone(),
                agent_id: inbox.agent_id.clone(),
                websocket_url: inbox.websocket_url.clone(),
                timeout: Duration::from_secs(
                    inbox.timeout_secs.unwrap_or(responses.default_timeout_secs),
                ),
                response_mode: inbox.response_mode,
            };
            if routes.insert(inbox.inbox_id.clone(), route).is_some() {
                warn!(inbox_id = %inbox.inbox_id, "inbox configured twice; last entry wins");
            }
        }
        Self {
            routes,
            fallback_message: responses.fallback_message.clone(),
        }
    }

    pub fn route(&self, inbox_id: &str) -> Option<&InboxRoute> {
        self.routes.get(inbox_id)
    }

    pub fn fallback_message(&self) -> &str {
        &self.fallback_message
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// One entry per distinct agent endpoint, in a stable order.
    pub fn static_agents(&self) -> Vec<StaticAgent> {
        let mut routes: Vec<_> = self.routes.values().collect();
        routes.sort_by(|a, b| a.inbox_id.cmp(&b.inbox_id));
        let mut agents: Vec<StaticAgent> = Vec::new();
        for route in routes {
            if agents.iter().any(|a| a.endpoint_url == route.websocket_url) {
                continue;
            }
            agents.push(StaticAgent::new(&route.agent_id, &route.websocket_url));
        }
        agents
    }
}
