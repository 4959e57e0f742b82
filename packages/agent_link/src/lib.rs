//! agent_link: persistent WebSocket links from the bridge to AI agents.
//!
//! One socket per agent endpoint is shared by every in-flight request. Each
//! request carries a `message_id`; the agent echoes it on its reply and a
//! listener task routes the reply back to the waiting caller. Replies nobody
//! is waiting for go to an [`UnsolicitedSink`].
//!
//! Connections heal themselves: a monitor pings live sockets and a sweep
//! reconnects dead ones.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use agent_link::{AgentManager, LinkConfig, LogSink, StaticAgent};
//!
//! # async fn run(request: agent_link::ChatRequest) {
//! let manager = AgentManager::new(LinkConfig::default(), Arc::new(LogSink));
//! manager.start(&[StaticAgent::new("support", "ws://localhost:8765/ws")]);
//!
//! if let Some(reply) = manager
//!     .send_sync("ws://localhost:8765/ws", &request, Duration::from_secs(30))
//!     .await
//! {
//!     println!("{}", reply.content);
//! }
//! manager.shutdown().await;
//! # }
//! ```

mod config;
mod connection;
mod connector;
mod dispatcher;
mod error;
mod listener;
mod manager;
mod monitor;
pub mod protocol;
mod registry;
mod sink;

#[cfg(test)]
mod e2e_tests;

pub use config::LinkConfig;
pub use connection::{AgentConnection, AgentStatusInfo, ConnectionStatus};
pub use connector::Connector;
pub use dispatcher::Dispatcher;
pub use error::LinkError;
pub use manager::{AgentManager, StaticAgent};
pub use monitor::HealthMonitor;
pub use protocol::{
    ChatRequest, ChatResponse, MessageContext, MessageSender, ResponseMetadata, ResponseMode,
};
pub use registry::Registry;
pub use sink::{ChannelSink, FanoutSink, LogSink, UnsolicitedMessage, UnsolicitedSink};
