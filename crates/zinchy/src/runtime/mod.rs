//! Agent runtime clients.
//!
//! A single `RuntimeClient` trait hides the difference between the two kinds of
//! agent runtime the gateway can front:
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │     ClientRouter     │
//!                 └──────────┬───────────┘
//!                            │ RuntimeClient
//!              ┌─────────────┴─────────────┐
//!              ▼                           ▼
//!   ┌────────────────────┐      ┌────────────────────┐
//!   │    PushRuntime     │      │    PullRuntime     │
//!   │ persistent duplex  │      │ one HTTP request   │
//!   │ WebSocket channel  │      │ per chat, data:    │
//!   │ with reconnects    │      │ line event stream  │
//!   └────────────────────┘      └────────────────────┘
//! ```
//!
//! Both normalize their native payloads into [`RuntimeChatChunk`]s.

mod error;
mod events;
pub mod factory;
pub mod pull;
pub mod push;
mod session_cache;

pub use error::{ChannelError, ConnectError};
pub use events::{EventBus, RuntimeEvent};
pub use factory::{ReconnectPolicy, RuntimeConfig, RuntimeSelection, create_runtime_client};
pub use session_cache::{DEFAULT_SESSION_TTL, SessionCache};

pub use zinchy_protocol::runtime::{RuntimeChatChunk, RuntimeHistoryMessage, RuntimeSession};

use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_stream::Stream;

/// Lazy, finite sequence of chunks for one chat call. Drop it to cancel.
pub type ChatStream = Pin<Box<dyn Stream<Item = RuntimeChatChunk> + Send>>;

/// Which protocol family a runtime speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Push,
    Pull,
}

impl RuntimeKind {
    /// Human-readable name used in error chunks.
    pub fn label(&self) -> &'static str {
        match self {
            RuntimeKind::Push => "Push runtime",
            RuntimeKind::Pull => "Pull runtime",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Push => write!(f, "push"),
            RuntimeKind::Pull => write!(f, "pull"),
        }
    }
}

/// Per-call chat options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    /// Remote conversation to continue.
    pub session_key: Option<String>,
    /// Agent to address, when the runtime hosts several.
    pub agent_id: Option<String>,
    /// Additional options forwarded verbatim to the runtime.
    pub extra: Map<String, Value>,
}

impl ChatOptions {
    pub fn for_session(session_key: impl Into<String>) -> Self {
        Self {
            session_key: Some(session_key.into()),
            ..Default::default()
        }
    }
}

/// Uniform interface over push- and pull-style agent runtimes.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Base URL of the runtime.
    fn endpoint(&self) -> &str;

    /// Best effort for pull runtimes, authoritative for push runtimes.
    fn is_connected(&self) -> bool;

    /// Establish (or probe) the connection.
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Send one message and stream the reply.
    fn chat(&self, text: String, options: ChatOptions) -> ChatStream;

    /// Remote sessions. Failures are logged and yield an empty list.
    async fn list_sessions(&self) -> Vec<RuntimeSession>;

    /// Remote history of one session. Failures are logged and yield an empty list.
    async fn history(&self, session_key: &str) -> Vec<RuntimeHistoryMessage>;

    /// Observe connection lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;
}

impl std::fmt::Debug for dyn RuntimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeClient")
            .field("kind", &self.kind())
            .field("endpoint", &self.endpoint())
            .field("connected", &self.is_connected())
            .finish()
    }
}
