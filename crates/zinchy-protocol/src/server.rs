//! Frames written by the gateway to client connections.

use serde::{Deserialize, Serialize};

use crate::runtime::{RuntimeChatChunk, RuntimeHistoryMessage, RuntimeSession};

/// Control and reply frames, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent once after the connection is registered.
    #[serde(rename = "connected")]
    Connected,

    /// Server keepalive.
    #[serde(rename = "ping")]
    Ping,

    /// Reply to a client `ping`.
    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    #[serde(rename = "sessions")]
    Sessions { sessions: Vec<RuntimeSession> },

    #[serde(rename = "history")]
    History {
        session_key: String,
        messages: Vec<RuntimeHistoryMessage>,
    },

    /// The agent runtime is going away; chats will fail until `runtime:ready`.
    #[serde(rename = "runtime:restarting")]
    RuntimeRestarting,

    /// The agent runtime is reachable again.
    #[serde(rename = "runtime:ready")]
    RuntimeReady,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            request_id: None,
        }
    }
}

/// A canonical chunk as sent to a client, tagged with the session it belongs to.
///
/// Serializes flat: `{"type": "text", "text": "hi", "session_key": "...", "request_id": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFrame {
    #[serde(flatten)]
    pub chunk: RuntimeChatChunk,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}
