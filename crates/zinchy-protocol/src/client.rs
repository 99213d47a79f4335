//! Frames sent by clients over the gateway WebSocket.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message from a browser client, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Send a chat message and stream the reply back as chunk frames.
    #[serde(rename = "chat.send")]
    ChatSend {
        text: String,
        /// Target conversation. Defaults to the user's main session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        /// Client-chosen id echoed on every chunk frame of this call.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Extra runtime options forwarded verbatim.
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        options: Map<String, Value>,
    },

    /// Stop the in-flight chat. Without a request id, whatever is running stops.
    #[serde(rename = "chat.cancel")]
    ChatCancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// List the sessions visible to this user.
    #[serde(rename = "sessions.list")]
    SessionsList,

    /// Fetch the remote history of one session.
    #[serde(rename = "sessions.history")]
    SessionsHistory { session_key: String },

    /// Application-level keepalive.
    #[serde(rename = "ping")]
    Ping,
}
