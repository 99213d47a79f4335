//! Canonical runtime types.
//!
//! Both runtime protocols (push and pull) are decoded into these shapes before
//! anything reaches a client connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One item of a streamed chat response.
///
/// Wire shape: `{"type": "text" | "tool_use" | "tool_result" | "error" | "done", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeChatChunk {
    /// Assistant text (may be an empty delta).
    Text {
        #[serde(default)]
        text: String,
    },

    /// The agent invoked a tool. Payload is passed through untouched.
    ToolUse {
        #[serde(default)]
        tool_use: Value,
    },

    /// A tool finished. Payload is passed through untouched.
    ToolResult {
        #[serde(default)]
        tool_result: Value,
    },

    /// The call failed; the stream ends after this chunk.
    Error {
        #[serde(default)]
        text: String,
    },

    /// The call completed.
    Done,
}

impl RuntimeChatChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    /// Whether this chunk ends a chat sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done)
    }
}

/// Reference to a conversation owned by the remote runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeSession {
    pub key: String,
}

impl RuntimeSession {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Read-only projection of one message of remote history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeHistoryMessage {
    pub role: String,

    /// Plain text or an array of content blocks, as the runtime reported it.
    pub content: Value,

    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chunk_wire_shape() {
        assert_eq!(
            serde_json::to_value(RuntimeChatChunk::text("hi")).unwrap(),
            json!({"type": "text", "text": "hi"})
        );
        assert_eq!(
            serde_json::to_value(RuntimeChatChunk::Done).unwrap(),
            json!({"type": "done"})
        );
        assert_eq!(
            serde_json::to_value(RuntimeChatChunk::ToolUse {
                tool_use: json!({"name": "read_file"})
            })
            .unwrap(),
            json!({"type": "tool_use", "tool_use": {"name": "read_file"}})
        );
    }

    #[test]
    fn test_chunk_terminal() {
        assert!(RuntimeChatChunk::Done.is_terminal());
        assert!(RuntimeChatChunk::error("boom").is_terminal());
        assert!(!RuntimeChatChunk::text("").is_terminal());
    }

    #[test]
    fn test_history_message_omits_missing_timestamp() {
        let msg = RuntimeHistoryMessage {
            role: "user".to_string(),
            content: json!("hello"),
            timestamp: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"role": "user", "content": "hello"})
        );
    }
}
