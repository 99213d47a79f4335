//! Maps a [`DuplexChannel`] onto the canonical [`RuntimeClient`] interface.

use async_trait::async_trait;
use futures::StreamExt;
use log::warn;
use serde_json::Value;
use tokio::sync::broadcast;

use super::channel::{DuplexChannel, GatewayChannel};
use crate::runtime::{
    ChatOptions, ChatStream, ConnectError, RuntimeChatChunk, RuntimeClient, RuntimeEvent,
    RuntimeHistoryMessage, RuntimeKind, RuntimeSession,
};

/// Push runtime client. Generic over the channel so tests can script one.
pub struct PushRuntime<C = GatewayChannel> {
    channel: C,
    endpoint: String,
}

impl<C: DuplexChannel> PushRuntime<C> {
    pub fn new(channel: C, endpoint: impl Into<String>) -> Self {
        Self {
            channel,
            endpoint: endpoint.into(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }
}

fn first_present(value: &Value, names: &[&str]) -> Value {
    names
        .iter()
        .find_map(|name| value.get(name).filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or(Value::Null)
}

fn error_text(chunk: &Value) -> String {
    let text = ["text", "message"]
        .iter()
        .find_map(|name| chunk.get(name).and_then(Value::as_str));
    let nested = || match chunk.get("error") {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(other) => other.get("message").and_then(Value::as_str),
        None => None,
    };
    text.or_else(nested).unwrap_or("Unknown error").to_string()
}

/// Normalize a native chunk. Only field names change; unknown shapes become empty text.
pub fn normalize_chunk(chunk: &Value) -> RuntimeChatChunk {
    match chunk.get("type").and_then(Value::as_str).unwrap_or_default() {
        "text" => RuntimeChatChunk::text(chunk.get("text").and_then(Value::as_str).unwrap_or_default()),
        "tool_use" => RuntimeChatChunk::ToolUse {
            tool_use: first_present(chunk, &["tool_use", "toolUse"]),
        },
        "tool_result" => RuntimeChatChunk::ToolResult {
            tool_result: first_present(chunk, &["tool_result", "toolResult"]),
        },
        "error" => RuntimeChatChunk::error(error_text(chunk)),
        "done" => RuntimeChatChunk::Done,
        _ => RuntimeChatChunk::text(""),
    }
}

fn parse_sessions(payload: &Value) -> Vec<RuntimeSession> {
    payload
        .get("sessions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    ["key", "sessionKey", "id"]
                        .iter()
                        .find_map(|name| item.get(name).and_then(Value::as_str))
                })
                .map(RuntimeSession::new)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_history(payload: &Value) -> Vec<RuntimeHistoryMessage> {
    payload
        .get("messages")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|m| RuntimeHistoryMessage {
                    role: m.get("role").and_then(Value::as_str).unwrap_or_default().to_string(),
                    content: m.get("content").cloned().unwrap_or(Value::Null),
                    timestamp: m
                        .get("timestamp")
                        .or_else(|| m.get("ts"))
                        .and_then(Value::as_i64),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl<C: DuplexChannel + 'static> RuntimeClient for PushRuntime<C> {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Push
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        self.channel.connect().await
    }

    fn chat(&self, text: String, options: ChatOptions) -> ChatStream {
        Box::pin(
            self.channel
                .chat(text, options)
                .map(|chunk| normalize_chunk(&chunk)),
        )
    }

    async fn list_sessions(&self) -> Vec<RuntimeSession> {
        match self.channel.list_sessions().await {
            Ok(payload) => parse_sessions(&payload),
            Err(e) => {
                warn!("Failed to list push runtime sessions: {}", e);
                Vec::new()
            }
        }
    }

    async fn history(&self, session_key: &str) -> Vec<RuntimeHistoryMessage> {
        match self.channel.history(session_key).await {
            Ok(payload) => parse_history(&payload),
            Err(e) => {
                warn!("Failed to load history for {}: {}", session_key, e);
                Vec::new()
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.channel.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ChannelError;
    use crate::runtime::EventBus;
    use crate::runtime::push::NativeChunkStream;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Channel that replays canned chunks and payloads.
    #[derive(Default)]
    struct ScriptedChannel {
        connected: AtomicBool,
        chunks: Vec<Value>,
        sessions: Option<Value>,
        history: Option<Value>,
        last_chat: Mutex<Option<(String, ChatOptions)>>,
        events: EventBus,
    }

    #[async_trait]
    impl DuplexChannel for ScriptedChannel {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn connect(&self) -> Result<(), ConnectError> {
            self.connected.store(true, Ordering::SeqCst);
            self.events.emit(RuntimeEvent::Connected);
            Ok(())
        }

        fn chat(&self, text: String, options: ChatOptions) -> NativeChunkStream {
            *self.last_chat.lock() = Some((text, options));
            futures::stream::iter(self.chunks.clone()).boxed()
        }

        async fn list_sessions(&self) -> Result<Value, ChannelError> {
            self.sessions.clone().ok_or(ChannelError::NotConnected)
        }

        async fn history(&self, _session_key: &str) -> Result<Value, ChannelError> {
            self.history.clone().ok_or(ChannelError::Timeout("sessions.history".to_string()))
        }

        fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
            self.events.subscribe()
        }
    }

    fn runtime(channel: ScriptedChannel) -> PushRuntime<ScriptedChannel> {
        PushRuntime::new(channel, "ws://runtime.test")
    }

    #[tokio::test]
    async fn test_text_chunk_maps_exactly() {
        let runtime = runtime(ScriptedChannel {
            chunks: vec![json!({"type": "text", "text": "hi"})],
            ..Default::default()
        });
        let chunks: Vec<_> = runtime
            .chat("hello".to_string(), ChatOptions::for_session("user:u:main"))
            .collect()
            .await;
        assert_eq!(chunks, vec![RuntimeChatChunk::text("hi")]);

        let (text, options) = runtime.channel().last_chat.lock().clone().unwrap();
        assert_eq!(text, "hello");
        assert_eq!(options.session_key.as_deref(), Some("user:u:main"));
    }

    #[test]
    fn test_normalize_field_names() {
        assert_eq!(
            normalize_chunk(&json!({"type": "tool_use", "toolUse": {"name": "bash"}})),
            RuntimeChatChunk::ToolUse {
                tool_use: json!({"name": "bash"})
            }
        );
        assert_eq!(
            normalize_chunk(&json!({"type": "tool_result", "toolResult": "ok"})),
            RuntimeChatChunk::ToolResult {
                tool_result: json!("ok")
            }
        );
        assert_eq!(
            normalize_chunk(&json!({"type": "error", "message": "connection lost"})),
            RuntimeChatChunk::error("connection lost")
        );
        assert_eq!(
            normalize_chunk(&json!({"type": "error", "error": {"message": "quota"}})),
            RuntimeChatChunk::error("quota")
        );
        assert_eq!(normalize_chunk(&json!({"type": "done"})), RuntimeChatChunk::Done);
        assert_eq!(normalize_chunk(&json!({"type": "thinking"})), RuntimeChatChunk::text(""));
    }

    #[tokio::test]
    async fn test_sessions_and_history_normalized() {
        let runtime = runtime(ScriptedChannel {
            sessions: Some(json!({"sessions": [{"key": "a"}, {"sessionKey": "b"}, {"id": "c"}]})),
            history: Some(json!({"messages": [
                {"role": "user", "content": "hi", "ts": 5},
                {"role": "assistant", "content": [{"type": "text", "text": "yo"}], "timestamp": 6}
            ]})),
            ..Default::default()
        });

        let keys: Vec<String> = runtime.list_sessions().await.into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let history = runtime.history("a").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].timestamp, Some(5));
        assert_eq!(history[1].timestamp, Some(6));
    }

    #[tokio::test]
    async fn test_channel_failures_yield_empty() {
        let runtime = runtime(ScriptedChannel::default());
        assert!(runtime.list_sessions().await.is_empty());
        assert!(runtime.history("x").await.is_empty());
    }

    #[tokio::test]
    async fn test_events_relayed() {
        let runtime = runtime(ScriptedChannel::default());
        let mut events = runtime.subscribe();
        assert!(!runtime.is_connected());

        runtime.connect().await.unwrap();

        assert!(runtime.is_connected());
        assert_eq!(events.recv().await.unwrap(), RuntimeEvent::Connected);
    }
}
