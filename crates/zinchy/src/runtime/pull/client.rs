//! HTTP client for pull-style runtimes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use super::decoder::decode_body;
use crate::runtime::{
    ChatOptions, ChatStream, ConnectError, EventBus, RuntimeChatChunk, RuntimeClient,
    RuntimeEvent, RuntimeHistoryMessage, RuntimeKind, RuntimeSession,
};

/// Settings for a pull runtime.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Base URL, e.g. `http://localhost:8090`. A trailing `/` is ignored.
    pub base_url: String,
    /// Timeout for REST calls and for the response headers of a chat.
    pub request_timeout: Duration,
    /// Maximum silence between two reads of a chat body.
    pub idle_timeout: Duration,
}

impl PullConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Client for a runtime that answers each chat with a `data:` line stream.
#[derive(Debug)]
pub struct PullRuntime {
    client: Client,
    base_url: String,
    request_timeout: Duration,
    idle_timeout: Duration,
    connected: AtomicBool,
    events: EventBus,
}

impl PullRuntime {
    pub fn new(config: PullConfig) -> Result<Self, ConnectError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url).map_err(|_| ConnectError::InvalidUrl(config.base_url.clone()))?;

        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| ConnectError::Unreachable {
                url: base_url.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url,
            request_timeout: config.request_timeout,
            idle_timeout: config.idle_timeout,
            connected: AtomicBool::new(false),
            events: EventBus::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json(&self, url: &str) -> Option<Value> {
        let response = match self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Runtime request to {} failed: {}", url, e);
                return None;
            }
        };

        if !response.status().is_success() {
            warn!("Runtime request to {} returned {}", url, response.status());
            return None;
        }

        match response.json::<Value>().await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to parse runtime response from {}: {}", url, e);
                None
            }
        }
    }
}

/// Body of `POST /api/messages`.
///
/// Client options are copied first, so they never replace the message text or
/// the routed session.
fn message_body(text: &str, options: &ChatOptions) -> Value {
    let mut body: Map<String, Value> = options.extra.clone();
    body.insert("text".to_string(), Value::String(text.to_string()));
    if let Some(agent_id) = &options.agent_id {
        body.insert("agent_id".to_string(), Value::String(agent_id.clone()));
    }
    if let Some(session_key) = &options.session_key {
        body.insert("session_id".to_string(), Value::String(session_key.clone()));
    }
    Value::Object(body)
}

fn parse_sessions(value: &Value) -> Vec<RuntimeSession> {
    let Some(items) = value.get("sessions").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(key) => Some(key.as_str()),
            other => other
                .get("id")
                .and_then(Value::as_str)
                .or_else(|| other.get("key").and_then(Value::as_str)),
        })
        .map(RuntimeSession::new)
        .collect()
}

fn parse_timestamp(message: &Value) -> Option<i64> {
    if let Some(ts) = message.get("timestamp").and_then(Value::as_i64) {
        return Some(ts);
    }
    let created_at = message.get("created_at").and_then(Value::as_str)?;
    chrono::DateTime::parse_from_rfc3339(created_at)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn parse_history(value: &Value) -> Vec<RuntimeHistoryMessage> {
    let Some(items) = value.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|message| RuntimeHistoryMessage {
            role: message
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content: message.get("content").cloned().unwrap_or(Value::Null),
            timestamp: parse_timestamp(message),
        })
        .collect()
}

#[async_trait]
impl RuntimeClient for PullRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Pull
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        let url = self.url("/health");
        match self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) => {
                // Any answer at all means the runtime is there.
                debug!("Runtime health probe returned {}", response.status());
                if !self.connected.swap(true, Ordering::SeqCst) {
                    info!("Connected to pull runtime at {}", self.base_url);
                }
                self.events.emit(RuntimeEvent::Connected);
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                warn!("Pull runtime at {} is unreachable: {}", self.base_url, e);
                self.events.emit(RuntimeEvent::Error(e.to_string()));
                Err(ConnectError::Unreachable {
                    url,
                    message: e.to_string(),
                })
            }
        }
    }

    fn chat(&self, text: String, options: ChatOptions) -> ChatStream {
        let request = self
            .client
            .post(self.url("/api/messages"))
            .json(&message_body(&text, &options));
        let request_timeout = self.request_timeout;
        let idle_timeout = self.idle_timeout;
        let label = self.kind().label();

        let stream = futures::stream::once(async move {
            let error = |text: String| futures::stream::iter([RuntimeChatChunk::error(text)]).boxed();

            let response = match tokio::time::timeout(request_timeout, request.send()).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return error(format!("{} connection error: {}", label, e)),
                Err(_) => {
                    return error(format!(
                        "{} connection error: no response within {}s",
                        label,
                        request_timeout.as_secs()
                    ));
                }
            };

            let status = response.status();
            if !status.is_success() {
                let reason = status.canonical_reason().unwrap_or(status.as_str());
                return error(format!("{} error: {}", label, reason));
            }

            decode_body(response.bytes_stream(), idle_timeout, label).boxed()
        })
        .flatten();

        Box::pin(stream)
    }

    async fn list_sessions(&self) -> Vec<RuntimeSession> {
        self.get_json(&self.url("/api/sessions"))
            .await
            .map(|value| parse_sessions(&value))
            .unwrap_or_default()
    }

    async fn history(&self, session_key: &str) -> Vec<RuntimeHistoryMessage> {
        let path = format!("/api/sessions/{}/history", urlencoding::encode(session_key));
        self.get_json(&self.url(&path))
            .await
            .map(|value| parse_history(&value))
            .unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trailing_slash_trimmed() {
        let runtime = PullRuntime::new(PullConfig::new("http://localhost:8090/")).unwrap();
        assert_eq!(runtime.endpoint(), "http://localhost:8090");
        assert_eq!(runtime.url("/health"), "http://localhost:8090/health");
        assert!(!runtime.is_connected());
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            PullRuntime::new(PullConfig::new("not a url")),
            Err(ConnectError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_message_body() {
        let mut options = ChatOptions {
            session_key: Some("user:u:main".to_string()),
            agent_id: Some("coder".to_string()),
            ..Default::default()
        };
        options.extra.insert("model".to_string(), json!("fast"));
        options.extra.insert("text".to_string(), json!("ignored"));
        options.extra.insert("session_id".to_string(), json!("user:other:main"));

        assert_eq!(
            message_body("hello", &options),
            json!({
                "text": "hello",
                "agent_id": "coder",
                "session_id": "user:u:main",
                "model": "fast",
            })
        );
        assert_eq!(
            message_body("hi", &ChatOptions::default()),
            json!({"text": "hi"})
        );
    }

    #[test]
    fn test_parse_sessions_accepts_strings_and_objects() {
        let sessions = parse_sessions(&json!({
            "sessions": ["a", {"id": "b"}, {"key": "c"}, {"other": 1}]
        }));
        assert_eq!(
            sessions,
            vec![
                RuntimeSession::new("a"),
                RuntimeSession::new("b"),
                RuntimeSession::new("c"),
            ]
        );
        assert!(parse_sessions(&json!({})).is_empty());
    }

    #[test]
    fn test_parse_history_converts_created_at() {
        let messages = parse_history(&json!({
            "messages": [
                {"role": "user", "content": "hi", "timestamp": 1700000000000_i64},
                {"role": "assistant", "content": [{"type": "text", "text": "yo"}],
                 "created_at": "2024-01-01T00:00:00Z"},
                {"role": "system", "content": "x"}
            ]
        }));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].timestamp, Some(1_700_000_000_000));
        assert_eq!(messages[1].timestamp, Some(1_704_067_200_000));
        assert_eq!(messages[1].content, json!([{"type": "text", "text": "yo"}]));
        assert_eq!(messages[2].timestamp, None);
    }
}
