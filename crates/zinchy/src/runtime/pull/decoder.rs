//! Decoder for `data:`-prefixed JSON event lines in a chunked response body.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use serde_json::Value;

use crate::runtime::RuntimeChatChunk;

const DATA_PREFIX: &str = "data: ";

/// Incremental line splitter.
///
/// Bytes are buffered undecoded until a full line is available, so a multi-byte
/// character split across two reads survives intact.
#[derive(Debug, Default)]
pub struct LineDecoder {
    carry: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read's worth of bytes; returns the chunks of every completed line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<RuntimeChatChunk> {
        self.carry.extend_from_slice(bytes);

        let Some(last_newline) = self.carry.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);

        complete
            .split(|b| *b == b'\n')
            .filter_map(|line| decode_line(&String::from_utf8_lossy(line)))
            .collect()
    }

    /// Flush the final unterminated line at end of body.
    pub fn finish(&mut self) -> Vec<RuntimeChatChunk> {
        let rest = std::mem::take(&mut self.carry);
        decode_line(&String::from_utf8_lossy(&rest))
            .into_iter()
            .collect()
    }
}

/// Decode one line. Blank lines, non-data lines and unparseable payloads yield nothing.
fn decode_line(line: &str) -> Option<RuntimeChatChunk> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        debug!("Skipping non-data line from runtime: {}", line);
        return None;
    };
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => Some(map_event(&value)),
        Err(e) => {
            warn!("Failed to parse runtime event: {}", e);
            None
        }
    }
}

fn str_field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| {
        value
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    })
}

fn json_field(value: &Value, names: &[&str]) -> Value {
    names
        .iter()
        .find_map(|name| value.get(name).filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Map a pull-runtime event to a canonical chunk. Unknown shapes become empty text.
pub fn map_event(value: &Value) -> RuntimeChatChunk {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "text" | "chunk" | "delta" => {
            RuntimeChatChunk::text(str_field(value, &["text", "content"]).unwrap_or_default())
        }
        "tool_use" | "call" => RuntimeChatChunk::ToolUse {
            tool_use: json_field(value, &["tool_use", "call"]),
        },
        "tool_result" | "result" => RuntimeChatChunk::ToolResult {
            tool_result: json_field(value, &["tool_result", "result"]),
        },
        "error" => RuntimeChatChunk::error(str_field(value, &["message"]).unwrap_or("Unknown error")),
        "done" | "end" => RuntimeChatChunk::Done,
        _ => RuntimeChatChunk::text(""),
    }
}

struct BodyState<S> {
    body: Pin<Box<S>>,
    decoder: LineDecoder,
    pending: VecDeque<RuntimeChatChunk>,
    finished: bool,
}

/// Turn a streaming response body into canonical chunks.
///
/// Transport errors and idle timeouts end the stream with a single error chunk.
/// Dropping the returned stream drops the body.
pub fn decode_body<S, E>(
    body: S,
    idle_timeout: Duration,
    label: &'static str,
) -> impl Stream<Item = RuntimeChatChunk> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    let state = BodyState {
        body: Box::pin(body),
        decoder: LineDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Some((chunk, state));
            }
            if state.finished {
                return None;
            }

            match tokio::time::timeout(idle_timeout, state.body.next()).await {
                Ok(Some(Ok(bytes))) => {
                    let chunks = state.decoder.push(&bytes);
                    state.pending.extend(chunks);
                }
                Ok(Some(Err(e))) => {
                    state.finished = true;
                    state
                        .pending
                        .push_back(RuntimeChatChunk::error(format!("{} connection error: {}", label, e)));
                }
                Ok(None) => {
                    state.finished = true;
                    let chunks = state.decoder.finish();
                    state.pending.extend(chunks);
                }
                Err(_) => {
                    state.finished = true;
                    state.pending.push_back(RuntimeChatChunk::error(format!(
                        "{} connection error: no data received for {}s",
                        label,
                        idle_timeout.as_secs()
                    )));
                }
            }
        }
    })
}
