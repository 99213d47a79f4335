//! Wire frames of the push runtime's duplex protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A JSON text frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Request; answered by a `res` frame with the same id.
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FrameError>,
    },
    /// Unsolicited server event.
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl FrameError {
    pub fn describe(&self) -> String {
        match &self.code {
            Some(code) if !self.message.is_empty() => format!("{} ({})", self.message, code),
            Some(code) => code.clone(),
            None if self.message.is_empty() => "request failed".to_string(),
            None => self.message.clone(),
        }
    }
}

impl Frame {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Frame::Req {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Method names.
pub mod method {
    pub const CONNECT: &str = "connect";
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_ABORT: &str = "chat.abort";
    pub const SESSIONS_LIST: &str = "sessions.list";
    pub const SESSIONS_HISTORY: &str = "sessions.history";
}

/// Event name carrying chat output.
pub const CHAT_EVENT: &str = "chat";

/// Parameters of the `connect` handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub client_id: String,
    pub client_version: String,
    pub scopes: Vec<String>,
    pub token: String,
    pub device_id: Option<String>,
}

impl ConnectParams {
    pub fn to_value(&self) -> Value {
        let mut params = json!({
            "client": {
                "id": self.client_id,
                "version": self.client_version,
            },
            "role": "operator",
            "scopes": self.scopes,
            "auth": { "token": self.token },
        });
        if let Some(device_id) = &self.device_id {
            params["device"] = json!({ "id": device_id });
        }
        params
    }
}
