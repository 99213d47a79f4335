//! Local credential files for the push runtime.

use std::path::Path;

use log::{debug, warn};
use serde_json::Value;

/// Read the operator token from a JSON file.
///
/// Looks at `gateway.auth.token`, then a top-level `token`. Any failure yields
/// an empty token; the runtime will then refuse the handshake on its own terms.
pub async fn read_token(path: Option<&Path>) -> String {
    let Some(value) = read_json(path).await else {
        return String::new();
    };
    value
        .pointer("/gateway/auth/token")
        .and_then(Value::as_str)
        .or_else(|| value.get("token").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

/// Read the device id from a device-identity JSON file (`deviceId` or `device_id`).
pub async fn read_device_id(path: Option<&Path>) -> Option<String> {
    let value = read_json(path).await?;
    value
        .get("deviceId")
        .or_else(|| value.get("device_id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

async fn read_json(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) => {
            debug!("Cannot read {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring malformed JSON in {}: {}", path.display(), e);
            None
        }
    }
}
