//! Runtime selection from configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use super::pull::{PullConfig, PullRuntime};
use super::push::{GatewayChannel, GatewayChannelConfig, PushRuntime};
use super::{ConnectError, RuntimeClient};

pub use super::push::ReconnectPolicy;

/// The configured runtime, if any. `None` puts the gateway in degraded mode.
pub type RuntimeSelection = Option<Arc<dyn RuntimeClient>>;

/// `[runtime]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base URL of a pull runtime. Takes precedence over `push_url`.
    pub pull_url: Option<String>,
    /// WebSocket URL of a push runtime.
    pub push_url: Option<String>,
    /// JSON file holding the push runtime's operator token.
    pub token_path: Option<String>,
    /// JSON file holding this gateway's device id.
    pub device_identity_path: Option<String>,
    pub client_id: String,
    pub client_version: String,
    pub scopes: Vec<String>,
    /// First reconnect delay.
    pub reconnect_interval_ms: u64,
    /// Backoff cap.
    pub max_reconnect_interval_ms: u64,
    /// Unset means retry forever.
    pub max_reconnect_attempts: Option<u32>,
    pub request_timeout_secs: u64,
    /// Silence allowed between chat chunks before a chat is ended with an error.
    pub idle_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pull_url: None,
            push_url: None,
            token_path: None,
            device_identity_path: None,
            client_id: "gateway-client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            scopes: vec!["operator.admin".to_string()],
            reconnect_interval_ms: 1000,
            max_reconnect_interval_ms: 30_000,
            max_reconnect_attempts: None,
            request_timeout_secs: 30,
            idle_timeout_secs: 120,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn expand_path(path: &Option<String>) -> Option<PathBuf> {
    non_empty(path).map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
}

impl RuntimeConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            interval: Duration::from_millis(self.reconnect_interval_ms),
            max_interval: Duration::from_millis(self.max_reconnect_interval_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    fn pull_config(&self, url: &str) -> PullConfig {
        PullConfig {
            base_url: url.to_string(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    fn channel_config(&self, url: &str) -> GatewayChannelConfig {
        GatewayChannelConfig {
            url: url.to_string(),
            token_path: expand_path(&self.token_path),
            device_identity_path: expand_path(&self.device_identity_path),
            client_id: self.client_id.clone(),
            client_version: self.client_version.clone(),
            scopes: self.scopes.clone(),
            reconnect: self.reconnect_policy(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            run_idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

/// Pick the runtime client for this configuration.
///
/// A pull URL wins over a push URL. Neither yields `Ok(None)`.
pub fn create_runtime_client(config: &RuntimeConfig) -> Result<RuntimeSelection, ConnectError> {
    if let Some(url) = non_empty(&config.pull_url) {
        info!("Using pull runtime at {}", url);
        let runtime = PullRuntime::new(config.pull_config(url))?;
        return Ok(Some(Arc::new(runtime)));
    }

    if let Some(url) = non_empty(&config.push_url) {
        info!("Using push runtime at {}", url);
        let channel = GatewayChannel::new(config.channel_config(url))?;
        return Ok(Some(Arc::new(PushRuntime::new(channel, url))));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeKind;

    #[test]
    fn test_pull_only() {
        let config = RuntimeConfig {
            pull_url: Some("http://localhost:8090/".to_string()),
            ..Default::default()
        };
        let runtime = create_runtime_client(&config).unwrap().unwrap();
        assert_eq!(runtime.kind(), RuntimeKind::Pull);
        assert_eq!(runtime.endpoint(), "http://localhost:8090");
    }

    #[test]
    fn test_pull_takes_precedence() {
        let config = RuntimeConfig {
            pull_url: Some("http://localhost:8090".to_string()),
            push_url: Some("ws://localhost:18789".to_string()),
            ..Default::default()
        };
        let runtime = create_runtime_client(&config).unwrap().unwrap();
        assert_eq!(runtime.kind(), RuntimeKind::Pull);
    }

    #[test]
    fn test_push_only() {
        let config = RuntimeConfig {
            push_url: Some("ws://localhost:18789".to_string()),
            pull_url: Some("  ".to_string()),
            ..Default::default()
        };
        let runtime = create_runtime_client(&config).unwrap().unwrap();
        assert_eq!(runtime.kind(), RuntimeKind::Push);
        assert_eq!(runtime.endpoint(), "ws://localhost:18789");
        assert!(!runtime.is_connected());
    }

    #[test]
    fn test_nothing_configured() {
        assert!(create_runtime_client(&RuntimeConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_url_is_reported() {
        let config = RuntimeConfig {
            push_url: Some("localhost:18789".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            create_runtime_client(&config),
            Err(ConnectError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_default_reconnect_policy_is_unbounded() {
        let policy = RuntimeConfig::default().reconnect_policy();
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.max_interval, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, None);
    }
}
