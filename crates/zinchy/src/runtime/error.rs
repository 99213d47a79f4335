//! Runtime transport errors.

use thiserror::Error;

/// Failure to reach or handshake with a runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Transport-level failure (DNS, refused, TLS, timeout).
    #[error("runtime at {url} is unreachable: {message}")]
    Unreachable { url: String, message: String },

    /// The runtime answered but refused the handshake.
    #[error("runtime handshake failed: {0}")]
    Handshake(String),

    /// Not connected yet; reconnection is in progress.
    #[error("runtime is not connected")]
    NotConnected,

    /// The configured URL cannot be used.
    #[error("invalid runtime URL '{0}'")]
    InvalidUrl(String),
}

/// Errors for individual requests over the push channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,

    #[error("request '{0}' timed out")]
    Timeout(String),

    /// The channel went away while the request was pending.
    #[error("channel closed")]
    Closed,

    /// The runtime returned `ok: false`.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("failed to serialize request: {0}")]
    Serialize(String),
}
