//! Push-style runtime: a persistent duplex WebSocket channel.

mod adapter;
mod channel;
mod credentials;
pub mod frames;

pub use adapter::{PushRuntime, normalize_chunk};
pub use channel::{
    DuplexChannel, GatewayChannel, GatewayChannelConfig, NativeChunkStream, ReconnectPolicy,
};
pub use credentials::{read_device_id, read_token};
