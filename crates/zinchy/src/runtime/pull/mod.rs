//! Pull-style runtime: stateless HTTP, one streaming request per chat.

mod client;
mod decoder;

pub use client::{PullConfig, PullRuntime};
pub use decoder::{LineDecoder, decode_body, map_event};
