//! Canonical protocol types for the Zinchy agent runtime gateway.
//!
//! - [`runtime`]: the backend-independent chat vocabulary every runtime adapter
//!   translates into (chunks, sessions, history).
//! - [`client`]: frames sent by browser clients over the gateway WebSocket.
//! - [`server`]: frames the gateway writes back, including control broadcasts.

pub mod client;
pub mod runtime;
pub mod server;

pub use client::ClientMessage;
pub use runtime::{RuntimeChatChunk, RuntimeHistoryMessage, RuntimeSession};
pub use server::{ChunkFrame, ServerMessage};
