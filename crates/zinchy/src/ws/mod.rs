//! WebSocket gateway for browser clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Browser clients                          │
//! │  - One WebSocket per tab, cookie-authenticated on upgrade    │
//! │  - Sends ClientMessage, receives chunk frames and control    │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ /api/ws
//! ┌──────────────────────────────▼───────────────────────────────┐
//! │                          Gateway                             │
//! │  - Registry of live connections (DashMap)                    │
//! │  - runtime:restarting / runtime:ready broadcasts             │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ one per connection
//! ┌──────────────────────────────▼───────────────────────────────┐
//! │                       ClientRouter                           │
//! │  - user:<id>: session namespace                              │
//! │  - Session cache, chat cancellation, Done terminator         │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ RuntimeClient
//!                     ┌──────────┴──────────┐
//!              ┌──────▼──────┐       ┌──────▼──────┐
//!              │ PushRuntime │       │ PullRuntime │
//!              └─────────────┘       └─────────────┘
//! ```

mod gateway;
mod handler;
mod router;

pub use gateway::{ConnectionHandle, ConnectionId, Gateway, OutboundSender};
pub use handler::{CONNECTION_BUSY, INBOX_CAPACITY, MAX_MESSAGE_SIZE, PING_INTERVAL, ws_handler};
pub use router::{ClientRouter, RUNTIME_NOT_CONFIGURED, RUNTIME_UNAVAILABLE};
