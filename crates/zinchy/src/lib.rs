//! Zinchy Agent Runtime Gateway.
//!
//! Authenticates browser WebSocket connections, routes their chat requests to a
//! single configured agent runtime (push- or pull-style), and broadcasts runtime
//! restart notifications to every connected client.

pub mod api;
pub mod auth;
pub mod restart;
pub mod runtime;
pub mod ws;

pub use zinchy_protocol as protocol;
