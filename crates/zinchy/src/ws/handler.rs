//! WebSocket upgrade and per-connection tasks.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};

use super::gateway::ConnectionHandle;
use super::router::{ClientRouter, RUNTIME_NOT_CONFIGURED};
use crate::api::AppState;
use crate::auth::Identity;
use crate::protocol::client::ClientMessage;
use crate::protocol::server::ServerMessage;

/// Largest accepted inbound message or frame.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Keepalive ping interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Client messages waiting for the dispatcher, per connection.
pub const INBOX_CAPACITY: usize = 32;

pub const CONNECTION_BUSY: &str = "Too many pending messages";

/// WebSocket upgrade handler.
///
/// GET /api/ws
///
/// Authentication happens before the upgrade; failures get a bare 401 and the
/// connection is closed.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match state.auth.authenticate(&headers) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejected WebSocket handshake: {}", e);
            return (StatusCode::UNAUTHORIZED, [(header::CONNECTION, "close")]).into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    info!("WebSocket upgrade request from user {}", identity.user_id);
    upgrade
        .max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_connection(socket, state, identity))
}

async fn handle_connection(socket: WebSocket, state: AppState, identity: Identity) {
    let (mut sink, mut receiver) = socket.split();
    let (conn, mut outbound) = state.gateway.register(identity.clone());
    let conn_id = conn.id();

    conn.send(&ServerMessage::Connected).await;

    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ping_frame = serde_json::to_string(&ServerMessage::Ping).unwrap_or_default();

        loop {
            tokio::select! {
                next = outbound.recv() => {
                    let Some(text) = next else { break };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Text(ping_frame.clone().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let router = state
        .runtime
        .clone()
        .map(|runtime| Arc::new(ClientRouter::new(runtime, identity.clone(), state.sessions.clone())));

    // Messages are handled one at a time, in arrival order.
    let (queue, mut inbox) = mpsc::channel::<ClientMessage>(INBOX_CAPACITY);
    let dispatch_task = router.clone().map(|router| {
        let conn = conn.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                router.handle_message(&conn, message).await;
            }
        })
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                handle_text(&conn, router.as_deref(), &queue, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                debug!("Received binary message from user {}, ignoring", identity.user_id);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("User {} closed WebSocket connection", identity.user_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error for user {}: {}", identity.user_id, e);
                break;
            }
        }
    }

    if let Some(router) = &router {
        router.cancel(None);
    }
    drop(queue);
    if let Some(task) = dispatch_task {
        task.abort();
    }
    send_task.abort();
    state.gateway.unregister(conn_id);
    info!("WebSocket connection closed for user {}", identity.user_id);
}

async fn handle_text(
    conn: &ConnectionHandle,
    router: Option<&ClientRouter>,
    queue: &mpsc::Sender<ClientMessage>,
    text: &str,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Dropping malformed frame on connection {}: {}", conn.id(), e);
            return;
        }
    };

    let Some(router) = router else {
        conn.send(&ServerMessage::error(RUNTIME_NOT_CONFIGURED)).await;
        return;
    };

    let message = match serde_json::from_value::<ClientMessage>(value) {
        Ok(message) => message,
        Err(e) => {
            debug!("Unsupported message on connection {}: {}", conn.id(), e);
            conn.send(&ServerMessage::error(format!("Invalid message: {}", e)))
                .await;
            return;
        }
    };

    match message {
        ClientMessage::ChatCancel { request_id } => {
            router.cancel(request_id.as_deref());
        }
        message => match queue.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!("Inbox full on connection {}, rejecting message", conn.id());
                let request_id = match message {
                    ClientMessage::ChatSend { request_id, .. } => request_id,
                    _ => None,
                };
                conn.send(&ServerMessage::Error {
                    message: CONNECTION_BUSY.to_string(),
                    request_id,
                })
                .await;
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Dispatcher for connection {} is gone", conn.id());
            }
        },
    }
}
