//! Per-connection message router.
//!
//! Turns client frames into runtime calls and streams the results back. Every
//! user owns the session namespace `user:<id>:`; only admins may reach outside it.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::gateway::ConnectionHandle;
use crate::auth::Identity;
use crate::protocol::client::ClientMessage;
use crate::protocol::server::{ChunkFrame, ServerMessage};
use crate::runtime::{ChatOptions, RuntimeChatChunk, RuntimeClient, SessionCache};

pub const RUNTIME_UNAVAILABLE: &str = "Agent runtime unavailable";
pub const RUNTIME_NOT_CONFIGURED: &str = "Agent runtime not configured";

/// Name of the session a user gets when none is given.
const MAIN_SESSION: &str = "main";

/// Cancelled request ids remembered for chats that have not started yet.
const PENDING_CANCEL_LIMIT: usize = 32;

struct ActiveChat {
    request_id: Option<String>,
    token: CancellationToken,
}

pub struct ClientRouter {
    runtime: Arc<dyn RuntimeClient>,
    identity: Identity,
    sessions: Arc<SessionCache>,
    active: Mutex<Option<ActiveChat>>,
    pending_cancels: Mutex<VecDeque<String>>,
}

impl ClientRouter {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        identity: Identity,
        sessions: Arc<SessionCache>,
    ) -> Self {
        Self {
            runtime,
            identity,
            sessions,
            active: Mutex::new(None),
            pending_cancels: Mutex::new(VecDeque::new()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Prefix of every session key this user owns.
    pub fn namespace(&self) -> String {
        format!("user:{}:", self.identity.user_id)
    }

    pub fn default_session_key(&self) -> String {
        format!("{}{}", self.namespace(), MAIN_SESSION)
    }

    pub fn can_access(&self, session_key: &str) -> bool {
        self.identity.is_admin() || session_key.starts_with(&self.namespace())
    }

    /// Pick the session for a request, enforcing the namespace rule.
    pub fn resolve_session_key(&self, requested: Option<&str>) -> Result<String, String> {
        match requested.map(str::trim).filter(|key| !key.is_empty()) {
            None => Ok(self.default_session_key()),
            Some(key) if self.can_access(key) => Ok(key.to_string()),
            Some(key) => Err(format!("Access denied to session '{}'", key)),
        }
    }

    /// Handle one client message. Never fails; problems become error frames.
    pub async fn handle_message(&self, conn: &ConnectionHandle, message: ClientMessage) {
        match message {
            ClientMessage::ChatSend {
                text,
                session_key,
                agent_id,
                request_id,
                options,
            } => {
                self.chat(conn, text, session_key, agent_id, request_id, options)
                    .await
            }
            ClientMessage::ChatCancel { request_id } => {
                self.cancel(request_id.as_deref());
            }
            ClientMessage::SessionsList => self.list_sessions(conn).await,
            ClientMessage::SessionsHistory { session_key } => self.history(conn, &session_key).await,
            ClientMessage::Ping => {
                conn.send(&ServerMessage::Pong).await;
            }
        }
    }

    /// Cancel the in-flight chat when ids match (or no id is given).
    ///
    /// An id that matches nothing in flight is remembered, so a chat still
    /// queued behind another is cancelled as soon as it starts.
    pub fn cancel(&self, request_id: Option<&str>) -> bool {
        let active = self.active.lock();
        match active.as_ref() {
            Some(chat) if request_id.is_none() || chat.request_id.as_deref() == request_id => {
                debug!(
                    "Cancelling chat {:?} for user {}",
                    chat.request_id, self.identity.user_id
                );
                chat.token.cancel();
                true
            }
            _ => {
                if let Some(id) = request_id {
                    let mut pending = self.pending_cancels.lock();
                    if pending.len() == PENDING_CANCEL_LIMIT {
                        pending.pop_front();
                    }
                    pending.push_back(id.to_string());
                }
                false
            }
        }
    }

    fn begin_chat(&self, request_id: Option<String>) -> CancellationToken {
        let token = CancellationToken::new();
        let mut active = self.active.lock();
        if let Some(id) = request_id.as_deref() {
            let mut pending = self.pending_cancels.lock();
            if let Some(pos) = pending.iter().position(|cancelled| cancelled == id) {
                pending.remove(pos);
                token.cancel();
            }
        }
        *active = Some(ActiveChat {
            request_id,
            token: token.clone(),
        });
        token
    }

    fn end_chat(&self) {
        self.active.lock().take();
    }

    async fn ensure_connected(&self) -> bool {
        if self.runtime.is_connected() {
            return true;
        }
        match self.runtime.connect().await {
            Ok(()) => self.runtime.is_connected(),
            Err(e) => {
                warn!("Agent runtime unavailable: {}", e);
                false
            }
        }
    }

    /// Make sure the session cache knows about `session_key`.
    async fn track_session(&self, session_key: &str) {
        if self.sessions.has(session_key) {
            return;
        }
        if self.sessions.is_stale() {
            let sessions = self.runtime.list_sessions().await;
            self.sessions.refresh(&sessions);
        }
        if !self.sessions.has(session_key) {
            info!("Starting new session {}", session_key);
            self.sessions.add(session_key);
        }
    }

    async fn chat(
        &self,
        conn: &ConnectionHandle,
        text: String,
        session_key: Option<String>,
        agent_id: Option<String>,
        request_id: Option<String>,
        options: Map<String, Value>,
    ) {
        let session_key = match self.resolve_session_key(session_key.as_deref()) {
            Ok(key) => key,
            Err(message) => {
                conn.send(&ServerMessage::Error {
                    message,
                    request_id,
                })
                .await;
                return;
            }
        };

        let frame = |chunk: RuntimeChatChunk| ChunkFrame {
            chunk,
            session_key: session_key.clone(),
            request_id: request_id.clone(),
        };

        let token = self.begin_chat(request_id.clone());
        if token.is_cancelled() {
            debug!("Chat on {} cancelled before it started", session_key);
            self.end_chat();
            conn.send(&frame(RuntimeChatChunk::Done)).await;
            return;
        }

        if !self.ensure_connected().await {
            self.end_chat();
            conn.send(&frame(RuntimeChatChunk::error(RUNTIME_UNAVAILABLE)))
                .await;
            conn.send(&frame(RuntimeChatChunk::Done)).await;
            return;
        }

        self.track_session(&session_key).await;

        let mut stream = self.runtime.chat(
            text,
            ChatOptions {
                session_key: Some(session_key.clone()),
                agent_id,
                extra: options,
            },
        );

        let mut terminated = false;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Chat on {} cancelled", session_key);
                    break;
                }
                next = stream.next() => {
                    let Some(chunk) = next else { break };
                    terminated = chunk.is_terminal();
                    if !conn.send(&frame(chunk)).await {
                        debug!("Connection {} went away mid-chat", conn.id());
                        self.end_chat();
                        return;
                    }
                    if terminated {
                        break;
                    }
                }
            }
        }

        // Dropping the stream releases the runtime request.
        drop(stream);
        self.end_chat();

        if !terminated {
            conn.send(&frame(RuntimeChatChunk::Done)).await;
        }
    }

    async fn list_sessions(&self, conn: &ConnectionHandle) {
        let sessions = self.runtime.list_sessions().await;
        self.sessions.refresh(&sessions);

        let visible = if self.identity.is_admin() {
            sessions
        } else {
            let namespace = self.namespace();
            sessions
                .into_iter()
                .filter(|session| session.key.starts_with(&namespace))
                .collect()
        };
        conn.send(&ServerMessage::Sessions { sessions: visible }).await;
    }

    async fn history(&self, conn: &ConnectionHandle, session_key: &str) {
        if !self.can_access(session_key) {
            conn.send(&ServerMessage::error(format!(
                "Access denied to session '{}'",
                session_key
            )))
            .await;
            return;
        }

        let messages = self.runtime.history(session_key).await;
        conn.send(&ServerMessage::History {
            session_key: session_key.to_string(),
            messages,
        })
        .await;
    }
}
