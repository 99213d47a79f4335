//! Persistent duplex channel to a push runtime.
//!
//! One supervisor task owns the WebSocket: it performs the `connect` handshake,
//! routes responses to waiting requests and chat events to their runs, and
//! reconnects with exponential backoff when the socket drops.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::credentials::{read_device_id, read_token};
use super::frames::{CHAT_EVENT, ConnectParams, Frame, method};
use crate::runtime::{ChannelError, ChatOptions, ConnectError, EventBus, RuntimeEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Raw, runtime-native chat chunks for one run.
pub type NativeChunkStream = BoxStream<'static, Value>;

/// Error chunk delivered to every in-flight run when the socket drops.
const CONNECTION_LOST: &str = "connection lost";

/// A persistent request/response + event channel to a push runtime.
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Start the channel (once) and report the outcome of its first attempt.
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Start a run and stream its native chunks until `done` or `error`.
    fn chat(&self, text: String, options: ChatOptions) -> NativeChunkStream;

    async fn list_sessions(&self) -> Result<Value, ChannelError>;

    async fn history(&self, session_key: &str) -> Result<Value, ChannelError>;

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;
}

/// When and how often to reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub interval: Duration,
    /// Upper bound for the backoff.
    pub max_interval: Duration,
    /// Consecutive failures before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after `failures` consecutive failed attempts.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(16));
        self.interval.saturating_mul(factor).min(self.max_interval)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

/// Settings for [`GatewayChannel`].
#[derive(Debug, Clone)]
pub struct GatewayChannelConfig {
    /// `ws://` or `wss://` URL of the runtime gateway.
    pub url: String,
    pub token_path: Option<PathBuf>,
    pub device_identity_path: Option<PathBuf>,
    pub client_id: String,
    pub client_version: String,
    pub scopes: Vec<String>,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
    /// Longest silence between chunks of a run before it is given up.
    pub run_idle_timeout: Duration,
}

impl GatewayChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token_path: None,
            device_identity_path: None,
            client_id: "gateway-client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            scopes: vec!["operator.admin".to_string()],
            reconnect: ReconnectPolicy::default(),
            request_timeout: Duration::from_secs(30),
            run_idle_timeout: Duration::from_secs(120),
        }
    }
}

type PendingReply = oneshot::Sender<Result<Value, ChannelError>>;

struct Shared {
    config: GatewayChannelConfig,
    connected: AtomicBool,
    outbound: RwLock<Option<mpsc::UnboundedSender<String>>>,
    pending: DashMap<String, PendingReply>,
    runs: DashMap<String, mpsc::UnboundedSender<Value>>,
    events: EventBus,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    fn next_request_id(&self) -> String {
        format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Queue a frame on the live socket without waiting for a reply.
    fn send_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        let text = serde_json::to_string(frame).map_err(|e| ChannelError::Serialize(e.to_string()))?;
        let outbound = self.outbound.read().clone().ok_or(ChannelError::NotConnected)?;
        outbound.send(text).map_err(|_| ChannelError::NotConnected)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ChannelError> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        if let Err(e) = self.send_frame(&Frame::request(id.clone(), method, params)) {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(ChannelError::Timeout(method.to_string()))
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Res {
                id,
                ok,
                payload,
                error,
            } => {
                let Some((_, reply)) = self.pending.remove(&id) else {
                    debug!("Dropping response for unknown request id {}", id);
                    return;
                };
                let result = if ok {
                    Ok(payload.unwrap_or(Value::Null))
                } else {
                    Err(ChannelError::Rejected(
                        error.map(|e| e.describe()).unwrap_or_else(|| "request failed".to_string()),
                    ))
                };
                let _ = reply.send(result);
            }
            Frame::Event { event, payload } if event == CHAT_EVENT => self.route_chat_event(payload),
            Frame::Event { event, .. } => debug!("Ignoring runtime event '{}'", event),
            Frame::Req { method, .. } => debug!("Ignoring request '{}' from runtime", method),
        }
    }

    fn route_chat_event(&self, payload: Value) {
        let Some(run_id) = payload.get("runId").and_then(Value::as_str) else {
            debug!("Chat event without runId");
            return;
        };
        let chunk = payload.get("chunk").cloned().unwrap_or(Value::Null);
        let terminal = matches!(
            chunk.get("type").and_then(Value::as_str),
            Some("done") | Some("error")
        );

        if terminal {
            if let Some((_, run)) = self.runs.remove(run_id) {
                let _ = run.send(chunk);
            }
        } else if let Some(run) = self.runs.get(run_id) {
            let _ = run.send(chunk);
        }
    }

    /// Fail everything that was waiting on the socket that just closed.
    fn fail_in_flight(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(ChannelError::Closed));
            }
        }

        let run_ids: Vec<String> = self.runs.iter().map(|e| e.key().clone()).collect();
        for run_id in run_ids {
            if let Some((_, run)) = self.runs.remove(&run_id) {
                let _ = run.send(json!({"type": "error", "message": CONNECTION_LOST}));
            }
        }
    }

    async fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            client_id: self.config.client_id.clone(),
            client_version: self.config.client_version.clone(),
            scopes: self.config.scopes.clone(),
            token: read_token(self.config.token_path.as_deref()).await,
            device_id: read_device_id(self.config.device_identity_path.as_deref()).await,
        }
    }
}

/// WebSocket implementation of [`DuplexChannel`].
pub struct GatewayChannel {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayChannel {
    pub fn new(config: GatewayChannelConfig) -> Result<Self, ConnectError> {
        let scheme_ok = config.url.starts_with("ws://") || config.url.starts_with("wss://");
        if !scheme_ok || reqwest::Url::parse(&config.url).is_err() {
            return Err(ConnectError::InvalidUrl(config.url));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                connected: AtomicBool::new(false),
                outbound: RwLock::new(None),
                pending: DashMap::new(),
                runs: DashMap::new(),
                events: EventBus::new(),
                next_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
            supervisor: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.shared.config.url
    }

    /// Stop the supervisor and close the socket.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

impl Drop for GatewayChannel {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl DuplexChannel for GatewayChannel {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        let first_attempt = {
            let mut supervisor = self.supervisor.lock();
            if supervisor.is_some() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.shared), tx)));
                Some(rx)
            }
        };

        match first_attempt {
            Some(rx) => rx.await.unwrap_or(Err(ConnectError::NotConnected)),
            None if self.is_connected() => Ok(()),
            None => Err(ConnectError::NotConnected),
        }
    }

    fn chat(&self, text: String, options: ChatOptions) -> NativeChunkStream {
        let run_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.runs.insert(run_id.clone(), tx);

        let guard = RunGuard {
            shared: Arc::clone(&self.shared),
            run_id: run_id.clone(),
        };
        let shared = Arc::clone(&self.shared);
        let params = chat_params(&text, &options, &run_id);

        let inner = futures::stream::once(async move {
            match shared.request(method::CHAT_SEND, params).await {
                Ok(_) => run_chunks(rx, shared.config.run_idle_timeout),
                Err(e) => {
                    shared.runs.remove(&run_id);
                    futures::stream::iter([json!({"type": "error", "message": e.to_string()})]).boxed()
                }
            }
        })
        .flatten()
        .boxed();

        Box::pin(RunStream {
            inner,
            _guard: guard,
        })
    }

    async fn list_sessions(&self) -> Result<Value, ChannelError> {
        self.shared.request(method::SESSIONS_LIST, json!({})).await
    }

    async fn history(&self, session_key: &str) -> Result<Value, ChannelError> {
        self.shared
            .request(method::SESSIONS_HISTORY, json!({ "sessionKey": session_key }))
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.shared.events.subscribe()
    }
}

fn chat_params(text: &str, options: &ChatOptions, run_id: &str) -> Value {
    let mut params: Map<String, Value> = options.extra.clone();
    if let Some(session_key) = &options.session_key {
        params.insert("sessionKey".to_string(), json!(session_key));
    }
    if let Some(agent_id) = &options.agent_id {
        params.insert("agentId".to_string(), json!(agent_id));
    }
    params.insert("message".to_string(), json!(text));
    params.insert("runId".to_string(), json!(run_id));
    Value::Object(params)
}

/// Chunks routed to one run. A run that stays silent for `idle` ends with an
/// error chunk; it is still registered then, so dropping the stream aborts it.
fn run_chunks(rx: mpsc::UnboundedReceiver<Value>, idle: Duration) -> NativeChunkStream {
    futures::stream::unfold(Some(rx), move |rx| async move {
        let mut rx = rx?;
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(chunk)) => Some((chunk, Some(rx))),
            Ok(None) => None,
            Err(_) => {
                warn!("No chat events from push runtime for {:?}", idle);
                let message = format!("no chat events from runtime for {}s", idle.as_secs());
                Some((json!({"type": "error", "message": message}), None))
            }
        }
    })
    .boxed()
}

/// Unsubscribes a run when its stream is dropped, aborting it if still active.
struct RunGuard {
    shared: Arc<Shared>,
    run_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.shared.runs.remove(&self.run_id).is_none() {
            return;
        }
        let id = self.shared.next_request_id();
        let abort = Frame::request(id, method::CHAT_ABORT, json!({ "runId": self.run_id }));
        if let Err(e) = self.shared.send_frame(&abort) {
            debug!("Could not abort run {}: {}", self.run_id, e);
        }
    }
}

struct RunStream {
    inner: NativeChunkStream,
    _guard: RunGuard,
}

impl Stream for RunStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Connection supervisor: connect, serve, back off, repeat.
async fn supervise(shared: Arc<Shared>, first_attempt: oneshot::Sender<Result<(), ConnectError>>) {
    let mut first_attempt = Some(first_attempt);
    let mut failures: u32 = 0;
    let policy = shared.config.reconnect.clone();

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        match open_socket(&shared).await {
            Ok(socket) => {
                failures = 0;
                serve_socket(&shared, socket, first_attempt.take()).await;
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "Push runtime connection to {} failed (attempt {}): {}",
                    shared.config.url, failures, e
                );
                shared.events.emit(RuntimeEvent::Error(e.to_string()));
                if let Some(tx) = first_attempt.take() {
                    let _ = tx.send(Err(e));
                }
                if policy.exhausted(failures) {
                    error!(
                        "Giving up on push runtime at {} after {} attempts",
                        shared.config.url, failures
                    );
                    break;
                }
            }
        }

        let delay = policy.delay_for(failures);
        debug!("Reconnecting to push runtime in {:?}", delay);
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Push runtime supervisor for {} stopped", shared.config.url);
}

/// Open the socket and complete the `connect` handshake.
async fn open_socket(shared: &Shared) -> Result<Socket, ConnectError> {
    let url = &shared.config.url;
    let timeout = shared.config.request_timeout;
    let unreachable = |message: String| ConnectError::Unreachable {
        url: url.clone(),
        message,
    };

    let (mut socket, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| unreachable("connection timed out".to_string()))?
        .map_err(|e| unreachable(e.to_string()))?;

    let id = shared.next_request_id();
    let hello = Frame::request(id.clone(), method::CONNECT, shared.connect_params().await.to_value());
    let text = serde_json::to_string(&hello).map_err(|e| ConnectError::Handshake(e.to_string()))?;
    socket
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| ConnectError::Handshake(e.to_string()))?;

    let reply = tokio::time::timeout(timeout, async {
        while let Some(message) = socket.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(Frame::Res {
                        id: reply_id,
                        ok,
                        error,
                        ..
                    }) if reply_id == id => {
                        return if ok {
                            Ok(())
                        } else {
                            Err(error.map(|e| e.describe()).unwrap_or_else(|| "rejected".to_string()))
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => debug!("Unparseable frame during handshake: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(e.to_string()),
            }
        }
        Err("socket closed during handshake".to_string())
    })
    .await
    .map_err(|_| ConnectError::Handshake("no handshake response".to_string()))?;

    reply.map_err(ConnectError::Handshake)?;
    Ok(socket)
}

/// Pump one connected socket until it closes.
async fn serve_socket(
    shared: &Arc<Shared>,
    socket: Socket,
    ready: Option<oneshot::Sender<Result<(), ConnectError>>>,
) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    *shared.outbound.write() = Some(outbound_tx);
    shared.connected.store(true, Ordering::SeqCst);
    info!("Connected to push runtime at {}", shared.config.url);
    shared.events.emit(RuntimeEvent::Connected);
    if let Some(tx) = ready {
        let _ = tx.send(Ok(()));
    }

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                warn!("Failed to write to push runtime: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let message = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(text.as_str()) {
                Ok(frame) => shared.handle_frame(frame),
                Err(e) => warn!("Failed to parse push runtime frame: {}", e),
            },
            Some(Ok(Message::Close(frame))) => {
                debug!("Push runtime closed the socket: {:?}", frame);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("Push runtime socket error: {}", e);
                break;
            }
            None => break,
        }
    }

    shared.outbound.write().take();
    shared.connected.store(false, Ordering::SeqCst);
    writer.abort();
    shared.fail_in_flight();
    info!("Disconnected from push runtime at {}", shared.config.url);
    shared.events.emit(RuntimeEvent::Disconnected);
}
