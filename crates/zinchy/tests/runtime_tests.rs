//! Runtime adapters against in-process fake runtimes.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use common::{eventually, serve};
use zinchy::runtime::{
    ChatOptions, ConnectError, RuntimeChatChunk, RuntimeConfig, RuntimeEvent, RuntimeKind,
    create_runtime_client,
};

fn pull_config(base_url: String) -> RuntimeConfig {
    RuntimeConfig {
        pull_url: Some(base_url),
        request_timeout_secs: 5,
        idle_timeout_secs: 5,
        ..Default::default()
    }
}

async fn stream_reply() -> impl IntoResponse {
    let body = concat!(
        "data: {\"type\":\"text\",\"text\":\"hel\"}\n\n",
        ": keepalive\n\n",
        "data: {\"type\":\"delta\",\"content\":\"lo\"}\n\n",
        "data: {\"type\":\"done\"}\n\n",
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn history(Path(key): Path<String>) -> Json<Value> {
    Json(json!({
        "messages": [
            {"role": "user", "content": key, "created_at": "2024-01-01T00:00:00Z"},
        ]
    }))
}

fn healthy_pull_runtime() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/messages", post(stream_reply))
        .route(
            "/api/sessions",
            get(|| async { Json(json!({"sessions": ["user:alice:main", {"id": "user:bob:main"}]})) }),
        )
        .route("/api/sessions/{key}/history", get(history))
}

fn failing_pull_runtime() -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
        .route("/api/messages", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/api/sessions", get(|| async { StatusCode::BAD_GATEWAY }))
}

#[tokio::test]
async fn test_pull_chat_streams_chunks() {
    let addr = serve(healthy_pull_runtime()).await;
    let runtime = create_runtime_client(&pull_config(format!("http://{addr}")))
        .unwrap()
        .unwrap();
    assert_eq!(runtime.kind(), RuntimeKind::Pull);

    runtime.connect().await.unwrap();
    assert!(runtime.is_connected());

    let chunks: Vec<_> = runtime
        .chat("hi".to_string(), ChatOptions::for_session("user:alice:main"))
        .collect()
        .await;
    assert_eq!(
        chunks,
        vec![
            RuntimeChatChunk::text("hel"),
            RuntimeChatChunk::text("lo"),
            RuntimeChatChunk::Done,
        ]
    );
}

#[tokio::test]
async fn test_pull_non_success_yields_single_error() {
    let addr = serve(failing_pull_runtime()).await;
    let runtime = create_runtime_client(&pull_config(format!("http://{addr}")))
        .unwrap()
        .unwrap();

    let chunks: Vec<_> = runtime
        .chat("hi".to_string(), ChatOptions::default())
        .collect()
        .await;
    assert_eq!(
        chunks,
        vec![RuntimeChatChunk::error("Pull runtime error: Internal Server Error")]
    );
}

#[tokio::test]
async fn test_pull_any_health_answer_counts_as_connected() {
    let addr = serve(failing_pull_runtime()).await;
    let runtime = create_runtime_client(&pull_config(format!("http://{addr}")))
        .unwrap()
        .unwrap();

    runtime.connect().await.unwrap();
    assert!(runtime.is_connected());
    assert!(runtime.list_sessions().await.is_empty());
    assert!(runtime.history("user:alice:main").await.is_empty());
}

#[tokio::test]
async fn test_pull_sessions_and_history() {
    let addr = serve(healthy_pull_runtime()).await;
    let runtime = create_runtime_client(&pull_config(format!("http://{addr}/")))
        .unwrap()
        .unwrap();

    let keys: Vec<_> = runtime
        .list_sessions()
        .await
        .into_iter()
        .map(|s| s.key)
        .collect();
    assert_eq!(keys, vec!["user:alice:main", "user:bob:main"]);

    let messages = runtime.history("user:alice:main").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[0].content, json!("user:alice:main"));
    assert_eq!(messages[0].timestamp, Some(1_704_067_200_000));
}

#[tokio::test]
async fn test_pull_unreachable_runtime() {
    // Bind then drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let runtime = create_runtime_client(&pull_config(format!("http://{addr}")))
        .unwrap()
        .unwrap();
    let mut events = runtime.subscribe();

    let err = runtime.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Unreachable { .. }));
    assert!(!runtime.is_connected());
    assert!(matches!(events.recv().await.unwrap(), RuntimeEvent::Error(_)));

    let chunks: Vec<_> = runtime
        .chat("hi".to_string(), ChatOptions::default())
        .collect()
        .await;
    assert_eq!(chunks.len(), 1);
    match &chunks[0] {
        RuntimeChatChunk::Error { text } => {
            assert!(text.starts_with("Pull runtime connection error: "))
        }
        other => panic!("expected error chunk, got {other:?}"),
    }
}

/// Fires when the response body it travels with is dropped.
struct DropSignal(Option<oneshot::Sender<()>>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Clone)]
struct BodyDropped(Arc<Mutex<Option<oneshot::Sender<()>>>>);

/// One text event, then keepalive comments forever.
async fn endless_reply(State(dropped): State<BodyDropped>) -> impl IntoResponse {
    let guard = DropSignal(dropped.0.lock().take());
    let first = futures::stream::once(async {
        Ok::<_, std::convert::Infallible>(Bytes::from_static(
            b"data: {\"type\":\"text\",\"text\":\"hel\"}\n\n",
        ))
    });
    let keepalive = futures::stream::unfold((), |()| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Some((Ok(Bytes::from_static(b": keepalive\n\n")), ()))
    });
    let body = first.chain(keepalive).map(move |chunk| {
        let _ = &guard;
        chunk
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
}

#[tokio::test]
async fn test_pull_dropping_stream_cancels_request() {
    let (tx, rx) = oneshot::channel();
    let router = Router::new()
        .route("/api/messages", post(endless_reply))
        .with_state(BodyDropped(Arc::new(Mutex::new(Some(tx)))));
    let addr = serve(router).await;
    let runtime = create_runtime_client(&pull_config(format!("http://{addr}")))
        .unwrap()
        .unwrap();

    let mut stream = runtime.chat("hi".to_string(), ChatOptions::default());
    assert_eq!(stream.next().await, Some(RuntimeChatChunk::text("hel")));
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("runtime kept streaming after the client went away")
        .unwrap();
}

/// How the fake push runtime answers `chat.send`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
enum ChatReply {
    /// A text chunk, then done.
    #[default]
    Complete,
    /// A text chunk and nothing else.
    Partial,
    /// Only the acknowledgement.
    Silent,
}

/// Fake push runtime speaking req/res/event frames.
#[derive(Clone, Default)]
struct FakePush {
    connections: Arc<AtomicUsize>,
    /// Close the first connection right after the handshake.
    drop_first: bool,
    chat_reply: ChatReply,
    /// Every method received, in order.
    methods: Arc<Mutex<Vec<String>>>,
}

impl FakePush {
    fn saw(&self, method: &str) -> bool {
        self.methods.lock().iter().any(|m| m == method)
    }
}

async fn push_upgrade(State(fake): State<FakePush>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| fake_push_session(socket, fake))
}

async fn fake_push_session(mut socket: WebSocket, fake: FakePush) {
    let nth = fake.connections.fetch_add(1, Ordering::SeqCst);

    while let Some(Ok(message)) = socket.next().await {
        let Message::Text(text) = message else { continue };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        let id = frame["id"].clone();
        let params = &frame["params"];
        let method = frame["method"].as_str().unwrap_or_default();
        fake.methods.lock().push(method.to_string());

        let mut replies = Vec::new();
        match method {
            "connect" => {
                assert_eq!(params["client"]["id"], "gateway-client");
                replies.push(json!({"type": "res", "id": id, "ok": true, "payload": {}}));
            }
            "chat.send" => {
                let run_id = params["runId"].clone();
                replies.push(json!({"type": "res", "id": id, "ok": true, "payload": {"runId": run_id}}));
                if fake.chat_reply != ChatReply::Silent {
                    replies.push(json!({"type": "event", "event": "chat", "payload": {"runId": run_id, "chunk": {"type": "text", "text": "hi"}}}));
                }
                if fake.chat_reply == ChatReply::Complete {
                    replies.push(json!({"type": "event", "event": "chat", "payload": {"runId": run_id, "chunk": {"type": "done"}}}));
                }
            }
            "sessions.list" => {
                replies.push(json!({"type": "res", "id": id, "ok": true, "payload": {"sessions": [{"key": "user:alice:main"}]}}));
            }
            "sessions.history" => {
                replies.push(json!({"type": "res", "id": id, "ok": false, "error": {"code": "NOT_FOUND", "message": "no such session"}}));
            }
            _ => {}
        }

        for reply in replies {
            if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                return;
            }
        }

        if nth == 0 && fake.drop_first && frame["method"] == "connect" {
            let _ = socket.close().await;
            return;
        }
    }
}

async fn spawn_fake_push(fake: FakePush) -> String {
    let router = Router::new()
        .route("/", get(push_upgrade))
        .with_state(fake);
    let addr = serve(router).await;
    format!("ws://{addr}/")
}

fn push_config(url: String) -> RuntimeConfig {
    RuntimeConfig {
        push_url: Some(url),
        reconnect_interval_ms: 50,
        max_reconnect_interval_ms: 200,
        request_timeout_secs: 5,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_push_chat_and_sessions() {
    let url = spawn_fake_push(FakePush::default()).await;
    let runtime = create_runtime_client(&push_config(url)).unwrap().unwrap();
    assert_eq!(runtime.kind(), RuntimeKind::Push);

    runtime.connect().await.unwrap();
    assert!(runtime.is_connected());

    let chunks: Vec<_> = runtime
        .chat("hello".to_string(), ChatOptions::for_session("user:alice:main"))
        .collect()
        .await;
    assert_eq!(
        chunks,
        vec![RuntimeChatChunk::text("hi"), RuntimeChatChunk::Done]
    );

    let sessions = runtime.list_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].key, "user:alice:main");

    // Rejected requests degrade to an empty result.
    assert!(runtime.history("user:alice:main").await.is_empty());
}

#[tokio::test]
async fn test_push_reconnects_after_drop() {
    let fake = FakePush {
        drop_first: true,
        ..Default::default()
    };
    let connections = fake.connections.clone();
    let url = spawn_fake_push(fake).await;
    let runtime = create_runtime_client(&push_config(url)).unwrap().unwrap();
    let mut events = runtime.subscribe();

    runtime.connect().await.unwrap();

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.len() < 3 {
            match events.recv().await {
                Ok(event) => seen.push(event),
                Err(_) => break,
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(
        seen,
        vec![
            RuntimeEvent::Connected,
            RuntimeEvent::Disconnected,
            RuntimeEvent::Connected,
        ]
    );
    assert!(connections.load(Ordering::SeqCst) >= 2);
    assert!(runtime.is_connected());
}

#[tokio::test]
async fn test_push_unreachable_runtime() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let runtime = create_runtime_client(&push_config(format!("ws://{addr}/")))
        .unwrap()
        .unwrap();
    let err = runtime.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Unreachable { .. }));
    assert!(!runtime.is_connected());
}

#[tokio::test]
async fn test_push_dropping_stream_aborts_run() {
    let fake = FakePush {
        chat_reply: ChatReply::Partial,
        ..Default::default()
    };
    let url = spawn_fake_push(fake.clone()).await;
    let runtime = create_runtime_client(&push_config(url)).unwrap().unwrap();
    runtime.connect().await.unwrap();

    let mut stream = runtime.chat("hello".to_string(), ChatOptions::for_session("user:alice:main"));
    assert_eq!(stream.next().await, Some(RuntimeChatChunk::text("hi")));
    drop(stream);

    assert!(eventually(|| fake.saw("chat.abort")).await);
    assert_eq!(
        *fake.methods.lock(),
        vec!["connect", "chat.send", "chat.abort"]
    );
}

#[tokio::test]
async fn test_push_silent_run_times_out() {
    let fake = FakePush {
        chat_reply: ChatReply::Silent,
        ..Default::default()
    };
    let url = spawn_fake_push(fake.clone()).await;
    let config = RuntimeConfig {
        idle_timeout_secs: 1,
        ..push_config(url)
    };
    let runtime = create_runtime_client(&config).unwrap().unwrap();
    runtime.connect().await.unwrap();

    let chunks: Vec<_> = tokio::time::timeout(
        Duration::from_secs(5),
        runtime
            .chat("hello".to_string(), ChatOptions::for_session("user:alice:main"))
            .collect::<Vec<_>>(),
    )
    .await
    .expect("silent run never ended");
    assert_eq!(
        chunks,
        vec![RuntimeChatChunk::error("no chat events from runtime for 1s")]
    );

    // The abandoned run is aborted on the runtime side.
    assert!(eventually(|| fake.saw("chat.abort")).await);
}
