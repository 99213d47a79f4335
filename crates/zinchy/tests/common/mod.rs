//! Test utilities and common setup.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use futures::StreamExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use zinchy::api::{self, AppState};
use zinchy::auth::{AuthState, Identity, SESSION_COOKIE};
use zinchy::runtime::{RuntimeSelection, SessionCache};

pub const TEST_SECRET: &str = "test-secret-for-integration-tests-minimum-32-chars";

pub type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A gateway listening on an ephemeral local port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestGateway {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn cookie(&self, user: &str, role: &str) -> String {
        session_cookie(&self.state.auth, user, role)
    }

    /// Open an authenticated client connection and consume the `connected` frame.
    pub async fn connect(&self, user: &str, role: &str) -> ClientSocket {
        let cookie = self.cookie(user, role);
        let mut socket = connect_ws(&self.ws_url(), Some(&cookie))
            .await
            .expect("websocket handshake");
        let hello = next_json(&mut socket).await;
        assert_eq!(hello["type"], "connected");
        socket
    }
}

pub fn test_state(runtime: RuntimeSelection) -> AppState {
    AppState::new(
        AuthState::new(Some(TEST_SECRET.to_string())),
        runtime,
        SessionCache::default(),
    )
}

/// Serve `router` on 127.0.0.1 and return its address.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub async fn spawn_gateway(runtime: RuntimeSelection) -> TestGateway {
    let state = test_state(runtime);
    state.gateway.spawn_restart_relay(&state.restart);
    let addr = serve(api::create_router(state.clone())).await;
    TestGateway { addr, state }
}

pub fn session_cookie(auth: &AuthState, user: &str, role: &str) -> String {
    let token = auth
        .issue_token(
            &Identity::new(user, role),
            SESSION_COOKIE,
            chrono::Duration::minutes(10),
        )
        .unwrap();
    format!("{}={}", SESSION_COOKIE, token)
}

pub async fn connect_ws(
    url: &str,
    cookie: Option<&str>,
) -> Result<ClientSocket, tungstenite::Error> {
    let mut request = url.into_client_request()?;
    if let Some(cookie) = cookie {
        request
            .headers_mut()
            .insert("cookie", HeaderValue::from_str(cookie).unwrap());
    }
    let (socket, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

/// Next text frame as JSON, skipping keepalive pings.
pub async fn next_json(socket: &mut ClientSocket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] != "ping" {
                return value;
            }
        }
    }
}

/// Collect chunk frames until a terminator arrives.
pub async fn collect_chat(socket: &mut ClientSocket) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = next_json(socket).await;
        let kind = frame["type"].as_str().unwrap_or_default().to_string();
        frames.push(frame);
        if kind == "done" {
            return frames;
        }
    }
}

/// Poll until `check` holds or the deadline passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
