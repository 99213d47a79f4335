//! HTTP handlers.

use axum::{Json, extract::State, http::StatusCode};
use log::info;
use serde::{Deserialize, Serialize};

use super::error::ApiResult;
use super::state::AppState;
use crate::auth::RequireAdmin;
use crate::runtime::RuntimeKind;

#[derive(Debug, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub kind: RuntimeKind,
    pub endpoint: String,
    pub connected: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// `null` when no runtime is configured.
    pub runtime: Option<RuntimeStatus>,
    /// Live WebSocket connections.
    pub connections: usize,
}

/// Health check.
///
/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let runtime = state.runtime.as_ref().map(|runtime| RuntimeStatus {
        kind: runtime.kind(),
        endpoint: runtime.endpoint().to_string(),
        connected: runtime.is_connected(),
    });

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        runtime,
        connections: state.gateway.len(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPhase {
    Restarting,
    Ready,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RestartRequest {
    pub phase: RestartPhase,
}

/// Drive the runtime restart state. Admin only.
///
/// POST /api/runtime/restart
pub async fn runtime_restart(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Json(request): Json<RestartRequest>,
) -> ApiResult<StatusCode> {
    info!(
        "Admin {} set runtime restart phase to {:?}",
        admin.id(),
        request.phase
    );
    match request.phase {
        RestartPhase::Restarting => state.restart.begin_restart(),
        RestartPhase::Ready => {
            state.restart.notify_ready();
        }
    }
    Ok(StatusCode::ACCEPTED)
}
