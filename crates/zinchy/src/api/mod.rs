//! HTTP surface: the WebSocket upgrade route plus health and restart control.

mod error;
mod handlers;
mod routes;
mod state;

#[allow(unused_imports)]
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{HealthResponse, RestartPhase, RestartRequest, RuntimeStatus};
pub use routes::create_router;
pub use state::AppState;
