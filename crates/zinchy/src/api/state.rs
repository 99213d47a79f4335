//! Application state shared across handlers.

use std::sync::Arc;

use axum::extract::FromRef;

use crate::auth::AuthState;
use crate::restart::RestartState;
use crate::runtime::{RuntimeSelection, SessionCache};
use crate::ws::Gateway;

#[derive(Clone, Debug)]
pub struct AppState {
    pub auth: AuthState,
    pub gateway: Arc<Gateway>,
    /// `None` when no runtime is configured.
    pub runtime: RuntimeSelection,
    pub sessions: Arc<SessionCache>,
    pub restart: Arc<RestartState>,
}

impl AppState {
    pub fn new(auth: AuthState, runtime: RuntimeSelection, sessions: SessionCache) -> Self {
        Self {
            auth,
            gateway: Arc::new(Gateway::new()),
            runtime,
            sessions: Arc::new(sessions),
            restart: Arc::new(RestartState::new()),
        }
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
