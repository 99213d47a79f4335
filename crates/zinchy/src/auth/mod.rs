//! Authentication module.
//!
//! Verifies the signed session cookie presented on the WebSocket upgrade (and on
//! the few HTTP control endpoints) and turns it into an [`Identity`].

mod claims;
mod config;
mod error;
mod session;

pub use claims::{Claims, Identity, Role};
pub use config::{AuthConfig, ConfigValidationError, SECRET_ENV_VARS};
pub use error::AuthError;
pub use session::{
    AuthState, CurrentUser, RequireAdmin, SECURE_SESSION_COOKIE, SESSION_COOKIE,
    derive_signing_key, select_session_cookie,
};
