//! Session cookie verification and axum extractors.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, header::COOKIE, request::Parts},
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};
use sha2::Sha256;

use super::{AuthConfig, AuthError, Claims, ConfigValidationError, Identity};

/// Session cookie set over HTTPS. Checked first.
pub const SECURE_SESSION_COOKIE: &str = "__Secure-authjs.session-token";
/// Session cookie set over plain HTTP.
pub const SESSION_COOKIE: &str = "authjs.session-token";

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Pick the session cookie out of a Cookie header.
///
/// Returns the cookie name (which doubles as the key-derivation salt) together
/// with its value. The secure cookie wins when both are present.
pub fn select_session_cookie(cookie_header: &str) -> Option<(&'static str, &str)> {
    let name = if token_from_cookie_header(cookie_header, SECURE_SESSION_COOKIE)
        .is_some_and(|token| !token.is_empty())
    {
        SECURE_SESSION_COOKIE
    } else {
        SESSION_COOKIE
    };
    token_from_cookie_header(cookie_header, name)
        .filter(|token| !token.is_empty())
        .map(|token| (name, token))
}

/// Derive the token signing key: HMAC-SHA256 keyed by the cookie name over the secret.
pub fn derive_signing_key(secret: &str, salt: &str) -> Result<Vec<u8>, AuthError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(salt.as_bytes())
        .map_err(|e| AuthError::Internal(e.to_string()))?;
    mac.update(secret.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    secret: Option<Arc<str>>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AuthState {
    pub fn new(secret: Option<String>) -> Self {
        if secret.is_none() {
            warn!("No session secret configured; every connection will be rejected");
        }
        Self {
            secret: secret.map(Arc::from),
        }
    }

    /// Build from config, resolving `env:` references and the fallback variables.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigValidationError> {
        Ok(Self::new(config.resolve_secret()?))
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Verify the session cookie carried by a Cookie header value.
    pub fn verify_cookie_header(&self, cookie_header: Option<&str>) -> Result<Claims, AuthError> {
        let cookie_header = cookie_header.ok_or(AuthError::MissingCookieHeader)?;
        let secret = self.secret.as_deref().ok_or(AuthError::MissingSecret)?;
        let (cookie_name, token) =
            select_session_cookie(cookie_header).ok_or(AuthError::MissingSessionCookie)?;

        self.validate_token(secret, cookie_name, token)
    }

    /// Authenticate a request by its headers.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let cookie_header = headers.get(COOKIE).and_then(|h| h.to_str().ok());
        let claims = self.verify_cookie_header(cookie_header)?;
        let identity = Identity::from_claims(&claims)?;
        debug!(
            "Authenticated user '{}' (role {})",
            identity.user_id, identity.user_role
        );
        Ok(identity)
    }

    fn validate_token(&self, secret: &str, salt: &str, token: &str) -> Result<Claims, AuthError> {
        let key = derive_signing_key(secret, salt)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;

        let token_data =
            decode::<Claims>(token, &DecodingKey::from_secret(&key), &validation).map_err(|e| {
                warn!("Session token validation failed: {:?}", e);
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    _ => AuthError::InvalidToken(e.to_string()),
                }
            })?;

        Ok(token_data.claims)
    }

    /// Mint a session token the gateway will accept under `cookie_name`.
    pub fn issue_token(
        &self,
        identity: &Identity,
        cookie_name: &str,
        ttl: chrono::Duration,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: Some(identity.user_id.clone()),
            id: None,
            exp: now + ttl.num_seconds(),
            iat: Some(now),
            email: None,
            name: None,
            role: Some(identity.user_role.clone()),
        };
        self.sign(cookie_name, &claims)
    }

    /// Sign arbitrary claims under `cookie_name`.
    pub fn sign(&self, cookie_name: &str, claims: &Claims) -> Result<String, AuthError> {
        let secret = self.secret.as_deref().ok_or(AuthError::MissingSecret)?;
        let key = derive_signing_key(secret, cookie_name)?;
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(&key),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

/// Authenticated user extracted from the request's session cookie.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Identity);

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.0.user_id
    }

    pub fn is_admin(&self) -> bool {
        self.0.is_admin()
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    AuthState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthState::from_ref(state);
        auth.authenticate(&parts.headers).map(CurrentUser)
    }
}

/// Require admin role.
///
/// Use as an extractor in handlers that require admin access.
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub CurrentUser);

impl<S> FromRequestParts<S> for RequireAdmin
where
    AuthState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;

        if !user.is_admin() {
            return Err(AuthError::InsufficientPermissions(
                "admin role required".to_string(),
            ));
        }

        Ok(RequireAdmin(user))
    }
}
