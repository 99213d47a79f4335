//! Session token claims, roles and the per-connection identity.

use serde::{Deserialize, Serialize};

use super::AuthError;

/// User role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular user.
    #[default]
    User,
    /// Administrator.
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// Claims carried by a session token.
///
/// Only `exp` is mandatory. The user id is taken from `sub`, falling back to a
/// custom `id` claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Alternative user ID claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Expiration time (as Unix timestamp).
    pub exp: i64,

    /// Issued at (as Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// User's email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// User's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// User role as stored by the identity provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Who is on the other end of a connection. Fixed for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub user_role: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, user_role: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_role: user_role.into(),
        }
    }

    /// Derive the identity from verified claims.
    ///
    /// The id comes from `sub`, else `id`; a missing role means `user`. Tokens
    /// without an id, or with a `:` in it, are rejected: the id is spliced into
    /// the `user:<id>:` session namespace.
    pub fn from_claims(claims: &Claims) -> Result<Self, AuthError> {
        let user_id = claims
            .sub
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(claims.id.as_deref())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::InvalidToken("token carries no user id".to_string()))?;
        if user_id.contains(':') {
            return Err(AuthError::InvalidToken(format!(
                "user id '{}' contains ':'",
                user_id
            )));
        }

        let user_role = claims
            .role
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("user")
            .to_string();
        Ok(Self {
            user_id: user_id.to_string(),
            user_role,
        })
    }

    /// Parsed role; unknown role strings are treated as a regular user.
    pub fn role(&self) -> Role {
        self.user_role.parse().unwrap_or_default()
    }

    pub fn is_admin(&self) -> bool {
        self.role() == Role::Admin
    }
}
