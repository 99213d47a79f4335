//! Authentication configuration.

use serde::{Deserialize, Serialize};

/// Environment variables consulted for the session secret, in precedence order.
pub const SECRET_ENV_VARS: [&str; 2] = ["AUTH_SECRET", "NEXTAUTH_SECRET"];

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Secret the session tokens are signed with.
    ///
    /// Supports `env:VAR_NAME`. When unset, `AUTH_SECRET` and then
    /// `NEXTAUTH_SECRET` are used. Without any secret every handshake is rejected.
    pub secret: Option<String>,
}

impl AuthConfig {
    /// Resolve the secret from config and the process environment.
    pub fn resolve_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        self.resolve_secret_with(|name| std::env::var(name).ok())
    }

    /// Resolve the secret using `lookup` for environment variables.
    pub fn resolve_secret_with<F>(&self, lookup: F) -> Result<Option<String>, ConfigValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = self.secret.as_deref() {
            if let Some(var_name) = value.strip_prefix("env:") {
                return match lookup(var_name) {
                    Some(secret) if !secret.is_empty() => Ok(Some(secret)),
                    Some(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
                    None => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
                };
            }
            if !value.is_empty() {
                return Ok(Some(value.to_string()));
            }
        }

        Ok(SECRET_ENV_VARS
            .iter()
            .find_map(|name| lookup(name).filter(|v| !v.is_empty())))
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// Environment variable not found (for `env:VAR_NAME` syntax).
    EnvVarNotFound(String),
    /// Environment variable is empty (for `env:VAR_NAME` syntax).
    EnvVarEmpty(String),
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnvVarNotFound(var) => {
                write!(
                    f,
                    "Environment variable '{}' not found (referenced via env:{} in config).",
                    var, var
                )
            }
            Self::EnvVarEmpty(var) => {
                write!(
                    f,
                    "Environment variable '{}' is empty (referenced via env:{} in config).",
                    var, var
                )
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}
