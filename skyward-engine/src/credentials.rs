//! Credential providers.
//!
//! The engine never acquires tokens itself; it asks a [`CredentialProvider`]
//! for an [`Authorizer`] right before each remote call.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Environment variable read by [`EnvironmentToken`].
pub const TOKEN_ENV: &str = "SKYWARD_ACCESS_TOKEN";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential not configured: {0}")]
    Missing(String),

    #[error("credential expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("credential provider failed: {0}")]
    Provider(String),
}

/// A usable bearer credential.
#[derive(Clone)]
pub struct Authorizer {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Authorizer {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorizer")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of authorizers.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn authorizer(&self) -> Result<Authorizer, CredentialError>;
}

/// Fixed token, typically injected for tests or short-lived jobs.
pub struct StaticToken {
    authorizer: Authorizer,
}

impl StaticToken {
    pub fn new(authorizer: Authorizer) -> Self {
        Self { authorizer }
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn authorizer(&self) -> Result<Authorizer, CredentialError> {
        if let Some(at) = self.authorizer.expires_at {
            if at <= Utc::now() {
                return Err(CredentialError::Expired(at));
            }
        }
        Ok(self.authorizer.clone())
    }
}

/// Reads the token from an environment variable on every call, so an
/// external refresher can rotate it.
pub struct EnvironmentToken {
    var: String,
}

impl EnvironmentToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvironmentToken {
    fn default() -> Self {
        Self::new(TOKEN_ENV)
    }
}

#[async_trait]
impl CredentialProvider for EnvironmentToken {
    async fn authorizer(&self) -> Result<Authorizer, CredentialError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(Authorizer::bearer(token.trim())),
            Ok(_) => Err(CredentialError::Missing(format!("{} is empty", self.var))),
            Err(_) => Err(CredentialError::Missing(format!("{} is not set", self.var))),
        }
    }
}
