//! Client for the external Auth Service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::GatewayError;

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
}

/// Outcome of a token validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid(AuthUser),
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingHeader,
    #[error("Invalid Authorization header format")]
    InvalidFormat,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    /// The Auth Service could not be reached or answered with an error.
    #[error("Auth service error: {0}")]
    Unavailable(String),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unavailable(msg) => GatewayError::AuthUnavailable(msg),
            other => GatewayError::Unauthorized(other.to_string()),
        }
    }
}

/// Token validation and role lookup.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<Verdict, AuthError>;
    async fn user_roles(&self, user_id: &str) -> Result<Vec<String>, AuthError>;
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RolesResponse {
    #[serde(default)]
    roles: Vec<String>,
}

/// Talks to the Auth Service over HTTP JSON.
pub struct HttpAuthClient {
    http_client: Client,
    base_url: String,
}

impl HttpAuthClient {
    pub fn new(config: &AuthConfig) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let http_client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http_client,
            base_url: config.address.trim_end_matches('/').to_string(),
        })
    }
}

fn unavailable(e: reqwest::Error) -> AuthError {
    AuthError::Unavailable(e.to_string())
}

#[async_trait]
impl AuthService for HttpAuthClient {
    async fn validate_token(&self, token: &str) -> Result<Verdict, AuthError> {
        let url = format!("{}/v1/tokens/validate", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&ValidateRequest { token })
            .send()
            .await
            .map_err(unavailable)?;

        // 401/403 carry a verdict; anything else non-2xx is a service failure.
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(Verdict::Invalid(format!("rejected with HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(AuthError::Unavailable(format!("HTTP {}", status.as_u16())));
        }

        let body: ValidateResponse = response.json().await.map_err(unavailable)?;
        match (body.valid, body.user_id) {
            (true, Some(user_id)) if !user_id.is_empty() => Ok(Verdict::Valid(AuthUser {
                user_id,
                email: body.email,
            })),
            (true, _) => Err(AuthError::Unavailable(
                "valid verdict without a user id".to_string(),
            )),
            (false, _) => Ok(Verdict::Invalid(
                body.reason.unwrap_or_else(|| "token rejected".to_string()),
            )),
        }
    }

    async fn user_roles(&self, user_id: &str) -> Result<Vec<String>, AuthError> {
        let url = format!("{}/v1/users/{}/roles", self.base_url, user_id);
        let response = self.http_client.get(&url).send().await.map_err(unavailable)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(AuthError::Unavailable(format!("HTTP {}", status.as_u16())));
        }

        let body: RolesResponse = response.json().await.map_err(unavailable)?;
        Ok(body.roles)
    }
}
