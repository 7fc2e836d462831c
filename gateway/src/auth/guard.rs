//! Bearer-token authentication with a short-lived verdict cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::client::{AuthError, AuthService, AuthUser, Verdict};
use crate::config::AuthConfig;
use crate::error::GatewayError;
use crate::AppState;

/// Entries beyond this trigger a sweep of expired verdicts.
const CACHE_SWEEP_THRESHOLD: usize = 10_000;

struct CachedVerdict {
    user: AuthUser,
    expires_at: Instant,
}

/// Authenticates requests against the Auth Service.
///
/// Only positive verdicts are cached, keyed by the SHA-256 of the token.
/// Service failures are never cached and always fail closed.
pub struct AuthGateway {
    service: Arc<dyn AuthService>,
    cache: RwLock<HashMap<String, CachedVerdict>>,
    ttl: Duration,
    admin_role: String,
}

/// Extract the token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::InvalidFormat)?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidFormat)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::InvalidFormat);
    }
    Ok(token)
}

fn cache_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl AuthGateway {
    pub fn new(service: Arc<dyn AuthService>, config: &AuthConfig) -> Self {
        Self {
            service,
            cache: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(config.cache_ttl_secs),
            admin_role: config.admin_role.clone(),
        }
    }

    /// Authenticate a request by validating its Bearer token.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
        let token = bearer_token(headers)?;
        self.verify(token).await
    }

    pub async fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        self.verify_at(token, Instant::now()).await
    }

    /// Validate `token` as of `now`. A cached verdict is used only while `now` is before its expiry.
    pub async fn verify_at(&self, token: &str, now: Instant) -> Result<AuthUser, AuthError> {
        let key = cache_key(token);
        let caching = !self.ttl.is_zero();

        if caching {
            if let Some(entry) = self.cache.read().await.get(&key) {
                if now < entry.expires_at {
                    return Ok(entry.user.clone());
                }
            }
        }

        match self.service.validate_token(token).await? {
            Verdict::Valid(user) => {
                if caching {
                    let mut cache = self.cache.write().await;
                    if cache.len() >= CACHE_SWEEP_THRESHOLD {
                        cache.retain(|_, entry| entry.expires_at > now);
                    }
                    cache.insert(
                        key,
                        CachedVerdict {
                            user: user.clone(),
                            expires_at: now + self.ttl,
                        },
                    );
                }
                Ok(user)
            }
            Verdict::Invalid(reason) => {
                if caching {
                    self.cache.write().await.remove(&key);
                }
                Err(AuthError::InvalidToken(reason))
            }
        }
    }

    /// Require the admin role. Missing role is 403; a failed lookup is an internal error.
    pub async fn authorize_admin(&self, user: &AuthUser) -> Result<(), GatewayError> {
        let roles = self.service.user_roles(&user.user_id).await?;
        if roles.iter().any(|r| r == &self.admin_role) {
            Ok(())
        } else {
            Err(GatewayError::Forbidden(format!(
                "role '{}' required",
                self.admin_role
            )))
        }
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.read().await.len()
    }
}

/// Middleware that requires a valid Bearer token and exposes the [`AuthUser`] as an extension.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.auth.authenticate(request.headers()).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => {
            tracing::debug!(error = %e, "Authentication failed");
            GatewayError::from(e).into_response()
        }
    }
}

/// Middleware that requires an authenticated admin user.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let user = match state.auth.authenticate(request.headers()).await {
        Ok(user) => user,
        Err(e) => return GatewayError::from(e).into_response(),
    };
    if let Err(e) = state.auth.authorize_admin(&user).await {
        tracing::warn!(user_id = %user.user_id, error = %e, "Admin access denied");
        return e.into_response();
    }
    request.extensions_mut().insert(user);
    next.run(request).await
}
