//! Error types for the gateway's HTTP surface.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors surfaced to API callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Queue is full ({capacity} requests)")]
    QueueFull { capacity: usize },

    #[error("No workers available for model {0}")]
    NoWorkersAvailable(String),

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Worker timed out: {0}")]
    WorkerTimeout(String),

    #[error("Worker request failed: {0}")]
    WorkerFailed(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Authentication service unavailable: {0}")]
    AuthUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// nginx's "client closed request"; not in the http crate's constant table.
const CLIENT_CLOSED_REQUEST: u16 = 499;

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited { .. } | GatewayError::QueueFull { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::NoWorkersAvailable(_) | GatewayError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Timeout(_) | GatewayError::WorkerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::WorkerFailed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Cancelled => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayError::AuthUnavailable(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidInput(_) => "invalid_request",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::QueueFull { .. } => "queue_full",
            GatewayError::NoWorkersAvailable(_) => "no_workers_available",
            GatewayError::ShuttingDown => "shutting_down",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::WorkerTimeout(_) => "worker_timeout",
            GatewayError::WorkerFailed(_) => "worker_failed",
            GatewayError::Cancelled => "cancelled",
            GatewayError::AuthUnavailable(_) => "auth_unavailable",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Whether a client may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. }
                | GatewayError::QueueFull { .. }
                | GatewayError::NoWorkersAvailable(_)
                | GatewayError::ShuttingDown
                | GatewayError::Timeout(_)
                | GatewayError::WorkerTimeout(_)
                | GatewayError::WorkerFailed(_)
                | GatewayError::AuthUnavailable(_)
        )
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some((*retry_after_secs).max(1)),
            GatewayError::QueueFull { .. } => Some(1),
            GatewayError::NoWorkersAvailable(_) => Some(5),
            GatewayError::ShuttingDown => Some(30),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the log; the caller gets a correlation id.
        let message = match &self {
            GatewayError::Internal(_) | GatewayError::AuthUnavailable(_) => {
                let correlation_id = uuid::Uuid::new_v4();
                tracing::error!(%correlation_id, error = %self, "Internal error");
                let summary = if matches!(self, GatewayError::AuthUnavailable(_)) {
                    "Internal authentication error"
                } else {
                    "Internal server error"
                };
                format!("{} (correlation id: {})", summary, correlation_id)
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": {
                "type": self.error_type(),
                "message": message,
                "retryable": self.is_retryable(),
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[rstest]
    #[case(GatewayError::InvalidInput("x".into()), 400)]
    #[case(GatewayError::Unauthorized("x".into()), 401)]
    #[case(GatewayError::Forbidden("x".into()), 403)]
    #[case(GatewayError::NotFound("x".into()), 404)]
    #[case(GatewayError::RateLimited { retry_after_secs: 2 }, 429)]
    #[case(GatewayError::QueueFull { capacity: 2 }, 429)]
    #[case(GatewayError::NoWorkersAvailable("m".into()), 503)]
    #[case(GatewayError::ShuttingDown, 503)]
    #[case(GatewayError::Timeout("x".into()), 504)]
    #[case(GatewayError::WorkerTimeout("x".into()), 504)]
    #[case(GatewayError::WorkerFailed("x".into()), 502)]
    #[case(GatewayError::Cancelled, 499)]
    #[case(GatewayError::AuthUnavailable("x".into()), 500)]
    #[case(GatewayError::Internal("x".into()), 500)]
    fn test_status_mapping(#[case] error: GatewayError, #[case] expected: u16) {
        assert_eq!(error.status_code().as_u16(), expected);
    }

    #[tokio::test]
    async fn test_queue_full_has_retry_after() {
        let response = GatewayError::QueueFull { capacity: 2 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");

        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "queue_full");
        assert_eq!(body["error"]["retryable"], true);
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let response = GatewayError::Internal("database password leaked".into()).into_response();
        let body = body_json(response).await;
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("correlation id"));
        assert!(!message.contains("password"));
    }

    #[tokio::test]
    async fn test_auth_unavailable_is_distinct_from_unauthorized() {
        let response = GatewayError::AuthUnavailable("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "auth_unavailable");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Internal authentication error"));
    }
}
