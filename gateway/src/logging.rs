use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::AppState;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Middleware that logs HTTP requests at INFO level and counts them.
///
/// Every response carries `X-Request-Id`: an inbound id is echoed, otherwise one is generated.
/// Handlers that set the header on the response (queued inference requests)
/// keep their own value, and that value is the one logged.
pub async fn request_logger(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(request).await;

    let status = response.status();
    let duration = start.elapsed();

    let request_id = match response.headers().get(&REQUEST_ID_HEADER) {
        Some(value) => value.to_str().unwrap_or_default().to_string(),
        None => {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            request_id
        }
    };

    state
        .metrics
        .http_requests
        .with_label_values(&[method.as_str(), &endpoint, status.as_str()])
        .inc();

    tracing::info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        request_id = %request_id,
        "HTTP request"
    );

    response
}
