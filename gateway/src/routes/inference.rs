//! OpenAI-compatible inference endpoints.
//!
//! Requests are admitted into the priority queue and answered once a
//! dispatcher has a worker's result. Optional headers:
//! - `X-Priority`: 0 (most urgent) to `queue.max_priority`
//! - `X-Request-Timeout-Ms`: queueing deadline, capped at `queue.max_wait_ms`

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use mindgateway_common::{ChatCompletionRequest, CompletionRequest, EmbeddingRequest};

use crate::auth::{require_auth, AuthUser};
use crate::error::GatewayError;
use crate::gateway::{CancelOutcome, DispatchOutcome, InferenceKind, InferencePayload, RequestId};
use crate::logging::REQUEST_ID_HEADER;
use crate::AppState;

pub const PRIORITY_HEADER: HeaderName = HeaderName::from_static("x-priority");
pub const TIMEOUT_HEADER: HeaderName = HeaderName::from_static("x-request-timeout-ms");
pub const WORKER_ID_HEADER: HeaderName = HeaderName::from_static("x-worker-id");

fn parse_header<T: FromStr>(headers: &HeaderMap, name: &HeaderName) -> Result<Option<T>, GatewayError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| GatewayError::InvalidInput(format!("invalid {} header", name)))
}

fn with_header(mut response: Response, name: HeaderName, value: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
    response
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, GatewayError> {
    body.map(|Json(value)| value)
        .map_err(|e| GatewayError::InvalidInput(e.body_text()))
}

/// POST /v1/chat/completions
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    match json_body(body) {
        Ok(request) => submit(&state, &user, &headers, InferencePayload::Chat(request)).await,
        Err(e) => rejected(&state, InferenceKind::Chat, e),
    }
}

/// POST /v1/completions
async fn completions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    body: Result<Json<CompletionRequest>, JsonRejection>,
) -> Response {
    match json_body(body) {
        Ok(request) => submit(&state, &user, &headers, InferencePayload::Completion(request)).await,
        Err(e) => rejected(&state, InferenceKind::Completion, e),
    }
}

/// POST /v1/embeddings
async fn embeddings(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    body: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Response {
    match json_body(body) {
        Ok(request) => submit(&state, &user, &headers, InferencePayload::Embedding(request)).await,
        Err(e) => rejected(&state, InferenceKind::Embedding, e),
    }
}

fn rejected(state: &AppState, kind: InferenceKind, error: GatewayError) -> Response {
    state
        .metrics
        .observe_request("unknown", kind.path(), error.status_code().as_u16(), 0.0);
    error.into_response()
}

/// Admit, wait for the dispatcher's answer, and record the outcome.
async fn submit(state: &AppState, user: &AuthUser, headers: &HeaderMap, payload: InferencePayload) -> Response {
    let start = Instant::now();
    let kind = payload.kind();
    let model = payload.model().to_string();

    let (request_id, result) = dispatch(state, user, headers, payload).await;
    let elapsed = start.elapsed().as_secs_f64();

    let response = match result {
        Ok(outcome) => {
            state.metrics.observe_request(&model, kind.path(), 200, elapsed);
            if let Some(usage) = outcome.output.usage() {
                state
                    .metrics
                    .record_tokens(&model, usage.prompt_tokens, usage.completion_tokens);
            }
            with_header(Json(outcome.output).into_response(), WORKER_ID_HEADER, &outcome.worker_id)
        }
        Err(e) => {
            state
                .metrics
                .observe_request(&model, kind.path(), e.status_code().as_u16(), elapsed);
            e.into_response()
        }
    };

    match request_id {
        Some(id) => with_header(response, REQUEST_ID_HEADER, &id.to_string()),
        None => response,
    }
}

/// The request id is known once the request has been admitted.
async fn dispatch(
    state: &AppState,
    user: &AuthUser,
    headers: &HeaderMap,
    payload: InferencePayload,
) -> (Option<RequestId>, Result<DispatchOutcome, GatewayError>) {
    let priority = match parse_header::<i64>(headers, &PRIORITY_HEADER) {
        Ok(p) => p,
        Err(e) => return (None, Err(e)),
    };
    let timeout = match parse_header::<u64>(headers, &TIMEOUT_HEADER) {
        Ok(t) => t.map(Duration::from_millis),
        Err(e) => return (None, Err(e)),
    };
    let model = payload.model().to_string();

    let handle = match state
        .admission
        .enqueue(payload, priority, timeout, &user.user_id)
        .await
    {
        Ok(handle) => handle,
        Err(e) => return (None, Err(e)),
    };
    let id = handle.id;

    // The queue enforces the deadline; the extra worker timeout covers a call already in flight.
    let max_wait = state.admission.max_wait();
    let wait = timeout.map_or(max_wait, |t| t.min(max_wait)) + state.config.worker.request_timeout();

    let result = handle.wait(wait).await;
    match &result {
        Ok(outcome) => tracing::info!(
            request_id = %id,
            %model,
            worker_id = %outcome.worker_id,
            attempts = outcome.attempts,
            "Request completed"
        ),
        Err(e) => {
            if matches!(e, GatewayError::Timeout(_)) {
                let cancelled = state.queue.cancel(id).await;
                if cancelled != CancelOutcome::NotFound {
                    tracing::warn!(request_id = %id, %model, ?cancelled, "Request timed out, cancelled");
                }
            }
            tracing::info!(request_id = %id, %model, error = %e, "Request failed");
        }
    }
    (Some(id), result)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_parse_header() {
        let h = headers(&[("x-priority", "3"), ("x-request-timeout-ms", "abc")]);
        assert_eq!(parse_header::<i64>(&h, &PRIORITY_HEADER).unwrap(), Some(3));
        assert!(matches!(
            parse_header::<u64>(&h, &TIMEOUT_HEADER),
            Err(GatewayError::InvalidInput(_))
        ));
        assert_eq!(parse_header::<i64>(&HeaderMap::new(), &PRIORITY_HEADER).unwrap(), None);
    }

    #[test]
    fn test_negative_priority_parses_for_admission_to_reject() {
        let h = headers(&[("x-priority", "-1")]);
        assert_eq!(parse_header::<i64>(&h, &PRIORITY_HEADER).unwrap(), Some(-1));
    }
}
