//! Worker registration endpoints.
//!
//! Workers authenticate with the shared `registry.auth_token`. When no token
//! is configured, dynamic registration is disabled and only
//! `registry.static_workers` are served.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, post},
    Json, Router,
};
use mindgateway_common::{Heartbeat, RegistrationAck, WorkerRegistration, WorkerStatus};
use serde::Serialize;

use crate::auth::bearer_token;
use crate::error::GatewayError;
use crate::AppState;

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    status: WorkerStatus,
}

/// Middleware that checks the shared registry token.
async fn require_registry_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let expected = &state.config.registry.auth_token;
    if expected.is_empty() {
        return GatewayError::Forbidden("worker registration is disabled".to_string()).into_response();
    }
    match bearer_token(request.headers()) {
        Ok(token) if token == expected => next.run(request).await,
        Ok(_) => GatewayError::Unauthorized("invalid registry token".to_string()).into_response(),
        Err(e) => GatewayError::Unauthorized(e.to_string()).into_response(),
    }
}

/// POST /registry/workers
async fn register(
    State(state): State<Arc<AppState>>,
    body: Result<Json<WorkerRegistration>, JsonRejection>,
) -> Result<(StatusCode, Json<RegistrationAck>), GatewayError> {
    let Json(registration) = body.map_err(|e| GatewayError::InvalidInput(e.body_text()))?;
    let worker = state.registry.register_worker(registration).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegistrationAck {
            worker_id: worker.id,
            heartbeat_interval_secs: state.config.registry.heartbeat_interval_secs,
        }),
    ))
}

/// POST /registry/workers/:id/heartbeat
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<Heartbeat>, JsonRejection>,
) -> Result<Json<HeartbeatResponse>, GatewayError> {
    let Json(heartbeat) = body.map_err(|e| GatewayError::InvalidInput(e.body_text()))?;
    if !heartbeat.load.is_finite() {
        return Err(GatewayError::InvalidInput("load must be a finite number".to_string()));
    }
    let status = state.registry.heartbeat(&id, heartbeat.load).await?;
    Ok(Json(HeartbeatResponse { status }))
}

/// DELETE /registry/workers/:id
async fn deregister(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    state
        .registry
        .deregister_worker(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| GatewayError::NotFound(format!("worker {}", id)))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/registry/workers", post(register))
        .route("/registry/workers/:id", delete(deregister))
        .route("/registry/workers/:id/heartbeat", post(heartbeat))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_registry_token))
        .with_state(state)
}
