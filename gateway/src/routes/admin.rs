//! Admin API routes.
//!
//! Provides:
//! - Worker table with health state (`/admin/workers`)
//! - Queue status (`/admin/queue`)
//!
//! Every route requires a user holding `auth.admin_role`.

use std::sync::Arc;

use axum::{extract::State, middleware, routing::get, Json, Router};
use mindgateway_common::WorkerStatusView;
use serde::Serialize;

use crate::auth::require_admin;
use crate::gateway::{QueueStatus, WorkerCounts};
use crate::AppState;

/// Response for /admin/workers endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WorkersResponse {
    pub workers: Vec<WorkerStatusView>,
    pub counts: WorkerCounts,
    pub total: usize,
}

/// GET /admin/workers - List registered workers
async fn list_workers(State(state): State<Arc<AppState>>) -> Json<WorkersResponse> {
    let snapshot = state.registry.snapshot().await;
    let workers: Vec<WorkerStatusView> = snapshot.workers().iter().map(|w| w.view()).collect();
    let counts = state.registry.counts().await;
    let total = workers.len();
    Json(WorkersResponse {
        workers,
        counts,
        total,
    })
}

/// GET /admin/queue - Queue depth and composition
async fn queue_status(State(state): State<Arc<AppState>>) -> Json<QueueStatus> {
    Json(state.queue.status().await)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/workers", get(list_workers))
        .route("/queue", get(queue_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .with_state(state)
}
