pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod routes;
pub mod test_util;

pub use auth::{AuthGateway, AuthService, AuthUser, HttpAuthClient};
pub use config::Config;
pub use error::GatewayError;
pub use gateway::{AdmissionController, RequestQueue, WorkerRegistry};
pub use metrics::Metrics;

use std::sync::Arc;

use axum::{middleware, Router};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub metrics: Metrics,
    /// Workers known to the gateway and their health.
    pub registry: Arc<WorkerRegistry>,
    /// Priority queue shared with the dispatcher pool.
    pub queue: Arc<RequestQueue>,
    pub admission: AdmissionController,
    pub auth: AuthGateway,
}

impl AppState {
    /// Wire the request-path components around an existing registry and queue.
    pub fn new(
        config: Config,
        metrics: Metrics,
        registry: Arc<WorkerRegistry>,
        queue: Arc<RequestQueue>,
        auth_service: Arc<dyn AuthService>,
    ) -> Self {
        let admission = AdmissionController::new(queue.clone(), &config.queue);
        let auth = AuthGateway::new(auth_service, &config.auth);
        Self {
            config,
            metrics,
            registry,
            queue,
            admission,
            auth,
        }
    }
}

/// Build the HTTP application without transport layers (CORS, tracing).
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::health::router(state.clone()))
        .merge(routes::inference::router(state.clone()))
        .merge(routes::models::router(state.clone()))
        .merge(routes::registry::router(state.clone()))
        .nest("/admin", routes::admin::router(state.clone()))
        .layer(middleware::from_fn_with_state(state, logging::request_logger))
}
