//! Routing engine: picks the worker that serves a request.

use std::sync::Arc;

use async_trait::async_trait;

use super::registry::{RegistrySnapshot, Worker, WorkerRegistry};
use crate::error::GatewayError;

/// Least-loaded eligible worker, ties broken by the lexically smallest id.
///
/// Only healthy workers that list `model` are considered. Linear in the
/// number of workers; never mutates anything.
pub fn select_worker<'a>(snapshot: &'a RegistrySnapshot, model: &'a str) -> Option<&'a Worker> {
    snapshot.eligible(model).min_by(|a, b| {
        a.routing_load()
            .total_cmp(&b.routing_load())
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Chooses a worker for a model.
#[async_trait]
pub trait RoutingEngine: Send + Sync {
    async fn route(&self, model: &str) -> Result<Worker, GatewayError>;
}

/// Routes over a fresh registry snapshot on every call.
pub struct LeastLoadedRouter {
    registry: Arc<WorkerRegistry>,
}

impl LeastLoadedRouter {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RoutingEngine for LeastLoadedRouter {
    async fn route(&self, model: &str) -> Result<Worker, GatewayError> {
        let snapshot = self.registry.snapshot().await;
        let worker = select_worker(&snapshot, model)
            .cloned()
            .ok_or_else(|| GatewayError::NoWorkersAvailable(model.to_string()))?;
        tracing::debug!(model, worker_id = %worker.id, load = worker.routing_load(), "Routed request");
        Ok(worker)
    }
}
