//! Worker registry: the authoritative table of workers and their health.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;

use mindgateway_common::{WorkerRegistration, WorkerStatus, WorkerStatusView};

use crate::config::HealthConfig;
use crate::error::GatewayError;
use crate::metrics::Metrics;

/// A registered worker.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: String,
    pub name: String,
    /// Base URL of the worker's OpenAI-compatible API.
    pub endpoint: String,
    pub models: BTreeSet<String>,
    /// Utilization in [0, 1] as last reported by the worker.
    pub load: f64,
    /// Sum of the load held by requests this gateway has in flight on the worker.
    pub in_flight_load: f64,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub unavailable_since: Option<Instant>,
}

impl Worker {
    fn from_registration(registration: WorkerRegistration) -> Self {
        let now = Utc::now();
        let name = if registration.name.is_empty() {
            registration.id.clone()
        } else {
            registration.name
        };
        Self {
            id: registration.id,
            name,
            endpoint: registration.endpoint.trim_end_matches('/').to_string(),
            models: registration.models.into_iter().collect(),
            load: registration.load.clamp(0.0, 1.0),
            in_flight_load: 0.0,
            status: WorkerStatus::Healthy,
            registered_at: now,
            last_seen: now,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unavailable_since: None,
        }
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    /// Load the router compares: reported plus in flight, capped at 1.
    pub fn routing_load(&self) -> f64 {
        (self.load + self.in_flight_load).min(1.0)
    }

    /// Routing-eligible: healthy and serving the model.
    pub fn is_eligible(&self, model: &str) -> bool {
        self.status == WorkerStatus::Healthy && self.serves(model)
    }

    /// Apply one health observation. Returns the transition, if any.
    fn observe(
        &mut self,
        ok: bool,
        thresholds: &HealthConfig,
        now: Instant,
    ) -> Option<(WorkerStatus, WorkerStatus)> {
        let before = self.status;

        if ok {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.last_seen = Utc::now();
            if self.status == WorkerStatus::Unavailable {
                // Restart the removal grace period.
                self.unavailable_since = Some(now);
            }
            if self.status != WorkerStatus::Healthy
                && self.consecutive_successes >= thresholds.recovery_successes
            {
                self.status = WorkerStatus::Healthy;
                self.unavailable_since = None;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= thresholds.unavailable_after {
                if self.status != WorkerStatus::Unavailable {
                    self.status = WorkerStatus::Unavailable;
                    self.unavailable_since = Some(now);
                }
            } else if self.consecutive_failures >= thresholds.degraded_after
                && self.status == WorkerStatus::Healthy
            {
                self.status = WorkerStatus::Degraded;
            }
        }

        (before != self.status).then_some((before, self.status))
    }

    pub fn view(&self) -> WorkerStatusView {
        WorkerStatusView {
            id: self.id.clone(),
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            models: self.models.iter().cloned().collect(),
            load: self.routing_load(),
            status: self.status,
            registered_at: self.registered_at,
            last_seen: self.last_seen,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Immutable, id-sorted copy of the registry.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    workers: Arc<[Worker]>,
    taken_at: Instant,
}

impl RegistrySnapshot {
    pub fn new(mut workers: Vec<Worker>, taken_at: Instant) -> Self {
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            workers: workers.into(),
            taken_at,
        }
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    /// Workers eligible to serve `model`, in id order.
    pub fn eligible<'a>(&'a self, model: &'a str) -> impl Iterator<Item = &'a Worker> + 'a {
        self.workers.iter().filter(move |w| w.is_eligible(model))
    }

    /// Models served by at least one healthy worker.
    pub fn healthy_models(&self) -> BTreeSet<String> {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Healthy)
            .flat_map(|w| w.models.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unavailable: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),
    #[error("Worker not found: {0}")]
    NotFound(String),
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidRegistration(msg) => GatewayError::InvalidInput(msg),
            RegistryError::NotFound(id) => GatewayError::NotFound(format!("worker {}", id)),
        }
    }
}

/// Registry of workers behind the gateway.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Worker>>,
    thresholds: HealthConfig,
    metrics: Metrics,
}

impl WorkerRegistry {
    pub fn new(thresholds: HealthConfig, metrics: Metrics) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            thresholds,
            metrics,
        }
    }

    /// Register a worker, replacing any previous entry with the same id.
    pub async fn register_worker(&self, registration: WorkerRegistration) -> Result<Worker, RegistryError> {
        if registration.id.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration("worker id is required".to_string()));
        }
        if !(registration.endpoint.starts_with("http://") || registration.endpoint.starts_with("https://")) {
            return Err(RegistryError::InvalidRegistration(format!(
                "endpoint must be an http(s) URL: {:?}",
                registration.endpoint
            )));
        }

        let worker = Worker::from_registration(registration);
        let mut workers = self.workers.write().await;
        let replaced = workers.insert(worker.id.clone(), worker.clone()).is_some();
        self.refresh_gauge(&workers);
        drop(workers);

        tracing::info!(
            worker_id = %worker.id,
            endpoint = %worker.endpoint,
            models = ?worker.models,
            replaced,
            "Worker registered"
        );
        Ok(worker)
    }

    pub async fn deregister_worker(&self, id: &str) -> Option<Worker> {
        let mut workers = self.workers.write().await;
        let removed = workers.remove(id);
        self.refresh_gauge(&workers);
        if removed.is_some() {
            tracing::info!(worker_id = %id, "Worker deregistered");
        }
        removed
    }

    /// Record a heartbeat: sets the absolute load and counts as a successful observation.
    pub async fn heartbeat(&self, id: &str, load: f64) -> Result<WorkerStatus, RegistryError> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        worker.load = load.clamp(0.0, 1.0);
        let transition = worker.observe(true, &self.thresholds, Instant::now());
        let status = worker.status;
        if transition.is_some() {
            self.refresh_gauge(&workers);
        }
        drop(workers);

        if let Some((from, to)) = transition {
            tracing::info!(worker_id = %id, %from, %to, "Worker status changed on heartbeat");
        }
        Ok(status)
    }

    /// Record the result of a health probe. Returns the worker's new status.
    pub async fn record_probe(&self, id: &str, ok: bool) -> Option<WorkerStatus> {
        self.record_probe_at(id, ok, Instant::now()).await
    }

    pub async fn record_probe_at(&self, id: &str, ok: bool, now: Instant) -> Option<WorkerStatus> {
        let mut workers = self.workers.write().await;
        let worker = workers.get_mut(id)?;
        let transition = worker.observe(ok, &self.thresholds, now);
        let status = worker.status;
        let failures = worker.consecutive_failures;
        if transition.is_some() {
            self.refresh_gauge(&workers);
        }
        drop(workers);

        match transition {
            Some((from, to)) if to == WorkerStatus::Healthy => {
                tracing::info!(worker_id = %id, %from, %to, "Worker recovered");
            }
            Some((from, to)) => {
                tracing::warn!(worker_id = %id, %from, %to, failures, "Worker health degraded");
            }
            None => {}
        }
        Some(status)
    }

    /// Adjust a worker's in-flight load by `delta`. Unknown ids are ignored.
    ///
    /// The counter itself is not clamped, so a `+delta`/`-delta` pair always
    /// nets to zero; only [`Worker::routing_load`] is capped.
    pub async fn update_load(&self, id: &str, delta: f64) {
        if let Some(worker) = self.workers.write().await.get_mut(id) {
            worker.in_flight_load += delta;
        }
    }

    pub async fn get(&self, id: &str) -> Option<Worker> {
        self.workers.read().await.get(id).cloned()
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let workers = self.workers.read().await;
        RegistrySnapshot::new(workers.values().cloned().collect(), Instant::now())
    }

    pub async fn counts(&self) -> WorkerCounts {
        Self::count(&*self.workers.read().await)
    }

    /// Remove workers that have been unavailable for longer than the grace period.
    pub async fn remove_expired(&self) -> Vec<String> {
        self.remove_expired_at(Instant::now()).await
    }

    pub async fn remove_expired_at(&self, now: Instant) -> Vec<String> {
        let grace = self.thresholds.removal_grace();
        let mut workers = self.workers.write().await;
        let expired: Vec<String> = workers
            .values()
            .filter(|w| {
                w.status == WorkerStatus::Unavailable
                    && w.unavailable_since
                        .is_some_and(|since| now.saturating_duration_since(since) >= grace)
            })
            .map(|w| w.id.clone())
            .collect();

        for id in &expired {
            workers.remove(id);
            tracing::info!(worker_id = %id, "Removed unavailable worker");
        }
        if !expired.is_empty() {
            self.refresh_gauge(&workers);
        }
        expired
    }

    fn count(workers: &HashMap<String, Worker>) -> WorkerCounts {
        workers.values().fold(WorkerCounts::default(), |mut counts, w| {
            match w.status {
                WorkerStatus::Healthy => counts.healthy += 1,
                WorkerStatus::Degraded => counts.degraded += 1,
                WorkerStatus::Unavailable => counts.unavailable += 1,
            }
            counts
        })
    }

    fn refresh_gauge(&self, workers: &HashMap<String, Worker>) {
        self.metrics
            .workers_active
            .set(Self::count(workers).healthy as i64);
    }
}
