//! Periodic worker health probing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::registry::{Worker, WorkerRegistry};

/// Checks whether a worker is alive.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, worker: &Worker) -> bool;
}

/// Probes `GET {endpoint}/health`; any 2xx answer counts as healthy.
pub struct HttpProbe {
    http_client: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, worker: &Worker) -> bool {
        let url = format!("{}/health", worker.endpoint);
        match self.http_client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(worker_id = %worker.id, "Health probe failed: {}", e);
                false
            }
        }
    }
}

/// Probes every registered worker on a fixed period and feeds the results to the registry.
pub struct HealthChecker {
    registry: Arc<WorkerRegistry>,
    probe: Arc<dyn HealthProbe>,
    period: Duration,
}

impl HealthChecker {
    pub fn new(registry: Arc<WorkerRegistry>, probe: Arc<dyn HealthProbe>, period: Duration) -> Self {
        Self {
            registry,
            probe,
            period,
        }
    }

    /// Probe all workers concurrently, then drop the ones past their grace period.
    pub async fn check_all(&self) {
        let snapshot = self.registry.snapshot().await;
        let results = join_all(snapshot.workers().iter().map(|worker| async move {
            (worker.id.as_str(), self.probe.probe(worker).await)
        }))
        .await;

        for (id, ok) in results {
            self.registry.record_probe(id, ok).await;
        }

        let removed = self.registry.remove_expired().await;
        if !removed.is_empty() {
            tracing::info!(?removed, "Removed workers after grace period");
        }
    }

    /// Run [`Self::check_all`] every period until `shutdown` fires.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.check_all().await,
                    _ = shutdown.changed() => break,
                }
            }
            tracing::info!("Health checker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::metrics::Metrics;
    use crate::test_util::{registration, StaticProbe};
    use mindgateway_common::WorkerStatus;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry() -> Arc<WorkerRegistry> {
        Arc::new(WorkerRegistry::new(
            HealthConfig {
                degraded_after: 1,
                unavailable_after: 2,
                recovery_successes: 1,
                removal_grace_secs: 0,
            },
            Metrics::new().unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_check_all_records_each_result() {
        let registry = registry();
        registry.register_worker(registration("up", &["m"], 0.0)).await.unwrap();
        registry.register_worker(registration("down", &["m"], 0.0)).await.unwrap();

        let probe = Arc::new(StaticProbe::new(&["down"]));
        let checker = HealthChecker::new(registry.clone(), probe, Duration::from_secs(30));

        checker.check_all().await;
        assert_eq!(registry.get("up").await.unwrap().status, WorkerStatus::Healthy);
        assert_eq!(registry.get("down").await.unwrap().status, WorkerStatus::Degraded);

        // Second failure makes it unavailable; a zero grace period removes it on the same pass.
        checker.check_all().await;
        assert!(registry.get("down").await.is_none());
        assert!(registry.get("up").await.is_some());
    }

    #[tokio::test]
    async fn test_spawned_checker_stops_on_shutdown() {
        let registry = registry();
        let probe = Arc::new(StaticProbe::new(&[]));
        let (tx, rx) = watch::channel(false);
        let handle = HealthChecker::new(registry, probe, Duration::from_millis(10)).spawn(rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})))
            .mount(&server)
            .await;

        let registry = registry();
        let mut reg = registration("w1", &["m"], 0.0);
        reg.endpoint = server.uri();
        let healthy = registry.register_worker(reg).await.unwrap();

        let mut reg = registration("w2", &["m"], 0.0);
        reg.endpoint = "http://127.0.0.1:1".to_string();
        let unreachable = registry.register_worker(reg).await.unwrap();

        let probe = HttpProbe::new(Duration::from_millis(500)).unwrap();
        assert!(probe.probe(&healthy).await);
        assert!(!probe.probe(&unreachable).await);
    }
}
