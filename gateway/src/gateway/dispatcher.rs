//! Dispatchers drain the request queue and forward requests to workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::payload::{DispatchOutcome, InferenceKind, InferenceOutput, InferencePayload};
use super::queue::{ClaimedItem, DispatchResult, InFlight, RequestQueue};
use super::registry::{Worker, WorkerRegistry};
use super::router::RoutingEngine;
use crate::config::{DispatchConfig, WorkerConfig};
use crate::error::GatewayError;
use crate::metrics::Metrics;

/// Errors from a single worker call.
#[derive(Debug, thiserror::Error)]
pub enum WorkerCallError {
    #[error("Failed to connect to worker: {0}")]
    Connect(String),
    #[error("Worker did not answer in time")]
    Timeout,
    #[error("Worker returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid worker response: {0}")]
    InvalidResponse(String),
}

impl WorkerCallError {
    /// Connect errors, timeouts and 5xx responses may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerCallError::Connect(_) | WorkerCallError::Timeout => true,
            WorkerCallError::Status { status, .. } => *status >= 500,
            WorkerCallError::InvalidResponse(_) => false,
        }
    }
}

impl From<WorkerCallError> for GatewayError {
    fn from(err: WorkerCallError) -> Self {
        match err {
            WorkerCallError::Timeout => GatewayError::WorkerTimeout(err.to_string()),
            other => GatewayError::WorkerFailed(other.to_string()),
        }
    }
}

/// Performs inference calls against a worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn call(&self, worker: &Worker, payload: &InferencePayload) -> Result<InferenceOutput, WorkerCallError>;
}

/// Calls a worker's OpenAI-compatible HTTP API.
pub struct HttpWorkerClient {
    http_client: Client,
}

impl HttpWorkerClient {
    pub fn new(config: &WorkerConfig) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { http_client })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        worker: &Worker,
        payload: &InferencePayload,
    ) -> Result<T, WorkerCallError> {
        let url = format!("{}{}", worker.endpoint, payload.kind().path());
        tracing::debug!(worker_id = %worker.id, %url, "Forwarding request to worker");

        let response = self
            .http_client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkerCallError::Timeout
                } else {
                    WorkerCallError::Connect(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerCallError::Status { status, body });
        }

        response.json().await.map_err(|e| {
            if e.is_timeout() {
                WorkerCallError::Timeout
            } else {
                WorkerCallError::InvalidResponse(e.to_string())
            }
        })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn call(&self, worker: &Worker, payload: &InferencePayload) -> Result<InferenceOutput, WorkerCallError> {
        Ok(match payload.kind() {
            InferenceKind::Chat => InferenceOutput::Chat(self.post(worker, payload).await?),
            InferenceKind::Completion => InferenceOutput::Completion(self.post(worker, payload).await?),
            InferenceKind::Embedding => InferenceOutput::Embedding(self.post(worker, payload).await?),
        })
    }
}

/// Retry and load-accounting settings for dispatchers.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub load_per_request: f64,
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            load_per_request: config.load_per_request,
        }
    }
}

impl DispatchSettings {
    /// Exponential backoff with jitter for the given attempt (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.retry_backoff.saturating_mul(1u32 << exponent);
        let jitter_ms = (self.retry_backoff.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max_backoff)
    }
}

enum CallFailure {
    Worker(WorkerCallError),
    Cancelled,
}

/// Pulls requests from the queue and drives them to a worker.
pub struct Dispatcher {
    queue: Arc<RequestQueue>,
    router: Arc<dyn RoutingEngine>,
    client: Arc<dyn WorkerClient>,
    registry: Arc<WorkerRegistry>,
    settings: DispatchSettings,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<RequestQueue>,
        router: Arc<dyn RoutingEngine>,
        client: Arc<dyn WorkerClient>,
        registry: Arc<WorkerRegistry>,
        settings: DispatchSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            queue,
            router,
            client,
            registry,
            settings,
            metrics,
        }
    }

    /// Serve queue items until the queue shuts down.
    pub async fn run(self: Arc<Self>, index: usize) {
        tracing::debug!(dispatcher = index, "Dispatcher started");
        while let Some(item) = self.queue.claim_next().await {
            self.process(item).await;
        }
        tracing::debug!(dispatcher = index, "Dispatcher stopped");
    }

    fn past_deadline(item: &ClaimedItem) -> bool {
        item.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Route one claimed item: dispatch it, put it back with a backoff, or fail it.
    pub async fn process(&self, item: ClaimedItem) {
        let model = item.payload.model().to_string();
        match self.router.route(&model).await {
            Ok(worker) => {
                let Some(in_flight) = self.queue.take_for_dispatch(item.id).await else {
                    // Cancelled or shut down while we were routing.
                    return;
                };
                self.execute(item, worker, in_flight).await;
            }
            Err(err) => {
                self.metrics.record_dispatch("no_worker");
                let attempts = item.attempts + 1;
                if attempts >= self.settings.max_attempts {
                    tracing::warn!(request_id = %item.id, %model, attempts, "No worker found, giving up");
                    self.queue.fail(item.id, err).await;
                } else if Self::past_deadline(&item) {
                    self.queue
                        .fail(item.id, GatewayError::Timeout("deadline passed while waiting for a worker".to_string()))
                        .await;
                } else {
                    let backoff = self.settings.backoff(attempts);
                    tracing::debug!(request_id = %item.id, %model, attempts, ?backoff, "No worker found, requeueing");
                    self.queue.requeue(item.id, backoff).await;
                }
            }
        }
    }

    async fn execute(&self, item: ClaimedItem, first: Worker, in_flight: InFlight) {
        let InFlight { mut result_tx, cancel } = in_flight;
        let model = item.payload.model().to_string();
        let mut attempts = item.attempts;
        let mut next = Some(first);

        let result: DispatchResult = loop {
            let worker = match next.take() {
                Some(worker) => worker,
                None => match self.router.route(&model).await {
                    Ok(worker) => worker,
                    Err(err) => {
                        attempts += 1;
                        self.metrics.record_dispatch("no_worker");
                        if attempts >= self.settings.max_attempts || Self::past_deadline(&item) {
                            break Err(err);
                        }
                        if !self.pause(attempts, &cancel, &mut result_tx).await {
                            break Err(GatewayError::Cancelled);
                        }
                        continue;
                    }
                },
            };

            attempts += 1;
            match self.call_worker(&worker, &item.payload, &cancel, &mut result_tx).await {
                Ok(output) => {
                    self.metrics.record_dispatch("success");
                    tracing::debug!(request_id = %item.id, worker_id = %worker.id, attempts, "Request served");
                    break Ok(DispatchOutcome {
                        output,
                        worker_id: worker.id,
                        attempts,
                    });
                }
                Err(CallFailure::Cancelled) => {
                    self.metrics.record_dispatch("cancelled");
                    tracing::debug!(request_id = %item.id, worker_id = %worker.id, "Request cancelled in flight");
                    break Err(GatewayError::Cancelled);
                }
                Err(CallFailure::Worker(err)) => {
                    let retry = err.is_retryable()
                        && attempts < self.settings.max_attempts
                        && !Self::past_deadline(&item);
                    tracing::warn!(
                        request_id = %item.id,
                        worker_id = %worker.id,
                        attempt = attempts,
                        retry,
                        error = %err,
                        "Worker call failed"
                    );
                    if !retry {
                        self.metrics.record_dispatch("failed");
                        break Err(err.into());
                    }
                    self.metrics.record_dispatch("retry");
                    if !self.pause(attempts, &cancel, &mut result_tx).await {
                        break Err(GatewayError::Cancelled);
                    }
                }
            }
        };

        // The caller may have gone away.
        let _ = result_tx.send(result);
        self.queue.finish(item.id).await;
    }

    /// Wait out the retry backoff. Returns false if the request was cancelled meanwhile.
    async fn pause(
        &self,
        attempt: u32,
        cancel: &Notify,
        result_tx: &mut oneshot::Sender<DispatchResult>,
    ) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.backoff(attempt)) => true,
            _ = cancel.notified() => false,
            _ = result_tx.closed() => false,
        }
    }

    /// Call a worker, holding its load for the duration of the call.
    async fn call_worker(
        &self,
        worker: &Worker,
        payload: &InferencePayload,
        cancel: &Notify,
        result_tx: &mut oneshot::Sender<DispatchResult>,
    ) -> Result<InferenceOutput, CallFailure> {
        let delta = self.settings.load_per_request;
        self.registry.update_load(&worker.id, delta).await;

        let result = tokio::select! {
            result = self.client.call(worker, payload) => result.map_err(CallFailure::Worker),
            _ = cancel.notified() => Err(CallFailure::Cancelled),
            _ = result_tx.closed() => Err(CallFailure::Cancelled),
        };

        self.registry.update_load(&worker.id, -delta).await;
        result
    }
}

/// The running dispatcher tasks.
pub struct DispatcherPool {
    handles: Vec<JoinHandle<()>>,
}

impl DispatcherPool {
    pub fn spawn(dispatcher: Arc<Dispatcher>, count: usize) -> Self {
        let handles = (0..count)
            .map(|index| tokio::spawn(dispatcher.clone().run(index)))
            .collect();
        tracing::info!(count, "Dispatcher pool started");
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every dispatcher to exit. They exit once the queue is shut down.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Dispatcher task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::gateway::queue::{CancelOutcome, NewRequest, RequestHandle};
    use crate::gateway::router::LeastLoadedRouter;
    use crate::test_util::{chat_payload, registration, MockWorkerClient, WorkerBehavior};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        queue: Arc<RequestQueue>,
        registry: Arc<WorkerRegistry>,
        dispatcher: Arc<Dispatcher>,
        metrics: Metrics,
    }

    fn settings(max_attempts: u32) -> DispatchSettings {
        DispatchSettings {
            max_attempts,
            retry_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            load_per_request: 0.25,
        }
    }

    async fn harness(client: Arc<dyn WorkerClient>, max_attempts: u32) -> Harness {
        let metrics = Metrics::new().unwrap();
        let registry = Arc::new(WorkerRegistry::new(HealthConfig::default(), metrics.clone()));
        let queue = Arc::new(RequestQueue::new(10, metrics.clone()));
        let router: Arc<dyn RoutingEngine> = Arc::new(LeastLoadedRouter::new(registry.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            router,
            client,
            registry.clone(),
            settings(max_attempts),
            metrics.clone(),
        ));
        Harness {
            queue,
            registry,
            dispatcher,
            metrics,
        }
    }

    async fn submit(h: &Harness) -> RequestHandle {
        h.queue
            .enqueue(NewRequest {
                payload: chat_payload("m"),
                priority: 5,
                deadline: Some(Instant::now() + Duration::from_secs(5)),
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let s = DispatchSettings {
            max_attempts: 5,
            retry_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            load_per_request: 0.1,
        };
        let first = s.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let second = s.backoff(2);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(250));
        assert_eq!(s.backoff(10), Duration::from_millis(300));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(WorkerCallError::Timeout.is_retryable());
        assert!(WorkerCallError::Connect("refused".into()).is_retryable());
        assert!(WorkerCallError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!WorkerCallError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(matches!(
            GatewayError::from(WorkerCallError::Timeout),
            GatewayError::WorkerTimeout(_)
        ));
    }

    #[tokio::test]
    async fn test_dispatches_to_least_loaded_and_releases_load() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Succeed));
        let h = harness(client.clone(), 3).await;
        h.registry.register_worker(registration("W1", &["m"], 0.5)).await.unwrap();
        h.registry.register_worker(registration("W2", &["m"], 0.25)).await.unwrap();

        let handle = submit(&h).await;
        let item = h.queue.claim_next().await.unwrap();
        h.dispatcher.process(item).await;

        let outcome = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.worker_id, "W2");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(client.calls(), vec!["W2".to_string()]);
        assert_eq!(h.registry.get("W2").await.unwrap().routing_load(), 0.25);
        assert_eq!(h.queue.status().await.in_flight, 0);
    }

    #[tokio::test]
    async fn test_saturated_worker_load_survives_completed_request() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Succeed));
        let h = harness(client, 3).await;
        h.registry.register_worker(registration("W1", &["m"], 0.95)).await.unwrap();

        let handle = submit(&h).await;
        let item = h.queue.claim_next().await.unwrap();
        h.dispatcher.process(item).await;
        handle.wait(Duration::from_secs(1)).await.unwrap();

        let worker = h.registry.get("W1").await.unwrap();
        assert_eq!(worker.load, 0.95);
        assert_eq!(worker.routing_load(), 0.95);
    }

    #[tokio::test]
    async fn test_no_worker_requeues_then_fails() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Succeed));
        let h = harness(client, 2).await;
        let handle = submit(&h).await;

        let item = h.queue.claim_next().await.unwrap();
        h.dispatcher.process(item).await;
        assert_eq!(h.queue.len().await, 1);

        let item = h.queue.claim_next().await.unwrap();
        assert_eq!(item.attempts, 1);
        h.dispatcher.process(item).await;

        assert_eq!(
            handle.wait(Duration::from_secs(1)).await.unwrap_err(),
            GatewayError::NoWorkersAvailable("m".to_string())
        );
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_retryable_failure_retries_then_succeeds() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::FailTimes(1)));
        let h = harness(client.clone(), 3).await;
        h.registry.register_worker(registration("W1", &["m"], 0.0)).await.unwrap();

        let handle = submit(&h).await;
        let item = h.queue.claim_next().await.unwrap();
        h.dispatcher.process(item).await;

        let outcome = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(client.calls().len(), 2);
        let text = h.metrics.gather().unwrap();
        assert!(text.contains(r#"mindgateway_dispatch_attempts_total{outcome="retry"} 1"#));
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Reject(400)));
        let h = harness(client.clone(), 3).await;
        h.registry.register_worker(registration("W1", &["m"], 0.0)).await.unwrap();

        let handle = submit(&h).await;
        let item = h.queue.claim_next().await.unwrap();
        h.dispatcher.process(item).await;

        assert!(matches!(
            handle.wait(Duration::from_secs(1)).await,
            Err(GatewayError::WorkerFailed(_))
        ));
        assert_eq!(client.calls().len(), 1);
        assert_eq!(h.registry.get("W1").await.unwrap().routing_load(), 0.0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_call_and_releases_load() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Hang));
        let h = harness(client, 3).await;
        h.registry.register_worker(registration("W1", &["m"], 0.0)).await.unwrap();

        let handle = submit(&h).await;
        let id = handle.id;
        let item = h.queue.claim_next().await.unwrap();
        let task = {
            let dispatcher = h.dispatcher.clone();
            tokio::spawn(async move { dispatcher.process(item).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.registry.get("W1").await.unwrap().routing_load(), 0.25);
        assert_eq!(h.queue.cancel(id).await, CancelOutcome::Signalled);

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(
            handle.wait(Duration::from_secs(1)).await.unwrap_err(),
            GatewayError::Cancelled
        );
        assert_eq!(h.registry.get("W1").await.unwrap().routing_load(), 0.0);
    }

    #[tokio::test]
    async fn test_dropped_caller_aborts_in_flight_call() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Hang));
        let h = harness(client, 3).await;
        h.registry.register_worker(registration("W1", &["m"], 0.0)).await.unwrap();

        let handle = submit(&h).await;
        let item = h.queue.claim_next().await.unwrap();
        let task = {
            let dispatcher = h.dispatcher.clone();
            tokio::spawn(async move { dispatcher.process(item).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(h.registry.get("W1").await.unwrap().routing_load(), 0.0);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops_on_shutdown() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Succeed));
        let h = harness(client, 3).await;
        h.registry.register_worker(registration("W1", &["m"], 0.0)).await.unwrap();

        let pool = DispatcherPool::spawn(h.dispatcher.clone(), 3);
        assert_eq!(pool.len(), 3);

        let mut handles = Vec::new();
        for _ in 0..10 {
            handles.push(submit(&h).await);
        }
        for handle in handles {
            assert!(handle.wait(Duration::from_secs(2)).await.is_ok());
        }

        h.queue.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), pool.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_client_parses_worker_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 0,
                "model": "m",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
            })))
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new(&WorkerConfig::default()).unwrap();
        let mut reg = registration("W1", &["m"], 0.0);
        reg.endpoint = server.uri();
        let registry = WorkerRegistry::new(HealthConfig::default(), Metrics::new().unwrap());
        let worker = registry.register_worker(reg).await.unwrap();

        let output = client.call(&worker, &chat_payload("m")).await.unwrap();
        assert_eq!(output.usage().unwrap().total_tokens, 4);
    }

    #[tokio::test]
    async fn test_http_client_maps_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = HttpWorkerClient::new(&WorkerConfig::default()).unwrap();
        let mut reg = registration("W1", &["m"], 0.0);
        reg.endpoint = server.uri();
        let registry = WorkerRegistry::new(HealthConfig::default(), Metrics::new().unwrap());
        let worker = registry.register_worker(reg).await.unwrap();

        let payload = InferencePayload::Embedding(
            serde_json::from_value(serde_json::json!({"model": "m", "input": "text"})).unwrap(),
        );
        let err = client.call(&worker, &payload).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, WorkerCallError::Status { status: 503, .. }));
    }
}
