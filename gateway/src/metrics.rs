//! Prometheus metrics for the gateway.
//!
//! One [`Metrics`] instance owns its own registry and is shared by handle;
//! nothing is registered globally, so tests can build as many as they like.

use prometheus::{
    exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// End-to-end latency of inference requests.
    pub request_latency: HistogramVec,
    pub requests_total: IntCounterVec,
    /// Items currently held by the priority queue (including claimed ones).
    pub queue_depth: IntGauge,
    /// Workers currently eligible for routing.
    pub workers_active: IntGauge,
    pub tokens_total: IntCounterVec,
    pub dispatch_attempts: IntCounterVec,
    pub http_requests: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "mindgateway_request_latency_seconds",
                "Latency of inference requests in seconds",
            )
            .buckets(exponential_buckets(0.001, 2.0, 15)?),
            &["model", "endpoint", "status"],
        )?;

        let requests_total = IntCounterVec::new(
            Opts::new("mindgateway_requests_total", "Total number of inference requests"),
            &["model", "endpoint", "status"],
        )?;

        let queue_depth = IntGauge::new("mindgateway_queue_depth", "Current depth of the request queue")?;

        let workers_active = IntGauge::new(
            "mindgateway_workers_active",
            "Number of healthy workers eligible for routing",
        )?;

        let tokens_total = IntCounterVec::new(
            Opts::new("mindgateway_tokens_total", "Total number of tokens processed"),
            &["model", "type"],
        )?;

        let dispatch_attempts = IntCounterVec::new(
            Opts::new(
                "mindgateway_dispatch_attempts_total",
                "Dispatch attempts by outcome",
            ),
            &["outcome"],
        )?;

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )?;

        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(workers_active.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(dispatch_attempts.clone()))?;
        registry.register(Box::new(http_requests.clone()))?;

        Ok(Self {
            registry,
            request_latency,
            requests_total,
            queue_depth,
            workers_active,
            tokens_total,
            dispatch_attempts,
            http_requests,
        })
    }

    /// Record a finished inference request.
    pub fn observe_request(&self, model: &str, endpoint: &str, status: u16, seconds: f64) {
        let status = status.to_string();
        self.request_latency
            .with_label_values(&[model, endpoint, &status])
            .observe(seconds);
        self.requests_total
            .with_label_values(&[model, endpoint, &status])
            .inc();
    }

    pub fn record_tokens(&self, model: &str, input: u32, output: u32) {
        self.tokens_total
            .with_label_values(&[model, "input"])
            .inc_by(input as u64);
        self.tokens_total
            .with_label_values(&[model, "output"])
            .inc_by(output as u64);
    }

    pub fn record_dispatch(&self, outcome: &str) {
        self.dispatch_attempts.with_label_values(&[outcome]).inc();
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
