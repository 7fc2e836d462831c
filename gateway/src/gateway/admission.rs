//! Admission control: validation, priority, deadline and rate limits.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::payload::InferencePayload;
use super::queue::{NewRequest, RequestHandle, RequestQueue};
use crate::config::QueueConfig;
use crate::error::GatewayError;

pub struct AdmissionController {
    queue: Arc<RequestQueue>,
    limiter: Option<Arc<DefaultKeyedRateLimiter<String>>>,
    default_priority: u8,
    max_priority: u8,
    max_wait: Duration,
}

impl AdmissionController {
    pub fn new(queue: Arc<RequestQueue>, config: &QueueConfig) -> Self {
        let limiter = NonZeroU32::new(config.rate_limit_per_second)
            .map(|rate| Arc::new(RateLimiter::keyed(Quota::per_second(rate))));
        Self {
            queue,
            limiter,
            default_priority: config.default_priority,
            max_priority: config.max_priority,
            max_wait: config.max_wait(),
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Validate and enqueue a request on behalf of `user`.
    ///
    /// `priority` defaults to the configured default; `timeout` is capped at
    /// the configured maximum wait and becomes the item's deadline.
    pub async fn enqueue(
        &self,
        payload: InferencePayload,
        priority: Option<i64>,
        timeout: Option<Duration>,
        user: &str,
    ) -> Result<RequestHandle, GatewayError> {
        let priority = self.resolve_priority(priority)?;
        let timeout = match timeout {
            Some(t) if t.is_zero() => {
                return Err(GatewayError::InvalidInput("request timeout must be positive".to_string()))
            }
            Some(t) => t.min(self.max_wait),
            None => self.max_wait,
        };
        payload.validate()?;
        // A request that cannot fit must not spend the caller's quota.
        // The enqueue below still re-checks capacity atomically.
        if self.queue.len().await >= self.queue.capacity() {
            let capacity = self.queue.capacity();
            tracing::warn!(%capacity, user, "Request rejected, queue full");
            return Err(GatewayError::QueueFull { capacity });
        }
        self.check_rate(user)?;

        let model = payload.model().to_string();
        let handle = self
            .queue
            .enqueue(NewRequest {
                payload,
                priority,
                deadline: Some(Instant::now() + timeout),
            })
            .await
            .inspect_err(|e| tracing::warn!(%model, user, error = %e, "Request rejected"))?;

        tracing::debug!(request_id = %handle.id, %model, priority, user, "Request admitted");
        Ok(handle)
    }

    fn resolve_priority(&self, priority: Option<i64>) -> Result<u8, GatewayError> {
        match priority {
            None => Ok(self.default_priority),
            Some(p) if (0..=self.max_priority as i64).contains(&p) => Ok(p as u8),
            Some(p) => Err(GatewayError::InvalidInput(format!(
                "priority {} is outside 0..={}",
                p, self.max_priority
            ))),
        }
    }

    /// Users with live rate-limit state.
    pub fn rate_limited_users(&self) -> usize {
        self.limiter.as_ref().map_or(0, |l| l.len())
    }

    /// Drop rate-limit state for users whose quota has fully replenished.
    pub fn prune_rate_limits(&self) {
        if let Some(limiter) = &self.limiter {
            prune(limiter);
        }
    }

    /// Periodically prune rate-limit state until shutdown.
    pub fn spawn_limiter_pruner(&self, period: Duration, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let limiter = self.limiter.clone()?;
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => prune(&limiter),
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Rate limiter pruner stopped");
        }))
    }

    fn check_rate(&self, user: &str) -> Result<(), GatewayError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        limiter.check_key(&user.to_string()).map_err(|not_until| {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            tracing::debug!(user, ?wait, "Rate limit exceeded");
            GatewayError::RateLimited {
                retry_after_secs: wait.as_secs_f64().ceil() as u64,
            }
        })
    }
}

fn prune(limiter: &DefaultKeyedRateLimiter<String>) {
    limiter.retain_recent();
    limiter.shrink_to_fit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::test_util::chat_payload;
    use rstest::rstest;

    fn controller(capacity: usize, rate: u32) -> AdmissionController {
        let queue = Arc::new(RequestQueue::new(capacity, Metrics::new().unwrap()));
        let config = QueueConfig {
            max_size: capacity,
            rate_limit_per_second: rate,
            ..QueueConfig::default()
        };
        AdmissionController::new(queue, &config)
    }

    #[rstest]
    #[case(Some(-1))]
    #[case(Some(10))]
    #[case(Some(1000))]
    #[tokio::test]
    async fn test_priority_out_of_range(#[case] priority: Option<i64>) {
        let admission = controller(10, 0);
        let err = admission
            .enqueue(chat_payload("m"), priority, None, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[rstest]
    #[case(None)]
    #[case(Some(0))]
    #[case(Some(9))]
    #[tokio::test]
    async fn test_priority_in_range(#[case] priority: Option<i64>) {
        let admission = controller(10, 0);
        assert!(admission
            .enqueue(chat_payload("m"), priority, None, "alice")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected_before_enqueue() {
        let admission = controller(10, 0);
        let err = admission
            .enqueue(chat_payload(""), None, None, "alice")
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::InvalidInput("model is required".to_string()));
        assert!(admission.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected() {
        let admission = controller(10, 0);
        let err = admission
            .enqueue(chat_payload("m"), None, Some(Duration::ZERO), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_queue_full() {
        let admission = controller(2, 0);
        let _a = admission.enqueue(chat_payload("m"), None, None, "alice").await.unwrap();
        let _b = admission.enqueue(chat_payload("m"), None, None, "alice").await.unwrap();
        assert_eq!(
            admission
                .enqueue(chat_payload("m"), None, None, "alice")
                .await
                .unwrap_err(),
            GatewayError::QueueFull { capacity: 2 }
        );
    }

    #[tokio::test]
    async fn test_rate_limit_is_per_user() {
        let admission = controller(10, 1);
        let _a = admission.enqueue(chat_payload("m"), None, None, "alice").await.unwrap();
        let err = admission
            .enqueue(chat_payload("m"), None, None, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));

        let _b = admission.enqueue(chat_payload("m"), None, None, "bob").await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_does_not_spend_rate_quota() {
        let admission = controller(1, 1);
        let a = admission.enqueue(chat_payload("m"), None, None, "alice").await.unwrap();

        assert_eq!(
            admission
                .enqueue(chat_payload("m"), None, None, "bob")
                .await
                .unwrap_err(),
            GatewayError::QueueFull { capacity: 1 }
        );

        admission.queue.cancel(a.id).await;
        assert!(admission
            .enqueue(chat_payload("m"), None, None, "bob")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_prune_drops_replenished_users() {
        let admission = controller(10, 20);
        let _a = admission.enqueue(chat_payload("m"), None, None, "alice").await.unwrap();
        let _b = admission.enqueue(chat_payload("m"), None, None, "bob").await.unwrap();
        assert_eq!(admission.rate_limited_users(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        admission.prune_rate_limits();
        assert_eq!(admission.rate_limited_users(), 0);
    }

    #[tokio::test]
    async fn test_limiter_pruner_stops_on_shutdown() {
        let admission = controller(10, 20);
        let (tx, rx) = watch::channel(false);
        let task = admission
            .spawn_limiter_pruner(Duration::from_millis(10), rx)
            .unwrap();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        assert!(controller(10, 0)
            .spawn_limiter_pruner(Duration::from_millis(10), watch::channel(false).1)
            .is_none());
    }
}
