//! Gateway configuration.

use config::{Config as ConfigLoader, Environment, File};
use mindgateway_common::WorkerRegistration;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub worker: WorkerConfig,
    pub health: HealthConfig,
    pub auth: AuthConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Time allowed for background tasks to stop after the listener closes.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Priority queue and dispatcher pool settings.
///
/// Priorities run from 0 (most urgent) to `max_priority`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    pub default_priority: u8,
    pub max_priority: u8,
    /// Period of the expired-item sweep.
    pub processing_period_ms: u64,
    /// Number of dispatcher tasks draining the queue.
    pub dispatchers: usize,
    /// Deadline applied when the caller does not send one.
    pub max_wait_ms: u64,
    /// Per-user admissions per second (0 = unlimited).
    pub rate_limit_per_second: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            default_priority: 5,
            max_priority: 9,
            processing_period_ms: 100,
            dispatchers: 4,
            max_wait_ms: 30_000,
            rate_limit_per_second: 0,
        }
    }
}

impl QueueConfig {
    pub fn processing_period(&self) -> Duration {
        Duration::from_millis(self.processing_period_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Routing plus worker-call attempts allowed per request.
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Load added to a worker while it serves one request.
    pub load_per_request: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 100,
            max_backoff_ms: 2_000,
            load_per_request: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_secs: u64,
    pub health_check_period_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_secs: 60,
            health_check_period_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_period_secs)
    }
}

/// Worker health state machine thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before a healthy worker is degraded.
    pub degraded_after: u32,
    /// Consecutive failures before a worker is unavailable.
    pub unavailable_after: u32,
    /// Consecutive successes that restore a worker to healthy.
    pub recovery_successes: u32,
    /// How long an unavailable worker is kept before removal.
    pub removal_grace_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: 2,
            unavailable_after: 5,
            recovery_successes: 2,
            removal_grace_secs: 300,
        }
    }
}

impl HealthConfig {
    pub fn removal_grace(&self) -> Duration {
        Duration::from_secs(self.removal_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base URL of the external Auth Service.
    pub address: String,
    pub timeout_ms: u64,
    /// Lifetime of cached positive verdicts (0 disables the cache).
    pub cache_ttl_secs: u64,
    /// Role required for the admin API.
    pub admin_role: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:9091".to_string(),
            timeout_ms: 2_000,
            cache_ttl_secs: 30,
            admin_role: "admin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Shared token workers present when registering.
    pub auth_token: String,
    pub heartbeat_interval_secs: u64,
    /// Workers registered at startup.
    pub static_workers: Vec<WorkerRegistration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            heartbeat_interval_secs: 10,
            static_workers: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (MINDGATEWAY__SECTION__KEY format)
    /// 2. `{CONFIG_PATH}/{ENVIRONMENT}.{yaml,toml,json}` (if present;
    ///    defaults `configs` and `dev`)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let dir = env::var("CONFIG_PATH").unwrap_or_else(|_| "configs".to_string());
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let base: PathBuf = Path::new(&dir).join(environment);

        let config: Config = ConfigLoader::builder()
            .add_source(File::with_name(&base.to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix("MINDGATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a single file, without environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = ConfigLoader::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.queue.max_size == 0 {
            return invalid("queue.max_size must be at least 1");
        }
        if self.queue.default_priority > self.queue.max_priority {
            return invalid("queue.default_priority must not exceed queue.max_priority");
        }
        if self.queue.dispatchers == 0 {
            return invalid("queue.dispatchers must be at least 1");
        }
        if self.queue.processing_period_ms == 0 {
            return invalid("queue.processing_period_ms must be positive");
        }
        if self.queue.max_wait_ms == 0 {
            return invalid("queue.max_wait_ms must be positive");
        }
        if self.dispatch.max_attempts == 0 {
            return invalid("dispatch.max_attempts must be at least 1");
        }
        if self.dispatch.retry_backoff_ms > self.dispatch.max_backoff_ms {
            return invalid("dispatch.retry_backoff_ms must not exceed dispatch.max_backoff_ms");
        }
        if !(self.dispatch.load_per_request > 0.0 && self.dispatch.load_per_request <= 1.0) {
            return invalid("dispatch.load_per_request must be in (0, 1]");
        }
        if self.worker.request_timeout_secs == 0 || self.worker.connect_timeout_ms == 0 {
            return invalid("worker timeouts must be positive");
        }
        if self.worker.health_check_period_secs == 0 {
            return invalid("worker.health_check_period_secs must be positive");
        }
        if self.health.degraded_after == 0 || self.health.recovery_successes == 0 {
            return invalid("health thresholds must be at least 1");
        }
        if self.health.unavailable_after <= self.health.degraded_after {
            return invalid("health.unavailable_after must exceed health.degraded_after");
        }
        if self.auth.address.is_empty() {
            return invalid("auth.address is required");
        }
        if self.auth.admin_role.is_empty() {
            return invalid("auth.admin_role is required");
        }

        let mut seen = HashSet::new();
        for worker in &self.registry.static_workers {
            if worker.id.is_empty() || worker.endpoint.is_empty() {
                return invalid("registry.static_workers entries need an id and an endpoint");
            }
            if !seen.insert(worker.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate static worker id: {}",
                    worker.id
                )));
            }
        }

        Ok(())
    }
}
