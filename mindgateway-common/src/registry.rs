//! Worker registry protocol.
//!
//! Workers register themselves with the gateway over HTTP, then report their
//! load on a fixed heartbeat interval:
//!
//! 1. `POST /registry/workers` with a [`WorkerRegistration`]; the gateway
//!    answers with a [`RegistrationAck`].
//! 2. `POST /registry/workers/{id}/heartbeat` with a [`Heartbeat`].
//! 3. `DELETE /registry/workers/{id}` on orderly shutdown.
//!
//! All calls carry the shared registry token as `Authorization: Bearer`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registration data sent by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// Unique worker identifier.
    pub id: String,
    /// Human-readable worker name.
    #[serde(default)]
    pub name: String,
    /// Base URL of the worker's OpenAI-compatible API.
    pub endpoint: String,
    /// Models this worker serves.
    #[serde(default)]
    pub models: Vec<String>,
    /// Initial load in [0, 1].
    #[serde(default)]
    pub load: f64,
}

/// Periodic heartbeat with the worker's self-reported load.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Heartbeat {
    pub load: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationAck {
    pub worker_id: String,
    /// How often the gateway expects a heartbeat.
    pub heartbeat_interval_secs: u64,
}

/// Health state of a worker as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Eligible for routing.
    Healthy,
    /// Failing probes; not routed to.
    Degraded,
    /// Failing long enough to be removed after the grace period.
    Unavailable,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Healthy => "healthy",
            WorkerStatus::Degraded => "degraded",
            WorkerStatus::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a worker, as listed by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusView {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub models: Vec<String>,
    pub load: f64,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub consecutive_failures: u32,
}
