//! Request-serving core of the gateway.
//!
//! This module provides:
//! - Worker registry with health tracking
//! - Routing engine over registry snapshots
//! - Priority queue, admission control and the dispatcher pool
//! - Periodic worker health probing

pub mod admission;
pub mod dispatcher;
pub mod health;
pub mod payload;
pub mod queue;
pub mod registry;
pub mod router;

pub use admission::AdmissionController;
pub use dispatcher::{DispatchSettings, Dispatcher, DispatcherPool, HttpWorkerClient, WorkerCallError, WorkerClient};
pub use health::{HealthChecker, HealthProbe, HttpProbe};
pub use payload::{DispatchOutcome, InferenceKind, InferenceOutput, InferencePayload};
pub use queue::{CancelOutcome, NewRequest, QueueStatus, RequestHandle, RequestId, RequestQueue};
pub use registry::{RegistryError, RegistrySnapshot, Worker, WorkerCounts, WorkerRegistry};
pub use router::{select_worker, LeastLoadedRouter, RoutingEngine};
