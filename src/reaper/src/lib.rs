//! Retention-expiry reaper for the shared data catalog.
//!
//! A small fleet of worker loops periodically selects catalog entries whose
//! retention period has elapsed and removes them, cascading the removal to
//! dependent replication obligations. The fleet makes progress despite
//! inter-worker contention and transient backend lock conflicts:
//! - partition-aware candidate selection per worker shard
//! - per-worker contention quarantine with jittered backoff
//! - chunked cascading deletion with per-batch failure isolation
//! - cooperative lifecycle and shutdown control

pub mod classify;
pub mod cycle;
pub mod fleet;
pub mod gateway;
pub mod metrics;
pub mod quarantine;

// Re-export commonly used types
pub use classify::{ErrorClassifier, FailureKind, LockSignature};
pub use cycle::ReaperCycle;
pub use fleet::{FleetCoordinator, Liveness, StaticLiveness, WorkerAssignment};
pub use gateway::{DeletionGateway, GatewayError, WorkSource};
pub use metrics::{MetricsSummary, ReaperMetrics};
pub use quarantine::QuarantineLedger;
