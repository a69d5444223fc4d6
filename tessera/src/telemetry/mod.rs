//! Pipeline telemetry.
//!
//! Lock-free atomic counters recorded by the pipeline stages, read out as a
//! point-in-time snapshot.
//!
//! # Architecture
//!
//! ```text
//! Pipeline stages ─────► PipelineMetrics ─────► TelemetrySnapshot ─────► CLI, logs
//!                        (atomic counters)      (point-in-time copy)
//! ```
//!
//! # Example
//!
//! ```
//! use tessera::telemetry::PipelineMetrics;
//!
//! let metrics = PipelineMetrics::new();
//! metrics.request_submitted();
//! metrics.memory_cache_miss();
//! metrics.load_task_created();
//! metrics.request_completed();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.requests_completed, 1);
//! assert_eq!(snapshot.load_tasks_created, 1);
//! ```

mod metrics;
mod snapshot;

pub use metrics::PipelineMetrics;
pub use snapshot::TelemetrySnapshot;
