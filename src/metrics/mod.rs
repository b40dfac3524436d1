//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks job submission, retries and permanent failures, how long each
//! stage takes, and how many iterations have completed.
//!
//! # Example
//!
//! ```ignore
//! use mlp_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_stage("label", 12.5);
//!
//! std::fs::write("metrics.prom", export_metrics())?;
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{AttemptOutcome, InFlightJob, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ITERATIONS_COMPLETED, JOBS_FAILED_TOTAL, JOBS_IN_PROGRESS, JOBS_SUBMITTED_TOTAL,
    JOB_ATTEMPTS_TOTAL, REGISTRY, STAGE_DURATION,
};
