//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by mlp-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{Counter, CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all mlp-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of job submissions, retries included.
pub static JOBS_SUBMITTED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Finished job attempts, labeled by outcome (succeeded, retried, failed).
pub static JOB_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs that failed after exhausting their retries.
pub static JOBS_FAILED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Number of jobs currently being waited on.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Stage duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of completed iterations of the current run.
pub static ITERATIONS_COMPLETED: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again after a successful initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let jobs_submitted = Counter::new(
        "mlp_forge_jobs_submitted_total",
        "Total number of job submissions, retries included",
    )?;

    let job_attempts = CounterVec::new(
        Opts::new("mlp_forge_job_attempts_total", "Finished job attempts"),
        &["outcome"],
    )?;

    let jobs_failed = Counter::new(
        "mlp_forge_jobs_failed_total",
        "Jobs that failed after exhausting their retries",
    )?;

    let jobs_in_progress = Gauge::new(
        "mlp_forge_jobs_in_progress",
        "Number of jobs currently being waited on",
    )?;

    // Stages range from local bookkeeping to multi-day training runs.
    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "mlp_forge_stage_duration_seconds",
            "Stage duration in seconds",
        )
        .buckets(vec![1.0, 10.0, 60.0, 600.0, 3600.0, 21600.0, 86400.0]),
        &["stage"],
    )?;

    let iterations_completed = Gauge::new(
        "mlp_forge_iterations_completed",
        "Number of completed iterations",
    )?;

    registry.register(Box::new(jobs_submitted.clone()))?;
    registry.register(Box::new(job_attempts.clone()))?;
    registry.register(Box::new(jobs_failed.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(iterations_completed.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_SUBMITTED_TOTAL.set(jobs_submitted);
    let _ = JOB_ATTEMPTS_TOTAL.set(job_attempts);
    let _ = JOBS_FAILED_TOTAL.set(jobs_failed);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = ITERATIONS_COMPLETED.set(iterations_completed);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
