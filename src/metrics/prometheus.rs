//! Prometheus metrics registration and export.
//!
//! All metrics live in statics initialized once by [`init_metrics`].
//! Recording before initialization is a no-op.

use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all media_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Generation attempts, labeled by model and outcome.
pub static GENERATION_ATTEMPTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Attempt latency in seconds, labeled by model.
pub static ATTEMPT_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Attempts served by a fallback model, labeled by preferred and fallback model.
pub static FALLBACKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Resolved asset tasks, labeled by asset type and final status.
pub static TASKS_RESOLVED: OnceLock<IntCounterVec> = OnceLock::new();

/// Jobs accepted by the dispatcher.
pub static JOBS_SUBMITTED: OnceLock<IntCounter> = OnceLock::new();

/// Jobs that reached a terminal status, labeled by status.
pub static JOBS_FINISHED: OnceLock<IntCounterVec> = OnceLock::new();

/// Tasks waiting in the queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Workers currently executing a task.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// 1 when a model is usable, 0 otherwise.
pub static MODEL_AVAILABLE: OnceLock<GaugeVec> = OnceLock::new();

/// Progress events emitted to subscribers.
pub static PROGRESS_EVENTS: OnceLock<IntCounter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let generation_attempts = IntCounterVec::new(
        Opts::new(
            "media_forge_generation_attempts_total",
            "Generation attempts by model and outcome",
        ),
        &["model", "outcome"],
    )?;

    let attempt_latency = HistogramVec::new(
        HistogramOpts::new(
            "media_forge_attempt_latency_seconds",
            "Generation attempt latency in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model"],
    )?;

    let fallbacks_total = IntCounterVec::new(
        Opts::new(
            "media_forge_fallbacks_total",
            "Attempts served by a fallback model",
        ),
        &["preferred", "fallback"],
    )?;

    let tasks_resolved = IntCounterVec::new(
        Opts::new("media_forge_tasks_resolved_total", "Resolved asset tasks"),
        &["asset_type", "status"],
    )?;

    let jobs_submitted = IntCounter::new(
        "media_forge_jobs_submitted_total",
        "Jobs accepted by the dispatcher",
    )?;

    let jobs_finished = IntCounterVec::new(
        Opts::new(
            "media_forge_jobs_finished_total",
            "Jobs that reached a terminal status",
        ),
        &["status"],
    )?;

    let queue_depth = Gauge::new("media_forge_queue_depth", "Tasks waiting in the queue")?;

    let active_workers = Gauge::new(
        "media_forge_active_workers",
        "Workers currently executing a task",
    )?;

    let model_available = GaugeVec::new(
        Opts::new("media_forge_model_available", "Model usability (1 = usable)"),
        &["model"],
    )?;

    let progress_events = IntCounter::new(
        "media_forge_progress_events_total",
        "Progress events emitted to subscribers",
    )?;

    registry.register(Box::new(generation_attempts.clone()))?;
    registry.register(Box::new(attempt_latency.clone()))?;
    registry.register(Box::new(fallbacks_total.clone()))?;
    registry.register(Box::new(tasks_resolved.clone()))?;
    registry.register(Box::new(jobs_submitted.clone()))?;
    registry.register(Box::new(jobs_finished.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(model_available.clone()))?;
    registry.register(Box::new(progress_events.clone()))?;

    // If any of these fail, metrics were already initialized.
    let _ = REGISTRY.set(registry);
    let _ = GENERATION_ATTEMPTS.set(generation_attempts);
    let _ = ATTEMPT_LATENCY.set(attempt_latency);
    let _ = FALLBACKS_TOTAL.set(fallbacks_total);
    let _ = TASKS_RESOLVED.set(tasks_resolved);
    let _ = JOBS_SUBMITTED.set(jobs_submitted);
    let _ = JOBS_FINISHED.set(jobs_finished);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = MODEL_AVAILABLE.set(model_available);
    let _ = PROGRESS_EVENTS.set(progress_events);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
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
