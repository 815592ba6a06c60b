//! Recording helpers over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_WORKERS, ATTEMPT_LATENCY, FALLBACKS_TOTAL, GENERATION_ATTEMPTS, JOBS_FINISHED,
    JOBS_SUBMITTED, MODEL_AVAILABLE, PROGRESS_EVENTS, QUEUE_DEPTH, TASKS_RESOLVED,
};

/// Metrics collector for orchestrator operations.
///
/// Cheap to clone and safe to call before [`super::init_metrics`]; unrecorded
/// metrics are simply skipped.
///
/// # Example
///
/// ```ignore
/// use media_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_attempt("flux-pro", "success", 2.5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one generation attempt.
    ///
    /// # Arguments
    ///
    /// * `model` - Model the attempt ran on
    /// * `outcome` - `success` or a failure kind such as `timeout`
    /// * `latency_secs` - Attempt duration in seconds
    pub fn record_attempt(&self, model: &str, outcome: &str, latency_secs: f64) {
        if let Some(attempts) = GENERATION_ATTEMPTS.get() {
            attempts.with_label_values(&[model, outcome]).inc();
        }

        if let Some(latency) = ATTEMPT_LATENCY.get() {
            latency.with_label_values(&[model]).observe(latency_secs);
        }

        tracing::trace!(
            model = model,
            outcome = outcome,
            latency_secs = latency_secs,
            "Recorded attempt metric"
        );
    }

    /// Record an attempt routed to a fallback model.
    pub fn record_fallback(&self, preferred: &str, fallback: &str) {
        if let Some(fallbacks) = FALLBACKS_TOTAL.get() {
            fallbacks.with_label_values(&[preferred, fallback]).inc();
        }
    }

    pub fn record_task_resolved(&self, asset_type: &str, status: &str) {
        if let Some(tasks) = TASKS_RESOLVED.get() {
            tasks.with_label_values(&[asset_type, status]).inc();
        }
    }

    pub fn record_job_submitted(&self) {
        if let Some(jobs) = JOBS_SUBMITTED.get() {
            jobs.inc();
        }
    }

    pub fn record_job_finished(&self, status: &str) {
        if let Some(jobs) = JOBS_FINISHED.get() {
            jobs.with_label_values(&[status]).inc();
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.set(depth as f64);
        }
    }

    /// Increment the active worker count.
    pub fn worker_busy(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    /// Decrement the active worker count.
    pub fn worker_idle(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }

    pub fn set_model_available(&self, model: &str, available: bool) {
        if let Some(gauge) = MODEL_AVAILABLE.get() {
            gauge
                .with_label_values(&[model])
                .set(if available { 1.0 } else { 0.0 });
        }
    }

    pub fn record_progress_event(&self) {
        if let Some(counter) = PROGRESS_EVENTS.get() {
            counter.inc();
        }
    }
}
