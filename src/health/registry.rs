//! Per-model health tracking and model selection.
//!
//! Each model's record sits behind its own mutex, so attempts on different
//! models never contend and every outcome is applied to a record as one unit.
//! The outer map is only write-locked when a model is seen for the first time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{BackendError, GenerationError, SelectionError};

/// Weight of the newest sample in the latency moving average.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Tuning for the health registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Consecutive failures after which a model is flagged unavailable.
    pub failure_threshold: u32,
    /// Time for `error_count` to halve.
    pub decay_half_life: Duration,
    /// How long a model stays flagged unavailable before it may recover.
    pub recovery_cooldown: Duration,
    /// Rate-limit window when the backend gives no `retry_after`.
    pub rate_limit_cooldown: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            decay_half_life: Duration::from_secs(300),
            recovery_cooldown: Duration::from_secs(60),
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

/// Health of a single model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHealthRecord {
    pub model_id: String,
    pub available: bool,
    pub error_count: u32,
    pub consecutive_failures: u32,
    pub avg_response_time_ms: Option<f64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub rate_limit_remaining: Option<u32>,
    pub last_error: Option<String>,
}

impl ModelHealthRecord {
    fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            available: true,
            error_count: 0,
            consecutive_failures: 0,
            avg_response_time_ms: None,
            last_success_at: None,
            last_checked_at: None,
            rate_limit_remaining: None,
            last_error: None,
        }
    }
}

/// What happened on one generation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success {
        latency: Duration,
        rate_limit_remaining: Option<u32>,
    },
    Failure {
        latency: Duration,
        kind: FailureKind,
    },
}

/// Failure classes that affect model health.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    Unavailable,
    Timeout,
    RateLimited { retry_after: Option<Duration> },
    Transport,
    /// Request rejected as invalid; says nothing about the model's health.
    InvalidRequest,
}

impl FailureKind {
    /// Maps an attempt error; selection failures never reached a model.
    pub fn from_error(err: &GenerationError) -> Option<Self> {
        match err {
            GenerationError::Timeout { .. } => Some(FailureKind::Timeout),
            GenerationError::Backend { source, .. } => Some(match source {
                BackendError::Unavailable(_) => FailureKind::Unavailable,
                BackendError::RateLimited { retry_after } => FailureKind::RateLimited {
                    retry_after: *retry_after,
                },
                BackendError::Timeout => FailureKind::Timeout,
                BackendError::InvalidRequest(_) => FailureKind::InvalidRequest,
                BackendError::Transport(_) => FailureKind::Transport,
            }),
            GenerationError::ModelUnavailable(_) | GenerationError::Cancelled => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FailureKind::Unavailable => "unavailable",
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimited { .. } => "rate_limited",
            FailureKind::Transport => "transport",
            FailureKind::InvalidRequest => "invalid_request",
        }
    }
}

/// Aggregate health across the configured models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health summary for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHealthSummary {
    pub model_id: String,
    pub available: bool,
    pub error_count: u32,
    pub avg_response_time_ms: Option<f64>,
}

/// Answer to `health()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: OverallStatus,
    pub models: Vec<ModelHealthSummary>,
}

struct ModelState {
    record: ModelHealthRecord,
    rate_limited_until: Option<DateTime<Utc>>,
    unavailable_since: Option<DateTime<Utc>>,
    last_decay_at: DateTime<Utc>,
}

impl ModelState {
    fn new(model_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            record: ModelHealthRecord::new(model_id),
            rate_limited_until: None,
            unavailable_since: None,
            last_decay_at: now,
        }
    }

    fn is_rate_limited(&self, now: DateTime<Utc>) -> bool {
        self.record.rate_limit_remaining == Some(0)
            && self.rate_limited_until.map_or(true, |until| now < until)
    }

    fn is_usable(&self, threshold: u32, now: DateTime<Utc>) -> bool {
        self.record.available && self.record.error_count < threshold && !self.is_rate_limited(now)
    }
}

/// Tracks availability, errors and latency per model identifier.
pub struct ModelHealthRegistry {
    config: RegistryConfig,
    models: RwLock<HashMap<String, Arc<Mutex<ModelState>>>>,
}

impl ModelHealthRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Registers models up front so they appear in health reports.
    pub fn with_models<I, S>(config: RegistryConfig, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::new(config);
        for model in models {
            registry.entry(model.as_ref(), Utc::now());
        }
        registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn entry(&self, model: &str, now: DateTime<Utc>) -> Arc<Mutex<ModelState>> {
        if let Some(state) = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
        {
            return Arc::clone(state);
        }

        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            models
                .entry(model.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ModelState::new(model, now)))),
        )
    }

    fn existing(&self, model: &str) -> Option<Arc<Mutex<ModelState>>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .map(Arc::clone)
    }

    /// Records the outcome of one attempt against `model`.
    pub fn record_outcome(&self, model: &str, outcome: AttemptOutcome) {
        self.record_outcome_at(model, outcome, Utc::now());
    }

    pub fn record_outcome_at(&self, model: &str, outcome: AttemptOutcome, now: DateTime<Utc>) {
        let entry = self.entry(model, now);
        let mut state = entry.lock().unwrap_or_else(PoisonError::into_inner);
        let threshold = self.config.failure_threshold;
        state.record.last_checked_at = Some(now);

        match outcome {
            AttemptOutcome::Success {
                latency,
                rate_limit_remaining,
            } => {
                let sample = latency.as_secs_f64() * 1000.0;
                state.record.avg_response_time_ms = Some(match state.record.avg_response_time_ms {
                    Some(avg) => avg + LATENCY_EMA_ALPHA * (sample - avg),
                    None => sample,
                });
                state.record.consecutive_failures = 0;
                state.record.available = true;
                state.record.last_success_at = Some(now);
                state.record.rate_limit_remaining = rate_limit_remaining;
                state.rate_limited_until = None;
                state.unavailable_since = None;
            }
            AttemptOutcome::Failure { kind, .. } => {
                state.record.last_error = Some(kind.label().to_string());
                match kind {
                    FailureKind::InvalidRequest => return,
                    FailureKind::RateLimited { retry_after } => {
                        let window = retry_after.unwrap_or(self.config.rate_limit_cooldown);
                        state.record.rate_limit_remaining = Some(0);
                        state.rate_limited_until = chrono::Duration::from_std(window)
                            .ok()
                            .map(|w| now + w);
                    }
                    _ => {}
                }

                state.record.error_count = (state.record.error_count + 1).min(threshold);
                state.record.consecutive_failures += 1;
                if state.record.available && state.record.consecutive_failures >= threshold {
                    state.record.available = false;
                    state.unavailable_since = Some(now);
                    tracing::warn!(
                        model = model,
                        consecutive_failures = state.record.consecutive_failures,
                        "Model flagged unavailable"
                    );
                }
            }
        }
    }

    /// Current record for `model`; unknown models report as healthy.
    pub fn get_health(&self, model: &str) -> ModelHealthRecord {
        let Some(entry) = self.existing(model) else {
            return ModelHealthRecord::new(model);
        };
        let state = entry.lock().unwrap_or_else(PoisonError::into_inner);
        state.record.clone()
    }

    /// Whether `model` may serve an attempt right now.
    pub fn is_usable(&self, model: &str) -> bool {
        self.is_usable_at(model, Utc::now())
    }

    pub fn is_usable_at(&self, model: &str, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.existing(model) else {
            return true;
        };
        let state = entry.lock().unwrap_or_else(PoisonError::into_inner);
        state.is_usable(self.config.failure_threshold, now)
    }

    /// Picks the model for the next attempt.
    ///
    /// The preferred model wins when usable; otherwise, if fallback is
    /// allowed, the first usable candidate in priority order.
    pub fn select_model(
        &self,
        preferred: &str,
        fallback_candidates: &[String],
        allow_fallback: bool,
    ) -> Result<String, SelectionError> {
        self.select_model_at(preferred, fallback_candidates, allow_fallback, Utc::now())
    }

    pub fn select_model_at(
        &self,
        preferred: &str,
        fallback_candidates: &[String],
        allow_fallback: bool,
        now: DateTime<Utc>,
    ) -> Result<String, SelectionError> {
        if self.is_usable_at(preferred, now) {
            return Ok(preferred.to_string());
        }

        let mut tried = vec![preferred.to_string()];
        if allow_fallback {
            for candidate in fallback_candidates.iter().filter(|c| *c != preferred) {
                if self.is_usable_at(candidate, now) {
                    tracing::debug!(
                        preferred = preferred,
                        fallback = %candidate,
                        "Preferred model unusable, selecting fallback"
                    );
                    return Ok(candidate.clone());
                }
                tried.push(candidate.clone());
            }
        }

        Err(SelectionError::ModelUnavailable {
            preferred: preferred.to_string(),
            tried,
        })
    }

    /// Average latency for `model`, if any attempt has succeeded.
    pub fn average_latency_ms(&self, model: &str) -> Option<f64> {
        self.get_health(model).avg_response_time_ms
    }

    /// Decays error counts, lifts expired rate limits and re-enables cooled-down models.
    pub fn reconcile(&self) {
        self.reconcile_at(Utc::now());
    }

    pub fn reconcile_at(&self, now: DateTime<Utc>) {
        let entries: Vec<Arc<Mutex<ModelState>>> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Arc::clone)
            .collect();

        let half_life = chrono::Duration::from_std(self.config.decay_half_life)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let cooldown = chrono::Duration::from_std(self.config.recovery_cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        for entry in entries {
            let mut state = entry.lock().unwrap_or_else(PoisonError::into_inner);

            if half_life > chrono::Duration::zero() {
                let elapsed = now - state.last_decay_at;
                let halvings = elapsed.num_milliseconds() / half_life.num_milliseconds().max(1);
                if halvings >= 32 {
                    state.record.error_count = 0;
                    state.last_decay_at = now;
                } else if halvings > 0 {
                    state.record.error_count >>= halvings as u32;
                    state.last_decay_at = state.last_decay_at + half_life * halvings as i32;
                }
            }

            if state.rate_limited_until.is_some_and(|until| until <= now) {
                state.rate_limited_until = None;
                state.record.rate_limit_remaining = None;
            }

            if !state.record.available
                && state
                    .unavailable_since
                    .map_or(true, |since| since + cooldown <= now)
                && state.record.error_count < self.config.failure_threshold
            {
                state.record.available = true;
                state.record.consecutive_failures = 0;
                state.unavailable_since = None;
                tracing::info!(model = %state.record.model_id, "Model recovered");
            }
        }
    }

    /// All known records, sorted by model id.
    pub fn snapshot(&self) -> Vec<ModelHealthRecord> {
        let mut records: Vec<ModelHealthRecord> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.lock().unwrap_or_else(PoisonError::into_inner).record.clone())
            .collect();
        records.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        records
    }

    /// Builds the health report for the given preferred and critical models.
    pub fn health_report(&self, preferred: &str, critical: &[String]) -> HealthReport {
        let now = Utc::now();
        for model in critical.iter().map(String::as_str).chain([preferred]) {
            self.entry(model, now);
        }

        let models: Vec<ModelHealthSummary> = self
            .snapshot()
            .into_iter()
            .map(|r| ModelHealthSummary {
                available: self.is_usable_at(&r.model_id, now),
                model_id: r.model_id,
                error_count: r.error_count,
                avg_response_time_ms: r.avg_response_time_ms,
            })
            .collect();

        let any_available = models.iter().any(|m| m.available);
        let all_critical_available = critical
            .iter()
            .map(String::as_str)
            .chain([preferred])
            .all(|c| self.is_usable_at(c, now));

        let overall_status = if !any_available {
            OverallStatus::Unhealthy
        } else if all_critical_available {
            OverallStatus::Healthy
        } else {
            OverallStatus::Degraded
        };

        HealthReport {
            overall_status,
            models,
        }
    }
}

/// Background task that periodically calls [`ModelHealthRegistry::reconcile`].
pub struct HealthReconciler {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HealthReconciler {
    pub fn start(registry: Arc<ModelHealthRegistry>, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                registry.reconcile();
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the reconciler to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for HealthReconciler {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
