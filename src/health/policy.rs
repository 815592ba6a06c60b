//! Fallback and retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff: `base * 2^attempt`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSchedule {
    #[serde(with = "crate::config::duration_ms")]
    pub base: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub cap: Duration,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffSchedule {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Which models may serve a job and how hard to try.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackPolicy {
    /// Model used when a request names none.
    pub default_model: String,
    /// Fallback candidates in priority order.
    pub candidates: Vec<String>,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: BackoffSchedule,
    /// Consecutive failures after which a model is flagged unavailable.
    pub failure_threshold: u32,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            default_model: "flux-pro".to_string(),
            candidates: vec!["sdxl-turbo".to_string()],
            max_retries: 3,
            backoff: BackoffSchedule::default(),
            failure_threshold: 3,
        }
    }
}

impl FallbackPolicy {
    /// Candidates other than `preferred`, in priority order.
    pub fn fallbacks_for(&self, preferred: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.candidates.len() + 1);
        let chain = self
            .candidates
            .iter()
            .chain(std::iter::once(&self.default_model));
        for model in chain {
            if model != preferred && !out.contains(model) {
                out.push(model.clone());
            }
        }
        out
    }

    /// Total attempts allowed per task.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
