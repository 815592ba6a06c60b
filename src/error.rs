//! Error types for media-forge operations.
//!
//! Defines the error taxonomy shared by the orchestrator subsystems:
//! - Request validation (rejected before any job exists)
//! - Model selection against the health registry
//! - Generation backend calls and per-attempt failures
//! - Job store persistence
//! - Content planning
//!
//! Per-attempt errors ([`GenerationError`]) are recorded on asset tasks and
//! never surface to callers of the orchestrator. Only validation, planning
//! and infrastructure errors reach [`OrchestratorError`].

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::scheduler::queue::QueueError;
use crate::storage::migrations::MigrationError;

/// Errors raised while validating a generation request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Script must not be empty")]
    EmptyScript,

    #[error("At least one asset type must be requested")]
    NoAssetTypes,

    #[error("Number of assets must be greater than zero")]
    ZeroAssets,

    #[error("Requested {requested} assets, maximum per job is {max}")]
    TooManyAssets { requested: u32, max: u32 },

    #[error("Model identifier must not be empty")]
    EmptyModelId,

    #[error("Planner returned {planned} asset specs for {requested} requested assets")]
    PlanMismatch { requested: u32, planned: usize },
}

/// Errors raised by model selection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// Neither the preferred model nor any permitted fallback is usable.
    #[error("Model {preferred} unavailable (candidates tried: {})", tried.join(", "))]
    ModelUnavailable {
        preferred: String,
        tried: Vec<String>,
    },
}

/// Typed failures reported by a generation backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Backend timed out")]
    Timeout,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl BackendError {
    /// Permanent errors are never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, BackendError::InvalidRequest(_))
    }
}

/// Failure of a single generation attempt, recorded on the asset task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error(transparent)]
    ModelUnavailable(#[from] SelectionError),

    #[error("Generation on model {model} timed out after {after:?}")]
    Timeout { model: String, after: Duration },

    #[error("Generation on model {model} failed: {source}")]
    Backend {
        model: String,
        #[source]
        source: BackendError,
    },

    #[error("Job cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::ModelUnavailable(_) | GenerationError::Timeout { .. } => true,
            GenerationError::Backend { source, .. } => !source.is_permanent(),
            GenerationError::Cancelled => false,
        }
    }

    /// Short label used for metrics and health records.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::ModelUnavailable(_) => "model_unavailable",
            GenerationError::Timeout { .. } => "timeout",
            GenerationError::Backend { source, .. } => match source {
                BackendError::Unavailable(_) => "unavailable",
                BackendError::RateLimited { .. } => "rate_limited",
                BackendError::Timeout => "timeout",
                BackendError::InvalidRequest(_) => "invalid_request",
                BackendError::Transport(_) => "transport",
            },
            GenerationError::Cancelled => "cancelled",
        }
    }
}

/// Errors that can occur during job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job store unavailable: {0}")]
    Unavailable(String),

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Task {task_id} not found in job {job_id}")]
    TaskNotFound { job_id: Uuid, task_id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether the store itself is unreachable, as opposed to a bad request.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_)
                | StoreError::Database(
                    sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
                )
        )
    }
}

/// Errors that can occur while planning assets from a script.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Script produced no usable segments")]
    NoSegments,

    #[error("Planner failed: {0}")]
    Failed(String),
}

/// Errors returned by the orchestrator surface (`submit`, `get_status`, `cancel`).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Planning failed: {0}")]
    Planning(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend setup failed: {0}")]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_permanence() {
        assert!(BackendError::InvalidRequest("bad prompt".into()).is_permanent());
        assert!(!BackendError::Unavailable("down".into()).is_permanent());
        assert!(!BackendError::RateLimited { retry_after: None }.is_permanent());
        assert!(!BackendError::Timeout.is_permanent());
    }

    #[test]
    fn test_generation_error_retryable() {
        let unavailable = GenerationError::from(SelectionError::ModelUnavailable {
            preferred: "m1".into(),
            tried: vec!["m1".into()],
        });
        assert!(unavailable.is_retryable());

        let timeout = GenerationError::Timeout {
            model: "m1".into(),
            after: Duration::from_secs(60),
        };
        assert!(timeout.is_retryable());

        let invalid = GenerationError::Backend {
            model: "m1".into(),
            source: BackendError::InvalidRequest("nsfw".into()),
        };
        assert!(!invalid.is_retryable());
        assert_eq!(invalid.kind(), "invalid_request");

        assert!(!GenerationError::Cancelled.is_retryable());
    }

    #[test]
    fn test_model_unavailable_names_model() {
        let err = SelectionError::ModelUnavailable {
            preferred: "flux-pro".into(),
            tried: vec!["flux-pro".into(), "sdxl".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("flux-pro"));
        assert!(msg.contains("sdxl"));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::TooManyAssets {
            requested: 80,
            max: 50,
        };
        assert!(err.to_string().contains("80"));
        assert!(err.to_string().contains("50"));
    }
}
