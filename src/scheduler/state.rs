//! Job state machine.
//!
//! Jobs move `pending -> generating -> {completed, failed}`. Every task
//! transition goes through this module, which recomputes the job's progress
//! and, once all tasks have resolved, its terminal status. The functions
//! here are pure over a `GenerationJob` so the job store can apply them
//! inside a single atomic read-modify-write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::job::{AssetMetadata, GenerationJob, Status};

/// Errors raised by invalid transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Job {0} is terminal")]
    JobTerminal(Uuid),

    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Invalid task transition from '{from}' to '{to}'")]
    InvalidTaskTransition { from: Status, to: Status },
}

/// How many task failures a job tolerates before it is failed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Largest fraction of failed tasks a job may have and still complete.
    /// `0.0` fails the job on any unrecovered task failure.
    pub max_failed_fraction: f64,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_failed_fraction: 0.0,
        }
    }
}

/// Successful generation result recorded on a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSuccess {
    pub model_used: String,
    pub fallback_used: bool,
    pub generation_time_ms: u64,
    pub quality_score: f64,
    pub asset_reference: String,
    pub metadata: Option<AssetMetadata>,
}

/// Final outcome of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResolution {
    Completed(TaskSuccess),
    Failed {
        error: String,
        /// Model of the last attempt, if any was selected.
        model: Option<String>,
    },
}

/// Marks a task `generating`, flipping the job to `generating` on the first start.
///
/// Returns `true` when this call moved the job out of `pending`.
pub fn start_task(
    job: &mut GenerationJob,
    task_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, TransitionError> {
    if job.is_terminal() || job.cancelled {
        return Err(TransitionError::JobTerminal(job.id));
    }

    let task = job
        .task_mut(task_id)
        .ok_or(TransitionError::TaskNotFound(task_id))?;
    if task.status != Status::Pending {
        return Err(TransitionError::InvalidTaskTransition {
            from: task.status,
            to: Status::Generating,
        });
    }
    task.status = Status::Generating;
    task.started_at = Some(now);

    job.updated_at = now;
    if job.status == Status::Pending {
        job.status = Status::Generating;
        return Ok(true);
    }
    Ok(false)
}

/// Records a task's final outcome and re-derives the job's progress and status.
///
/// Outcomes are still recorded once the job is terminal, but they no longer
/// change its status. Returns the job's new terminal status if this call
/// made it terminal.
pub fn resolve_task(
    job: &mut GenerationJob,
    task_id: Uuid,
    attempt_count: u32,
    resolution: TaskResolution,
    policy: &FailurePolicy,
    now: DateTime<Utc>,
) -> Result<Option<Status>, TransitionError> {
    let was_terminal = job.is_terminal();
    let task = job
        .task_mut(task_id)
        .ok_or(TransitionError::TaskNotFound(task_id))?;

    let target = match resolution {
        TaskResolution::Completed(_) => Status::Completed,
        TaskResolution::Failed { .. } => Status::Failed,
    };
    if task.status.is_terminal() {
        return Err(TransitionError::InvalidTaskTransition {
            from: task.status,
            to: target,
        });
    }

    task.attempt_count = attempt_count;
    task.completed_at = Some(now);
    let mut completed_with = None;
    match resolution {
        TaskResolution::Completed(success) => {
            task.status = Status::Completed;
            task.model_used = Some(success.model_used.clone());
            task.fallback_used = success.fallback_used;
            task.generation_time_ms = Some(success.generation_time_ms);
            task.quality_score = Some(success.quality_score);
            task.asset_reference = Some(success.asset_reference);
            task.metadata = success.metadata;
            task.error = None;
            completed_with = Some((success.model_used, success.fallback_used));
        }
        TaskResolution::Failed { error, model } => {
            task.status = Status::Failed;
            if model.is_some() {
                task.model_used = model;
            }
            task.error = Some(error);
        }
    }

    job.updated_at = now;
    recompute_progress(job);

    if was_terminal {
        return Ok(None);
    }

    if let Some((model, fallback_used)) = completed_with {
        job.model_selected = Some(model);
        job.fallback_occurred |= fallback_used;
    }

    Ok(evaluate_terminal(job, policy, now))
}

/// Cancels a job: it becomes `failed` immediately and pending tasks fail.
///
/// Tasks already generating or resolved are left untouched.
pub fn cancel_job(
    job: &mut GenerationJob,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    if job.is_terminal() {
        return Err(TransitionError::JobTerminal(job.id));
    }

    job.cancelled = true;
    job.status = Status::Failed;
    job.error_message = Some(format!("cancelled: {}", reason));
    job.actual_completion = Some(now);
    job.updated_at = now;

    for task in job.tasks.iter_mut().filter(|t| t.status == Status::Pending) {
        task.status = Status::Failed;
        task.error = Some("job cancelled".to_string());
        task.completed_at = Some(now);
    }

    recompute_progress(job);
    Ok(())
}

/// Sets `progress_percentage` to the share of resolved tasks.
pub fn recompute_progress(job: &mut GenerationJob) {
    job.progress_percentage = progress_of(job);
}

/// `(completed + failed) / total * 100`.
pub fn progress_of(job: &GenerationJob) -> f64 {
    let total = job.tasks.len();
    if total == 0 {
        return 100.0;
    }
    let (_, _, completed, failed) = job.task_counts();
    (completed + failed) as f64 / total as f64 * 100.0
}

/// Decides the terminal status once every task has resolved.
fn evaluate_terminal(
    job: &mut GenerationJob,
    policy: &FailurePolicy,
    now: DateTime<Utc>,
) -> Option<Status> {
    let (pending, generating, completed, failed) = job.task_counts();
    if pending + generating > 0 {
        return None;
    }

    let total = job.tasks.len().max(1);
    let failed_fraction = failed as f64 / total as f64;
    let status = if completed > 0 && failed_fraction <= policy.max_failed_fraction {
        Status::Completed
    } else {
        Status::Failed
    };

    job.status = status;
    job.actual_completion = Some(now);
    if status == Status::Failed {
        let first_error = job
            .tasks
            .iter()
            .find_map(|t| t.error.as_deref())
            .unwrap_or("unknown error");
        job.error_message = Some(format!(
            "{} of {} asset tasks failed: {}",
            failed, total, first_error
        ));
    }
    Some(status)
}
