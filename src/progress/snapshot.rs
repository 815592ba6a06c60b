//! Point-in-time job summaries shared by progress events and `get_status`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::job::{AssetType, GenerationJob, Status};

/// Summary of one asset task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: Uuid,
    pub index: u32,
    pub asset_type: AssetType,
    pub status: Status,
    pub model_used: Option<String>,
    pub fallback_used: bool,
    pub attempt_count: u32,
    pub generation_time_ms: Option<u64>,
    pub quality_score: Option<f64>,
    pub asset_reference: Option<String>,
    pub error: Option<String>,
}

/// Snapshot of a job and its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub status: Status,
    pub progress_percentage: f64,
    pub tasks: Vec<TaskSummary>,
    pub model_selected: Option<String>,
    pub fallback_occurred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub actual_completion: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `self` reflects a later state of the job than `other`.
    pub fn supersedes(&self, other: &JobSnapshot) -> bool {
        (self.updated_at, self.progress_percentage) >= (other.updated_at, other.progress_percentage)
    }
}

impl From<&GenerationJob> for JobSnapshot {
    fn from(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress_percentage: job.progress_percentage,
            tasks: job
                .tasks
                .iter()
                .map(|t| TaskSummary {
                    task_id: t.id,
                    index: t.spec.index,
                    asset_type: t.asset_type,
                    status: t.status,
                    model_used: t.model_used.clone(),
                    fallback_used: t.fallback_used,
                    attempt_count: t.attempt_count,
                    generation_time_ms: t.generation_time_ms,
                    quality_score: t.quality_score,
                    asset_reference: t.asset_reference.clone(),
                    error: t.error.clone(),
                })
                .collect(),
            model_selected: job.model_selected.clone(),
            fallback_occurred: job.fallback_occurred,
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            estimated_completion: job.estimated_completion,
            actual_completion: job.actual_completion,
        }
    }
}
