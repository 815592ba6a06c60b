//! Job definitions for the generation scheduler.
//!
//! This module defines the core records tracked by the orchestrator:
//!
//! - `GenerationRequest`: What a caller asks for
//! - `GenerationJob`: A request turned into tracked work, owning its tasks
//! - `AssetTask`: One asset to generate
//! - `AssetSpec`: Per-asset payload produced by the content planner
//! - `AssetParams` / `AssetMetadata`: Per-asset-type shapes, keyed by type

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of artifact a task produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Image,
    Video,
    Audio,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Image => "image",
            AssetType::Video => "video",
            AssetType::Audio => "audio",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(AssetType::Image),
            "video" => Ok(AssetType::Video),
            "audio" => Ok(AssetType::Audio),
            other => Err(format!("unknown asset type '{}'", other)),
        }
    }
}

/// Status shared by jobs and asset tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl Status {
    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Generating => "generating",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "generating" => Ok(Status::Generating),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Generation parameters for one asset, keyed by asset type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AssetParams {
    Image {
        width: u32,
        height: u32,
        style: Option<String>,
    },
    Video {
        duration_secs: u32,
        width: u32,
        height: u32,
        fps: u32,
    },
    Audio {
        duration_secs: u32,
        voice: Option<String>,
    },
}

impl AssetParams {
    /// Reasonable defaults for each asset type.
    pub fn default_for(asset_type: AssetType) -> Self {
        match asset_type {
            AssetType::Image => AssetParams::Image {
                width: 1024,
                height: 1024,
                style: None,
            },
            AssetType::Video => AssetParams::Video {
                duration_secs: 5,
                width: 1280,
                height: 720,
                fps: 24,
            },
            AssetType::Audio => AssetParams::Audio {
                duration_secs: 10,
                voice: None,
            },
        }
    }

    pub fn asset_type(&self) -> AssetType {
        match self {
            AssetParams::Image { .. } => AssetType::Image,
            AssetParams::Video { .. } => AssetType::Video,
            AssetParams::Audio { .. } => AssetType::Audio,
        }
    }
}

/// Metadata describing a produced artifact, keyed by asset type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AssetMetadata {
    Image {
        width: u32,
        height: u32,
        format: String,
    },
    Video {
        duration_ms: u64,
        width: u32,
        height: u32,
        fps: u32,
    },
    Audio {
        duration_ms: u64,
        sample_rate: u32,
        channels: u16,
    },
}

/// Per-asset generation spec. Opaque to the orchestrator; forwarded to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSpec {
    /// Position of the asset within the job.
    pub index: u32,
    /// Prompt text sent to the model.
    pub prompt: String,
    /// Type-specific generation parameters.
    pub params: AssetParams,
}

impl AssetSpec {
    pub fn new(index: u32, prompt: impl Into<String>, params: AssetParams) -> Self {
        Self {
            index,
            prompt: prompt.into(),
            params,
        }
    }

    pub fn asset_type(&self) -> AssetType {
        self.params.asset_type()
    }
}

/// A caller's request to generate assets from a script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Script text the assets are planned from.
    pub script: String,
    /// Asset types to generate.
    pub asset_types: Vec<AssetType>,
    /// Number of assets to generate.
    pub num_assets: u32,
    /// Preferred model; the configured default is used when absent.
    #[serde(default)]
    pub preferred_model: Option<String>,
    /// Whether fallback models may serve this job.
    #[serde(default = "default_allow_fallback")]
    pub allow_fallback: bool,
}

fn default_allow_fallback() -> bool {
    true
}

impl GenerationRequest {
    pub fn new(script: impl Into<String>, asset_types: Vec<AssetType>, num_assets: u32) -> Self {
        Self {
            script: script.into(),
            asset_types,
            num_assets,
            preferred_model: None,
            allow_fallback: true,
        }
    }

    /// Sets the preferred model.
    pub fn with_preferred_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = Some(model.into());
        self
    }

    /// Sets whether fallback models are allowed.
    pub fn with_allow_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = allow;
        self
    }
}

/// One asset to generate within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetTask {
    pub id: Uuid,
    /// Back-reference to the owning job.
    pub job_id: Uuid,
    pub asset_type: AssetType,
    pub spec: AssetSpec,
    pub status: Status,
    pub model_used: Option<String>,
    pub fallback_used: bool,
    pub attempt_count: u32,
    pub generation_time_ms: Option<u64>,
    pub quality_score: Option<f64>,
    /// Opaque handle to the produced artifact, owned by the backend.
    pub asset_reference: Option<String>,
    pub metadata: Option<AssetMetadata>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AssetTask {
    pub fn new(job_id: Uuid, spec: AssetSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            asset_type: spec.asset_type(),
            spec,
            status: Status::Pending,
            model_used: None,
            fallback_used: false,
            attempt_count: 0,
            generation_time_ms: None,
            quality_score: None,
            asset_reference: None,
            metadata: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// A generation job and the asset tasks it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub asset_types: Vec<AssetType>,
    pub num_assets: u32,
    pub preferred_model: String,
    pub allow_fallback: bool,
    pub status: Status,
    pub progress_percentage: f64,
    pub cancelled: bool,
    /// Model used by the most recently completed task.
    pub model_selected: Option<String>,
    pub fallback_occurred: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub actual_completion: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub tasks: Vec<AssetTask>,
}

impl GenerationJob {
    /// Creates a pending job with one pending task per spec.
    pub fn new(
        asset_types: Vec<AssetType>,
        preferred_model: impl Into<String>,
        allow_fallback: bool,
        specs: Vec<AssetSpec>,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let tasks: Vec<AssetTask> = specs.into_iter().map(|s| AssetTask::new(id, s)).collect();

        Self {
            id,
            asset_types,
            num_assets: tasks.len() as u32,
            preferred_model: preferred_model.into(),
            allow_fallback,
            status: Status::Pending,
            progress_percentage: 0.0,
            cancelled: false,
            model_selected: None,
            fallback_occurred: false,
            created_at: now,
            updated_at: now,
            estimated_completion: None,
            actual_completion: None,
            error_message: None,
            tasks,
        }
    }

    pub fn task(&self, task_id: Uuid) -> Option<&AssetTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: Uuid) -> Option<&mut AssetTask> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Counts tasks by status: (pending, generating, completed, failed).
    pub fn task_counts(&self) -> (usize, usize, usize, usize) {
        self.tasks
            .iter()
            .fold((0, 0, 0, 0), |(p, g, c, f), t| match t.status {
                Status::Pending => (p + 1, g, c, f),
                Status::Generating => (p, g + 1, c, f),
                Status::Completed => (p, g, c + 1, f),
                Status::Failed => (p, g, c, f + 1),
            })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(n: u32) -> Vec<AssetSpec> {
        (0..n)
            .map(|i| {
                AssetSpec::new(i, format!("shot {}", i), AssetParams::default_for(AssetType::Image))
            })
            .collect()
    }

    #[test]
    fn test_job_new_creates_pending_tasks() {
        let job = GenerationJob::new(vec![AssetType::Image], "m1", true, specs(3));

        assert_eq!(job.status, Status::Pending);
        assert_eq!(job.num_assets, 3);
        assert_eq!(job.tasks.len(), 3);
        assert!(job.tasks.iter().all(|t| t.job_id == job.id));
        assert!(job.tasks.iter().all(|t| t.status == Status::Pending));
        assert_eq!(job.progress_percentage, 0.0);
        assert!(!job.cancelled);
    }

    #[test]
    fn test_task_counts() {
        let mut job = GenerationJob::new(vec![AssetType::Image], "m1", true, specs(4));
        job.tasks[0].status = Status::Generating;
        job.tasks[1].status = Status::Completed;
        job.tasks[2].status = Status::Failed;

        assert_eq!(job.task_counts(), (1, 1, 1, 1));
    }

    #[test]
    fn test_status_terminal() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Generating.is_terminal());
        assert!(Status::Completed.is_terminal());
        assert!(Status::Failed.is_terminal());
    }

    #[test]
    fn test_asset_type_parse() {
        assert_eq!("Image".parse::<AssetType>(), Ok(AssetType::Image));
        assert_eq!(" audio ".parse::<AssetType>(), Ok(AssetType::Audio));
        assert!("hologram".parse::<AssetType>().is_err());
    }

    #[test]
    fn test_asset_params_tagged_serialization() {
        let params = AssetParams::Video {
            duration_secs: 4,
            width: 640,
            height: 360,
            fps: 30,
        };
        let json = serde_json::to_value(&params).expect("serialize");
        assert_eq!(json["type"], "video");
        assert_eq!(json["fps"], 30);
        assert_eq!(params.asset_type(), AssetType::Video);
    }

    #[test]
    fn test_request_builder() {
        let req = GenerationRequest::new("A cat.", vec![AssetType::Image], 2)
            .with_preferred_model("flux")
            .with_allow_fallback(false);

        assert_eq!(req.preferred_model.as_deref(), Some("flux"));
        assert!(!req.allow_fallback);
    }

    #[test]
    fn test_request_deserialize_defaults() {
        let req: GenerationRequest = serde_json::from_str(
            r#"{"script":"hello","asset_types":["image","audio"],"num_assets":2}"#,
        )
        .expect("deserialize");
        assert!(req.allow_fallback);
        assert!(req.preferred_model.is_none());
        assert_eq!(req.asset_types, vec![AssetType::Image, AssetType::Audio]);
    }
}
