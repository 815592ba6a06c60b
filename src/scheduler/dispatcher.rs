//! Generation dispatcher.
//!
//! Turns a [`GenerationRequest`] into a persisted [`GenerationJob`] with one
//! pending task per planned asset, and enqueues those tasks for the worker
//! pool. Dispatch returns as soon as the tasks are queued; it never waits
//! on generation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use super::job::{GenerationJob, GenerationRequest};
use super::queue::{QueuedTask, TaskQueue};
use super::state;
use crate::error::{OrchestratorError, ValidationError};
use crate::health::{FallbackPolicy, ModelHealthRegistry};
use crate::metrics::MetricsCollector;
use crate::planner::ContentPlanner;
use crate::storage::JobStore;

/// Limits and estimates the dispatcher works with.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    /// Largest `num_assets` accepted per job.
    pub max_assets: u32,
    /// Default model and fallback order, used to pick the model an
    /// estimate is based on.
    pub fallback: FallbackPolicy,
    /// Latency estimate for models with no recorded successes.
    pub default_latency_ms: u64,
    /// Worker count, used as the parallelism ceiling for estimates.
    pub num_workers: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_assets: 50,
            fallback: FallbackPolicy::default(),
            default_latency_ms: 30_000,
            num_workers: 4,
        }
    }
}

/// Checks a request before any job exists.
pub fn validate_request(
    request: &GenerationRequest,
    max_assets: u32,
) -> Result<(), ValidationError> {
    if request.script.trim().is_empty() {
        return Err(ValidationError::EmptyScript);
    }
    if request.asset_types.is_empty() {
        return Err(ValidationError::NoAssetTypes);
    }
    if request.num_assets == 0 {
        return Err(ValidationError::ZeroAssets);
    }
    if request.num_assets > max_assets {
        return Err(ValidationError::TooManyAssets {
            requested: request.num_assets,
            max: max_assets,
        });
    }
    if request
        .preferred_model
        .as_deref()
        .is_some_and(|m| m.trim().is_empty())
    {
        return Err(ValidationError::EmptyModelId);
    }
    Ok(())
}

pub struct GenerationDispatcher {
    planner: Arc<dyn ContentPlanner>,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<ModelHealthRegistry>,
    settings: DispatchSettings,
    metrics: MetricsCollector,
}

impl GenerationDispatcher {
    pub fn new(
        planner: Arc<dyn ContentPlanner>,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<ModelHealthRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            planner,
            store,
            queue,
            registry,
            settings,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Validates, plans, persists and enqueues a new job.
    ///
    /// Validation and planning failures leave no trace in the store.
    pub async fn dispatch(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationJob, OrchestratorError> {
        validate_request(request, self.settings.max_assets)?;

        let specs = self
            .planner
            .plan(&request.script, &request.asset_types, request.num_assets)
            .await?;
        if specs.len() != request.num_assets as usize {
            return Err(ValidationError::PlanMismatch {
                requested: request.num_assets,
                planned: specs.len(),
            }
            .into());
        }

        let preferred = request
            .preferred_model
            .clone()
            .unwrap_or_else(|| self.settings.fallback.default_model.clone());
        let mut job = GenerationJob::new(
            request.asset_types.clone(),
            preferred,
            request.allow_fallback,
            specs,
        );
        job.estimated_completion = Some(self.estimate_completion(&job));

        self.store.insert_job(&job).await?;
        debug!(job_id = %job.id, tasks = job.tasks.len(), "Job persisted");

        for task in &job.tasks {
            if let Err(e) = self.queue.push(QueuedTask::new(job.id, task.id)).await {
                error!(job_id = %job.id, task_id = %task.id, error = %e, "Failed to enqueue task");
                self.abandon(&job).await;
                return Err(e.into());
            }
        }

        if let Ok(depth) = self.queue.len().await {
            self.metrics.set_queue_depth(depth);
        }
        self.metrics.record_job_submitted();
        info!(
            job_id = %job.id,
            model = %job.preferred_model,
            num_assets = job.num_assets,
            allow_fallback = job.allow_fallback,
            "Job submitted"
        );

        Ok(job)
    }

    /// `avg latency × num_assets / min(num_workers, num_assets)` past creation.
    ///
    /// The latency is that of the model selection would pick right now; the
    /// default estimate applies when no model is selectable or the selected
    /// one has no recorded successes.
    pub fn estimate_completion(&self, job: &GenerationJob) -> DateTime<Utc> {
        let candidates = self.settings.fallback.fallbacks_for(&job.preferred_model);
        let avg_ms = self
            .registry
            .select_model(&job.preferred_model, &candidates, job.allow_fallback)
            .ok()
            .and_then(|model| self.registry.average_latency_ms(&model))
            .unwrap_or(self.settings.default_latency_ms as f64);
        let parallelism = self
            .settings
            .num_workers
            .min(job.num_assets as usize)
            .max(1);
        let total_ms = avg_ms * f64::from(job.num_assets) / parallelism as f64;
        job.created_at + chrono::Duration::milliseconds(total_ms.round() as i64)
    }

    /// Fails a job whose tasks could not all be enqueued.
    async fn abandon(&self, job: &GenerationJob) {
        let result = self
            .store
            .update_job(
                job.id,
                Box::new(|job: &mut GenerationJob| {
                    state::cancel_job(job, "enqueue failed", Utc::now())
                }),
            )
            .await;
        if let Err(e) = result {
            error!(job_id = %job.id, error = %e, "Failed to mark unqueued job as failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PlanError, StoreError};
    use crate::health::{AttemptOutcome, FailureKind, RegistryConfig};
    use crate::planner::ScriptPlanner;
    use crate::scheduler::job::{AssetSpec, AssetType, Status};
    use crate::scheduler::queue::InMemoryTaskQueue;
    use crate::storage::InMemoryJobStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct ShortPlanner;

    #[async_trait]
    impl ContentPlanner for ShortPlanner {
        async fn plan(
            &self,
            _script: &str,
            _asset_types: &[AssetType],
            _num_assets: u32,
        ) -> Result<Vec<AssetSpec>, PlanError> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryTaskQueue>,
        registry: Arc<ModelHealthRegistry>,
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Arc::new(InMemoryJobStore::new()),
            queue: Arc::new(InMemoryTaskQueue::new()),
            registry: Arc::new(ModelHealthRegistry::new(RegistryConfig::default())),
        }
    }

    fn dispatcher(f: &Fixture, planner: Arc<dyn ContentPlanner>) -> GenerationDispatcher {
        GenerationDispatcher::new(
            planner,
            f.store.clone(),
            f.queue.clone(),
            f.registry.clone(),
            DispatchSettings {
                fallback: FallbackPolicy {
                    default_model: "m1".into(),
                    candidates: vec!["m2".into()],
                    ..Default::default()
                },
                default_latency_ms: 1_000,
                ..Default::default()
            },
        )
    }

    fn request(n: u32) -> GenerationRequest {
        GenerationRequest::new(
            "A storm rolls in. The lighthouse keeper lights the lamp.",
            vec![AssetType::Image],
            n,
        )
    }

    #[test]
    fn test_validation_order() {
        let empty = GenerationRequest::new("  ", vec![], 0);
        assert_eq!(validate_request(&empty, 50), Err(ValidationError::EmptyScript));

        let no_types = GenerationRequest::new("script", vec![], 0);
        assert_eq!(validate_request(&no_types, 50), Err(ValidationError::NoAssetTypes));

        let zero = GenerationRequest::new("script", vec![AssetType::Audio], 0);
        assert_eq!(validate_request(&zero, 50), Err(ValidationError::ZeroAssets));

        let many = GenerationRequest::new("script", vec![AssetType::Audio], 51);
        assert_eq!(
            validate_request(&many, 50),
            Err(ValidationError::TooManyAssets {
                requested: 51,
                max: 50
            })
        );

        let blank_model =
            GenerationRequest::new("script", vec![AssetType::Audio], 1).with_preferred_model("");
        assert_eq!(
            validate_request(&blank_model, 50),
            Err(ValidationError::EmptyModelId)
        );
    }

    #[tokio::test]
    async fn test_dispatch_persists_and_enqueues() {
        let f = fixture();
        let d = dispatcher(&f, Arc::new(ScriptPlanner::new()));

        let job = d.dispatch(&request(3)).await.unwrap();
        assert_eq!(job.status, Status::Pending);
        assert_eq!(job.preferred_model, "m1");
        assert_eq!(job.tasks.len(), 3);
        assert!(job.estimated_completion.is_some());

        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.tasks.len(), 3);
        assert_eq!(f.queue.len().await.unwrap(), 3);

        // FIFO in plan order.
        for task in &job.tasks {
            let queued = f.queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
            assert_eq!(queued.task_id, task.id);
        }
    }

    #[tokio::test]
    async fn test_invalid_request_has_no_side_effects() {
        let f = fixture();
        let d = dispatcher(&f, Arc::new(ScriptPlanner::new()));

        let err = d.dispatch(&request(0)).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(ValidationError::ZeroAssets)
        ));
        assert!(f.store.is_empty());
        assert_eq!(f.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_plan_mismatch_is_rejected() {
        let f = fixture();
        let d = dispatcher(&f, Arc::new(ShortPlanner));

        let err = d.dispatch(&request(2)).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(ValidationError::PlanMismatch { planned: 0, .. })
        ));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_propagates() {
        let f = fixture();
        f.store.set_available(false);
        let d = dispatcher(&f, Arc::new(ScriptPlanner::new()));

        let err = d.dispatch(&request(1)).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Store(StoreError::Unavailable(_))
        ));
        assert_eq!(f.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_estimate_uses_registry_latency_and_parallelism() {
        let f = fixture();
        let d = dispatcher(&f, Arc::new(ScriptPlanner::new()));

        // No history: default 1s × 8 assets / 4 workers = 2s.
        let job = d.dispatch(&request(8)).await.unwrap();
        let eta = job.estimated_completion.unwrap() - job.created_at;
        assert_eq!(eta.num_milliseconds(), 2_000);

        f.registry.record_outcome(
            "m1",
            AttemptOutcome::Success {
                latency: Duration::from_millis(400),
                rate_limit_remaining: None,
            },
        );
        // 400ms × 2 assets / min(4, 2) = 400ms.
        let job = d.dispatch(&request(2)).await.unwrap();
        let eta = job.estimated_completion.unwrap() - job.created_at;
        assert_eq!(eta.num_milliseconds(), 400);
    }

    #[tokio::test]
    async fn test_estimate_follows_selected_fallback_model() {
        let f = fixture();
        let d = dispatcher(&f, Arc::new(ScriptPlanner::new()));

        for _ in 0..f.registry.config().failure_threshold {
            f.registry.record_outcome(
                "m1",
                AttemptOutcome::Failure {
                    latency: Duration::from_millis(5),
                    kind: FailureKind::Unavailable,
                },
            );
        }
        f.registry.record_outcome(
            "m2",
            AttemptOutcome::Success {
                latency: Duration::from_millis(600),
                rate_limit_remaining: None,
            },
        );

        // m2 will serve the tasks: 600ms × 2 assets / 2 workers.
        let job = d.dispatch(&request(2)).await.unwrap();
        let eta = job.estimated_completion.unwrap() - job.created_at;
        assert_eq!(eta.num_milliseconds(), 600);

        // Without fallback nothing is selectable, so the default applies.
        let job = d
            .dispatch(&request(2).with_allow_fallback(false))
            .await
            .unwrap();
        let eta = job.estimated_completion.unwrap() - job.created_at;
        assert_eq!(eta.num_milliseconds(), 1_000);
    }
}
