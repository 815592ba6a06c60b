//! End-to-end tests for the orchestrator against in-process collaborators.
//!
//! Run with: cargo test --test orchestrator

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use media_forge::backend::{FixedLatencyBackend, GenerationBackend, GenerationOutput};
use media_forge::config::ForgeConfig;
use media_forge::health::{AttemptOutcome, BackoffSchedule, FailureKind};
use media_forge::orchestrator::{Components, Orchestrator};
use media_forge::planner::ScriptPlanner;
use media_forge::progress::JobSnapshot;
use media_forge::scheduler::{AssetSpec, AssetType, GenerationRequest, InMemoryTaskQueue, Status};
use media_forge::storage::InMemoryJobStore;
use media_forge::BackendError;
use uuid::Uuid;

const SCRIPT: &str = "Dawn over the harbour.\n\nFishermen haul their nets.\n\nA gull steals a sardine.";

/// Fails every attempt for the listed asset indices, succeeds otherwise.
struct ScriptedBackend {
    failing: HashSet<u32>,
    latency: Duration,
    failing_calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(failing: impl IntoIterator<Item = u32>, latency: Duration) -> Self {
        Self {
            failing: failing.into_iter().collect(),
            latency,
            failing_calls: AtomicUsize::new(0),
        }
    }

    fn failing_calls(&self) -> usize {
        self.failing_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(
        &self,
        model_id: &str,
        spec: &AssetSpec,
    ) -> Result<GenerationOutput, BackendError> {
        tokio::time::sleep(self.latency).await;
        if self.failing.contains(&spec.index) {
            self.failing_calls.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::Unavailable(format!(
                "asset {} cannot be rendered",
                spec.index
            )));
        }
        Ok(GenerationOutput {
            asset_reference: format!("scripted://{}/{}", model_id, spec.index),
            quality_score: 0.8,
            latency_ms: self.latency.as_millis() as u64,
            metadata: None,
            rate_limit_remaining: None,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn config(workers: usize) -> ForgeConfig {
    let mut config = ForgeConfig::default();
    config.pool.num_workers = workers;
    config.pool.poll_interval = Duration::from_millis(10);
    config.pool.attempt_timeout = Duration::from_secs(2);
    config.fallback.default_model = "m1".into();
    config.fallback.candidates = vec!["m2".into()];
    config.fallback.max_retries = 2;
    config.fallback.backoff = BackoffSchedule::new(Duration::from_millis(5), Duration::from_millis(20));
    config.progress.coalesce_interval = Duration::from_millis(10);
    config
}

fn build(config: ForgeConfig, backend: Arc<dyn GenerationBackend>) -> Orchestrator {
    Orchestrator::with_components(
        config,
        Components {
            store: Arc::new(InMemoryJobStore::new()),
            queue: Arc::new(InMemoryTaskQueue::new()),
            backend,
            planner: Arc::new(ScriptPlanner::new()),
        },
    )
}

fn fixed_backend() -> Arc<FixedLatencyBackend> {
    Arc::new(FixedLatencyBackend::new(Duration::from_millis(5), 0.9))
}

fn images(n: u32) -> GenerationRequest {
    GenerationRequest::new(SCRIPT, vec![AssetType::Image], n).with_preferred_model("m1")
}

/// Flags `model` unavailable in the health registry.
fn mark_unavailable(orchestrator: &Orchestrator, model: &str) {
    for _ in 0..orchestrator.config().fallback.failure_threshold {
        orchestrator.registry().record_outcome(
            model,
            AttemptOutcome::Failure {
                latency: Duration::from_millis(1),
                kind: FailureKind::Unavailable,
            },
        );
    }
    assert!(!orchestrator.registry().get_health(model).available);
}

/// Waits until the job is terminal and every task has resolved.
async fn wait_resolved(orchestrator: &Orchestrator, job_id: Uuid) -> JobSnapshot {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = orchestrator.get_status(job_id).await.expect("status");
            if snapshot.is_terminal() && snapshot.tasks.iter().all(|t| t.status.is_terminal()) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not resolve in time")
}

fn expected_progress(snapshot: &JobSnapshot) -> f64 {
    let resolved = snapshot
        .tasks
        .iter()
        .filter(|t| t.status.is_terminal())
        .count();
    resolved as f64 / snapshot.tasks.len() as f64 * 100.0
}

#[tokio::test]
async fn scenario_a_healthy_preferred_model() {
    let backend = fixed_backend();
    let orchestrator = build(config(2), backend.clone());
    let mut events = orchestrator.subscribe();
    orchestrator.start().await.expect("start");

    let receipt = orchestrator.submit(&images(3)).await.expect("submit");
    assert_eq!(receipt.status, Status::Pending);
    assert!(receipt.estimated_completion.is_some());

    let done = wait_resolved(&orchestrator, receipt.job_id).await;
    orchestrator.shutdown().await.expect("shutdown");

    assert_eq!(done.status, Status::Completed);
    assert_eq!(done.progress_percentage, 100.0);
    assert_eq!(done.model_selected.as_deref(), Some("m1"));
    assert!(!done.fallback_occurred);
    assert!(done.error_message.is_none());
    for task in &done.tasks {
        assert_eq!(task.status, Status::Completed);
        assert_eq!(task.model_used.as_deref(), Some("m1"));
        assert!(!task.fallback_used);
        assert!(task.generation_time_ms.is_some());
        assert!(task.quality_score.is_some());
        assert!(task.asset_reference.is_some());
    }
    assert_eq!(backend.calls("m2"), 0);

    // Every emitted snapshot is consistent and progress never goes backwards.
    let mut last = 0.0;
    let mut saw_terminal = false;
    while let Ok(snapshot) = events.try_recv() {
        if snapshot.job_id != receipt.job_id {
            continue;
        }
        assert_eq!(snapshot.progress_percentage, expected_progress(&snapshot));
        assert!(snapshot.progress_percentage >= last);
        last = snapshot.progress_percentage;
        saw_terminal |= snapshot.is_terminal();
    }
    assert!(saw_terminal, "final state was never published");
}

#[tokio::test]
async fn scenario_b_fallback_when_preferred_unavailable() {
    let backend = fixed_backend();
    backend.set_unavailable("m1", true);
    let orchestrator = build(config(2), backend.clone());
    mark_unavailable(&orchestrator, "m1");
    orchestrator.start().await.expect("start");

    let receipt = orchestrator
        .submit(&images(3).with_allow_fallback(true))
        .await
        .expect("submit");
    let done = wait_resolved(&orchestrator, receipt.job_id).await;
    orchestrator.shutdown().await.expect("shutdown");

    assert_eq!(done.status, Status::Completed);
    assert!(done.fallback_occurred);
    assert_eq!(done.model_selected.as_deref(), Some("m2"));
    for task in &done.tasks {
        assert_eq!(task.status, Status::Completed);
        assert_eq!(task.model_used.as_deref(), Some("m2"));
        assert!(task.fallback_used);
    }
    assert_eq!(backend.calls("m1"), 0);
}

#[tokio::test]
async fn scenario_c_no_fallback_fails_without_touching_other_models() {
    let backend = fixed_backend();
    let orchestrator = build(config(2), backend.clone());
    mark_unavailable(&orchestrator, "m1");
    orchestrator.start().await.expect("start");

    let receipt = orchestrator
        .submit(&images(3).with_allow_fallback(false))
        .await
        .expect("submit");
    let done = wait_resolved(&orchestrator, receipt.job_id).await;
    orchestrator.shutdown().await.expect("shutdown");

    assert_eq!(done.status, Status::Failed);
    assert_eq!(done.progress_percentage, 100.0);
    assert!(done.tasks.iter().all(|t| t.status == Status::Failed));
    let message = done.error_message.expect("error message");
    assert!(message.contains("m1"), "message was: {}", message);
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test]
async fn scenario_d_one_exhausted_task_fails_job_and_keeps_successes() {
    let backend = Arc::new(ScriptedBackend::new([1], Duration::from_millis(5)));
    let mut config = config(3);
    // Keep m1 selectable while task 1 burns through its retries.
    config.fallback.failure_threshold = 10;
    let orchestrator = build(config, backend.clone());
    orchestrator.start().await.expect("start");

    let receipt = orchestrator
        .submit(&images(3).with_allow_fallback(false))
        .await
        .expect("submit");
    let done = wait_resolved(&orchestrator, receipt.job_id).await;
    orchestrator.shutdown().await.expect("shutdown");

    assert_eq!(done.status, Status::Failed);
    assert_eq!(done.progress_percentage, 100.0);

    let by_index: HashMap<u32, _> = done.tasks.iter().map(|t| (t.index, t)).collect();
    assert_eq!(by_index[&0].status, Status::Completed);
    assert_eq!(by_index[&2].status, Status::Completed);
    assert!(by_index[&0].asset_reference.is_some());

    let failed = by_index[&1];
    assert_eq!(failed.status, Status::Failed);
    assert_eq!(failed.attempt_count, 3);
    assert!(failed
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("cannot be rendered"));
    assert_eq!(backend.failing_calls(), 3);
}

#[tokio::test]
async fn scenario_e_cancel_stops_retries_and_keeps_outcomes() {
    let backend = Arc::new(ScriptedBackend::new([1], Duration::from_millis(5)));
    let mut config = config(2);
    config.fallback.failure_threshold = 1_000;
    config.fallback.max_retries = 1_000;
    config.fallback.backoff = BackoffSchedule::new(Duration::from_millis(40), Duration::from_millis(40));
    let orchestrator = build(config, backend.clone());
    orchestrator.start().await.expect("start");

    let receipt = orchestrator
        .submit(&images(2).with_allow_fallback(false))
        .await
        .expect("submit");

    // Task 0 succeeds, task 1 keeps retrying.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = orchestrator.get_status(receipt.job_id).await.expect("status");
            if status.tasks[0].status == Status::Completed && backend.failing_calls() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("retries never started");

    let cancelled = orchestrator
        .cancel(receipt.job_id, "user abort")
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, Status::Failed);
    assert_eq!(cancelled.error_message.as_deref(), Some("cancelled: user abort"));
    let calls_at_cancel = backend.failing_calls();

    let done = wait_resolved(&orchestrator, receipt.job_id).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    orchestrator.shutdown().await.expect("shutdown");

    // At most the attempt already in flight finishes after the cancel.
    assert!(backend.failing_calls() <= calls_at_cancel + 1);

    assert_eq!(done.status, Status::Failed);
    assert_eq!(done.error_message.as_deref(), Some("cancelled: user abort"));
    assert_eq!(done.tasks[0].status, Status::Completed);
    assert!(done.tasks[0].asset_reference.is_some());
    assert_eq!(done.tasks[1].status, Status::Failed);
    assert_eq!(done.progress_percentage, 100.0);

    assert!(matches!(
        orchestrator.cancel(receipt.job_id, "again").await,
        Err(media_forge::OrchestratorError::AlreadyTerminal(_))
    ));
}

#[tokio::test]
async fn fallback_takes_over_once_threshold_is_crossed_mid_job() {
    let backend = fixed_backend();
    backend.set_unavailable("m1", true);
    let mut config = config(1);
    config.fallback.failure_threshold = 2;
    config.fallback.max_retries = 3;
    let orchestrator = build(config, backend.clone());
    orchestrator.start().await.expect("start");

    let receipt = orchestrator
        .submit(&images(3).with_allow_fallback(true))
        .await
        .expect("submit");
    let done = wait_resolved(&orchestrator, receipt.job_id).await;
    orchestrator.shutdown().await.expect("shutdown");

    assert_eq!(done.status, Status::Completed);
    // Two failures flag m1; everything after lands on m2.
    assert_eq!(backend.calls("m1"), 2);
    for task in &done.tasks {
        assert_eq!(task.model_used.as_deref(), Some("m2"));
    }
    assert!(!orchestrator.registry().get_health("m1").available);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_jobs_on_five_workers() {
    let backend = fixed_backend();
    let orchestrator = Arc::new(build(config(5), backend.clone()));
    orchestrator.start().await.expect("start");

    let submissions = (0..100).map(|_| {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.submit(&images(2)).await })
    });
    let mut job_ids = Vec::new();
    for handle in futures::future::join_all(submissions).await {
        job_ids.push(handle.expect("join").expect("submit").job_id);
    }

    for job_id in &job_ids {
        let done = wait_resolved(&orchestrator, *job_id).await;
        assert_eq!(done.status, Status::Completed);
        assert_eq!(done.progress_percentage, 100.0);
    }
    orchestrator.shutdown().await.expect("shutdown");

    assert_eq!(backend.total_calls(), 200);
    assert!(
        backend.peak_concurrency() <= 5,
        "peak concurrency was {}",
        backend.peak_concurrency()
    );
    let stats = orchestrator.pool_stats().await;
    assert_eq!(stats.tasks_completed, 200);
}

#[tokio::test]
async fn invalid_request_is_rejected_without_side_effects() {
    let orchestrator = build(config(1), fixed_backend());
    let err = orchestrator
        .submit(&GenerationRequest::new(SCRIPT, Vec::new(), 2))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        media_forge::OrchestratorError::Validation(media_forge::ValidationError::NoAssetTypes)
    ));
}
