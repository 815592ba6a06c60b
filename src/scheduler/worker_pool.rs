//! Asset worker pool.
//!
//! A fixed number of workers drain the shared [`TaskQueue`]. Each worker
//! handles one asset task at a time, so the pool size caps the number of
//! concurrent calls into the generation backend across all jobs.
//!
//! # Per-task flow
//!
//! 1. Mark the task `generating` (the first start flips the job too)
//! 2. Select a model through the health registry
//! 3. Call the backend with a per-attempt timeout
//! 4. On retryable failure, back off and select again, up to `max_retries`
//! 5. Record the outcome through the job state machine and ack the task
//!
//! Cancellation is cooperative: a worker checks the job's flag while it
//! waits between attempts and never interrupts an attempt in flight.
//! When the job store is unreachable, workers stop taking new work and
//! poll the store with exponential backoff until it recovers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{AssetTask, GenerationJob, Status};
use super::queue::{QueuedTask, TaskQueue};
use super::state::{self, FailurePolicy, TaskResolution, TaskSuccess, TransitionError};
use crate::backend::GenerationBackend;
use crate::error::GenerationError;
use crate::health::{AttemptOutcome, FailureKind, FallbackPolicy, ModelHealthRegistry};
use crate::metrics::MetricsCollector;
use crate::progress::ProgressPublisher;
use crate::storage::{JobMutation, JobStore, JobUpdate};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Upper bound on a single backend call.
    #[serde(with = "crate::config::duration_ms")]
    pub attempt_timeout: Duration,
    /// Queue wait per poll, and the granularity of cancellation checks.
    #[serde(with = "crate::config::duration_ms")]
    pub poll_interval: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub shutdown_timeout: Duration,
    /// First delay when polling an unreachable job store.
    #[serde(with = "crate::config::duration_ms")]
    pub store_backoff_base: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub store_backoff_cap: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            attempt_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            store_backoff_base: Duration::from_millis(100),
            store_backoff_cap: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_store_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.store_backoff_base = base;
        self.store_backoff_cap = cap;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently holding a task.
    pub active_workers: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Backend calls issued, including retries.
    pub attempts: u64,
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Tasks resolved either way.
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Share of resolved tasks that completed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    attempts: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_resolution(&self, status: Status, duration: Duration) {
        let counter = if status == Status::Completed {
            &self.tasks_completed
        } else {
            &self.tasks_failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            attempts: self.attempts.load(Ordering::SeqCst),
            average_task_duration: average,
        }
    }
}

/// Components every worker shares.
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub backend: Arc<dyn GenerationBackend>,
    pub registry: Arc<ModelHealthRegistry>,
    pub fallback: FallbackPolicy,
    pub failure_policy: FailurePolicy,
    pub publisher: ProgressPublisher,
    pub metrics: MetricsCollector,
}

/// Fixed-size pool of asset workers.
pub struct AssetWorkerPool {
    config: WorkerPoolConfig,
    context: Arc<WorkerContext>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl AssetWorkerPool {
    pub fn new(config: WorkerPoolConfig, context: Arc<WorkerContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            context,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the workers after returning unacknowledged tasks to the queue.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.config.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_workers must be at least 1".into(),
            ));
        }
        if self.config.poll_interval.is_zero() || self.config.store_backoff_base.is_zero() {
            return Err(PoolError::InvalidConfig(
                "poll_interval and store_backoff_base must be greater than zero".into(),
            ));
        }

        match self.context.queue.recover_processing().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered = recovered, "Recovered unacknowledged tasks"),
            Err(e) => warn!(error = %e, "Failed to recover unacknowledged tasks"),
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                ctx: Arc::clone(&self.context),
                config: self.config.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
                stopping: false,
                stats: Arc::clone(&self.stats),
            };
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");
        Ok(())
    }

    /// Signals every worker to stop and waits for in-flight tasks.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        // Workers may already be gone.
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let drain = async {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, drain).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

/// How a worker finished with a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    /// Outcome recorded; the task is acked.
    Resolved(Status),
    /// Nothing to do (job cancelled, terminal or gone); the task is acked.
    Skipped,
    /// Shutdown interrupted the task; it stays unacknowledged for redelivery.
    Abandoned,
}

enum Interrupt {
    Cancelled,
    Shutdown,
}

struct Worker {
    id: String,
    ctx: Arc<WorkerContext>,
    config: WorkerPoolConfig,
    shutdown_rx: broadcast::Receiver<()>,
    /// Set once the shutdown signal has been consumed.
    stopping: bool,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            if self.stopping {
                break;
            }
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.ctx.queue.pop(self.config.poll_interval).await {
                Ok(Some(queued)) => {
                    if let Ok(depth) = self.ctx.queue.len().await {
                        self.ctx.metrics.set_queue_depth(depth);
                    }
                    self.process_task(queued).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to pop task");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_task(&mut self, queued: QueuedTask) {
        let started = Instant::now();
        self.stats.increment_active();
        self.ctx.metrics.worker_busy();

        let handled = self.handle(&queued).await;

        self.stats.decrement_active();
        self.ctx.metrics.worker_idle();

        if let Handled::Resolved(status) = handled {
            self.stats.record_resolution(status, started.elapsed());
        }
        if handled != Handled::Abandoned {
            if let Err(e) = self.ctx.queue.ack(&queued).await {
                error!(
                    worker_id = %self.id,
                    task_id = %queued.task_id,
                    error = %e,
                    "Failed to ack task"
                );
            }
        }
    }

    async fn handle(&mut self, queued: &QueuedTask) -> Handled {
        let job_id = queued.job_id;
        let task_id = queued.task_id;

        let start = move || -> JobMutation {
            Box::new(move |job: &mut GenerationJob| {
                state::start_task(job, task_id, Utc::now()).map(|_| ())
            })
        };
        let Some(update) = self.persist(job_id, start).await else {
            return self.unpersisted();
        };

        match &update.outcome {
            Ok(()) => {
                if update.started_job() {
                    info!(worker_id = %self.id, job_id = %job_id, "Job started generating");
                }
                self.ctx.publisher.publish(&update.job);
            }
            Err(TransitionError::InvalidTaskTransition {
                from: Status::Generating,
                ..
            }) if !update.job.is_terminal() => {
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    task_id = %task_id,
                    "Resuming redelivered task"
                );
            }
            Err(reason) => {
                debug!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    task_id = %task_id,
                    reason = %reason,
                    "Skipping task"
                );
                return Handled::Skipped;
            }
        }

        let job = update.job;
        let Some(task) = job.task(task_id).cloned() else {
            return Handled::Skipped;
        };

        let Some((attempts, resolution)) = self.generate_with_retries(&job, &task).await else {
            return Handled::Abandoned;
        };

        let policy = self.ctx.failure_policy;
        let resolve = move || -> JobMutation {
            let resolution = resolution.clone();
            Box::new(move |job: &mut GenerationJob| {
                state::resolve_task(job, task_id, attempts, resolution, &policy, Utc::now())
                    .map(|_| ())
            })
        };
        let Some(update) = self.persist(job_id, resolve).await else {
            return self.unpersisted();
        };
        if let Err(reason) = &update.outcome {
            warn!(
                worker_id = %self.id,
                job_id = %job_id,
                task_id = %task_id,
                reason = %reason,
                "Task outcome rejected"
            );
            return Handled::Skipped;
        }

        self.record_resolution(&update, task_id);
        self.ctx.publisher.publish(&update.job);

        update
            .job
            .task(task_id)
            .map_or(Handled::Skipped, |t| Handled::Resolved(t.status))
    }

    fn unpersisted(&self) -> Handled {
        if self.stopping {
            Handled::Abandoned
        } else {
            Handled::Skipped
        }
    }

    fn record_resolution(&self, update: &JobUpdate, task_id: Uuid) {
        let job = &update.job;
        if let Some(task) = job.task(task_id) {
            self.ctx
                .metrics
                .record_task_resolved(task.asset_type.as_str(), task.status.as_str());
            info!(
                worker_id = %self.id,
                job_id = %job.id,
                task_id = %task_id,
                status = %task.status,
                model = task.model_used.as_deref().unwrap_or("-"),
                attempt = task.attempt_count,
                progress = job.progress_percentage,
                "Task resolved"
            );
        }

        if update.became_terminal() {
            self.ctx.metrics.record_job_finished(job.status.as_str());
            match job.status {
                Status::Completed => info!(job_id = %job.id, "Job completed"),
                _ => warn!(
                    job_id = %job.id,
                    error = job.error_message.as_deref().unwrap_or(""),
                    "Job failed"
                ),
            }
        }
    }

    /// Runs attempts until one succeeds, retries run out, or the job is cancelled.
    ///
    /// Returns the attempt count and the resolution to record, or `None`
    /// when shutdown interrupts a retry wait.
    async fn generate_with_retries(
        &mut self,
        job: &GenerationJob,
        task: &AssetTask,
    ) -> Option<(u32, TaskResolution)> {
        let max_attempts = self.ctx.fallback.max_attempts();
        let fallbacks = self.ctx.fallback.fallbacks_for(&job.preferred_model);
        let mut attempts = 0;
        let mut last_model: Option<String> = None;

        loop {
            if attempts > 0 {
                let delay = self.ctx.fallback.backoff.delay_for(attempts - 1);
                match self.pause_between_attempts(job.id, delay).await {
                    Ok(()) => {}
                    Err(Interrupt::Cancelled) => {
                        info!(
                            worker_id = %self.id,
                            job_id = %job.id,
                            task_id = %task.id,
                            attempt = attempts,
                            "Job cancelled, stopping retries"
                        );
                        let resolution = TaskResolution::Failed {
                            error: GenerationError::Cancelled.to_string(),
                            model: last_model,
                        };
                        return Some((attempts, resolution));
                    }
                    Err(Interrupt::Shutdown) => return None,
                }
            }

            attempts += 1;
            match self.attempt(job, task, &fallbacks, attempts).await {
                Ok(success) => return Some((attempts, TaskResolution::Completed(success))),
                Err((err, model)) => {
                    if model.is_some() {
                        last_model = model;
                    }
                    let retryable = err.is_retryable();
                    if !retryable || attempts >= max_attempts {
                        warn!(
                            worker_id = %self.id,
                            job_id = %job.id,
                            task_id = %task.id,
                            attempt = attempts,
                            error = %err,
                            retryable = retryable,
                            "Task failed"
                        );
                        let resolution = TaskResolution::Failed {
                            error: err.to_string(),
                            model: last_model,
                        };
                        return Some((attempts, resolution));
                    }
                    debug!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        task_id = %task.id,
                        attempt = attempts,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                }
            }
        }
    }

    /// One model selection plus one backend call.
    ///
    /// On failure also returns the model that was tried, if any.
    async fn attempt(
        &self,
        job: &GenerationJob,
        task: &AssetTask,
        fallbacks: &[String],
        attempt: u32,
    ) -> Result<TaskSuccess, (GenerationError, Option<String>)> {
        let model = self
            .ctx
            .registry
            .select_model(&job.preferred_model, fallbacks, job.allow_fallback)
            .map_err(|e| (GenerationError::from(e), None))?;
        let fallback_used = model != job.preferred_model;
        if fallback_used {
            info!(
                worker_id = %self.id,
                job_id = %job.id,
                task_id = %task.id,
                model = %model,
                preferred = %job.preferred_model,
                attempt = attempt,
                "Using fallback model"
            );
            self.ctx.metrics.record_fallback(&job.preferred_model, &model);
        }

        self.stats.record_attempt();
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.attempt_timeout,
            self.ctx.backend.generate(&model, &task.spec),
        )
        .await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(GenerationError::Backend {
                model: model.clone(),
                source,
            }),
            Err(_) => Err(GenerationError::Timeout {
                model: model.clone(),
                after: self.config.attempt_timeout,
            }),
        };

        match outcome {
            Ok(output) => {
                self.ctx.registry.record_outcome(
                    &model,
                    AttemptOutcome::Success {
                        latency: elapsed,
                        rate_limit_remaining: output.rate_limit_remaining,
                    },
                );
                self.ctx
                    .metrics
                    .record_attempt(&model, "success", elapsed.as_secs_f64());
                self.ctx.metrics.set_model_available(&model, true);

                Ok(TaskSuccess {
                    model_used: model,
                    fallback_used,
                    generation_time_ms: output.latency_ms,
                    quality_score: output.quality_score,
                    asset_reference: output.asset_reference,
                    metadata: output.metadata,
                })
            }
            Err(err) => {
                if let Some(kind) = FailureKind::from_error(&err) {
                    self.ctx.registry.record_outcome(
                        &model,
                        AttemptOutcome::Failure {
                            latency: elapsed,
                            kind,
                        },
                    );
                }
                self.ctx
                    .metrics
                    .record_attempt(&model, err.kind(), elapsed.as_secs_f64());
                let available = self.ctx.registry.get_health(&model).available;
                self.ctx.metrics.set_model_available(&model, available);
                Err((err, Some(model)))
            }
        }
    }

    /// Sleeps out a retry delay in `poll_interval` steps, checking the
    /// job's cancellation flag after each step.
    async fn pause_between_attempts(
        &mut self,
        job_id: Uuid,
        delay: Duration,
    ) -> Result<(), Interrupt> {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_cancelled(job_id).await {
                return Err(Interrupt::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let step = remaining.min(self.config.poll_interval);
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    self.stopping = true;
                    return Err(Interrupt::Shutdown);
                }
                _ = tokio::time::sleep(step) => {}
            }
        }
    }

    async fn is_cancelled(&self, job_id: Uuid) -> bool {
        match self.ctx.store.get_job(job_id).await {
            Ok(Some(job)) => job.cancelled || job.is_terminal(),
            Ok(None) => true,
            // Keep retrying; the outcome write will wait for the store.
            Err(_) => false,
        }
    }

    /// Applies a transition, waiting out store outages.
    ///
    /// `make` is called once per try. Returns `None` on a non-transient
    /// store error or when shutdown arrives during an outage.
    async fn persist<F>(&mut self, job_id: Uuid, make: F) -> Option<JobUpdate>
    where
        F: Fn() -> JobMutation,
    {
        loop {
            match self.ctx.store.update_job(job_id, make()).await {
                Ok(update) => return Some(update),
                Err(e) if e.is_unavailable() => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Job store unavailable, pausing"
                    );
                    if !self.wait_for_store().await {
                        return None;
                    }
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Failed to persist task transition"
                    );
                    return None;
                }
            }
        }
    }

    /// Polls the store with exponential backoff until it answers.
    ///
    /// Returns `false` if shutdown was signalled first.
    async fn wait_for_store(&mut self) -> bool {
        let mut delay = self.config.store_backoff_base;
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    self.stopping = true;
                    return false;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.ctx.store.ping().await {
                Ok(()) => {
                    info!(worker_id = %self.id, "Job store reachable again");
                    return true;
                }
                Err(e) => {
                    debug!(
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Job store still unavailable"
                    );
                    delay = (delay * 2).min(self.config.store_backoff_cap);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FixedLatencyBackend;
    use crate::error::BackendError;
    use crate::health::{BackoffSchedule, RegistryConfig};
    use crate::progress::BroadcastNotifier;
    use crate::scheduler::job::{AssetParams, AssetSpec, AssetType};
    use crate::scheduler::queue::InMemoryTaskQueue;
    use crate::storage::InMemoryJobStore;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryTaskQueue>,
        backend: Arc<FixedLatencyBackend>,
        context: Arc<WorkerContext>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let backend = Arc::new(FixedLatencyBackend::new(Duration::from_millis(5), 0.9));
        let fallback = FallbackPolicy {
            default_model: "m1".into(),
            candidates: vec!["m2".into()],
            max_retries: 2,
            backoff: BackoffSchedule::new(Duration::from_millis(5), Duration::from_millis(20)),
            failure_threshold: 3,
        };
        let context = Arc::new(WorkerContext {
            store: store.clone(),
            queue: queue.clone(),
            backend: backend.clone(),
            registry: Arc::new(ModelHealthRegistry::new(RegistryConfig::default())),
            fallback,
            failure_policy: FailurePolicy::default(),
            publisher: ProgressPublisher::new(
                Arc::new(BroadcastNotifier::new(16)),
                Duration::from_millis(10),
            ),
            metrics: MetricsCollector::new(),
        });
        Harness {
            store,
            queue,
            backend,
            context,
        }
    }

    fn pool_config(workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new(workers)
            .with_poll_interval(Duration::from_millis(10))
            .with_attempt_timeout(Duration::from_secs(2))
            .with_store_backoff(Duration::from_millis(5), Duration::from_millis(20))
    }

    async fn submit(h: &Harness, n: u32) -> GenerationJob {
        let specs = (0..n)
            .map(|i| AssetSpec::new(i, format!("shot {}", i), AssetParams::default_for(AssetType::Image)))
            .collect();
        let job = GenerationJob::new(vec![AssetType::Image], "m1", false, specs);
        h.store.insert_job(&job).await.unwrap();
        for task in &job.tasks {
            h.queue.push(QueuedTask::new(job.id, task.id)).await.unwrap();
        }
        job
    }

    async fn wait_resolved(store: &InMemoryJobStore, job_id: Uuid) -> GenerationJob {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Some(job)) = store.get_job(job_id).await {
                    if job.is_terminal() && job.tasks.iter().all(|t| t.status.is_terminal()) {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not resolve in time")
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.attempt_timeout, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.store_backoff_base, Duration::from_millis(100));
        assert_eq!(config.store_backoff_cap, Duration::from_secs(5));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            tasks_completed: 80,
            tasks_failed: 20,
            attempts: 130,
            average_task_duration: Duration::from_secs(3),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_resolution(Status::Completed, Duration::from_secs(10));
        stats.record_resolution(Status::Completed, Duration::from_secs(20));
        stats.record_resolution(Status::Failed, Duration::from_secs(5));
        stats.increment_active();
        stats.increment_active();
        stats.decrement_active();

        let pool_stats = stats.to_pool_stats(4);
        assert_eq!(pool_stats.tasks_completed, 2);
        assert_eq!(pool_stats.tasks_failed, 1);
        assert_eq!(pool_stats.active_workers, 1);
        assert!(pool_stats.average_task_duration.as_millis() > 11000);
        assert!(pool_stats.average_task_duration.as_millis() < 12000);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(30))
            .to_string()
            .contains("30"));
    }

    #[tokio::test]
    async fn test_pool_lifecycle_errors() {
        let h = harness();
        let mut pool = AssetWorkerPool::new(pool_config(2), h.context.clone());

        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
        pool.start().await.unwrap();
        assert!(pool.is_running());
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));
        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());

        let mut empty = AssetWorkerPool::new(pool_config(0), h.context.clone());
        assert!(matches!(empty.start().await, Err(PoolError::InvalidConfig(_))));

        let mut busy_loop = AssetWorkerPool::new(
            pool_config(1).with_poll_interval(Duration::ZERO),
            h.context.clone(),
        );
        assert!(matches!(busy_loop.start().await, Err(PoolError::InvalidConfig(_))));
        assert!(!busy_loop.is_running());
    }

    #[tokio::test]
    async fn test_pool_completes_job() {
        let h = harness();
        let job = submit(&h, 3).await;
        let mut pool = AssetWorkerPool::new(pool_config(2), h.context.clone());
        pool.start().await.unwrap();

        let done = wait_resolved(&h.store, job.id).await;
        pool.shutdown().await.unwrap();

        assert_eq!(done.status, Status::Completed);
        assert_eq!(done.progress_percentage, 100.0);
        for task in &done.tasks {
            assert_eq!(task.model_used.as_deref(), Some("m1"));
            assert!(!task.fallback_used);
            assert_eq!(task.attempt_count, 1);
            assert!(task.asset_reference.is_some());
        }
        assert_eq!(pool.stats().tasks_completed, 3);
        assert_eq!(h.queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let h = harness();
        h.backend
            .fail_next("m1", BackendError::Unavailable("blip".into()));
        let job = submit(&h, 1).await;
        let mut pool = AssetWorkerPool::new(pool_config(1), h.context.clone());
        pool.start().await.unwrap();

        let done = wait_resolved(&h.store, job.id).await;
        pool.shutdown().await.unwrap();

        assert_eq!(done.status, Status::Completed);
        assert_eq!(done.tasks[0].attempt_count, 2);
        assert_eq!(h.backend.calls("m1"), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_retried() {
        let h = harness();
        h.backend
            .fail_next("m1", BackendError::InvalidRequest("bad prompt".into()));
        let job = submit(&h, 1).await;
        let mut pool = AssetWorkerPool::new(pool_config(1), h.context.clone());
        pool.start().await.unwrap();

        let done = wait_resolved(&h.store, job.id).await;
        pool.shutdown().await.unwrap();

        assert_eq!(done.status, Status::Failed);
        assert_eq!(done.tasks[0].attempt_count, 1);
        assert!(done.tasks[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("bad prompt"));
        assert_eq!(h.backend.calls("m1"), 1);
    }

    #[tokio::test]
    async fn test_workers_wait_out_store_outage() {
        let h = harness();
        let job = submit(&h, 2).await;
        h.store.set_available(false);

        let mut pool = AssetWorkerPool::new(pool_config(2), h.context.clone());
        pool.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.backend.total_calls(), 0);

        h.store.set_available(true);
        let done = wait_resolved(&h.store, job.id).await;
        pool.shutdown().await.unwrap();

        assert_eq!(done.status, Status::Completed);
        assert_eq!(h.backend.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_redelivered_task_is_resumed() {
        let h = harness();
        let job = submit(&h, 1).await;
        let task_id = job.tasks[0].id;

        // Simulate a worker that started the task and crashed before acking.
        let popped = h.queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        h.store
            .update_job(
                job.id,
                Box::new(move |job: &mut GenerationJob| {
                    state::start_task(job, task_id, Utc::now()).map(|_| ())
                }),
            )
            .await
            .unwrap();
        assert_eq!(popped.task_id, task_id);

        let mut pool = AssetWorkerPool::new(pool_config(1), h.context.clone());
        pool.start().await.unwrap();

        let done = wait_resolved(&h.store, job.id).await;
        pool.shutdown().await.unwrap();
        assert_eq!(done.status, Status::Completed);
    }
}
