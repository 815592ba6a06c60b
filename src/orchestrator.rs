//! The orchestrator: single construction point for every subsystem.
//!
//! [`Orchestrator`] wires the job store, task queue, generation backend,
//! health registry, progress publisher, dispatcher and worker pool
//! together, and exposes the surface callers use: `submit`, `get_status`,
//! `cancel` and `health`.
//!
//! # Example
//!
//! ```rust,ignore
//! use media_forge::config::ForgeConfig;
//! use media_forge::orchestrator::Orchestrator;
//! use media_forge::scheduler::{AssetType, GenerationRequest};
//!
//! let orchestrator = Orchestrator::from_config(ForgeConfig::load(None)?).await?;
//! orchestrator.start().await?;
//!
//! let receipt = orchestrator
//!     .submit(&GenerationRequest::new(script, vec![AssetType::Image], 3))
//!     .await?;
//! let status = orchestrator.get_status(receipt.job_id).await?;
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::backend::{self, GenerationBackend};
use crate::config::{ForgeConfig, QueueConfig, StoreConfig};
use crate::error::{OrchestratorError, StoreError};
use crate::health::{HealthReconciler, HealthReport, ModelHealthRegistry};
use crate::metrics::MetricsCollector;
use crate::planner::{ContentPlanner, ScriptPlanner};
use crate::progress::{BroadcastNotifier, JobSnapshot, ProgressPublisher};
use crate::scheduler::state;
use crate::scheduler::{
    AssetWorkerPool, DispatchSettings, GenerationDispatcher, GenerationJob, GenerationRequest,
    InMemoryTaskQueue, PoolError, PoolStats, RedisTaskQueue, Status, TaskQueue, WorkerContext,
};
use crate::storage::{InMemoryJobStore, JobStore, PostgresJobStore};

/// What `submit` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub status: Status,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Externally supplied collaborators.
pub struct Components {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub backend: Arc<dyn GenerationBackend>,
    pub planner: Arc<dyn ContentPlanner>,
}

pub struct Orchestrator {
    config: ForgeConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<ModelHealthRegistry>,
    notifier: Arc<BroadcastNotifier>,
    publisher: ProgressPublisher,
    dispatcher: GenerationDispatcher,
    pool: tokio::sync::Mutex<AssetWorkerPool>,
    reconciler: Mutex<Option<HealthReconciler>>,
    metrics: MetricsCollector,
}

impl Orchestrator {
    /// Builds every component from configuration.
    ///
    /// Connects to Redis and PostgreSQL when configured, running store
    /// migrations first.
    pub async fn from_config(config: ForgeConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let backend = backend::from_config(&config.backend)?;
        let queue: Arc<dyn TaskQueue> = match &config.queue {
            QueueConfig::Memory => Arc::new(InMemoryTaskQueue::new()),
            QueueConfig::Redis { url, queue_name } => {
                Arc::new(RedisTaskQueue::connect(url, queue_name).await?)
            }
        };
        let store: Arc<dyn JobStore> = match &config.store {
            StoreConfig::Memory => Arc::new(InMemoryJobStore::new()),
            StoreConfig::Postgres { url } => {
                let store = PostgresJobStore::connect(url).await?;
                store.run_migrations().await?;
                Arc::new(store)
            }
        };

        info!(
            backend = backend.name(),
            workers = config.pool.num_workers,
            default_model = %config.fallback.default_model,
            "Orchestrator configured"
        );

        Ok(Self::with_components(
            config,
            Components {
                store,
                queue,
                backend,
                planner: Arc::new(ScriptPlanner::new()),
            },
        ))
    }

    /// Wires the given collaborators together. Nothing runs until [`Self::start`].
    pub fn with_components(config: ForgeConfig, components: Components) -> Self {
        let mut models = vec![config.fallback.default_model.clone()];
        models.extend(config.fallback.candidates.iter().cloned());
        models.extend(config.health.critical_models.iter().cloned());
        let registry = Arc::new(ModelHealthRegistry::with_models(
            config.registry_config(),
            models,
        ));

        let notifier = Arc::new(BroadcastNotifier::new(config.progress.channel_capacity));
        let publisher = ProgressPublisher::new(notifier.clone(), config.progress.coalesce_interval);
        let metrics = MetricsCollector::new();

        let dispatcher = GenerationDispatcher::new(
            components.planner,
            components.store.clone(),
            components.queue.clone(),
            registry.clone(),
            DispatchSettings {
                max_assets: config.jobs.max_assets,
                fallback: config.fallback.clone(),
                default_latency_ms: config.health.default_latency_ms,
                num_workers: config.pool.num_workers,
            },
        );

        let context = Arc::new(WorkerContext {
            store: components.store.clone(),
            queue: components.queue,
            backend: components.backend,
            registry: registry.clone(),
            fallback: config.fallback.clone(),
            failure_policy: config.jobs.failure,
            publisher: publisher.clone(),
            metrics: metrics.clone(),
        });
        let pool = AssetWorkerPool::new(config.pool.clone(), context);

        Self {
            config,
            store: components.store,
            registry,
            notifier,
            publisher,
            dispatcher,
            pool: tokio::sync::Mutex::new(pool),
            reconciler: Mutex::new(None),
            metrics,
        }
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelHealthRegistry> {
        &self.registry
    }

    /// Starts the worker pool and the health reconciler.
    pub async fn start(&self) -> Result<(), PoolError> {
        self.pool.lock().await.start().await?;

        let mut reconciler = self.reconciler.lock().unwrap_or_else(PoisonError::into_inner);
        if reconciler.is_none() {
            *reconciler = Some(HealthReconciler::start(
                self.registry.clone(),
                self.config.health.reconcile_interval,
            ));
        }
        Ok(())
    }

    /// Stops the workers, the reconciler, and flushes pending progress.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let result = match self.pool.lock().await.shutdown().await {
            Err(PoolError::NotRunning) => Ok(()),
            other => other,
        };

        let reconciler = self
            .reconciler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reconciler) = reconciler {
            reconciler.stop().await;
        }

        self.publisher.flush_all();
        result
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.lock().await.stats()
    }

    /// Accepts a request and returns once its tasks are queued.
    pub async fn submit(
        &self,
        request: &GenerationRequest,
    ) -> Result<SubmitReceipt, OrchestratorError> {
        let job = self.dispatcher.dispatch(request).await?;
        self.publisher.publish(&job);

        Ok(SubmitReceipt {
            job_id: job.id,
            status: job.status,
            estimated_completion: job.estimated_completion,
        })
    }

    /// Last committed state of a job.
    pub async fn get_status(&self, job_id: Uuid) -> Result<JobSnapshot, OrchestratorError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        Ok(JobSnapshot::from(&job))
    }

    /// Cancels a job. Workers stop retrying its tasks at their next check.
    pub async fn cancel(
        &self,
        job_id: Uuid,
        reason: &str,
    ) -> Result<JobSnapshot, OrchestratorError> {
        let reason_owned = reason.to_string();
        let update = self
            .store
            .update_job(
                job_id,
                Box::new(move |job: &mut GenerationJob| {
                    state::cancel_job(job, &reason_owned, Utc::now())
                }),
            )
            .await?;

        // cancel_job only rejects terminal jobs.
        if update.outcome.is_err() {
            return Err(OrchestratorError::AlreadyTerminal(job_id));
        }

        if update.became_terminal() {
            self.metrics.record_job_finished(update.job.status.as_str());
        }
        info!(job_id = %job_id, reason = reason, "Job cancelled");
        self.publisher.publish(&update.job);
        Ok(JobSnapshot::from(&update.job))
    }

    /// Per-model health and the overall status.
    pub fn health(&self) -> HealthReport {
        self.registry.health_report(
            &self.config.fallback.default_model,
            &self.config.critical_models(),
        )
    }

    /// Receives progress snapshots for every job.
    pub fn subscribe(&self) -> broadcast::Receiver<JobSnapshot> {
        self.notifier.subscribe()
    }
}
