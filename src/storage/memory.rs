//! Process-local job store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::{JobMutation, JobStore, JobUpdate};
use crate::error::StoreError;
use crate::scheduler::job::{AssetTask, GenerationJob};

/// Job store backed by a `HashMap`.
///
/// Availability can be switched off to simulate an outage: every call then
/// fails with [`StoreError::Unavailable`].
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, GenerationJob>>,
    available: AtomicBool,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".into()))
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &GenerationJob) -> Result<(), StoreError> {
        self.check()?;
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>, StoreError> {
        self.check()?;
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned())
    }

    async fn list_tasks(&self, job_id: Uuid) -> Result<Vec<AssetTask>, StoreError> {
        self.check()?;
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .map(|job| job.tasks.clone())
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn update_job(
        &self,
        job_id: Uuid,
        mutation: JobMutation,
    ) -> Result<JobUpdate, StoreError> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;

        let previous_status = stored.status;
        let mut working = stored.clone();
        let outcome = mutation(&mut working);
        if outcome.is_ok() {
            *stored = working;
        }

        Ok(JobUpdate {
            previous_status,
            job: stored.clone(),
            outcome,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}
