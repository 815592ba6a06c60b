//! Task queues feeding the asset worker pool.
//!
//! Two implementations share the [`TaskQueue`] trait:
//!
//! - [`InMemoryTaskQueue`]: a FIFO guarded by a mutex, for single-process runs
//! - [`RedisTaskQueue`]: a Redis list with reliable dequeue
//!
//! # Queue Structure
//!
//! The Redis queue uses two lists:
//!
//! - `{queue_name}`: tasks waiting for a worker
//! - `{queue_name}:processing`: tasks handed to a worker but not yet acknowledged
//!
//! Tasks move atomically from the main list to the processing list when
//! popped. A worker that crashes leaves its task in the processing list,
//! where [`TaskQueue::recover_processing`] finds it on the next startup.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize task data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Reference to one asset task waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedTask {
    pub fn new(job_id: Uuid, task_id: Uuid) -> Self {
        Self {
            job_id,
            task_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// FIFO of asset tasks shared by the dispatcher and the workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Appends a task to the back of the queue.
    async fn push(&self, task: QueuedTask) -> Result<(), QueueError>;

    /// Takes the next task, waiting up to `timeout` for one to arrive.
    async fn pop(&self, timeout: Duration) -> Result<Option<QueuedTask>, QueueError>;

    /// Acknowledges that a popped task has been handled.
    async fn ack(&self, task: &QueuedTask) -> Result<(), QueueError>;

    /// Number of tasks waiting.
    async fn len(&self) -> Result<usize, QueueError>;

    /// Returns unacknowledged tasks to the queue, reporting how many moved.
    async fn recover_processing(&self) -> Result<usize, QueueError>;

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}

#[derive(Default)]
struct MemoryState {
    waiting: VecDeque<QueuedTask>,
    in_flight: HashMap<Uuid, QueuedTask>,
}

/// Process-local task queue.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let task = state.waiting.pop_front()?;
        state.in_flight.insert(task.task_id, task.clone());
        Some(task)
    }

    /// Number of popped tasks not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .len()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, task: QueuedTask) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.in_flight.remove(&task.task_id);
            state.waiting.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<QueuedTask>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.try_pop() {
                return Ok(Some(task));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(self.try_pop());
            }
        }
    }

    async fn ack(&self, task: &QueuedTask) -> Result<(), QueueError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .remove(&task.task_id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting
            .len())
    }

    async fn recover_processing(&self) -> Result<usize, QueueError> {
        let recovered = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut stranded: Vec<QueuedTask> = state.in_flight.drain().map(|(_, t)| t).collect();
            stranded.sort_by_key(|t| t.enqueued_at);
            let count = stranded.len();
            for task in stranded.into_iter().rev() {
                state.waiting.push_front(task);
            }
            count
        };
        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }
}

/// Shortest block handed to BRPOPLPUSH; a zero timeout would block forever.
const MIN_BLOCK_SECS: f64 = 0.01;

/// Redis-backed task queue with reliable dequeue.
///
/// Uses BRPOPLPUSH so a task is never lost between pop and ack. Blocking
/// pops run on their own connections: Redis serves one connection's
/// commands in order, so a pop parked on the shared manager would hold up
/// every push, ack and len behind it.
pub struct RedisTaskQueue {
    client: redis::Client,
    /// Shared connection for non-blocking commands; reconnects automatically.
    redis: ConnectionManager,
    /// Idle connections reserved for blocking pops.
    blocking: Mutex<Vec<MultiplexedConnection>>,
    queue_name: String,
    processing_queue: String,
}

impl RedisTaskQueue {
    /// Connects to Redis and creates a new task queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            blocking: Mutex::new(Vec::new()),
            queue_name: queue_name.to_string(),
            processing_queue: processing_key(queue_name),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Takes an idle blocking connection, opening one if none is free.
    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, QueueError> {
        let idle = self
            .blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| QueueError::ConnectionFailed(e.to_string())),
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }

    /// Number of idle connections kept for blocking pops.
    pub fn idle_blocking_connections(&self) -> usize {
        self.blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of tasks popped but not yet acknowledged.
    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.processing_queue).await?;
        Ok(len)
    }
}

fn processing_key(queue_name: &str) -> String {
    format!("{}:processing", queue_name)
}

/// BRPOPLPUSH timeout in (fractional) seconds, never zero.
fn block_timeout_secs(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(MIN_BLOCK_SECS)
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, task: QueuedTask) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&task)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<QueuedTask>, QueueError> {
        let mut conn = self.checkout_blocking().await?;
        let timeout_secs = block_timeout_secs(timeout);

        // A failed connection is dropped rather than returned to the pool.
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        self.checkin_blocking(conn);

        match result {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for data in entries {
            if let Ok(entry) = serde_json::from_str::<QueuedTask>(&data) {
                if entry.task_id == task.task_id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &data)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Already removed, e.g. by recover_processing().
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue_name).await?;
        Ok(len)
    }

    async fn recover_processing(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;
        let mut recovered = 0;

        for data in entries {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&self.processing_queue, 1, &data)
                .rpush(&self.queue_name, &data);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(
                queue = %self.queue_name,
                recovered = recovered,
                "Recovered unacknowledged tasks"
            );
        }
        Ok(recovered)
    }
}
