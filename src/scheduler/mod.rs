//! Job scheduling: job model, state machine, task queue, dispatch and workers.
//!
//! - **GenerationDispatcher**: validates requests, plans assets, persists
//!   the job and enqueues one task per asset
//! - **TaskQueue**: shared FIFO of asset tasks (in-process or Redis with a
//!   processing list for crash recovery)
//! - **AssetWorkerPool**: fixed-size pool that runs each task against the
//!   generation backend with retries and model fallback
//! - **state**: the job state machine every task transition goes through
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Dispatcher  │
//!                      └──────┬───────┘
//!                             │ one task per asset
//!                      ┌──────▼───────┐
//!                      │  Task Queue  │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──────── Job Store + Health Registry ──┘
//! ```

pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod state;
pub mod worker_pool;

pub use dispatcher::{validate_request, DispatchSettings, GenerationDispatcher};
pub use job::{
    AssetMetadata, AssetParams, AssetSpec, AssetTask, AssetType, GenerationJob,
    GenerationRequest, Status,
};
pub use queue::{InMemoryTaskQueue, QueueError, QueuedTask, RedisTaskQueue, TaskQueue};
pub use state::{FailurePolicy, TaskResolution, TaskSuccess, TransitionError};
pub use worker_pool::{AssetWorkerPool, PoolError, PoolStats, WorkerContext, WorkerPoolConfig};
