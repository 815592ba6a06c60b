//! media-forge: multi-model media generation orchestrator.
//!
//! Turns a script into a job of asset generation tasks, runs them on a
//! bounded worker pool against external generation models with health
//! tracking and fallback, and publishes throttled progress snapshots.
//!
//! [`orchestrator::Orchestrator`] is the single construction point.

// Core modules
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::ForgeConfig;
pub use error::{
    BackendError, GenerationError, OrchestratorError, SelectionError, StoreError,
    ValidationError,
};
pub use orchestrator::{Components, Orchestrator, SubmitReceipt};
