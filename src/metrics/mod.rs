//! Prometheus metrics for the generation orchestrator.
//!
//! Covers generation attempts, fallbacks, task and job outcomes, queue
//! depth, worker activity, model availability and progress emission.
//!
//! # Example
//!
//! ```ignore
//! use media_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().record_job_submitted();
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
