//! Model health tracking and fallback selection.
//!
//! - **ModelHealthRegistry**: availability, error counts, latency and rate
//!   limits per model, and the `select_model` decision
//! - **FallbackPolicy**: candidate chain, retry budget and backoff schedule
//! - **HealthReconciler**: background decay of error counts so transient
//!   failures heal without manual resets
//!
//! # Example
//!
//! ```
//! use media_forge::health::{ModelHealthRegistry, RegistryConfig};
//!
//! let registry = ModelHealthRegistry::new(RegistryConfig::default());
//! let fallbacks = vec!["sdxl-turbo".to_string()];
//! let model = registry.select_model("flux-pro", &fallbacks, true).unwrap();
//! assert_eq!(model, "flux-pro");
//! ```

pub mod policy;
pub mod registry;

pub use policy::{BackoffSchedule, FallbackPolicy};
pub use registry::{
    AttemptOutcome, FailureKind, HealthReconciler, HealthReport, ModelHealthRecord,
    ModelHealthRegistry, ModelHealthSummary, OverallStatus, RegistryConfig,
};
