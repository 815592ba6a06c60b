//! Generation backends.
//!
//! The orchestrator calls external generation services only through
//! [`GenerationBackend`]. Implementations:
//!
//! - [`FixedLatencyBackend`]: deterministic backend with a fixed delay, for
//!   tests and dry runs
//! - [`HttpBackend`]: JSON-over-HTTP generation service
//!
//! Which one runs is decided by configuration ([`crate::config::BackendConfig`]).

pub mod fixed;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::scheduler::job::{AssetMetadata, AssetSpec};

pub use fixed::FixedLatencyBackend;
pub use http::HttpBackend;

/// Successful result of one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Opaque handle to the produced artifact.
    pub asset_reference: String,
    pub quality_score: f64,
    /// Latency as measured by the backend.
    pub latency_ms: u64,
    #[serde(default)]
    pub metadata: Option<AssetMetadata>,
    #[serde(default)]
    pub rate_limit_remaining: Option<u32>,
}

/// An external service that turns an asset spec into an artifact.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generates one asset on `model_id`.
    async fn generate(
        &self,
        model_id: &str,
        spec: &AssetSpec,
    ) -> Result<GenerationOutput, BackendError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Builds the backend selected by `config`.
pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn GenerationBackend>, BackendError> {
    match config {
        BackendConfig::Fixed {
            latency_ms,
            quality_score,
            unavailable_models,
        } => {
            let backend = FixedLatencyBackend::new(
                std::time::Duration::from_millis(*latency_ms),
                *quality_score,
            );
            for model in unavailable_models {
                backend.set_unavailable(model, true);
            }
            Ok(Arc::new(backend))
        }
        BackendConfig::Http {
            base_url,
            api_key,
            request_timeout,
        } => Ok(Arc::new(HttpBackend::new(
            base_url.clone(),
            api_key.clone(),
            *request_timeout,
        )?)),
    }
}
