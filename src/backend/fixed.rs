//! Deterministic fixed-latency backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{GenerationBackend, GenerationOutput};
use crate::error::BackendError;
use crate::scheduler::job::{AssetMetadata, AssetParams, AssetSpec};

/// Sleeps for a fixed latency and returns a synthetic artifact reference.
///
/// Models can be marked unavailable, and per-model failures can be queued
/// with [`FixedLatencyBackend::fail_next`]. The backend also counts calls
/// and tracks peak concurrency.
pub struct FixedLatencyBackend {
    latency: Duration,
    quality_score: f64,
    model_latency: RwLock<HashMap<String, Duration>>,
    unavailable: RwLock<HashSet<String>>,
    scripted: Mutex<HashMap<String, VecDeque<BackendError>>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FixedLatencyBackend {
    pub fn new(latency: Duration, quality_score: f64) -> Self {
        Self {
            latency,
            quality_score,
            model_latency: RwLock::new(HashMap::new()),
            unavailable: RwLock::new(HashSet::new()),
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Overrides the latency for one model.
    pub fn with_model_latency(self, model: &str, latency: Duration) -> Self {
        self.model_latency
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.to_string(), latency);
        self
    }

    pub fn set_unavailable(&self, model: &str, unavailable: bool) {
        let mut set = self.unavailable.write().unwrap_or_else(PoisonError::into_inner);
        if unavailable {
            set.insert(model.to_string());
        } else {
            set.remove(model);
        }
    }

    /// Queues `error` as the result of the next call on `model`.
    pub fn fail_next(&self, model: &str, error: BackendError) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(model.to_string())
            .or_default()
            .push_back(error);
    }

    /// Calls made against `model`, failed ones included.
    pub fn calls(&self, model: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    /// Highest number of calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn latency_for(&self, model: &str) -> Duration {
        self.model_latency
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .copied()
            .unwrap_or(self.latency)
    }

    fn next_scripted(&self, model: &str) -> Option<BackendError> {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(model)
            .and_then(VecDeque::pop_front)
    }
}

fn metadata_for(params: &AssetParams) -> AssetMetadata {
    match params {
        AssetParams::Image { width, height, .. } => AssetMetadata::Image {
            width: *width,
            height: *height,
            format: "png".to_string(),
        },
        AssetParams::Video {
            duration_secs,
            width,
            height,
            fps,
        } => AssetMetadata::Video {
            duration_ms: u64::from(*duration_secs) * 1000,
            width: *width,
            height: *height,
            fps: *fps,
        },
        AssetParams::Audio { duration_secs, .. } => AssetMetadata::Audio {
            duration_ms: u64::from(*duration_secs) * 1000,
            sample_rate: 44_100,
            channels: 2,
        },
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationBackend for FixedLatencyBackend {
    async fn generate(
        &self,
        model_id: &str,
        spec: &AssetSpec,
    ) -> Result<GenerationOutput, BackendError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(model_id.to_string())
            .or_insert(0) += 1;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = self.latency_for(model_id);
        tokio::time::sleep(latency).await;

        if self
            .unavailable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(model_id)
        {
            return Err(BackendError::Unavailable(format!(
                "model {} is offline",
                model_id
            )));
        }
        if let Some(err) = self.next_scripted(model_id) {
            return Err(err);
        }

        Ok(GenerationOutput {
            asset_reference: format!(
                "fixed://{}/{}/{}",
                model_id,
                spec.asset_type(),
                spec.index
            ),
            quality_score: self.quality_score,
            latency_ms: latency.as_millis() as u64,
            metadata: Some(metadata_for(&spec.params)),
            rate_limit_remaining: None,
        })
    }

    fn name(&self) -> &str {
        "fixed"
    }
}
