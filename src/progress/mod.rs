//! Progress reporting.
//!
//! Every task transition produces a [`JobSnapshot`]. The [`ProgressPublisher`]
//! throttles snapshots to at most one per job per coalescing interval and
//! hands them to a [`NotificationChannel`]. Delivery is best effort:
//! subscribers treat the job store as the source of truth.

pub mod publisher;
pub mod snapshot;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use publisher::{BroadcastNotifier, NotificationChannel, ProgressPublisher};
pub use snapshot::{JobSnapshot, TaskSummary};

/// Progress publishing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Minimum gap between two emissions for the same job.
    #[serde(with = "crate::config::duration_ms")]
    pub coalesce_interval: Duration,
    /// Buffer size of the broadcast channel.
    pub channel_capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            coalesce_interval: Duration::from_millis(250),
            channel_capacity: 256,
        }
    }
}
