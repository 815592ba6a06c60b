//! Coalescing progress publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use super::snapshot::JobSnapshot;
use crate::metrics::MetricsCollector;
use crate::scheduler::job::GenerationJob;

/// Fire-and-forget sink for progress snapshots.
pub trait NotificationChannel: Send + Sync {
    /// Delivers `snapshot` to current listeners. Never blocks, never retries.
    fn notify(&self, snapshot: JobSnapshot);
}

/// Fan-out channel backed by `tokio::sync::broadcast`.
///
/// Slow receivers observe `RecvError::Lagged`; with no receivers, snapshots
/// are dropped.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<JobSnapshot>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobSnapshot> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl NotificationChannel for BroadcastNotifier {
    fn notify(&self, snapshot: JobSnapshot) {
        // A send error only means there are no receivers.
        let _ = self.sender.send(snapshot);
    }
}

#[derive(Default)]
struct Slot {
    last_emit: Option<Instant>,
    /// `(updated_at, progress)` of the last emitted snapshot.
    last_emitted: Option<(DateTime<Utc>, f64)>,
    pending: Option<JobSnapshot>,
    flush_scheduled: bool,
    terminal_emitted: bool,
}

impl Slot {
    fn is_stale(&self, snapshot: &JobSnapshot) -> bool {
        self.last_emitted
            .is_some_and(|key| (snapshot.updated_at, snapshot.progress_percentage) < key)
    }

    fn mark_emitted(&mut self, snapshot: &JobSnapshot, now: Instant) {
        self.last_emit = Some(now);
        self.last_emitted = Some((snapshot.updated_at, snapshot.progress_percentage));
        self.terminal_emitted = snapshot.is_terminal();
    }

    fn is_idle(&self, now: Instant, interval: Duration) -> bool {
        self.terminal_emitted
            && !self.flush_scheduled
            && self.pending.is_none()
            && self
                .last_emit
                .map_or(true, |at| now.duration_since(at) >= interval)
    }
}

struct Shared {
    interval: Duration,
    channel: Arc<dyn NotificationChannel>,
    slots: Mutex<HashMap<Uuid, Slot>>,
    emitted: AtomicU64,
    metrics: MetricsCollector,
}

impl Shared {
    fn emit(&self, snapshot: JobSnapshot) {
        tracing::trace!(
            job_id = %snapshot.job_id,
            progress = snapshot.progress_percentage,
            status = %snapshot.status,
            "Emitting progress snapshot"
        );
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_progress_event();
        self.channel.notify(snapshot);
    }

    fn flush(&self, job_id: Uuid) {
        let snapshot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(slot) = slots.get_mut(&job_id) else {
                return;
            };
            slot.flush_scheduled = false;
            let Some(snapshot) = slot.pending.take() else {
                return;
            };
            if slot.is_stale(&snapshot) {
                return;
            }
            slot.mark_emitted(&snapshot, Instant::now());
            snapshot
        };
        self.emit(snapshot);
    }
}

/// Turns job transitions into throttled progress events.
///
/// Emits at most one snapshot per job per coalescing interval. The first
/// change after a quiet period goes out immediately; changes inside the
/// interval are merged and the latest one is flushed when the interval
/// ends, so the final state of a job is always delivered.
#[derive(Clone)]
pub struct ProgressPublisher {
    shared: Arc<Shared>,
}

impl ProgressPublisher {
    pub fn new(channel: Arc<dyn NotificationChannel>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                interval,
                channel,
                slots: Mutex::new(HashMap::new()),
                emitted: AtomicU64::new(0),
                metrics: MetricsCollector::new(),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Snapshots emitted so far, across all jobs.
    pub fn emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::Relaxed)
    }

    /// Publishes the current state of `job`.
    pub fn publish(&self, job: &GenerationJob) {
        self.publish_snapshot(JobSnapshot::from(job));
    }

    /// Publishes `snapshot`, subject to coalescing.
    ///
    /// Must be called from within a tokio runtime for trailing flushes to run.
    pub fn publish_snapshot(&self, snapshot: JobSnapshot) {
        let interval = self.shared.interval;
        let job_id = snapshot.job_id;
        let now = Instant::now();

        let emit_now = {
            let mut slots = self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|id, slot| *id == job_id || !slot.is_idle(now, interval));
            let slot = slots.entry(job_id).or_default();

            if slot.is_stale(&snapshot) {
                return;
            }

            if slot.flush_scheduled {
                if slot.pending.as_ref().map_or(true, |p| snapshot.supersedes(p)) {
                    slot.pending = Some(snapshot);
                }
                None
            } else {
                match slot.last_emit {
                    Some(at) if now.duration_since(at) < interval => {
                        let delay = interval - now.duration_since(at);
                        match tokio::runtime::Handle::try_current() {
                            Ok(handle) => {
                                slot.pending = Some(snapshot);
                                slot.flush_scheduled = true;
                                let shared = Arc::clone(&self.shared);
                                handle.spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    shared.flush(job_id);
                                });
                            }
                            Err(_) => {
                                tracing::warn!(
                                    job_id = %job_id,
                                    "No runtime for trailing progress flush, dropping snapshot"
                                );
                            }
                        }
                        None
                    }
                    _ => {
                        slot.mark_emitted(&snapshot, now);
                        Some(snapshot)
                    }
                }
            }
        };

        if let Some(snapshot) = emit_now {
            self.shared.emit(snapshot);
        }
    }

    /// Emits every pending snapshot immediately. Used on shutdown.
    pub fn flush_all(&self) {
        let pending: Vec<Uuid> = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, slot)| slot.pending.is_some())
            .map(|(id, _)| *id)
            .collect();
        for job_id in pending {
            self.shared.flush(job_id);
        }
    }
}
