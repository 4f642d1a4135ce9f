//! Locally known pod set and GPU availability
//!
//! The store is the only state shared between the reconciler (background
//! merges) and the action coordinator (optimistic updates). Every write goes
//! through one of the methods below, which take the write lock for the whole
//! mutation, so callers never lock externally.
//!
//! ## Sequence numbers
//!
//! Every fetch and every local update draws a number from the same monotonic
//! counter. A record remembers the number of the write that produced it and
//! a merge carrying an older number leaves it alone:
//!
//! ```text
//! seq 7  reconciler starts list_pods()      (slow)
//! seq 8  stop(p1) succeeds -> p1 = Stopped  (record seq 8)
//! seq 7  merge arrives with p1 = Running    -> skipped, p1 stays Stopped
//! ```

use chrono::{DateTime, Utc};
use podfleet_core::{sort_gpu_types, GpuSortKey, GpuType, Pod, PodId, PodPatch, PodStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct PodRecord {
    pod: Pod,
    seq: u64,
    /// Missing from the last merge; removed if the next one misses it too
    vanishing: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    pods: HashMap<PodId, PodRecord>,
    gpu_types: Vec<GpuType>,
    gpu_seq: u64,
    /// Highest fetch sequence merged so far
    merged_seq: u64,
    stale: bool,
    last_error: Option<String>,
    last_refreshed_at: Option<DateTime<Utc>>,
}

/// One pod as seen in a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PodEntry {
    pub pod: Pod,
    pub vanishing: bool,
    pub sequence: u64,
}

/// Immutable view of the store at one instant
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Sorted by pod name, then id
    pub pods: Vec<PodEntry>,
    /// Out-of-stock entries last, provider order otherwise
    pub gpu_types: Vec<GpuType>,
    /// Last refresh failed; data is the last known good
    pub stale: bool,
    pub last_error: Option<String>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn pod(&self, id: &PodId) -> Option<&Pod> {
        self.pods.iter().find(|e| &e.pod.id == id).map(|e| &e.pod)
    }

    pub fn gpu_type(&self, id: &str) -> Option<&GpuType> {
        self.gpu_types.iter().find(|g| g.id == id)
    }

    pub fn running_count(&self) -> usize {
        self.pods
            .iter()
            .filter(|e| e.pod.status == PodStatus::Running)
            .count()
    }

    /// Hourly spend of every pod still holding a GPU
    pub fn total_cost_per_hour(&self) -> f64 {
        self.pods
            .iter()
            .filter(|e| e.pod.status.is_active())
            .map(|e| e.pod.cost_per_hour)
            .sum()
    }

    /// Availability listing re-sorted by a caller key
    pub fn gpu_availability_sorted(&self, key: GpuSortKey) -> Vec<GpuType> {
        let mut gpus = self.gpu_types.clone();
        sort_gpu_types(&mut gpus, Some(key));
        gpus
    }
}

/// Outcome of one [`StateStore::merge_pods`] call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub sequence: u64,
    pub added: Vec<PodId>,
    pub changed: Vec<PodId>,
    pub vanishing: Vec<PodId>,
    pub removed: Vec<PodId>,
    /// Observed entries ignored because the store holds newer data
    pub skipped_stale: Vec<PodId>,
}

impl MergeReport {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty()
            && self.changed.is_empty()
            && self.vanishing.is_empty()
            && self.removed.is_empty())
    }
}

/// Single source of truth for pods and GPU availability
#[derive(Debug, Default)]
pub struct StateStore {
    inner: RwLock<StoreInner>,
    sequence: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw the next sequence number
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().await;
        let mut pods: Vec<PodEntry> = inner
            .pods
            .values()
            .map(|r| PodEntry {
                pod: r.pod.clone(),
                vanishing: r.vanishing,
                sequence: r.seq,
            })
            .collect();
        pods.sort_by(|a, b| {
            a.pod
                .name
                .cmp(&b.pod.name)
                .then_with(|| a.pod.id.cmp(&b.pod.id))
        });

        Snapshot {
            pods,
            gpu_types: inner.gpu_types.clone(),
            stale: inner.stale,
            last_error: inner.last_error.clone(),
            last_refreshed_at: inner.last_refreshed_at,
            sequence: inner.merged_seq,
            taken_at: Utc::now(),
        }
    }

    pub async fn pod(&self, id: &PodId) -> Option<Pod> {
        self.inner.read().await.pods.get(id).map(|r| r.pod.clone())
    }

    /// Merge an authoritative pod listing fetched under `seq`
    pub async fn merge_pods(&self, seq: u64, observed: Vec<Pod>) -> MergeReport {
        let mut inner = self.inner.write().await;
        let mut report = MergeReport {
            sequence: seq,
            ..Default::default()
        };
        let newest = seq >= inner.merged_seq;
        let mut seen = HashSet::with_capacity(observed.len());

        for mut pod in observed {
            seen.insert(pod.id.clone());

            match inner.pods.get_mut(&pod.id) {
                Some(record) if record.seq > seq => {
                    report.skipped_stale.push(pod.id);
                }
                Some(record) => {
                    if !record.pod.status.can_transition_to(pod.status) {
                        pod.status = record.pod.status;
                    }
                    if !same_observation(&record.pod, &pod) || record.vanishing {
                        report.changed.push(pod.id.clone());
                    }
                    record.pod = pod;
                    record.seq = seq;
                    record.vanishing = false;
                }
                None if !newest => {
                    // An older fetch cannot introduce pods a newer one no longer lists
                    report.skipped_stale.push(pod.id);
                }
                None => {
                    report.added.push(pod.id.clone());
                    inner.pods.insert(
                        pod.id.clone(),
                        PodRecord {
                            pod,
                            seq,
                            vanishing: false,
                        },
                    );
                }
            }
        }

        if newest {
            let mut to_remove = Vec::new();
            for (id, record) in inner.pods.iter_mut() {
                if seen.contains(id) || record.seq > seq {
                    continue;
                }
                if record.vanishing {
                    to_remove.push(id.clone());
                } else {
                    record.vanishing = true;
                    record.seq = seq;
                    report.vanishing.push(id.clone());
                }
            }
            for id in to_remove {
                inner.pods.remove(&id);
                report.removed.push(id);
            }
            inner.merged_seq = seq;
        }

        if report.has_changes() {
            debug!(
                seq,
                added = report.added.len(),
                changed = report.changed.len(),
                vanishing = report.vanishing.len(),
                removed = report.removed.len(),
                "Merged pod listing"
            );
        }

        report
    }

    /// Replace the availability table if `seq` is not older than the last one
    pub async fn merge_gpu_types(&self, seq: u64, mut observed: Vec<GpuType>) -> bool {
        let mut inner = self.inner.write().await;
        if seq < inner.gpu_seq {
            return false;
        }
        sort_gpu_types(&mut observed, None);
        inner.gpu_types = observed;
        inner.gpu_seq = seq;
        true
    }

    /// Optimistic update after a successful action
    ///
    /// Returns the updated pod, or `None` if the store does not know it.
    pub async fn apply_local_update(&self, id: &PodId, patch: &PodPatch) -> Option<Pod> {
        let seq = self.next_sequence();
        let mut inner = self.inner.write().await;
        let record = inner.pods.get_mut(id)?;
        patch.apply(&mut record.pod);
        record.seq = seq;
        record.vanishing = false;
        debug!(pod_id = %id, seq, status = %record.pod.status, "Applied local update");
        Some(record.pod.clone())
    }

    /// Optimistic insert of a freshly created pod
    pub async fn insert_local(&self, pod: Pod) {
        let seq = self.next_sequence();
        let mut inner = self.inner.write().await;
        info!(pod_id = %pod.id, name = %pod.name, seq, "Tracking new pod");
        inner.pods.insert(
            pod.id.clone(),
            PodRecord {
                pod,
                seq,
                vanishing: false,
            },
        );
    }

    pub async fn mark_refreshed(&self) {
        let mut inner = self.inner.write().await;
        inner.stale = false;
        inner.last_error = None;
        inner.last_refreshed_at = Some(Utc::now());
    }

    pub async fn mark_stale(&self, error: impl ToString) {
        let mut inner = self.inner.write().await;
        inner.stale = true;
        inner.last_error = Some(error.to_string());
    }
}

fn same_observation(a: &Pod, b: &Pod) -> bool {
    let mut b = b.clone();
    b.observed_at = a.observed_at;
    *a == b
}
