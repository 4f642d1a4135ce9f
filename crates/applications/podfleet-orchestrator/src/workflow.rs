//! Workflow plumbing shared by deploy, rolling and bulk runs
//!
//! A workflow executor records per-item results on a [`WorkflowRecorder`],
//! which streams progress to the caller and settles into an immutable
//! [`WorkflowRun`]. The caller holds a [`WorkflowHandle`].

use crate::error::{ActionFailure, OrchestratorError, Result};
use crate::rolling::RollingPhase;
use chrono::{DateTime, Utc};
use futures::Stream;
use podfleet_core::PodId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowKind {
    Deploy,
    RollingUpdate,
    Bulk,
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deploy => "deploy",
            Self::RollingUpdate => "rolling-update",
            Self::Bulk => "bulk",
        };
        f.write_str(s)
    }
}

/// Overall outcome of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Succeeded,
    PartialFailure,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::PartialFailure => "partial-failure",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemOutcome {
    Succeeded,
    Failed(ActionFailure),
    Skipped(String),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn failure(&self) -> Option<&ActionFailure> {
        match self {
            Self::Failed(f) => Some(f),
            _ => None,
        }
    }
}

/// Result for one item of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub label: String,
    pub pod_id: Option<PodId>,
    /// Rolling updates only
    pub replacement_pod_id: Option<PodId>,
    pub ticket_id: Option<Uuid>,
    pub outcome: ItemOutcome,
    pub finished_at: DateTime<Utc>,
}

impl ItemResult {
    pub fn new(label: impl Into<String>, outcome: ItemOutcome) -> Self {
        Self {
            label: label.into(),
            pod_id: None,
            replacement_pod_id: None,
            ticket_id: None,
            outcome,
            finished_at: Utc::now(),
        }
    }

    pub fn with_pod(mut self, pod_id: Option<PodId>) -> Self {
        self.pod_id = pod_id;
        self
    }

    pub fn with_replacement(mut self, pod_id: Option<PodId>) -> Self {
        self.replacement_pod_id = pod_id;
        self
    }

    pub fn with_ticket(mut self, ticket_id: Uuid) -> Self {
        self.ticket_id = Some(ticket_id);
        self
    }
}

/// A finished workflow run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub kind: WorkflowKind,
    pub items: Vec<ItemResult>,
    pub status: WorkflowStatus,
    pub first_error: Option<ActionFailure>,
    /// Free-form context: image, GPU type, bulk action, savings
    pub details: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl WorkflowRun {
    pub fn succeeded_count(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed(_)))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Skipped(_)))
            .count()
    }

    /// Lower-cased text the history search matches against
    pub fn search_text(&self) -> String {
        let mut parts = vec![
            self.id.to_string(),
            self.kind.to_string(),
            self.status.to_string(),
        ];
        for item in &self.items {
            parts.push(item.label.clone());
            parts.extend(item.pod_id.iter().map(|p| p.to_string()));
            parts.extend(item.replacement_pod_id.iter().map(|p| p.to_string()));
            match &item.outcome {
                ItemOutcome::Failed(f) => parts.push(f.to_string()),
                ItemOutcome::Skipped(reason) => parts.push(reason.clone()),
                ItemOutcome::Succeeded => {}
            }
        }
        if let Some(err) = &self.first_error {
            parts.push(err.to_string());
        }
        for (k, v) in &self.details {
            parts.push(format!("{}={}", k, v));
        }
        parts.join(" ").to_lowercase()
    }
}

/// First eight hex digits of a run id, used in generated pod names
pub fn short_run_id(id: &Uuid) -> String {
    id.simple().to_string().chars().take(8).collect()
}

/// Status a run settles into
pub fn settle_status(items: &[ItemResult], cancelled: bool) -> WorkflowStatus {
    if cancelled {
        return WorkflowStatus::Cancelled;
    }
    let succeeded = items.iter().filter(|i| i.outcome.is_success()).count();
    if succeeded == items.len() {
        WorkflowStatus::Succeeded
    } else if succeeded == 0 {
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::PartialFailure
    }
}

/// Cooperative cancellation flag
///
/// Cancelling stops a workflow from issuing further items. Calls already
/// handed to the provider run to completion.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Progress reported while a run executes
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowProgress {
    ItemStarted {
        run_id: Uuid,
        label: String,
        pod_id: Option<PodId>,
    },
    ItemFinished {
        run_id: Uuid,
        result: ItemResult,
    },
    Phase {
        run_id: Uuid,
        pod_id: PodId,
        phase: RollingPhase,
    },
    Finished {
        run_id: Uuid,
        status: WorkflowStatus,
    },
}

/// Cloneable sender for progress that does not settle an item
///
/// Concurrent item futures report through this while the recorder itself
/// stays with the loop that records results.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    run_id: Uuid,
    tx: mpsc::UnboundedSender<WorkflowProgress>,
}

impl ProgressSink {
    pub fn item_started(&self, label: &str, pod_id: Option<&PodId>) {
        self.send(WorkflowProgress::ItemStarted {
            run_id: self.run_id,
            label: label.to_string(),
            pod_id: pod_id.cloned(),
        });
    }

    pub fn phase(&self, pod_id: &PodId, phase: RollingPhase) {
        debug!(run_id = %self.run_id, pod_id = %pod_id, ?phase, "Rolling phase");
        self.send(WorkflowProgress::Phase {
            run_id: self.run_id,
            pod_id: pod_id.clone(),
            phase,
        });
    }

    fn send(&self, event: WorkflowProgress) {
        // Nobody listening is fine
        let _ = self.tx.send(event);
    }
}

/// Collects item results for one run and streams progress
pub struct WorkflowRecorder {
    run_id: Uuid,
    kind: WorkflowKind,
    cancel: CancelToken,
    items: Vec<ItemResult>,
    first_error: Option<ActionFailure>,
    details: BTreeMap<String, String>,
    started_at: DateTime<Utc>,
    sink: ProgressSink,
}

impl WorkflowRecorder {
    pub fn new(kind: WorkflowKind) -> (Self, mpsc::UnboundedReceiver<WorkflowProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let run_id = Uuid::new_v4();
        let recorder = Self {
            run_id,
            kind,
            cancel: CancelToken::new(),
            items: Vec::new(),
            first_error: None,
            details: BTreeMap::new(),
            started_at: Utc::now(),
            sink: ProgressSink { run_id, tx },
        };
        (recorder, rx)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn items(&self) -> &[ItemResult] {
        &self.items
    }

    pub fn detail(&mut self, key: impl Into<String>, value: impl ToString) {
        self.details.insert(key.into(), value.to_string());
    }

    pub fn progress_sink(&self) -> ProgressSink {
        self.sink.clone()
    }

    pub fn item_started(&self, label: &str, pod_id: Option<&PodId>) {
        self.sink.item_started(label, pod_id);
    }

    pub fn phase(&self, pod_id: &PodId, phase: RollingPhase) {
        self.sink.phase(pod_id, phase);
    }

    pub fn record(&mut self, result: ItemResult) {
        if let ItemOutcome::Failed(failure) = &result.outcome {
            warn!(
                run_id = %self.run_id,
                item = %result.label,
                pod_id = ?result.pod_id,
                failure = %failure,
                "Workflow item failed"
            );
            if self.first_error.is_none() {
                self.first_error = Some(failure.clone());
            }
        }
        self.sink.send(WorkflowProgress::ItemFinished {
            run_id: self.run_id,
            result: result.clone(),
        });
        self.items.push(result);
    }

    /// Record every remaining label as skipped
    pub fn skip_remaining(
        &mut self,
        labels: impl IntoIterator<Item = (String, Option<PodId>)>,
        reason: &str,
    ) {
        for (label, pod_id) in labels {
            self.record(
                ItemResult::new(label, ItemOutcome::Skipped(reason.to_string())).with_pod(pod_id),
            );
        }
    }

    /// Settle the run. A cancelled run keeps only the items that completed.
    pub fn finish(self) -> WorkflowRun {
        let cancelled = self.cancel.is_cancelled();
        let status = settle_status(&self.items, cancelled);
        let finished_at = Utc::now();
        let duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;

        info!(
            run_id = %self.run_id,
            kind = %self.kind,
            status = %status,
            items = self.items.len(),
            duration_ms,
            "Workflow finished"
        );
        self.sink.send(WorkflowProgress::Finished {
            run_id: self.run_id,
            status,
        });

        WorkflowRun {
            id: self.run_id,
            kind: self.kind,
            items: self.items,
            status,
            first_error: self.first_error,
            details: self.details,
            started_at: self.started_at,
            finished_at,
            duration_ms,
        }
    }
}

/// Caller's view of a running workflow
pub struct WorkflowHandle {
    run_id: Uuid,
    kind: WorkflowKind,
    cancel: CancelToken,
    progress: Option<mpsc::UnboundedReceiver<WorkflowProgress>>,
    task: JoinHandle<WorkflowRun>,
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("run_id", &self.run_id)
            .field("kind", &self.kind)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl WorkflowHandle {
    pub(crate) fn spawn<F>(
        recorder_meta: (Uuid, WorkflowKind, CancelToken),
        progress: mpsc::UnboundedReceiver<WorkflowProgress>,
        run: F,
    ) -> Self
    where
        F: Future<Output = WorkflowRun> + Send + 'static,
    {
        let (run_id, kind, cancel) = recorder_meta;
        Self {
            run_id,
            kind,
            cancel,
            progress: Some(progress),
            task: tokio::spawn(run),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stop issuing further items
    pub fn cancel(&self) {
        info!(run_id = %self.run_id, "Cancelling workflow");
        self.cancel.cancel();
    }

    /// Progress events until the run finishes
    ///
    /// The stream can be taken once; later calls yield an empty stream.
    pub fn progress_stream(&mut self) -> impl Stream<Item = WorkflowProgress> + Send + use<> {
        let rx = self.progress.take();
        async_stream::stream! {
            if let Some(mut rx) = rx {
                while let Some(event) = rx.recv().await {
                    let done = matches!(event, WorkflowProgress::Finished { .. });
                    yield event;
                    if done {
                        break;
                    }
                }
            }
        }
    }

    pub async fn wait(self) -> Result<WorkflowRun> {
        self.task
            .await
            .map_err(|e| OrchestratorError::Task(e.to_string()))
    }
}
