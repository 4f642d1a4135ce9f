//! Engine façade
//!
//! Wires the store, reconciler, coordinator, workflow executors and history
//! log together behind one handle a presentation layer can hold.
//!
//! ```text
//!   caller ──submit──▶ validate ──▶ spawn workflow ──▶ coordinator ──▶ gateway
//!     ▲                                   │                               │
//!     └── snapshot() ◀── StateStore ◀─────┴──── reconciler ◀──────────────┘
//! ```
//!
//! Requests are validated against the current snapshot before a workflow is
//! spawned, so a rejected request never reaches the provider. Every finished
//! run is appended to the history log.

use crate::bulk::{BulkAction, BulkRequest, BulkSummary, BulkWorkflow};
use crate::config::EngineConfig;
use crate::coordinator::{ActionCoordinator, ActionEvent};
use crate::deploy::{DeployRequest, DeployWorkflow};
use crate::error::Result;
use crate::history::{HistoryFilter, HistoryLog};
use crate::reconciler::{Reconciler, ReconcilerHandle};
use crate::rolling::{RollingRequest, RollingWorkflow};
use crate::store::{MergeReport, Snapshot, StateStore};
use crate::workflow::{CancelToken, WorkflowHandle, WorkflowKind, WorkflowRecorder, WorkflowRun};
use podfleet_core::{PodId, ProviderGateway, Template};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// A workflow to submit
#[derive(Debug, Clone)]
pub enum WorkflowRequest {
    Deploy(DeployRequest),
    RollingUpdate(RollingRequest),
    Bulk(BulkRequest),
}

impl WorkflowRequest {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            Self::Deploy(_) => WorkflowKind::Deploy,
            Self::RollingUpdate(_) => WorkflowKind::RollingUpdate,
            Self::Bulk(_) => WorkflowKind::Bulk,
        }
    }

    fn validate(&self, snapshot: &Snapshot) -> Result<()> {
        match self {
            Self::Deploy(r) => r.validate(snapshot),
            Self::RollingUpdate(r) => r.validate(snapshot),
            Self::Bulk(r) => r.validate(),
        }
    }
}

/// Cancel tokens of runs that have not finished yet
type ActiveRuns = Arc<Mutex<HashMap<Uuid, CancelToken>>>;

/// Everything a spawned workflow needs, detached from the engine's lifetime
#[derive(Clone)]
struct Executors {
    coordinator: Arc<ActionCoordinator>,
    store: Arc<StateStore>,
    reconciler: Arc<Reconciler>,
    config: EngineConfig,
    history: Arc<HistoryLog>,
    active: ActiveRuns,
}

impl Executors {
    async fn run(&self, request: WorkflowRequest, recorder: WorkflowRecorder) -> WorkflowRun {
        let run = match request {
            WorkflowRequest::Deploy(r) => {
                DeployWorkflow::new(self.coordinator.clone(), self.store.clone())
                    .run(r, recorder)
                    .await
            }
            WorkflowRequest::RollingUpdate(r) => {
                RollingWorkflow::new(
                    self.coordinator.clone(),
                    self.store.clone(),
                    self.reconciler.trigger(),
                    self.config.rolling.clone(),
                )
                .run(r, recorder)
                .await
            }
            WorkflowRequest::Bulk(r) => self.bulk().run(r, recorder).await,
        };
        self.settle(&run).await;
        run
    }

    fn bulk(&self) -> BulkWorkflow {
        BulkWorkflow::new(
            self.coordinator.clone(),
            self.store.clone(),
            self.config.bulk_max_in_flight,
        )
    }

    async fn settle(&self, run: &WorkflowRun) {
        remove_active(&self.active, &run.id);
        if let Err(e) = self.history.append(run.clone()).await {
            warn!(run_id = %run.id, error = %e, "Failed to persist workflow run");
        }
    }
}

fn remove_active(active: &ActiveRuns, run_id: &Uuid) {
    if let Ok(mut map) = active.lock() {
        map.remove(run_id);
    }
}

/// The orchestration engine
pub struct Engine {
    gateway: Arc<dyn ProviderGateway>,
    executors: Executors,
    reconciler_handle: tokio::sync::Mutex<Option<ReconcilerHandle>>,
}

impl Engine {
    /// Build an engine. Opens the history file when one is configured.
    pub async fn new(gateway: Arc<dyn ProviderGateway>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(StateStore::new());
        let coordinator = Arc::new(ActionCoordinator::new(
            gateway.clone(),
            store.clone(),
            config.retry.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(gateway.clone(), store.clone(), &config));
        let history = match &config.history_path {
            Some(path) => HistoryLog::open(path, config.history_max_entries).await?,
            None => HistoryLog::in_memory().with_max_entries(config.history_max_entries),
        };

        info!(
            provider = gateway.name(),
            history = ?config.history_path,
            "Engine created"
        );

        Ok(Self {
            gateway,
            executors: Executors {
                coordinator,
                store,
                reconciler,
                config,
                history: Arc::new(history),
                active: Arc::new(Mutex::new(HashMap::new())),
            },
            reconciler_handle: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.executors.config
    }

    pub fn provider_name(&self) -> &str {
        self.gateway.name()
    }

    /// Start background reconciliation. A second call is a no-op.
    pub async fn start(&self) {
        let mut handle = self.reconciler_handle.lock().await;
        if handle.as_ref().is_some_and(|h| h.is_running()) {
            return;
        }
        *handle = Some(self.executors.reconciler.clone().spawn());
    }

    pub async fn is_running(&self) -> bool {
        self.reconciler_handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| h.is_running())
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.executors.store.snapshot().await
    }

    /// Reconcile now and wait for the merge
    pub async fn force_refresh(&self) -> Result<MergeReport> {
        Ok(self.executors.reconciler.reconcile_once().await?)
    }

    /// Wake the background reconciler without waiting
    pub fn request_refresh(&self) {
        self.executors.reconciler.trigger().refresh();
    }

    /// Validate and start a workflow
    ///
    /// Validation failures are returned here and nothing is sent to the
    /// provider.
    pub async fn submit_workflow(&self, request: WorkflowRequest) -> Result<WorkflowHandle> {
        let snapshot = self.snapshot().await;
        request.validate(&snapshot)?;

        let (recorder, progress) = WorkflowRecorder::new(request.kind());
        let meta = (recorder.run_id(), recorder.kind(), recorder.cancel_token());
        self.register(&recorder);

        info!(run_id = %meta.0, kind = %meta.1, "Workflow submitted");

        let executors = self.executors.clone();
        Ok(WorkflowHandle::spawn(meta, progress, async move {
            executors.run(request, recorder).await
        }))
    }

    /// Run one action over a set of pods and wait for the summary
    pub async fn submit_bulk_action(&self, pod_ids: Vec<PodId>, action: BulkAction) -> Result<BulkSummary> {
        let request = BulkRequest::new(pod_ids, action);
        request.validate()?;

        let (recorder, _progress) = WorkflowRecorder::new(WorkflowKind::Bulk);
        self.register(&recorder);

        let (run, summary) = self
            .executors
            .bulk()
            .run_with_summary(request, recorder)
            .await;
        self.executors.settle(&run).await;
        Ok(summary)
    }

    /// Cancel a running workflow. Returns false if it is unknown or finished.
    pub fn cancel_workflow(&self, run_id: Uuid) -> bool {
        let token = self
            .executors
            .active
            .lock()
            .ok()
            .and_then(|map| map.get(&run_id).cloned());
        match token {
            Some(token) => {
                info!(run_id = %run_id, "Cancelling workflow");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of workflows still running
    pub fn active_workflows(&self) -> Vec<Uuid> {
        self.executors
            .active
            .lock()
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn query_history(&self, filter: &HistoryFilter) -> Vec<WorkflowRun> {
        self.executors.history.query(filter).await
    }

    /// Templates a deploy can start from, account-owned first then by name.
    /// Serverless templates are left out.
    pub async fn list_templates(&self, include_public: bool) -> Result<Vec<Template>> {
        let mut templates: Vec<Template> = self
            .gateway
            .list_templates(include_public)
            .await?
            .into_iter()
            .filter(Template::is_deployable)
            .collect();
        templates.sort_by(|a, b| a.is_public.cmp(&b.is_public).then_with(|| a.name.cmp(&b.name)));
        Ok(templates)
    }

    /// Ticket transitions from every action the engine issues
    pub fn subscribe_actions(&self) -> broadcast::Receiver<ActionEvent> {
        self.executors.coordinator.subscribe()
    }

    /// Stop reconciliation and cancel running workflows
    ///
    /// In-flight provider calls are not aborted; cancelled runs settle on
    /// their own and still reach the history log.
    pub async fn shutdown(&self) {
        for run_id in self.active_workflows() {
            self.cancel_workflow(run_id);
        }
        if let Some(handle) = self.reconciler_handle.lock().await.take() {
            handle.shutdown().await;
        }
        info!("Engine shut down");
    }

    fn register(&self, recorder: &WorkflowRecorder) {
        if let Ok(mut map) = self.executors.active.lock() {
            map.insert(recorder.run_id(), recorder.cancel_token());
        }
    }
}
