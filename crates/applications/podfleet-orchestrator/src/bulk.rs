//! One action over many pods
//!
//! Each pod gets its own ticket through the coordinator. Items run
//! concurrently, bounded by `max_in_flight`, and every outcome is attributed
//! to its pod. A pod that is busy with another action fails with a
//! `Conflict` rather than waiting.

use crate::coordinator::{ALREADY_GONE_NOTE, ActionCoordinator, PodAction};
use crate::error::{ActionFailure, OrchestratorError, Result};
use crate::store::StateStore;
use crate::workflow::{ItemOutcome, ItemResult, WorkflowRecorder, WorkflowRun};
use futures::StreamExt;
use podfleet_core::PodId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Default horizon for projected savings
pub const DEFAULT_SAVINGS_HORIZON: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BulkAction {
    Stop,
    Terminate,
    Restart,
}

impl BulkAction {
    /// Whether succeeding releases the pod's hourly cost
    pub fn saves_cost(&self) -> bool {
        matches!(self, Self::Stop | Self::Terminate)
    }

    fn pod_action(&self) -> PodAction {
        match self {
            Self::Stop => PodAction::Stop,
            Self::Terminate => PodAction::Terminate,
            Self::Restart => PodAction::Restart,
        }
    }
}

impl std::fmt::Display for BulkAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stop => "stop",
            Self::Terminate => "terminate",
            Self::Restart => "restart",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BulkAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stop" => Ok(Self::Stop),
            "terminate" => Ok(Self::Terminate),
            "restart" => Ok(Self::Restart),
            other => Err(format!("unknown bulk action: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkRequest {
    pub pod_ids: Vec<PodId>,
    pub action: BulkAction,
    pub savings_horizon: Duration,
}

impl BulkRequest {
    pub fn new(pod_ids: Vec<PodId>, action: BulkAction) -> Self {
        Self {
            pod_ids,
            action,
            savings_horizon: DEFAULT_SAVINGS_HORIZON,
        }
    }

    pub fn with_savings_horizon(mut self, horizon: Duration) -> Self {
        self.savings_horizon = horizon;
        self
    }

    /// Unknown pods are not rejected here; they fail per item.
    pub fn validate(&self) -> Result<()> {
        if self.pod_ids.is_empty() {
            return Err(OrchestratorError::validation("no pods selected"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.pod_ids.iter().find(|id| !seen.insert(*id)) {
            return Err(OrchestratorError::validation(format!("pod {} selected twice", dup)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub pod_id: PodId,
    pub failure: ActionFailure,
}

/// Aggregate result of a bulk action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkSummary {
    pub run_id: Uuid,
    pub action: BulkAction,
    pub requested: usize,
    pub succeeded: usize,
    pub failed: Vec<BulkFailure>,
    /// Cost per hour released by succeeded stops / terminates
    pub hourly_savings: f64,
    pub horizon_hours: f64,
    pub projected_savings: f64,
}

impl BulkSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.succeeded == self.requested
    }
}

pub struct BulkWorkflow {
    coordinator: Arc<ActionCoordinator>,
    store: Arc<StateStore>,
    max_in_flight: usize,
}

impl BulkWorkflow {
    pub fn new(coordinator: Arc<ActionCoordinator>, store: Arc<StateStore>, max_in_flight: usize) -> Self {
        Self {
            coordinator,
            store,
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub async fn run(&self, request: BulkRequest, recorder: WorkflowRecorder) -> WorkflowRun {
        self.run_with_summary(request, recorder).await.0
    }

    pub async fn run_with_summary(
        &self,
        request: BulkRequest,
        mut recorder: WorkflowRecorder,
    ) -> (WorkflowRun, BulkSummary) {
        // Only pods still billing before the action release any cost
        let snapshot = self.store.snapshot().await;
        let costs: HashMap<PodId, f64> = request
            .pod_ids
            .iter()
            .filter_map(|id| snapshot.pod(id))
            .filter(|p| p.status.is_active())
            .map(|p| (p.id.clone(), p.cost_per_hour))
            .collect();

        recorder.detail("action", request.action);
        recorder.detail("pods", request.pod_ids.len());
        info!(
            run_id = %recorder.run_id(),
            action = %request.action,
            pods = request.pod_ids.len(),
            max_in_flight = self.max_in_flight,
            "Starting bulk action"
        );

        let sink = recorder.progress_sink();
        let cancel = recorder.cancel_token();
        let coordinator = self.coordinator.as_ref();
        let action = request.action.pod_action();

        let mut results = futures::stream::iter(request.pod_ids.iter().cloned())
            .map(|pod_id| {
                let sink = sink.clone();
                let cancel = cancel.clone();
                let action = action.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    sink.item_started(pod_id.as_str(), Some(&pod_id));
                    let (item, already_gone) = match coordinator.execute(&pod_id, action).await {
                        Ok(ticket) => {
                            let already_gone = ticket.note.as_deref() == Some(ALREADY_GONE_NOTE);
                            let outcome = match ticket.failure {
                                None => ItemOutcome::Succeeded,
                                Some(failure) => ItemOutcome::Failed(failure),
                            };
                            let item = ItemResult::new(pod_id.to_string(), outcome)
                                .with_ticket(ticket.id);
                            (item, already_gone)
                        }
                        Err(e) => {
                            let failure = ItemOutcome::Failed(ActionFailure::from(&e));
                            (ItemResult::new(pod_id.to_string(), failure), false)
                        }
                    };
                    Some((item.with_pod(Some(pod_id)), already_gone))
                }
            })
            .buffer_unordered(self.max_in_flight);

        let mut succeeded = 0;
        let mut failed = Vec::new();
        let mut hourly_savings = 0.0;
        while let Some(result) = results.next().await {
            let Some((item, already_gone)) = result else { continue };
            if let Some(pod_id) = &item.pod_id {
                match &item.outcome {
                    ItemOutcome::Succeeded => {
                        succeeded += 1;
                        if request.action.saves_cost() && !already_gone {
                            hourly_savings += costs.get(pod_id).copied().unwrap_or(0.0);
                        }
                    }
                    ItemOutcome::Failed(failure) => failed.push(BulkFailure {
                        pod_id: pod_id.clone(),
                        failure: failure.clone(),
                    }),
                    ItemOutcome::Skipped(_) => {}
                }
            }
            recorder.record(item);
        }

        let horizon_hours = request.savings_horizon.as_secs_f64() / 3600.0;
        let projected_savings = hourly_savings * horizon_hours;
        if request.action.saves_cost() {
            recorder.detail("hourly_savings", format!("{:.2}", hourly_savings));
            recorder.detail("projected_savings", format!("{:.2}", projected_savings));
        }

        let summary = BulkSummary {
            run_id: recorder.run_id(),
            action: request.action,
            requested: request.pod_ids.len(),
            succeeded,
            failed,
            hourly_savings,
            horizon_hours,
            projected_savings,
        };
        (recorder.finish(), summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::FailureKind;
    use crate::mock::MockGateway;
    use crate::workflow::{WorkflowKind, WorkflowStatus};
    use podfleet_core::{GatewayError, Pod, PodStatus};

    fn pods(n: usize) -> Vec<Pod> {
        (1..=n)
            .map(|i| {
                Pod::new(format!("p{}", i), format!("job-{}", i))
                    .with_status(PodStatus::Running)
                    .with_cost(0.5 * i as f64)
            })
            .collect()
    }

    fn ids(n: usize) -> Vec<PodId> {
        (1..=n).map(|i| PodId::new(format!("p{}", i))).collect()
    }

    async fn fixture(gateway: MockGateway, max_in_flight: usize) -> (Arc<MockGateway>, Arc<ActionCoordinator>, BulkWorkflow) {
        let gateway = Arc::new(gateway);
        let store = Arc::new(StateStore::new());
        let seq = store.next_sequence();
        store.merge_pods(seq, gateway.pods()).await;
        let retry = RetryPolicy::default().with_base_delay(Duration::from_millis(1));
        let coordinator = Arc::new(ActionCoordinator::new(gateway.clone(), store.clone(), retry));
        let bulk = BulkWorkflow::new(coordinator.clone(), store, max_in_flight);
        (gateway, coordinator, bulk)
    }

    #[test]
    fn test_validate_rejects_empty_and_duplicates() {
        let empty = BulkRequest::new(vec![], BulkAction::Stop);
        assert!(matches!(empty.validate(), Err(OrchestratorError::Validation(_))));

        let dup = BulkRequest::new(vec![PodId::new("p1"), PodId::new("p1")], BulkAction::Stop);
        assert!(matches!(dup.validate(), Err(OrchestratorError::Validation(_))));

        let ok = BulkRequest::new(vec![PodId::new("p1"), PodId::new("p2")], BulkAction::Stop);
        assert!(ok.validate().is_ok());
    }

    #[tokio::test]
    async fn test_rate_limited_item_still_succeeds() {
        let gateway = MockGateway::new().with_pods(pods(3));
        let p2 = PodId::new("p2");
        gateway.fail_next(&p2, GatewayError::rate_limited(None));
        gateway.fail_next(&p2, GatewayError::rate_limited(None));
        let (gateway, _coordinator, bulk) = fixture(gateway, 8).await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Bulk);

        let (run, summary) = bulk
            .run_with_summary(BulkRequest::new(ids(3), BulkAction::Stop), recorder)
            .await;

        assert_eq!(summary.succeeded, 3);
        assert!(summary.failed.is_empty());
        assert!(summary.all_succeeded());
        assert_eq!(run.status, WorkflowStatus::Succeeded);
        assert_eq!(gateway.calls_for(&p2).len(), 3);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let gateway = MockGateway::new()
            .with_pods(pods(10))
            .with_latency(Duration::from_millis(20));
        let (gateway, _coordinator, bulk) = fixture(gateway, 3).await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Bulk);

        let (_run, summary) = bulk
            .run_with_summary(BulkRequest::new(ids(10), BulkAction::Restart), recorder)
            .await;

        assert_eq!(summary.succeeded, 10);
        assert_eq!(gateway.max_concurrent(), 3);
    }

    #[tokio::test]
    async fn test_savings_from_succeeded_pods_only() {
        let gateway = MockGateway::new().with_pods(pods(3));
        gateway.fail_next(&PodId::new("p3"), GatewayError::auth("denied"));
        let (_gateway, _coordinator, bulk) = fixture(gateway, 8).await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Bulk);

        let request = BulkRequest::new(ids(3), BulkAction::Terminate)
            .with_savings_horizon(Duration::from_secs(10 * 3600));
        let (run, summary) = bulk.run_with_summary(request, recorder).await;

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].pod_id, PodId::new("p3"));
        assert_eq!(summary.failed[0].failure.kind, FailureKind::Auth);
        assert!((summary.hourly_savings - 1.5).abs() < 1e-9);
        assert!((summary.projected_savings - 15.0).abs() < 1e-9);
        assert_eq!(run.status, WorkflowStatus::PartialFailure);
        assert_eq!(run.details.get("hourly_savings").map(String::as_str), Some("1.50"));
    }

    #[tokio::test]
    async fn test_savings_skip_pods_not_billing() {
        let mut listed = pods(3);
        listed[0].status = PodStatus::Stopped;
        let (_gateway, _coordinator, bulk) = fixture(MockGateway::new().with_pods(listed), 8).await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Bulk);

        let (_run, summary) = bulk
            .run_with_summary(BulkRequest::new(ids(3), BulkAction::Stop), recorder)
            .await;

        assert_eq!(summary.succeeded, 3);
        // p1 was already stopped; p2 and p3 bill 1.0 + 1.5
        assert!((summary.hourly_savings - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_savings_skip_pods_already_gone() {
        let gateway = MockGateway::new().with_pods(pods(2));
        let (gateway, _coordinator, bulk) = fixture(gateway, 8).await;
        gateway.remove_pod(&PodId::new("p2"));
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Bulk);

        let (_run, summary) = bulk
            .run_with_summary(BulkRequest::new(ids(2), BulkAction::Terminate), recorder)
            .await;

        assert_eq!(summary.succeeded, 2);
        assert!((summary.hourly_savings - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_restart_has_no_savings() {
        let (_gateway, _coordinator, bulk) = fixture(MockGateway::new().with_pods(pods(2)), 8).await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Bulk);

        let (run, summary) = bulk
            .run_with_summary(BulkRequest::new(ids(2), BulkAction::Restart), recorder)
            .await;
        assert_eq!(summary.hourly_savings, 0.0);
        assert!(!run.details.contains_key("hourly_savings"));
    }

    #[tokio::test]
    async fn test_busy_pod_reported_as_conflict() {
        let gateway = MockGateway::new()
            .with_pods(pods(2))
            .with_latency(Duration::from_millis(30));
        let (gateway, coordinator, bulk) = fixture(gateway, 8).await;

        let busy = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.restart(&PodId::new("p1")).await })
        };
        while !coordinator.is_locked(&PodId::new("p1")) {
            tokio::task::yield_now().await;
        }

        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Bulk);
        let (_run, summary) = bulk
            .run_with_summary(BulkRequest::new(ids(2), BulkAction::Stop), recorder)
            .await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].failure.kind, FailureKind::Conflict);
        assert!(busy.await.unwrap().unwrap().is_success());
        assert_eq!(gateway.calls_for(&PodId::new("p1")).len(), 1);
    }

    #[test]
    fn test_parse_action() {
        assert_eq!("Stop".parse::<BulkAction>().unwrap(), BulkAction::Stop);
        assert_eq!("terminate".parse::<BulkAction>().unwrap(), BulkAction::Terminate);
        assert!("pause".parse::<BulkAction>().is_err());
    }
}
