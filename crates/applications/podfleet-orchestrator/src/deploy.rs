//! Deploy: create N pods from a template
//!
//! Requests are validated against the availability table before anything is
//! sent to the provider. Asking for more GPUs than are in stock is an error,
//! never silently clamped.

use crate::coordinator::{ActionCoordinator, CreateOutcome};
use crate::error::{ActionFailure, FailureKind, OrchestratorError, Result};
use crate::store::{Snapshot, StateStore};
use crate::workflow::{ItemOutcome, ItemResult, WorkflowRecorder, WorkflowRun, short_run_id};
use podfleet_core::{CloudType, GpuType, PodSpec, Template};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Provider message fragment meaning stock ran out mid-deploy
const OUT_OF_CAPACITY_MARKER: &str = "no longer any instances available";

/// What to deploy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub template: Template,
    pub name_prefix: String,
    pub gpu_type_id: String,
    /// GPUs per pod
    pub gpu_count: u32,
    pub pod_count: u32,
    pub cloud_type: CloudType,
    pub container_disk_in_gb: Option<u32>,
    pub volume_in_gb: Option<u32>,
}

impl DeployRequest {
    pub fn new(
        template: Template,
        name_prefix: impl Into<String>,
        gpu_type_id: impl Into<String>,
        pod_count: u32,
    ) -> Self {
        Self {
            template,
            name_prefix: name_prefix.into(),
            gpu_type_id: gpu_type_id.into(),
            gpu_count: 1,
            pod_count,
            cloud_type: CloudType::All,
            container_disk_in_gb: None,
            volume_in_gb: None,
        }
    }

    pub fn with_gpu_count(mut self, gpu_count: u32) -> Self {
        self.gpu_count = gpu_count;
        self
    }

    pub fn with_cloud_type(mut self, cloud_type: CloudType) -> Self {
        self.cloud_type = cloud_type;
        self
    }

    pub fn with_disk(mut self, container_disk_in_gb: u32, volume_in_gb: u32) -> Self {
        self.container_disk_in_gb = Some(container_disk_in_gb);
        self.volume_in_gb = Some(volume_in_gb);
        self
    }

    /// Reject the request unless the current availability can satisfy it
    pub fn validate(&self, snapshot: &Snapshot) -> Result<()> {
        if self.pod_count == 0 {
            return Err(OrchestratorError::validation("pod count must be at least 1"));
        }
        if self.gpu_count == 0 {
            return Err(OrchestratorError::validation("GPU count must be at least 1"));
        }
        if self.name_prefix.trim().is_empty() {
            return Err(OrchestratorError::validation("name prefix must not be empty"));
        }

        let gpu = snapshot.gpu_type(&self.gpu_type_id).ok_or_else(|| {
            OrchestratorError::validation(format!("unknown GPU type {}", self.gpu_type_id))
        })?;
        if !gpu.stock_status.is_available() {
            return Err(OrchestratorError::validation(format!(
                "{} is out of stock",
                gpu.display_name
            )));
        }

        let requested = u64::from(self.pod_count) * u64::from(self.gpu_count);
        if requested > u64::from(gpu.available_count) {
            return Err(OrchestratorError::validation(format!(
                "requested {} x {} GPUs of {} but only {} available",
                self.pod_count, self.gpu_count, gpu.display_name, gpu.available_count
            )));
        }
        Ok(())
    }

    fn pod_spec(&self, name: impl Into<String>) -> PodSpec {
        let mut spec = PodSpec::from_template(&self.template, name, &self.gpu_type_id, self.gpu_count)
            .with_cloud_type(self.cloud_type);
        if let Some(disk) = self.container_disk_in_gb {
            spec.container_disk_in_gb = disk;
        }
        if let Some(volume) = self.volume_in_gb {
            spec.volume_in_gb = volume;
        }
        spec
    }
}

/// Projected spend for a deploy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub per_pod_per_hour: f64,
    pub total_per_hour: f64,
    pub hours: f64,
    pub total_for_period: f64,
}

pub fn estimate_cost(
    gpu: &GpuType,
    gpu_count: u32,
    pod_count: u32,
    cloud_type: CloudType,
    hours: f64,
) -> CostEstimate {
    let per_pod_per_hour = gpu.price_for(cloud_type) * gpu_count as f64;
    let total_per_hour = per_pod_per_hour * pod_count as f64;
    CostEstimate {
        per_pod_per_hour,
        total_per_hour,
        hours,
        total_for_period: total_per_hour * hours,
    }
}

/// Runs validated deploy requests
pub struct DeployWorkflow {
    coordinator: Arc<ActionCoordinator>,
    store: Arc<StateStore>,
}

impl DeployWorkflow {
    pub fn new(coordinator: Arc<ActionCoordinator>, store: Arc<StateStore>) -> Self {
        Self { coordinator, store }
    }

    /// Create the pods. Expects [`DeployRequest::validate`] to have passed.
    pub async fn run(&self, request: DeployRequest, mut recorder: WorkflowRecorder) -> WorkflowRun {
        let short_id = short_run_id(&recorder.run_id());
        let snapshot = self.store.snapshot().await;

        recorder.detail("template", &request.template.name);
        recorder.detail("image", &request.template.image);
        recorder.detail("gpu_type", &request.gpu_type_id);
        recorder.detail("gpu_count", request.gpu_count);
        recorder.detail("pod_count", request.pod_count);
        if let Some(gpu) = snapshot.gpu_type(&request.gpu_type_id) {
            let estimate = estimate_cost(gpu, request.gpu_count, request.pod_count, request.cloud_type, 1.0);
            recorder.detail("cost_per_hour", format!("{:.2}", estimate.total_per_hour));
        }

        info!(
            run_id = %recorder.run_id(),
            pods = request.pod_count,
            gpu_type = %request.gpu_type_id,
            batch = self.coordinator.supports_batch_create(),
            "Starting deploy"
        );

        if self.coordinator.supports_batch_create() {
            self.run_batch(&request, &short_id, &mut recorder).await;
        } else {
            self.run_sequential(&request, &short_id, &mut recorder).await;
        }

        recorder.finish()
    }

    async fn run_batch(&self, request: &DeployRequest, short_id: &str, recorder: &mut WorkflowRecorder) {
        if recorder.is_cancelled() {
            return;
        }
        let base = format!("{}-{}", request.name_prefix, short_id);
        for i in 0..request.pod_count {
            recorder.item_started(&format!("{}-{}", base, i), None);
        }

        let outcomes = self
            .coordinator
            .create_batch(&request.pod_spec(&base), request.pod_count)
            .await;
        for (i, outcome) in outcomes.iter().enumerate() {
            let label = outcome
                .pod
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| format!("{}-{}", base, i));
            recorder.record(item_from_create(label, outcome));
        }

        let delivered = outcomes.len();
        let requested = request.pod_count as usize;
        if delivered < requested {
            warn!(
                run_id = %recorder.run_id(),
                delivered,
                requested,
                "Provider created fewer pods than requested"
            );
            let failure = ActionFailure::new(
                FailureKind::Provider,
                format!("provider created {} of {} pods", delivered, requested),
            );
            for i in delivered..requested {
                recorder.record(ItemResult::new(
                    format!("{}-{}", base, i),
                    ItemOutcome::Failed(failure.clone()),
                ));
            }
        }
    }

    async fn run_sequential(
        &self,
        request: &DeployRequest,
        short_id: &str,
        recorder: &mut WorkflowRecorder,
    ) {
        let names: Vec<String> = (0..request.pod_count)
            .map(|i| format!("{}-{}-{}", request.name_prefix, short_id, i))
            .collect();

        for (index, name) in names.iter().enumerate() {
            if recorder.is_cancelled() {
                info!(run_id = %recorder.run_id(), created = index, "Deploy cancelled");
                return;
            }

            recorder.item_started(name, None);
            let outcome = self.coordinator.create_pod(&request.pod_spec(name)).await;
            let failure = outcome.ticket.failure.clone();
            recorder.record(item_from_create(name.clone(), &outcome));

            if let Some(reason) = failure.as_ref().and_then(halt_reason) {
                warn!(
                    run_id = %recorder.run_id(),
                    created = index,
                    requested = names.len(),
                    reason,
                    "Stopping deploy early"
                );
                recorder.skip_remaining(
                    names[index + 1..].iter().map(|n| (n.clone(), None)),
                    reason,
                );
                return;
            }
        }
    }
}

/// Failures after which further creates are pointless
fn halt_reason(failure: &ActionFailure) -> Option<&'static str> {
    if failure.is_fatal() {
        Some("halted after authentication failure")
    } else if failure.message.to_lowercase().contains(OUT_OF_CAPACITY_MARKER) {
        Some("halted: no GPUs available")
    } else {
        None
    }
}

fn item_from_create(label: String, outcome: &CreateOutcome) -> ItemResult {
    let result = match &outcome.ticket.failure {
        Some(failure) => ItemResult::new(label, ItemOutcome::Failed(failure.clone())),
        None => ItemResult::new(label, ItemOutcome::Succeeded),
    };
    result
        .with_pod(outcome.ticket.pod_id.clone())
        .with_ticket(outcome.ticket.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::mock::{MockCall, MockGateway};
    use crate::workflow::{WorkflowKind, WorkflowProgress, WorkflowStatus};
    use podfleet_core::{GatewayError, StockStatus};
    use std::time::Duration;

    fn template() -> Template {
        Template::new("tpl-1", "vllm", "vllm/vllm-openai:v0.6")
    }

    fn a40(available: u32) -> GpuType {
        GpuType::new("NVIDIA A40", available, StockStatus::InStock).with_prices(0.44, 0.35)
    }

    async fn fixture(gateway: MockGateway, listed: Vec<GpuType>) -> (Arc<MockGateway>, Arc<StateStore>, DeployWorkflow) {
        let gateway = Arc::new(gateway);
        let store = Arc::new(StateStore::new());
        let seq = store.next_sequence();
        store.merge_gpu_types(seq, listed).await;
        let coordinator = Arc::new(ActionCoordinator::new(
            gateway.clone(),
            store.clone(),
            RetryPolicy::none(),
        ));
        (gateway, store.clone(), DeployWorkflow::new(coordinator, store))
    }

    #[tokio::test]
    async fn test_validation_rejects_over_stock() {
        let (gateway, store, _deploy) = fixture(MockGateway::new(), vec![a40(3)]).await;
        let snapshot = store.snapshot().await;

        let err = DeployRequest::new(template(), "llm", "NVIDIA A40", 4)
            .validate(&snapshot)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(err.to_string().contains("only 3 available"));

        let err = DeployRequest::new(template(), "llm", "NVIDIA A40", 2)
            .with_gpu_count(2)
            .validate(&snapshot)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        assert!(DeployRequest::new(template(), "llm", "NVIDIA A40", 3)
            .validate(&snapshot)
            .is_ok());
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_validation_rejects_unknown_and_out_of_stock() {
        let (_gw, store, _deploy) = fixture(
            MockGateway::new(),
            vec![GpuType::new("H100", 0, StockStatus::OutOfStock)],
        )
        .await;
        let snapshot = store.snapshot().await;

        for request in [
            DeployRequest::new(template(), "llm", "H100", 1),
            DeployRequest::new(template(), "llm", "B200", 1),
            DeployRequest::new(template(), "llm", "H100", 0),
            DeployRequest::new(template(), "", "H100", 1),
        ] {
            assert!(matches!(
                request.validate(&snapshot),
                Err(OrchestratorError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_sequential_deploy_names_and_tickets() {
        let (gateway, store, deploy) =
            fixture(MockGateway::new().with_gpu_types(vec![a40(8)]), vec![a40(8)]).await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Deploy);
        let short = short_run_id(&recorder.run_id());

        let run = deploy
            .run(DeployRequest::new(template(), "llm", "NVIDIA A40", 3), recorder)
            .await;

        assert_eq!(run.status, WorkflowStatus::Succeeded);
        let labels: Vec<_> = run.items.iter().map(|i| i.label.clone()).collect();
        assert_eq!(
            labels,
            (0..3).map(|i| format!("llm-{}-{}", short, i)).collect::<Vec<_>>()
        );
        let tickets: std::collections::HashSet<_> =
            run.items.iter().filter_map(|i| i.ticket_id).collect();
        assert_eq!(tickets.len(), 3);
        assert_eq!(gateway.mutations().len(), 3);
        assert_eq!(store.snapshot().await.pods.len(), 3);
        assert_eq!(run.details.get("cost_per_hour").map(String::as_str), Some("1.05"));
    }

    #[tokio::test]
    async fn test_batch_deploy_uses_one_call() {
        let (gateway, _store, deploy) = fixture(
            MockGateway::new()
                .with_gpu_types(vec![a40(8)])
                .with_batch_create(true),
            vec![a40(8)],
        )
        .await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Deploy);

        let run = deploy
            .run(DeployRequest::new(template(), "llm", "NVIDIA A40", 4), recorder)
            .await;

        assert_eq!(run.status, WorkflowStatus::Succeeded);
        assert_eq!(run.items.len(), 4);
        let mutations = gateway.mutations();
        assert_eq!(mutations.len(), 1);
        assert!(matches!(mutations[0], MockCall::CreateBatch { count: 4, .. }));
    }

    #[tokio::test]
    async fn test_short_batch_records_missing_pods_as_failed() {
        let gateway = MockGateway::new()
            .with_gpu_types(vec![a40(8)])
            .with_batch_create(true);
        gateway.short_batches(2);
        let (_gateway, store, deploy) = fixture(gateway, vec![a40(8)]).await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Deploy);

        let run = deploy
            .run(DeployRequest::new(template(), "llm", "NVIDIA A40", 4), recorder)
            .await;

        assert_eq!(run.status, WorkflowStatus::PartialFailure);
        assert_eq!(run.items.len(), 4);
        assert_eq!(run.succeeded_count(), 2);
        assert_eq!(run.failed_count(), 2);
        let failure = run.items[3].outcome.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Provider);
        assert_eq!(failure.message, "provider created 2 of 4 pods");
        assert_eq!(store.snapshot().await.pods.len(), 2);
    }

    #[tokio::test]
    async fn test_stock_exhausted_mid_deploy_skips_rest() {
        // Listing says 5, provider only has 2 left
        let (gateway, _store, deploy) =
            fixture(MockGateway::new().with_gpu_types(vec![a40(2)]), vec![a40(5)]).await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Deploy);

        let run = deploy
            .run(DeployRequest::new(template(), "llm", "NVIDIA A40", 5), recorder)
            .await;

        assert_eq!(run.status, WorkflowStatus::PartialFailure);
        assert_eq!(run.succeeded_count(), 2);
        assert_eq!(run.failed_count(), 1);
        assert_eq!(run.skipped_count(), 2);
        assert_eq!(gateway.mutations().len(), 3);
        assert_eq!(run.first_error.unwrap().kind, FailureKind::Provider);
    }

    #[tokio::test]
    async fn test_auth_failure_stops_deploy() {
        let gateway = MockGateway::new().with_gpu_types(vec![a40(8)]);
        gateway.fail_next_create(GatewayError::auth("invalid api key"));
        let (gateway, _store, deploy) = fixture(gateway, vec![a40(8)]).await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::Deploy);

        let run = deploy
            .run(DeployRequest::new(template(), "llm", "NVIDIA A40", 3), recorder)
            .await;

        assert_eq!(run.status, WorkflowStatus::Failed);
        assert_eq!(run.skipped_count(), 2);
        assert_eq!(gateway.mutations().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_keeps_only_completed_items() {
        let (gateway, _store, deploy) = fixture(
            MockGateway::new()
                .with_gpu_types(vec![a40(8)])
                .with_latency(Duration::from_millis(20)),
            vec![a40(8)],
        )
        .await;
        let (recorder, mut rx) = WorkflowRecorder::new(WorkflowKind::Deploy);
        let cancel = recorder.cancel_token();

        let task = tokio::spawn(async move {
            deploy
                .run(DeployRequest::new(template(), "llm", "NVIDIA A40", 5), recorder)
                .await
        });

        while let Some(event) = rx.recv().await {
            if matches!(event, WorkflowProgress::ItemFinished { .. }) {
                cancel.cancel();
                break;
            }
        }
        let run = task.await.unwrap();

        assert_eq!(run.status, WorkflowStatus::Cancelled);
        assert!(run.items.len() < 5);
        assert!(run.items.iter().all(|i| i.outcome.is_success()));
        assert_eq!(run.items.len(), gateway.mutations().len());
    }

    #[test]
    fn test_estimate_cost() {
        let gpu = a40(4);
        let estimate = estimate_cost(&gpu, 2, 3, CloudType::Secure, 24.0);
        assert!((estimate.per_pod_per_hour - 0.88).abs() < 1e-9);
        assert!((estimate.total_per_hour - 2.64).abs() < 1e-9);
        assert!((estimate.total_for_period - 63.36).abs() < 1e-9);

        let cheapest = estimate_cost(&gpu, 1, 1, CloudType::All, 1.0);
        assert!((cheapest.total_per_hour - 0.35).abs() < 1e-9);
    }
}
