//! Rolling image update
//!
//! Replaces pods group by group:
//!
//! ```text
//! for each group of `parallelism` pods
//!     │
//!     ├── 1. Create replacement (same shape, new image)
//!     │
//!     ├── 2. Wait until the store shows it Running (bounded)
//!     │
//!     ├── 3. Drain grace (optional)
//!     │
//!     └── 4. Retire the old pod (terminate or stop)
//! ```
//!
//! The next group starts only once the whole group is confirmed. The first
//! failure halts the rollout: replaced pods stay on the new image, the rest
//! are left untouched and recorded as skipped. Nothing is rolled back.

use crate::config::{RetireAction, RollingConfig};
use crate::coordinator::ActionCoordinator;
use crate::error::{ActionFailure, FailureKind, OrchestratorError, Result};
use crate::reconciler::RefreshTrigger;
use crate::store::{Snapshot, StateStore};
use crate::workflow::{ItemOutcome, ItemResult, WorkflowRecorder, WorkflowRun, short_run_id};
use futures::future::join_all;
use podfleet_core::{Pod, PodId, PodSpec, PodStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-pod progress through a replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollingPhase {
    CreatingReplacement,
    AwaitingHealthy,
    Draining,
    RetiringOld,
    Completed,
    Failed,
}

/// Pods to move to a new image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingRequest {
    pub pod_ids: Vec<PodId>,
    pub image: String,
}

impl RollingRequest {
    pub fn new(pod_ids: Vec<PodId>, image: impl Into<String>) -> Self {
        Self {
            pod_ids,
            image: image.into(),
        }
    }

    /// Targets must exist, be live, and share one template
    pub fn validate(&self, snapshot: &Snapshot) -> Result<()> {
        if self.pod_ids.is_empty() {
            return Err(OrchestratorError::validation("no pods selected"));
        }
        if self.image.trim().is_empty() {
            return Err(OrchestratorError::validation("image must not be empty"));
        }

        let mut seen = HashSet::new();
        let mut template: Option<&Option<String>> = None;
        for id in &self.pod_ids {
            if !seen.insert(id) {
                return Err(OrchestratorError::validation(format!("pod {} selected twice", id)));
            }
            let pod = snapshot
                .pod(id)
                .ok_or_else(|| OrchestratorError::PodNotFound(id.clone()))?;
            if pod.status == PodStatus::Terminated {
                return Err(OrchestratorError::validation(format!("pod {} is terminated", id)));
            }
            match template {
                None => template = Some(&pod.template_id),
                Some(t) if *t != pod.template_id => {
                    return Err(OrchestratorError::validation(
                        "selected pods do not share a template",
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Executes rolling updates
pub struct RollingWorkflow {
    coordinator: Arc<ActionCoordinator>,
    store: Arc<StateStore>,
    trigger: RefreshTrigger,
    config: RollingConfig,
}

impl RollingWorkflow {
    pub fn new(
        coordinator: Arc<ActionCoordinator>,
        store: Arc<StateStore>,
        trigger: RefreshTrigger,
        config: RollingConfig,
    ) -> Self {
        Self {
            coordinator,
            store,
            trigger,
            config,
        }
    }

    pub async fn run(&self, request: RollingRequest, mut recorder: WorkflowRecorder) -> WorkflowRun {
        let short_id = short_run_id(&recorder.run_id());
        let snapshot = self.store.snapshot().await;
        let parallelism = self.config.parallelism.max(1);

        recorder.detail("image", &request.image);
        recorder.detail("pods", request.pod_ids.len());
        recorder.detail("parallelism", parallelism);
        if let Some(pod) = request.pod_ids.first().and_then(|id| snapshot.pod(id)) {
            recorder.detail("previous_image", &pod.image);
        }

        info!(
            run_id = %recorder.run_id(),
            pods = request.pod_ids.len(),
            image = %request.image,
            parallelism,
            "Starting rolling update"
        );

        let targets: Vec<(PodId, Option<Pod>)> = request
            .pod_ids
            .iter()
            .map(|id| (id.clone(), snapshot.pod(id).cloned()))
            .collect();

        for (group_index, group) in targets.chunks(parallelism).enumerate() {
            if recorder.is_cancelled() {
                info!(run_id = %recorder.run_id(), "Rolling update cancelled");
                break;
            }

            let results = join_all(
                group
                    .iter()
                    .map(|(id, pod)| self.replace_one(id, pod.as_ref(), &request.image, &short_id, &recorder)),
            )
            .await;

            let halted = results.iter().any(|r| !r.outcome.is_success());
            for result in results {
                recorder.record(result);
            }

            if halted {
                let rest = targets
                    .get((group_index + 1) * parallelism..)
                    .unwrap_or_default()
                    .iter()
                    .map(|(id, pod)| {
                        let label = pod.as_ref().map_or_else(|| id.to_string(), |p| p.name.clone());
                        (label, Some(id.clone()))
                    });
                warn!(run_id = %recorder.run_id(), "Rolling update halted");
                recorder.skip_remaining(rest, "halted after earlier failure");
                break;
            }
        }

        recorder.finish()
    }

    async fn replace_one(
        &self,
        old_id: &PodId,
        old: Option<&Pod>,
        image: &str,
        short_id: &str,
        recorder: &WorkflowRecorder,
    ) -> ItemResult {
        let Some(old) = old else {
            let failure = ActionFailure::new(FailureKind::NotFound, format!("pod {} no longer known", old_id));
            recorder.phase(old_id, RollingPhase::Failed);
            return ItemResult::new(old_id.to_string(), ItemOutcome::Failed(failure))
                .with_pod(Some(old_id.clone()));
        };
        let item = |outcome| ItemResult::new(old.name.clone(), outcome).with_pod(Some(old.id.clone()));

        recorder.item_started(&old.name, Some(&old.id));
        recorder.phase(&old.id, RollingPhase::CreatingReplacement);

        let spec = PodSpec::replacing(old, format!("{}-v2-{}", old.name, short_id), image);
        let created = self.coordinator.create_pod(&spec).await;
        let replacement = match created.pod {
            Some(pod) => pod,
            None => {
                recorder.phase(&old.id, RollingPhase::Failed);
                let failure = created
                    .ticket
                    .failure
                    .unwrap_or_else(|| ActionFailure::new(FailureKind::Internal, "create returned no pod"));
                return item(ItemOutcome::Failed(failure)).with_ticket(created.ticket.id);
            }
        };

        recorder.phase(&old.id, RollingPhase::AwaitingHealthy);
        if let Err(failure) = self.wait_for_healthy(&replacement.id).await {
            recorder.phase(&old.id, RollingPhase::Failed);
            if self.config.cleanup_failed_replacement {
                self.cleanup(&replacement.id).await;
            }
            return item(ItemOutcome::Failed(failure)).with_replacement(Some(replacement.id));
        }

        if !self.config.drain_grace.is_zero() {
            recorder.phase(&old.id, RollingPhase::Draining);
            debug!(pod_id = %old.id, grace_ms = self.config.drain_grace.as_millis() as u64, "Draining");
            tokio::time::sleep(self.config.drain_grace).await;
        }

        recorder.phase(&old.id, RollingPhase::RetiringOld);
        let retired = match self.config.retire_action {
            RetireAction::Terminate => self.coordinator.terminate(&old.id).await,
            RetireAction::Stop => self.coordinator.stop(&old.id).await,
        };

        let outcome = match retired {
            Ok(ticket) => match ticket.failure {
                None => ItemOutcome::Succeeded,
                Some(failure) => ItemOutcome::Failed(failure),
            },
            Err(e) => ItemOutcome::Failed(ActionFailure::from(&e)),
        };

        recorder.phase(
            &old.id,
            if outcome.is_success() {
                RollingPhase::Completed
            } else {
                RollingPhase::Failed
            },
        );
        item(outcome).with_replacement(Some(replacement.id))
    }

    /// Poll the store until the pod is Running, nudging the reconciler
    async fn wait_for_healthy(&self, pod_id: &PodId) -> std::result::Result<(), ActionFailure> {
        let timeout = self.config.health_timeout;
        let start = Instant::now();

        info!(pod_id = %pod_id, timeout_secs = timeout.as_secs(), "Waiting for replacement to be healthy");

        loop {
            self.trigger.refresh();
            tokio::time::sleep(self.config.health_poll_interval).await;

            match self.store.pod(pod_id).await.map(|p| p.status) {
                Some(PodStatus::Running) => {
                    info!(
                        pod_id = %pod_id,
                        elapsed_secs = start.elapsed().as_secs_f64(),
                        "Replacement is healthy"
                    );
                    return Ok(());
                }
                Some(status @ (PodStatus::Error | PodStatus::Terminated)) => {
                    return Err(ActionFailure::new(
                        FailureKind::Provider,
                        format!("replacement {} entered {}", pod_id, status),
                    ));
                }
                status => {
                    debug!(pod_id = %pod_id, ?status, "Replacement not ready yet");
                }
            }

            if start.elapsed() >= timeout {
                return Err(ActionFailure::from(&OrchestratorError::HealthTimeout {
                    pod_id: pod_id.clone(),
                    after: timeout,
                }));
            }
        }
    }

    async fn cleanup(&self, replacement: &PodId) {
        match self.coordinator.terminate(replacement).await {
            Ok(ticket) if ticket.is_success() => {
                info!(pod_id = %replacement, "Removed unhealthy replacement");
            }
            Ok(ticket) => {
                warn!(pod_id = %replacement, failure = ?ticket.failure, "Could not remove unhealthy replacement");
            }
            Err(e) => {
                warn!(pod_id = %replacement, error = %e, "Could not remove unhealthy replacement");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, RetryPolicy};
    use crate::mock::{MockCall, MockGateway};
    use crate::reconciler::{Reconciler, ReconcilerHandle};
    use crate::workflow::{WorkflowKind, WorkflowProgress, WorkflowStatus};
    use std::time::Duration;

    fn web(i: usize) -> Pod {
        Pod::new(format!("p{}", i), format!("web-{}", i))
            .with_status(PodStatus::Running)
            .with_image("app:v1")
            .with_template("tpl-web")
            .with_gpu("NVIDIA A40", 1)
    }

    fn rolling_config() -> RollingConfig {
        RollingConfig::default()
            .with_health_timeout(Duration::from_millis(300))
            .with_health_poll_interval(Duration::from_millis(10))
    }

    struct Fixture {
        gateway: Arc<MockGateway>,
        store: Arc<StateStore>,
        reconciler: ReconcilerHandle,
        workflow: RollingWorkflow,
    }

    async fn fixture(pods: Vec<Pod>, config: RollingConfig) -> Fixture {
        let gateway = Arc::new(MockGateway::new().with_pods(pods));
        let store = Arc::new(StateStore::new());
        let engine_config = EngineConfig::default().with_refresh_interval(Duration::from_millis(20));
        let reconciler = Arc::new(Reconciler::new(gateway.clone(), store.clone(), &engine_config));
        reconciler.reconcile_once().await.unwrap();
        let trigger = reconciler.trigger();
        let reconciler = reconciler.spawn();

        let coordinator = Arc::new(ActionCoordinator::new(
            gateway.clone(),
            store.clone(),
            RetryPolicy::none(),
        ));
        let workflow = RollingWorkflow::new(coordinator, store.clone(), trigger, config);
        Fixture {
            gateway,
            store,
            reconciler,
            workflow,
        }
    }

    fn request(n: usize) -> RollingRequest {
        RollingRequest::new((0..n).map(|i| PodId::new(format!("p{}", i))).collect(), "app:v2")
    }

    #[tokio::test]
    async fn test_rolling_replaces_every_pod() {
        let f = fixture((0..3).map(web).collect(), rolling_config()).await;
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::RollingUpdate);

        let run = f.workflow.run(request(3), recorder).await;

        assert_eq!(run.status, WorkflowStatus::Succeeded);
        assert!(run.items.iter().all(|i| i.replacement_pod_id.is_some()));
        for i in 0..3 {
            let old = PodId::new(format!("p{}", i));
            assert_eq!(f.gateway.calls_for(&old), vec![MockCall::Terminate(old.clone())]);
        }
        let images: Vec<_> = f.gateway.pods().into_iter().map(|p| p.image).collect();
        assert_eq!(images, vec!["app:v2"; 3]);
        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unhealthy_replacement_halts_rollout() {
        let f = fixture((0..3).map(web).collect(), rolling_config()).await;
        f.gateway.never_healthy("web-1-v2");
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::RollingUpdate);

        let run = f.workflow.run(request(3), recorder).await;

        assert_eq!(run.status, WorkflowStatus::PartialFailure);
        assert!(run.items[0].outcome.is_success());
        assert_eq!(run.items[1].outcome.failure().unwrap().kind, FailureKind::Timeout);
        assert!(run.items[1].outcome.failure().unwrap().message.contains("not healthy after"));
        assert!(matches!(run.items[2].outcome, ItemOutcome::Skipped(_)));
        assert_eq!(run.first_error.as_ref().unwrap().kind, FailureKind::Timeout);

        // Only the first old pod was retired; the others never saw a mutation
        let p0 = PodId::new("p0");
        assert_eq!(f.gateway.calls_for(&p0), vec![MockCall::Terminate(p0.clone())]);
        assert!(f.gateway.calls_for(&PodId::new("p1")).is_empty());
        assert!(f.gateway.calls_for(&PodId::new("p2")).is_empty());
        assert_eq!(f.gateway.pod(&PodId::new("p1")).unwrap().image, "app:v1");
        assert_eq!(f.gateway.pod(&PodId::new("p2")).unwrap().image, "app:v1");

        // The stuck replacement was cleaned up
        let stuck = run.items[1].replacement_pod_id.clone().unwrap();
        assert!(f.gateway.pod(&stuck).is_none());
        assert_eq!(f.gateway.mutations().len(), 4);
        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_group_failure_is_failed() {
        let f = fixture((0..2).map(web).collect(), rolling_config()).await;
        f.gateway.never_healthy("web-0-v2");
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::RollingUpdate);

        let run = f.workflow.run(request(2), recorder).await;
        assert_eq!(run.status, WorkflowStatus::Failed);
        assert_eq!(run.skipped_count(), 1);
        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_retire_with_drain_phases() {
        let config = rolling_config()
            .with_retire_action(RetireAction::Stop)
            .with_drain_grace(Duration::from_millis(5));
        let f = fixture(vec![web(0)], config).await;
        let (recorder, mut rx) = WorkflowRecorder::new(WorkflowKind::RollingUpdate);

        let run = f.workflow.run(request(1), recorder).await;
        assert_eq!(run.status, WorkflowStatus::Succeeded);
        assert_eq!(
            f.store.pod(&PodId::new("p0")).await.unwrap().status,
            PodStatus::Stopped
        );

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkflowProgress::Phase { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                RollingPhase::CreatingReplacement,
                RollingPhase::AwaitingHealthy,
                RollingPhase::Draining,
                RollingPhase::RetiringOld,
                RollingPhase::Completed,
            ]
        );
        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_parallel_groups() {
        let f = fixture(
            (0..4).map(web).collect(),
            rolling_config().with_parallelism(2),
        )
        .await;
        f.gateway.never_healthy("web-3-v2");
        let (recorder, _rx) = WorkflowRecorder::new(WorkflowKind::RollingUpdate);

        let run = f.workflow.run(request(4), recorder).await;

        // Second group has one failure; both of its members settle, nothing is skipped
        assert_eq!(run.status, WorkflowStatus::PartialFailure);
        assert_eq!(run.succeeded_count(), 3);
        assert_eq!(run.failed_count(), 1);
        assert_eq!(run.skipped_count(), 0);
        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation() {
        let mut other = web(1);
        other.template_id = Some("tpl-other".into());
        let f = fixture(vec![web(0), other], rolling_config()).await;
        let snapshot = f.store.snapshot().await;

        assert!(matches!(
            request(2).validate(&snapshot),
            Err(OrchestratorError::Validation(_))
        ));
        assert!(matches!(
            RollingRequest::new(vec![PodId::new("ghost")], "app:v2").validate(&snapshot),
            Err(OrchestratorError::PodNotFound(_))
        ));
        assert!(RollingRequest::new(vec![], "app:v2").validate(&snapshot).is_err());
        assert!(request(1).validate(&snapshot).is_ok());
        f.reconciler.shutdown().await;
    }
}
