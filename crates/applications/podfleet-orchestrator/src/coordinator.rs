//! Per-pod action execution
//!
//! Every provider mutation goes through the [`ActionCoordinator`]. It:
//! 1. Takes the exclusive lock for the target pod (a busy pod is a conflict,
//!    not a queue)
//! 2. Calls the gateway, retrying transient failures with exponential backoff.
//!    A create whose outcome is unknown (timeout, 5xx) is looked up on the
//!    provider before it is sent again, so a lost response never bills a
//!    second pod
//! 3. Applies the expected status to the store as soon as the call succeeds
//! 4. Broadcasts every ticket transition as an [`ActionEvent`]
//!
//! The lock is a [`PodLease`] guard; dropping it releases the pod on every
//! exit path, including cancellation of the calling future.

use crate::config::RetryPolicy;
use crate::error::{ActionFailure, OrchestratorError, Result};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use podfleet_core::{
    ActionKind, GatewayError, GatewayErrorKind, Pod, PodId, PodPatch, PodSpec, PodStatus,
    ProviderGateway,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the action event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Note recorded when a destructive action finds the pod already gone
pub const ALREADY_GONE_NOTE: &str = "already gone";

/// Ticket lifecycle: `Pending -> InFlight -> {Succeeded | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl TicketState {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One provider call against one pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTicket {
    pub id: Uuid,
    /// Absent for a create until the provider assigns an id
    pub pod_id: Option<PodId>,
    pub kind: ActionKind,
    pub state: TicketState,
    pub attempts: u32,
    pub failure: Option<ActionFailure>,
    pub note: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ActionTicket {
    fn new(kind: ActionKind, pod_id: Option<PodId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pod_id,
            kind,
            state: TicketState::Pending,
            attempts: 0,
            failure: None,
            note: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == TicketState::Succeeded
    }
}

/// A mutation against an existing pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodAction {
    Stop,
    Terminate,
    Restart,
    UpdateImage { image: String },
}

impl PodAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Stop => ActionKind::Stop,
            Self::Terminate => ActionKind::Terminate,
            Self::Restart => ActionKind::Restart,
            Self::UpdateImage { .. } => ActionKind::UpdateImage,
        }
    }

    /// Local state assumed once the provider accepted the call
    fn expected_patch(&self) -> PodPatch {
        match self {
            Self::Stop => PodPatch::status(PodStatus::Stopped),
            Self::Terminate => PodPatch::status(PodStatus::Terminated),
            Self::Restart => PodPatch::status(PodStatus::Provisioning),
            Self::UpdateImage { image } => {
                PodPatch::status(PodStatus::Provisioning).with_image(image.clone())
            }
        }
    }
}

impl std::fmt::Display for PodAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// Ticket transition broadcast to subscribers
#[derive(Debug, Clone)]
pub struct ActionEvent {
    pub ticket: ActionTicket,
    pub at: DateTime<Utc>,
}

/// Result of a create
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub ticket: ActionTicket,
    pub pod: Option<Pod>,
}

#[derive(Default)]
struct Registry {
    locks: HashMap<PodId, Uuid>,
    active: HashMap<Uuid, ActionTicket>,
}

/// Exclusive hold on one pod (or on a create slot); released on drop
struct PodLease<'a> {
    coordinator: &'a ActionCoordinator,
    ticket_id: Uuid,
    pod_id: Option<PodId>,
}

impl Drop for PodLease<'_> {
    fn drop(&mut self) {
        let mut registry = self.coordinator.registry();
        registry.active.remove(&self.ticket_id);
        if let Some(pod_id) = &self.pod_id {
            if registry.locks.get(pod_id) == Some(&self.ticket_id) {
                registry.locks.remove(pod_id);
            }
        }
    }
}

/// Serialises, retries and records provider mutations
pub struct ActionCoordinator {
    gateway: Arc<dyn ProviderGateway>,
    store: Arc<StateStore>,
    retry: RetryPolicy,
    registry: Mutex<Registry>,
    events: broadcast::Sender<ActionEvent>,
}

impl ActionCoordinator {
    pub fn new(gateway: Arc<dyn ProviderGateway>, store: Arc<StateStore>, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            gateway,
            store,
            retry,
            registry: Mutex::new(Registry::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActionEvent> {
        self.events.subscribe()
    }

    /// Tickets currently Pending or InFlight
    pub fn in_flight(&self) -> Vec<ActionTicket> {
        let mut tickets: Vec<_> = self.registry().active.values().cloned().collect();
        tickets.sort_by_key(|t| t.started_at);
        tickets
    }

    pub fn is_locked(&self, pod_id: &PodId) -> bool {
        self.registry().locks.contains_key(pod_id)
    }

    pub fn supports_batch_create(&self) -> bool {
        self.gateway.supports_batch_create()
    }

    pub async fn stop(&self, pod_id: &PodId) -> Result<ActionTicket> {
        self.execute(pod_id, PodAction::Stop).await
    }

    pub async fn terminate(&self, pod_id: &PodId) -> Result<ActionTicket> {
        self.execute(pod_id, PodAction::Terminate).await
    }

    pub async fn restart(&self, pod_id: &PodId) -> Result<ActionTicket> {
        self.execute(pod_id, PodAction::Restart).await
    }

    pub async fn update_image(&self, pod_id: &PodId, image: &str) -> Result<ActionTicket> {
        self.execute(
            pod_id,
            PodAction::UpdateImage {
                image: image.to_string(),
            },
        )
        .await
    }

    /// Run one action against one pod.
    ///
    /// Returns `Err(ActionConflict)` without touching the provider if the pod
    /// is busy. Otherwise the returned ticket is settled: provider failures are
    /// recorded on it, not returned as errors.
    pub async fn execute(&self, pod_id: &PodId, action: PodAction) -> Result<ActionTicket> {
        let mut ticket = ActionTicket::new(action.kind(), Some(pod_id.clone()));
        let _lease = self.acquire(&ticket)?;
        self.publish(&ticket);

        self.transition(&mut ticket, TicketState::InFlight);
        let gateway: &dyn ProviderGateway = self.gateway.as_ref();
        let result = match &action {
            PodAction::Stop => {
                self.call_with_retry(&mut ticket, move || gateway.stop_pod(pod_id))
                    .await
            }
            PodAction::Terminate => {
                self.call_with_retry(&mut ticket, move || gateway.terminate_pod(pod_id))
                    .await
            }
            PodAction::Restart => {
                let gpu_count = self.restart_gpu_count(pod_id).await;
                self.call_with_retry(&mut ticket, move || gateway.restart_pod(pod_id, gpu_count))
                    .await
            }
            PodAction::UpdateImage { image } => {
                let image = image.as_str();
                self.call_with_retry(&mut ticket, move || {
                    gateway.update_pod_image(pod_id, image)
                })
                .await
            }
        };

        match result {
            Ok(()) => {
                self.store
                    .apply_local_update(pod_id, &action.expected_patch())
                    .await;
                self.succeed(&mut ticket);
            }
            Err(err)
                if err.kind() == GatewayErrorKind::NotFound && action.kind().is_destructive() =>
            {
                info!(pod_id = %pod_id, action = %action, "Pod already gone");
                ticket.note = Some(ALREADY_GONE_NOTE.to_string());
                self.store
                    .apply_local_update(pod_id, &PodPatch::status(PodStatus::Terminated))
                    .await;
                self.succeed(&mut ticket);
            }
            Err(err) => self.fail(&mut ticket, &err),
        }

        Ok(ticket)
    }

    /// Create one pod. The new pod is inserted into the store on success.
    pub async fn create_pod(&self, spec: &PodSpec) -> CreateOutcome {
        let mut ticket = ActionTicket::new(ActionKind::Create, None);
        let _lease = self.acquire_unkeyed(&ticket);
        self.publish(&ticket);

        self.transition(&mut ticket, TicketState::InFlight);
        let gateway: &dyn ProviderGateway = self.gateway.as_ref();
        let result = self
            .create_with_retry(&mut ticket, spec, 1, move || async move {
                gateway.create_pod(spec).await.map(|pod| vec![pod])
            })
            .await
            .and_then(|pods| {
                pods.into_iter()
                    .next()
                    .ok_or_else(|| GatewayError::provider("pod creation returned no pod"))
            });
        match result {
            Ok(pod) => {
                ticket.pod_id = Some(pod.id.clone());
                self.store.insert_local(pod.clone()).await;
                self.succeed(&mut ticket);
                CreateOutcome {
                    ticket,
                    pod: Some(pod),
                }
            }
            Err(err) => {
                self.fail(&mut ticket, &err);
                CreateOutcome { ticket, pod: None }
            }
        }
    }

    /// Create `count` pods in one provider call.
    ///
    /// Always returns `count` outcomes, one ticket per pod. When the call
    /// fails every outcome carries the same failure.
    pub async fn create_batch(&self, spec: &PodSpec, count: u32) -> Vec<CreateOutcome> {
        let mut call = ActionTicket::new(ActionKind::Create, None);
        let _lease = self.acquire_unkeyed(&call);
        self.transition(&mut call, TicketState::InFlight);

        let gateway: &dyn ProviderGateway = self.gateway.as_ref();
        let result = self
            .create_with_retry(&mut call, spec, count, move || gateway.create_pods(spec, count))
            .await;

        match result {
            Ok(pods) => {
                let mut outcomes = Vec::with_capacity(pods.len());
                for pod in pods {
                    let mut ticket = call.clone();
                    ticket.id = Uuid::new_v4();
                    ticket.pod_id = Some(pod.id.clone());
                    self.store.insert_local(pod.clone()).await;
                    self.succeed(&mut ticket);
                    outcomes.push(CreateOutcome {
                        ticket,
                        pod: Some(pod),
                    });
                }
                outcomes
            }
            Err(err) => (0..count)
                .map(|_| {
                    let mut ticket = call.clone();
                    ticket.id = Uuid::new_v4();
                    self.fail(&mut ticket, &err);
                    CreateOutcome { ticket, pod: None }
                })
                .collect(),
        }
    }

    async fn call_with_retry<T, F, Fut>(
        &self,
        ticket: &mut ActionTicket,
        mut call: F,
    ) -> std::result::Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = podfleet_core::Result<T>>,
    {
        loop {
            ticket.attempts += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && ticket.attempts <= self.retry.max_retries => {
                    self.back_off(ticket, &err).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Retry loop for creates
    ///
    /// After a failure that may have landed on the provider, pods named after
    /// `spec` that the store did not know before the first attempt are
    /// adopted instead of sending the create again. If the provider cannot
    /// be listed the original error is returned without a retry.
    async fn create_with_retry<F, Fut>(
        &self,
        ticket: &mut ActionTicket,
        spec: &PodSpec,
        count: u32,
        mut call: F,
    ) -> std::result::Result<Vec<Pod>, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = podfleet_core::Result<Vec<Pod>>>,
    {
        let known: HashSet<PodId> = self
            .store
            .snapshot()
            .await
            .pods
            .into_iter()
            .map(|e| e.pod.id)
            .collect();

        loop {
            ticket.attempts += 1;
            let err = match call().await {
                Ok(pods) => return Ok(pods),
                Err(err) => err,
            };

            if may_have_landed(&err) {
                match self.gateway.list_pods().await {
                    Ok(listed) => {
                        let landed = landed_pods(listed, spec, count, &known);
                        if !landed.is_empty() {
                            info!(
                                ticket_id = %ticket.id,
                                name = %spec.name,
                                adopted = landed.len(),
                                error = %err,
                                "Create landed despite error, adopting"
                            );
                            return Ok(landed);
                        }
                    }
                    Err(list_err) => {
                        warn!(
                            ticket_id = %ticket.id,
                            name = %spec.name,
                            error = %err,
                            list_error = %list_err,
                            "Cannot confirm create outcome, not retrying"
                        );
                        return Err(err);
                    }
                }
            }

            if !err.is_retryable() || ticket.attempts > self.retry.max_retries {
                return Err(err);
            }
            self.back_off(ticket, &err).await;
        }
    }

    async fn back_off(&self, ticket: &ActionTicket, err: &GatewayError) {
        let backoff = self.retry.delay_for(ticket.attempts);
        let delay = err.retry_after().map_or(backoff, |after| after.max(backoff));
        warn!(
            ticket_id = %ticket.id,
            pod_id = ?ticket.pod_id,
            action = %ticket.kind,
            attempt = ticket.attempts,
            delay_ms = millis(delay),
            error = %err,
            "Retrying provider call"
        );
        tokio::time::sleep(delay).await;
    }

    /// GPUs to resume a pod on: its own count when the store knows it
    async fn restart_gpu_count(&self, pod_id: &PodId) -> u32 {
        match self.store.pod(pod_id).await {
            Some(pod) if pod.gpu_count > 0 => pod.gpu_count,
            _ => {
                warn!(pod_id = %pod_id, "GPU count unknown, resuming on one GPU");
                1
            }
        }
    }

    fn acquire(&self, ticket: &ActionTicket) -> Result<PodLease<'_>> {
        let pod_id = ticket
            .pod_id
            .clone()
            .ok_or_else(|| OrchestratorError::validation("ticket has no target pod"))?;

        let mut registry = self.registry();
        if let Some(holder) = registry.locks.get(&pod_id) {
            let in_flight = registry
                .active
                .get(holder)
                .map(|t| t.kind)
                .unwrap_or(ticket.kind);
            debug!(pod_id = %pod_id, requested = %ticket.kind, in_flight = %in_flight, "Pod busy");
            return Err(OrchestratorError::ActionConflict { pod_id, in_flight });
        }
        registry.locks.insert(pod_id.clone(), ticket.id);
        registry.active.insert(ticket.id, ticket.clone());

        Ok(PodLease {
            coordinator: self,
            ticket_id: ticket.id,
            pod_id: Some(pod_id),
        })
    }

    fn acquire_unkeyed(&self, ticket: &ActionTicket) -> PodLease<'_> {
        self.registry().active.insert(ticket.id, ticket.clone());
        PodLease {
            coordinator: self,
            ticket_id: ticket.id,
            pod_id: None,
        }
    }

    fn transition(&self, ticket: &mut ActionTicket, state: TicketState) {
        ticket.state = state;
        if state.is_settled() {
            ticket.finished_at = Some(Utc::now());
        }
        if let Some(active) = self.registry().active.get_mut(&ticket.id) {
            *active = ticket.clone();
        }
        self.publish(ticket);
    }

    fn succeed(&self, ticket: &mut ActionTicket) {
        info!(
            ticket_id = %ticket.id,
            pod_id = ?ticket.pod_id,
            action = %ticket.kind,
            attempts = ticket.attempts,
            note = ?ticket.note,
            "Action succeeded"
        );
        self.transition(ticket, TicketState::Succeeded);
    }

    fn fail(&self, ticket: &mut ActionTicket, err: &GatewayError) {
        let failure = ActionFailure::from(err);
        error!(
            ticket_id = %ticket.id,
            pod_id = ?ticket.pod_id,
            action = %ticket.kind,
            attempts = ticket.attempts,
            failure = %failure,
            "Action failed"
        );
        ticket.failure = Some(failure);
        self.transition(ticket, TicketState::Failed);
    }

    fn publish(&self, ticket: &ActionTicket) {
        // No subscribers is fine
        let _ = self.events.send(ActionEvent {
            ticket: ticket.clone(),
            at: Utc::now(),
        });
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Failures after which the provider may still have created the pod
fn may_have_landed(err: &GatewayError) -> bool {
    matches!(
        err.kind(),
        GatewayErrorKind::TransientNetwork | GatewayErrorKind::Provider
    )
}

/// Pods a create for `spec` produced, excluding ones known beforehand
fn landed_pods(listed: Vec<Pod>, spec: &PodSpec, count: u32, known: &HashSet<PodId>) -> Vec<Pod> {
    let batch_prefix = format!("{}-", spec.name);
    listed
        .into_iter()
        .filter(|p| !known.contains(&p.id) && p.status != PodStatus::Terminated)
        .filter(|p| p.name == spec.name || (count > 1 && p.name.starts_with(&batch_prefix)))
        .take(count as usize)
        .collect()
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
