//! Background reconciliation with the provider
//!
//! Every cycle fetches the pod listing and GPU availability concurrently and
//! merges both into the [`StateStore`] under one sequence number. Failures are
//! never raised: the store keeps its last-known data, is flagged stale, and the
//! next poll backs off.
//!
//! ## Backoff
//!
//! ```text
//! ok            -> interval
//! network x1    -> interval * 2
//! network x2    -> interval * 4
//! rate-limit x1 -> interval * 2   (new class, streak restarts)
//! ```
//!
//! Delays are capped at `max_refresh_backoff`.

use crate::config::{EngineConfig, backoff_delay};
use crate::store::{MergeReport, StateStore};
use podfleet_core::{GatewayError, GatewayErrorKind, ProviderGateway};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wakes the reconciler ahead of its next scheduled poll
#[derive(Debug, Clone, Default)]
pub struct RefreshTrigger {
    notify: Arc<Notify>,
}

impl RefreshTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a refresh. Requests made while a cycle runs collapse into one.
    pub fn refresh(&self) {
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Consecutive failures of one class
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct FailureStreak {
    kind: Option<GatewayErrorKind>,
    count: u32,
}

impl FailureStreak {
    fn record(&mut self, kind: GatewayErrorKind) {
        if self.kind == Some(kind) {
            self.count += 1;
        } else {
            self.kind = Some(kind);
            self.count = 1;
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Keeps the store in line with the provider
pub struct Reconciler {
    gateway: Arc<dyn ProviderGateway>,
    store: Arc<StateStore>,
    interval: Duration,
    max_backoff: Duration,
    trigger: RefreshTrigger,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn ProviderGateway>, store: Arc<StateStore>, config: &EngineConfig) -> Self {
        Self {
            gateway,
            store,
            interval: config.refresh_interval,
            max_backoff: config.max_refresh_backoff.max(config.refresh_interval),
            trigger: RefreshTrigger::new(),
        }
    }

    pub fn trigger(&self) -> RefreshTrigger {
        self.trigger.clone()
    }

    /// Run one fetch-and-merge cycle
    ///
    /// Whatever part of the fetch succeeded is merged. The store is marked
    /// stale and the first error returned if either call failed.
    pub async fn reconcile_once(&self) -> Result<MergeReport, GatewayError> {
        let seq = self.store.next_sequence();
        let (pods, gpus) = tokio::join!(
            self.gateway.list_pods(),
            self.gateway.list_gpu_availability()
        );

        let mut first_error = None;

        let report = match pods {
            Ok(pods) => self.store.merge_pods(seq, pods).await,
            Err(e) => {
                first_error = Some(e);
                MergeReport {
                    sequence: seq,
                    ..Default::default()
                }
            }
        };

        match gpus {
            Ok(gpus) => {
                self.store.merge_gpu_types(seq, gpus).await;
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => {
                self.store.mark_refreshed().await;
                Ok(report)
            }
            Some(e) => {
                self.store.mark_stale(&e).await;
                Err(e)
            }
        }
    }

    fn next_delay(&self, streak: &FailureStreak) -> Duration {
        if streak.count == 0 {
            self.interval
        } else {
            backoff_delay(self.interval, streak.count + 1, self.max_backoff)
        }
    }

    /// Start the polling loop
    ///
    /// Cycles never overlap. Shutdown is only observed between cycles, so a
    /// merge in progress always completes.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let trigger = self.trigger.clone();

        let task = tokio::spawn(async move {
            let mut streak = FailureStreak::default();
            info!(
                provider = self.gateway.name(),
                interval_ms = self.interval.as_millis() as u64,
                "Reconciler started"
            );

            loop {
                match self.reconcile_once().await {
                    Ok(report) => {
                        if streak.count > 0 {
                            info!(after_failures = streak.count, "Provider reachable again");
                        }
                        streak.reset();
                        debug!(
                            seq = report.sequence,
                            added = report.added.len(),
                            removed = report.removed.len(),
                            "Reconcile cycle complete"
                        );
                    }
                    Err(e) => {
                        streak.record(e.kind());
                        warn!(
                            error = %e,
                            class = %e.kind(),
                            streak = streak.count,
                            "Reconcile failed, keeping last snapshot"
                        );
                    }
                }

                let delay = self.next_delay(&streak);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.trigger.notified() => {
                        debug!("Forced refresh");
                    }
                    changed = shutdown_rx.changed() => {
                        // Handle dropped
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                if *shutdown_rx.borrow() {
                    break;
                }
            }

            info!("Reconciler stopped");
        });

        ReconcilerHandle {
            trigger,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Control handle for a running reconciler
pub struct ReconcilerHandle {
    trigger: RefreshTrigger,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn trigger(&self) -> RefreshTrigger {
        self.trigger.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop after the current cycle and wait for the loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Reconciler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockGateway};
    use podfleet_core::{GpuType, Pod, PodId, PodStatus, StockStatus};

    fn config(interval_ms: u64) -> EngineConfig {
        EngineConfig::default().with_refresh_interval(Duration::from_millis(interval_ms))
    }

    fn fixture(interval_ms: u64) -> (Arc<MockGateway>, Arc<StateStore>, Reconciler) {
        let gateway = Arc::new(
            MockGateway::new()
                .with_pods(vec![Pod::new("p1", "web-0").with_status(PodStatus::Running)])
                .with_gpu_types(vec![GpuType::new("A40", 4, StockStatus::InStock)]),
        );
        let store = Arc::new(StateStore::new());
        let reconciler = Reconciler::new(gateway.clone(), store.clone(), &config(interval_ms));
        (gateway, store, reconciler)
    }

    #[tokio::test]
    async fn test_reconcile_once_merges_both_listings() {
        let (gateway, store, reconciler) = fixture(1000);

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.added, vec![PodId::new("p1")]);

        let snap = store.snapshot().await;
        assert_eq!(snap.pods.len(), 1);
        assert_eq!(snap.gpu_types.len(), 1);
        assert!(!snap.stale);
        assert!(snap.last_refreshed_at.is_some());
        assert!(gateway.calls().contains(&MockCall::ListPods));
        assert!(gateway.calls().contains(&MockCall::ListGpus));
    }

    #[tokio::test]
    async fn test_failure_keeps_last_snapshot_and_marks_stale() {
        let (gateway, store, reconciler) = fixture(1000);
        reconciler.reconcile_once().await.unwrap();

        gateway.remove_pod(&PodId::new("p1"));
        gateway.fail_next_list(GatewayError::transient("connection reset"));
        let err = reconciler.reconcile_once().await.unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::TransientNetwork);

        let snap = store.snapshot().await;
        assert!(snap.stale);
        assert_eq!(snap.pods.len(), 1);
        assert!(!snap.pods[0].vanishing);
        assert!(snap.last_error.unwrap().contains("connection reset"));

        reconciler.reconcile_once().await.unwrap();
        let snap = store.snapshot().await;
        assert!(!snap.stale);
        assert!(snap.pods[0].vanishing);
    }

    #[test]
    fn test_streak_resets_on_class_change() {
        let (_gw, _store, reconciler) = fixture(100);
        let mut streak = FailureStreak::default();
        assert_eq!(reconciler.next_delay(&streak), Duration::from_millis(100));

        streak.record(GatewayErrorKind::TransientNetwork);
        assert_eq!(reconciler.next_delay(&streak), Duration::from_millis(200));
        streak.record(GatewayErrorKind::TransientNetwork);
        assert_eq!(reconciler.next_delay(&streak), Duration::from_millis(400));

        streak.record(GatewayErrorKind::RateLimited);
        assert_eq!(streak.count, 1);
        assert_eq!(reconciler.next_delay(&streak), Duration::from_millis(200));

        streak.reset();
        assert_eq!(reconciler.next_delay(&streak), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_capped() {
        let (_gw, _store, reconciler) = fixture(100);
        let streak = FailureStreak {
            kind: Some(GatewayErrorKind::Provider),
            count: 30,
        };
        assert_eq!(reconciler.next_delay(&streak), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_trigger_forces_refresh() {
        // Interval long enough that only the trigger can cause a second cycle
        let (gateway, store, reconciler) = fixture(60_000);
        let handle = Arc::new(reconciler).spawn();

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.snapshot().await.pods.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        gateway.add_pod(Pod::new("p2", "web-1").with_status(PodStatus::Running));
        handle.trigger().refresh();

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.pod(&PodId::new("p2")).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(handle.is_running());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling() {
        let (gateway, _store, reconciler) = fixture(10);
        let handle = Arc::new(reconciler).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        let polls = gateway.calls().len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.calls().len(), polls);
    }
}
