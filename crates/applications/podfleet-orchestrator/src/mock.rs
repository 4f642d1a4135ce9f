//! Scripted in-memory provider
//!
//! Behaves like a small provider account: created pods start `Provisioning`
//! and come up `Running` on the next listing, terminated pods disappear,
//! GPU stock is consumed by creates. On top of that, tests can script
//! failures, latency and pods that never become healthy, and read back every
//! call that was made.

use async_trait::async_trait;
use podfleet_core::{
    GatewayError, GpuType, Pod, PodId, PodSpec, PodStatus, ProviderGateway, Result, StockStatus,
    Template,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Message the provider returns when stock ran out between listing and create
pub const NO_INSTANCES_MESSAGE: &str =
    "There are no longer any instances available with the requested specifications";

/// One recorded gateway call
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    ListPods,
    ListGpus,
    ListTemplates { include_public: bool },
    Create { name: String },
    CreateBatch { name: String, count: u32 },
    Stop(PodId),
    Terminate(PodId),
    Restart(PodId, u32),
    UpdateImage(PodId, String),
}

impl MockCall {
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::ListPods | Self::ListGpus | Self::ListTemplates { .. }
        )
    }

    pub fn pod_id(&self) -> Option<&PodId> {
        match self {
            Self::Stop(id)
            | Self::Terminate(id)
            | Self::Restart(id, _)
            | Self::UpdateImage(id, _) => Some(id),
            _ => None,
        }
    }
}

#[derive(Default)]
struct MockState {
    pods: BTreeMap<PodId, Pod>,
    gpu_types: Vec<GpuType>,
    templates: Vec<Template>,
    calls: Vec<MockCall>,
    pod_errors: HashMap<PodId, VecDeque<GatewayError>>,
    create_errors: VecDeque<GatewayError>,
    /// Creates that succeed on the provider but report this error
    lost_create_responses: VecDeque<GatewayError>,
    /// Batch creates that deliver fewer pods than asked for
    batch_shortfall: u32,
    list_errors: VecDeque<GatewayError>,
    /// Created pods whose name contains one of these stay Provisioning
    never_healthy: Vec<String>,
}

/// In-memory [`ProviderGateway`]
pub struct MockGateway {
    state: Mutex<MockState>,
    latency_ms: AtomicU64,
    batch_create: AtomicBool,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            latency_ms: AtomicU64::new(0),
            batch_create: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_pods(self, pods: impl IntoIterator<Item = Pod>) -> Self {
        for pod in pods {
            self.add_pod(pod);
        }
        self
    }

    pub fn with_gpu_types(self, gpus: Vec<GpuType>) -> Self {
        self.set_gpu_types(gpus);
        self
    }

    /// Templates listed to every caller; public ones only when asked for
    pub fn with_templates(self, templates: Vec<Template>) -> Self {
        self.lock().templates = templates;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Delay applied to every call
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    pub fn with_batch_create(self, enabled: bool) -> Self {
        self.batch_create.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn add_pod(&self, pod: Pod) {
        self.lock().pods.insert(pod.id.clone(), pod);
    }

    /// Drop a pod as if it was deleted outside this process
    pub fn remove_pod(&self, id: &PodId) {
        self.lock().pods.remove(id);
    }

    pub fn set_status(&self, id: &PodId, status: PodStatus) {
        if let Some(pod) = self.lock().pods.get_mut(id) {
            pod.status = status;
        }
    }

    pub fn set_gpu_types(&self, gpus: Vec<GpuType>) {
        self.lock().gpu_types = gpus;
    }

    pub fn pod(&self, id: &PodId) -> Option<Pod> {
        self.lock().pods.get(id).cloned()
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.lock().pods.values().cloned().collect()
    }

    /// Fail the next mutation targeting `id`
    pub fn fail_next(&self, id: &PodId, err: GatewayError) {
        self.lock()
            .pod_errors
            .entry(id.clone())
            .or_default()
            .push_back(err);
    }

    pub fn fail_next_create(&self, err: GatewayError) {
        self.lock().create_errors.push_back(err);
    }

    /// Let the next create land but answer it with `err`
    pub fn lose_next_create_response(&self, err: GatewayError) {
        self.lock().lost_create_responses.push_back(err);
    }

    /// Batch creates deliver `missing` fewer pods than requested
    pub fn short_batches(&self, missing: u32) {
        self.lock().batch_shortfall = missing;
    }

    /// Fail the next `list_pods` call
    pub fn fail_next_list(&self, err: GatewayError) {
        self.lock().list_errors.push_back(err);
    }

    /// Created pods whose name contains `fragment` never reach Running
    pub fn never_healthy(&self, fragment: impl Into<String>) {
        self.lock().never_healthy.push(fragment.into());
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<MockCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    /// Calls made against one pod
    pub fn calls_for(&self, id: &PodId) -> Vec<MockCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.pod_id() == Some(id))
            .cloned()
            .collect()
    }

    /// Highest number of mutations observed running at the same time
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, call: MockCall) -> InFlight<'_> {
        let mutation = call.is_mutation();
        self.lock().calls.push(call);
        if mutation {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        }
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        InFlight {
            counter: mutation.then_some(&self.in_flight),
        }
    }

    fn take_pod_error(&self, id: &PodId) -> Option<GatewayError> {
        self.lock().pod_errors.get_mut(id).and_then(|q| q.pop_front())
    }

    fn spawn_pod(&self, state: &mut MockState, name: String, spec: &PodSpec) -> Result<Pod> {
        let gpu = state
            .gpu_types
            .iter_mut()
            .find(|g| g.id == spec.gpu_type_id);
        let price = match gpu {
            Some(gpu) => {
                if gpu.available_count < spec.gpu_count {
                    return Err(GatewayError::provider(NO_INSTANCES_MESSAGE));
                }
                gpu.available_count -= spec.gpu_count;
                if gpu.available_count == 0 {
                    gpu.stock_status = StockStatus::OutOfStock;
                }
                gpu.price_for(spec.cloud_type)
            }
            // Unknown SKUs are accepted so tests can skip stock bookkeeping
            None => 0.0,
        };

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut pod = Pod::new(format!("mock-{}", n), name)
            .with_image(spec.image.clone())
            .with_gpu(spec.gpu_type_id.clone(), spec.gpu_count)
            .with_cost(price * spec.gpu_count as f64);
        pod.template_id = spec.template_id.clone();
        pod.gpu_display_name = spec.gpu_type_id.clone();
        pod.container_disk_in_gb = spec.container_disk_in_gb;
        pod.volume_in_gb = spec.volume_in_gb;
        pod.volume_mount_path = spec.volume_mount_path.clone();
        pod.ports = spec.ports.clone();
        pod.env = spec.env.clone();

        state.pods.insert(pod.id.clone(), pod.clone());
        Ok(pod)
    }

    fn mutate<F>(&self, id: &PodId, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<PodId, Pod>),
    {
        if let Some(err) = self.take_pod_error(id) {
            return Err(err);
        }
        let mut state = self.lock();
        if !state.pods.contains_key(id) {
            return Err(GatewayError::not_found(id.to_string()));
        }
        f(&mut state.pods);
        Ok(())
    }
}

/// Decrements the in-flight gauge when a mutation returns
struct InFlight<'a> {
    counter: Option<&'a AtomicUsize>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ProviderGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let _guard = self.enter(MockCall::ListPods).await;
        let mut state = self.lock();
        if let Some(err) = state.list_errors.pop_front() {
            return Err(err);
        }

        let never_healthy = state.never_healthy.clone();
        for pod in state.pods.values_mut() {
            if pod.status == PodStatus::Provisioning
                && !never_healthy.iter().any(|f| pod.name.contains(f.as_str()))
            {
                pod.status = PodStatus::Running;
            }
            pod.observed_at = chrono::Utc::now();
        }
        Ok(state.pods.values().cloned().collect())
    }

    async fn list_gpu_availability(&self) -> Result<Vec<GpuType>> {
        let _guard = self.enter(MockCall::ListGpus).await;
        Ok(self.lock().gpu_types.clone())
    }

    async fn list_templates(&self, include_public: bool) -> Result<Vec<Template>> {
        let _guard = self.enter(MockCall::ListTemplates { include_public }).await;
        Ok(self
            .lock()
            .templates
            .iter()
            .filter(|t| include_public || !t.is_public)
            .cloned()
            .collect())
    }

    fn supports_batch_create(&self) -> bool {
        self.batch_create.load(Ordering::SeqCst)
    }

    async fn create_pods(&self, spec: &PodSpec, count: u32) -> Result<Vec<Pod>> {
        let _guard = self
            .enter(MockCall::CreateBatch {
                name: spec.name.clone(),
                count,
            })
            .await;
        if !self.supports_batch_create() {
            return Err(GatewayError::provider("mock does not support batch creation"));
        }

        let mut state = self.lock();
        if let Some(err) = state.create_errors.pop_front() {
            return Err(err);
        }
        let needed = spec.gpu_count * count;
        if let Some(gpu) = state.gpu_types.iter().find(|g| g.id == spec.gpu_type_id) {
            if gpu.available_count < needed {
                return Err(GatewayError::provider(NO_INSTANCES_MESSAGE));
            }
        }
        let delivered = count.saturating_sub(state.batch_shortfall);
        let pods = (0..delivered)
            .map(|i| self.spawn_pod(&mut state, format!("{}-{}", spec.name, i), spec))
            .collect::<Result<Vec<_>>>()?;
        match state.lost_create_responses.pop_front() {
            Some(err) => Err(err),
            None => Ok(pods),
        }
    }

    async fn create_pod(&self, spec: &PodSpec) -> Result<Pod> {
        let _guard = self
            .enter(MockCall::Create {
                name: spec.name.clone(),
            })
            .await;
        let mut state = self.lock();
        if let Some(err) = state.create_errors.pop_front() {
            return Err(err);
        }
        let pod = self.spawn_pod(&mut state, spec.name.clone(), spec)?;
        match state.lost_create_responses.pop_front() {
            Some(err) => Err(err),
            None => Ok(pod),
        }
    }

    async fn stop_pod(&self, id: &PodId) -> Result<()> {
        let _guard = self.enter(MockCall::Stop(id.clone())).await;
        self.mutate(id, |pods| {
            if let Some(pod) = pods.get_mut(id) {
                pod.status = PodStatus::Stopped;
                pod.uptime_secs = 0;
            }
        })
    }

    async fn terminate_pod(&self, id: &PodId) -> Result<()> {
        let _guard = self.enter(MockCall::Terminate(id.clone())).await;
        self.mutate(id, |pods| {
            pods.remove(id);
        })
    }

    async fn restart_pod(&self, id: &PodId, gpu_count: u32) -> Result<()> {
        let _guard = self.enter(MockCall::Restart(id.clone(), gpu_count)).await;
        self.mutate(id, |pods| {
            if let Some(pod) = pods.get_mut(id) {
                pod.status = PodStatus::Provisioning;
                pod.gpu_count = gpu_count;
            }
        })
    }

    async fn update_pod_image(&self, id: &PodId, image: &str) -> Result<()> {
        let _guard = self
            .enter(MockCall::UpdateImage(id.clone(), image.to_string()))
            .await;
        self.mutate(id, |pods| {
            if let Some(pod) = pods.get_mut(id) {
                pod.image = image.to_string();
                pod.status = PodStatus::Provisioning;
            }
        })
    }
}
