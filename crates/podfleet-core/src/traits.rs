//! Core traits for PodFleet
//!
//! The ProviderGateway trait is the only way the orchestrator talks to the
//! remote compute provider. Implementations are thin: one call, one request,
//! classified error. Retries live above the gateway.

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::types::*;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Human-readable provider name (for logs)
    fn name(&self) -> &str;

    /// Live state
    async fn list_pods(&self) -> Result<Vec<Pod>>;
    async fn list_gpu_availability(&self) -> Result<Vec<GpuType>>;

    /// Templates owned by the account, plus public ones when asked
    async fn list_templates(&self, include_public: bool) -> Result<Vec<Template>>;

    /// Whether `create_pods` can create a whole batch in one call
    fn supports_batch_create(&self) -> bool {
        false
    }

    /// Create `count` pods from one spec in a single provider call.
    ///
    /// Only meaningful when [`supports_batch_create`](Self::supports_batch_create)
    /// returns true.
    async fn create_pods(&self, _spec: &PodSpec, _count: u32) -> Result<Vec<Pod>> {
        Err(GatewayError::provider(format!(
            "{} does not support batch creation",
            self.name()
        )))
    }

    /// Lifecycle
    async fn create_pod(&self, spec: &PodSpec) -> Result<Pod>;
    async fn stop_pod(&self, id: &PodId) -> Result<()>;
    async fn terminate_pod(&self, id: &PodId) -> Result<()>;
    /// Resume a stopped pod on `gpu_count` GPUs
    async fn restart_pod(&self, id: &PodId, gpu_count: u32) -> Result<()>;
    async fn update_pod_image(&self, id: &PodId, image: &str) -> Result<()>;
}
