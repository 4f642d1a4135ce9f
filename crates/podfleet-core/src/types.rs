//! Core types shared across PodFleet components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Provider-assigned identifier for a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodId(pub String);

impl PodId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PodId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PodId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Pod lifecycle status
///
/// `Terminated` is absorbing: once a pod is terminated it never comes back,
/// a new create produces a new [`PodId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodStatus {
    Provisioning,
    Running,
    Stopped,
    Terminating,
    Terminated,
    Error,
}

impl PodStatus {
    /// Check if the pod is terminal (will never change again)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Check if the pod is billing / holding a GPU
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Provisioning)
    }

    /// Whether a record in this status may be moved to `next`
    pub fn can_transition_to(&self, next: PodStatus) -> bool {
        !self.is_terminal() || next.is_terminal()
    }
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// GPU stock tier as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StockStatus {
    InStock,
    Low,
    OutOfStock,
}

impl StockStatus {
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::OutOfStock)
    }
}

/// Which provider cloud a pod may be placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CloudType {
    #[default]
    All,
    Community,
    Secure,
}

impl CloudType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Community => "COMMUNITY",
            Self::Secure => "SECURE",
        }
    }
}

/// Lifecycle operation issued against the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Stop,
    Terminate,
    Restart,
    UpdateImage,
}

impl ActionKind {
    /// Stop and terminate end with the pod gone or idle; a vanished pod is
    /// already where these actions would have put it.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Stop | Self::Terminate)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Stop => "stop",
            Self::Terminate => "terminate",
            Self::Restart => "restart",
            Self::UpdateImage => "update-image",
        };
        f.write_str(s)
    }
}

/// A rented GPU compute instance as last observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub id: PodId,
    pub name: String,
    pub template_id: Option<String>,
    pub image: String,
    pub gpu_type_id: String,
    pub gpu_display_name: String,
    pub gpu_count: u32,
    pub status: PodStatus,
    pub cost_per_hour: f64,
    pub uptime_secs: u64,
    /// Average GPU utilisation across the pod's GPUs
    pub gpu_utilization: Option<f64>,
    pub memory_utilization: Option<f64>,
    pub volume_in_gb: u32,
    pub container_disk_in_gb: u32,
    pub volume_mount_path: String,
    pub ports: String,
    /// `KEY=VALUE` pairs
    pub env: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl Pod {
    pub fn new(id: impl Into<PodId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            template_id: None,
            image: String::new(),
            gpu_type_id: String::new(),
            gpu_display_name: String::new(),
            gpu_count: 1,
            status: PodStatus::Provisioning,
            cost_per_hour: 0.0,
            uptime_secs: 0,
            gpu_utilization: None,
            memory_utilization: None,
            volume_in_gb: 0,
            container_disk_in_gb: 0,
            volume_mount_path: "/workspace".to_string(),
            ports: String::new(),
            env: Vec::new(),
            observed_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: PodStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_gpu(mut self, gpu_type_id: impl Into<String>, count: u32) -> Self {
        self.gpu_type_id = gpu_type_id.into();
        self.gpu_count = count;
        self
    }

    pub fn with_cost(mut self, cost_per_hour: f64) -> Self {
        self.cost_per_hour = cost_per_hour;
        self
    }

    pub fn with_uptime(mut self, secs: u64) -> Self {
        self.uptime_secs = secs;
        self
    }

    /// A pod is healthy once it is Running
    pub fn is_healthy(&self) -> bool {
        self.status == PodStatus::Running
    }

    /// Uptime rendered as `"3h 12m"`, `"7m"` or `"--"` when not up
    pub fn uptime_display(&self) -> String {
        if self.uptime_secs == 0 {
            return "--".to_string();
        }
        let hours = self.uptime_secs / 3600;
        let minutes = (self.uptime_secs % 3600) / 60;
        if hours > 0 {
            format!("{}h {}m", hours, minutes)
        } else {
            format!("{}m", minutes)
        }
    }
}

/// GPU SKU with live availability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuType {
    pub id: String,
    pub display_name: String,
    pub memory_gb: u32,
    pub available_count: u32,
    pub stock_status: StockStatus,
    pub secure_price: f64,
    pub community_price: f64,
    pub max_gpu_count: u32,
}

impl GpuType {
    pub fn new(id: impl Into<String>, available_count: u32, stock_status: StockStatus) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            memory_gb: 0,
            available_count,
            stock_status,
            secure_price: 0.0,
            community_price: 0.0,
            max_gpu_count: 0,
        }
    }

    pub fn with_prices(mut self, secure: f64, community: f64) -> Self {
        self.secure_price = secure;
        self.community_price = community;
        self
    }

    pub fn with_memory(mut self, gb: u32) -> Self {
        self.memory_gb = gb;
        self
    }

    /// Cheapest non-zero price across clouds, 0.0 when none is quoted
    pub fn lowest_price(&self) -> f64 {
        [self.community_price, self.secure_price]
            .into_iter()
            .filter(|p| *p > 0.0)
            .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
            .unwrap_or(0.0)
    }

    /// Hourly price for one GPU on the given cloud
    pub fn price_for(&self, cloud: CloudType) -> f64 {
        match cloud {
            CloudType::Community => self.community_price,
            CloudType::Secure => self.secure_price,
            CloudType::All => self.lowest_price(),
        }
    }
}

/// Caller-selectable ordering within a stock tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuSortKey {
    Price,
    Memory,
    Available,
    Name,
}

/// Sort an availability listing.
///
/// Out-of-stock entries always end up after every in-stock entry. Within a tier
/// the provider order is kept (stable sort) unless `key` is given.
pub fn sort_gpu_types(gpus: &mut [GpuType], key: Option<GpuSortKey>) {
    gpus.sort_by(|a, b| {
        let tier = (!a.stock_status.is_available()).cmp(&!b.stock_status.is_available());
        if tier != Ordering::Equal {
            return tier;
        }
        match key {
            None => Ordering::Equal,
            Some(GpuSortKey::Price) => a.lowest_price().total_cmp(&b.lowest_price()),
            Some(GpuSortKey::Memory) => b.memory_gb.cmp(&a.memory_gb),
            Some(GpuSortKey::Available) => b.available_count.cmp(&a.available_count),
            Some(GpuSortKey::Name) => a
                .display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase()),
        }
    });
}

/// Reusable pod configuration selected at deploy time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub category: String,
    pub container_disk_in_gb: u32,
    pub volume_in_gb: u32,
    pub volume_mount_path: String,
    pub ports: String,
    pub env: Vec<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_serverless: bool,
}

impl Template {
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: image.into(),
            category: String::new(),
            container_disk_in_gb: 20,
            volume_in_gb: 20,
            volume_mount_path: "/workspace".to_string(),
            ports: "8888/http".to_string(),
            env: Vec::new(),
            is_public: false,
            is_serverless: false,
        }
    }

    /// Serverless templates cannot back an on-demand pod
    pub fn is_deployable(&self) -> bool {
        !self.is_serverless && !self.image.is_empty()
    }
}

/// Concrete create request handed to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub name: String,
    pub image: String,
    pub gpu_type_id: String,
    pub gpu_count: u32,
    pub cloud_type: CloudType,
    pub template_id: Option<String>,
    pub container_disk_in_gb: u32,
    pub volume_in_gb: u32,
    pub volume_mount_path: String,
    pub ports: String,
    pub env: Vec<String>,
}

impl PodSpec {
    /// Build a spec from a template
    pub fn from_template(
        template: &Template,
        name: impl Into<String>,
        gpu_type_id: impl Into<String>,
        gpu_count: u32,
    ) -> Self {
        Self {
            name: name.into(),
            image: template.image.clone(),
            gpu_type_id: gpu_type_id.into(),
            gpu_count,
            cloud_type: CloudType::All,
            template_id: Some(template.id.clone()),
            container_disk_in_gb: template.container_disk_in_gb,
            volume_in_gb: template.volume_in_gb,
            volume_mount_path: template.volume_mount_path.clone(),
            ports: template.ports.clone(),
            env: template.env.clone(),
        }
    }

    /// Same shape as an existing pod, different image and name
    pub fn replacing(pod: &Pod, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            gpu_type_id: pod.gpu_type_id.clone(),
            gpu_count: pod.gpu_count,
            cloud_type: CloudType::All,
            template_id: pod.template_id.clone(),
            container_disk_in_gb: pod.container_disk_in_gb,
            volume_in_gb: pod.volume_in_gb,
            volume_mount_path: pod.volume_mount_path.clone(),
            ports: if pod.ports.is_empty() {
                "8888/http".to_string()
            } else {
                pod.ports.clone()
            },
            env: pod.env.clone(),
        }
    }

    pub fn with_cloud_type(mut self, cloud_type: CloudType) -> Self {
        self.cloud_type = cloud_type;
        self
    }
}

/// Partial field update applied to a pod record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodPatch {
    pub status: Option<PodStatus>,
    pub image: Option<String>,
    pub name: Option<String>,
}

impl PodPatch {
    pub fn status(status: PodStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Apply to a pod. A terminated pod keeps its status.
    pub fn apply(&self, pod: &mut Pod) {
        if let Some(status) = self.status {
            if pod.status.can_transition_to(status) {
                pod.status = status;
            }
        }
        if let Some(image) = &self.image {
            pod.image = image.clone();
        }
        if let Some(name) = &self.name {
            pod.name = name.clone();
        }
        pod.observed_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_is_absorbing() {
        assert!(!PodStatus::Terminated.can_transition_to(PodStatus::Running));
        assert!(PodStatus::Terminated.can_transition_to(PodStatus::Terminated));
        assert!(PodStatus::Stopped.can_transition_to(PodStatus::Running));
        assert!(PodStatus::Running.can_transition_to(PodStatus::Terminated));
    }

    #[test]
    fn test_serverless_template_not_deployable() {
        let mut template = Template::new("tpl", "worker", "app:v1");
        assert!(template.is_deployable());
        template.is_serverless = true;
        assert!(!template.is_deployable());
        assert!(!Template::new("tpl", "blank", "").is_deployable());
    }

    #[test]
    fn test_patch_never_resurrects() {
        let mut pod = Pod::new("p1", "worker").with_status(PodStatus::Terminated);
        PodPatch::status(PodStatus::Running).apply(&mut pod);
        assert_eq!(pod.status, PodStatus::Terminated);
    }

    #[test]
    fn test_uptime_display() {
        assert_eq!(Pod::new("p", "p").uptime_display(), "--");
        assert_eq!(Pod::new("p", "p").with_uptime(420).uptime_display(), "7m");
        assert_eq!(
            Pod::new("p", "p").with_uptime(3 * 3600 + 12 * 60).uptime_display(),
            "3h 12m"
        );
    }

    #[test]
    fn test_lowest_price_ignores_zero() {
        let gpu = GpuType::new("A100", 4, StockStatus::InStock).with_prices(1.89, 0.0);
        assert_eq!(gpu.lowest_price(), 1.89);
        let gpu = gpu.with_prices(1.89, 1.19);
        assert_eq!(gpu.lowest_price(), 1.19);
        assert_eq!(gpu.price_for(CloudType::Secure), 1.89);
    }

    #[test]
    fn test_out_of_stock_sorts_last() {
        let mut gpus = vec![
            GpuType::new("H100", 0, StockStatus::OutOfStock).with_prices(3.0, 2.5),
            GpuType::new("A40", 9, StockStatus::InStock).with_prices(0.5, 0.4),
            GpuType::new("L4", 1, StockStatus::Low).with_prices(0.3, 0.2),
            GpuType::new("T4", 0, StockStatus::OutOfStock).with_prices(0.1, 0.1),
        ];

        sort_gpu_types(&mut gpus, None);
        let ids: Vec<_> = gpus.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["A40", "L4", "H100", "T4"]);

        sort_gpu_types(&mut gpus, Some(GpuSortKey::Price));
        let ids: Vec<_> = gpus.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["L4", "A40", "T4", "H100"]);
    }

    #[test]
    fn test_replacement_spec_keeps_shape() {
        let pod = Pod::new("p1", "llm-0")
            .with_gpu("NVIDIA A40", 2)
            .with_template("tpl-1")
            .with_image("app:v1");
        let spec = PodSpec::replacing(&pod, "llm-0-v2", "app:v2");
        assert_eq!(spec.image, "app:v2");
        assert_eq!(spec.gpu_count, 2);
        assert_eq!(spec.template_id.as_deref(), Some("tpl-1"));
        assert_eq!(spec.ports, "8888/http");
    }

    #[test]
    fn test_pod_roundtrips_through_json() {
        let pod = Pod::new("p1", "llm-0").with_status(PodStatus::Running);
        let json = serde_json::to_string(&pod).unwrap();
        assert!(json.contains("\"status\":\"Running\""));
    }
}
