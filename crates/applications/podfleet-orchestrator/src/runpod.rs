//! RunPod provider gateway
//!
//! GraphQL over HTTPS. Every call is a single POST, except template listing,
//! which is a REST GET. Failures are classified into [`GatewayError`] and
//! never retried here.
//!
//! ## Classification
//!
//! ```text
//! connect / timeout           -> TransientNetwork
//! HTTP 401 / 403              -> Auth
//! HTTP 429 (+ Retry-After)    -> RateLimited
//! HTTP 5xx                    -> Provider
//! GraphQL "... not found ..." -> NotFound
//! other GraphQL errors        -> Provider
//! ```

use crate::error::Result;
use async_trait::async_trait;
use podfleet_core::{
    GatewayError, GpuType, Pod, PodId, PodSpec, PodStatus, ProviderGateway, StockStatus, Template,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

pub const RUNPOD_GRAPHQL_URL: &str = "https://api.runpod.io/graphql";
pub const RUNPOD_REST_URL: &str = "https://rest.runpod.io/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource floor RunPod applies to on-demand deploys
const MIN_VCPU_COUNT: u32 = 2;
const MIN_MEMORY_IN_GB: u32 = 15;

const LIST_PODS_QUERY: &str = r#"
query {
  myself {
    pods {
      id
      name
      imageName
      desiredStatus
      costPerHr
      gpuCount
      volumeInGb
      containerDiskInGb
      volumeMountPath
      templateId
      env
      ports
      runtime {
        uptimeInSeconds
        gpus { gpuUtilPercent memoryUtilPercent }
      }
      machine { gpuDisplayName gpuTypeId }
    }
  }
}
"#;

const GPU_TYPES_QUERY: &str = r#"
query {
  gpuTypes {
    id
    displayName
    memoryInGb
    securePrice
    communityPrice
    maxGpuCount
    lowestPrice(input: { gpuCount: 1 }) {
      stockStatus
      maxUnreservedGpuCount
      totalCount
      rentedCount
    }
  }
}
"#;

const CREATE_POD_MUTATION: &str = r#"
mutation CreatePod($input: PodFindAndDeployOnDemandInput!) {
  podFindAndDeployOnDemand(input: $input) {
    id
    name
    imageName
    desiredStatus
    costPerHr
    machine { gpuDisplayName gpuTypeId }
  }
}
"#;

const STOP_POD_MUTATION: &str = r#"
mutation StopPod($input: PodStopInput!) {
  podStop(input: $input) { id desiredStatus }
}
"#;

const TERMINATE_POD_MUTATION: &str = r#"
mutation TerminatePod($input: PodTerminateInput!) {
  podTerminate(input: $input)
}
"#;

const RESUME_POD_MUTATION: &str = r#"
mutation ResumePod($input: PodResumeInput!) {
  podResume(input: $input) { id desiredStatus }
}
"#;

const EDIT_POD_MUTATION: &str = r#"
mutation EditPod($input: PodEditJobInput!) {
  podEditJob(input: $input) { id imageName }
}
"#;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListPodsData {
    myself: Option<Myself>,
}

#[derive(Debug, Deserialize)]
struct Myself {
    #[serde(default)]
    pods: Option<Vec<RawPod>>,
}

#[derive(Debug, Deserialize)]
struct GpuTypesData {
    #[serde(rename = "gpuTypes")]
    gpu_types: Option<Vec<RawGpuType>>,
}

#[derive(Debug, Deserialize)]
struct CreatePodData {
    #[serde(rename = "podFindAndDeployOnDemand")]
    pod: Option<RawPod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawPod {
    id: String,
    name: Option<String>,
    image_name: Option<String>,
    desired_status: Option<String>,
    cost_per_hr: Option<f64>,
    gpu_count: Option<u32>,
    volume_in_gb: Option<f64>,
    container_disk_in_gb: Option<f64>,
    volume_mount_path: Option<String>,
    template_id: Option<String>,
    env: Option<Vec<String>>,
    ports: Option<String>,
    runtime: Option<RawRuntime>,
    machine: Option<RawMachine>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawRuntime {
    uptime_in_seconds: Option<u64>,
    gpus: Option<Vec<RawGpuMetrics>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawGpuMetrics {
    gpu_util_percent: Option<f64>,
    memory_util_percent: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawMachine {
    gpu_display_name: Option<String>,
    gpu_type_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawGpuType {
    id: String,
    display_name: Option<String>,
    memory_in_gb: Option<u32>,
    secure_price: Option<f64>,
    community_price: Option<f64>,
    max_gpu_count: Option<u32>,
    lowest_price: Option<RawLowestPrice>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawLowestPrice {
    stock_status: Option<String>,
    max_unreserved_gpu_count: Option<u32>,
    total_count: Option<i64>,
    rented_count: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawTemplate {
    id: String,
    name: Option<String>,
    image_name: Option<String>,
    category: Option<String>,
    container_disk_in_gb: Option<u32>,
    volume_in_gb: Option<u32>,
    volume_mount_path: Option<String>,
    env: Option<Value>,
    ports: Option<Value>,
    is_public: Option<bool>,
    is_serverless: Option<bool>,
}

// ============================================================================
// Mapping
// ============================================================================

/// Map RunPod's `desiredStatus` onto the pod lifecycle
fn map_pod_status(desired: &str, uptime_secs: u64) -> PodStatus {
    match desired.to_ascii_uppercase().as_str() {
        "RUNNING" if uptime_secs > 0 => PodStatus::Running,
        "RUNNING" | "CREATED" | "RESTARTING" => PodStatus::Provisioning,
        "EXITED" | "STOPPED" | "PAUSED" => PodStatus::Stopped,
        "TERMINATING" => PodStatus::Terminating,
        "TERMINATED" => PodStatus::Terminated,
        _ => PodStatus::Error,
    }
}

fn map_stock(status: Option<&str>) -> StockStatus {
    match status {
        Some("High") | Some("Medium") => StockStatus::InStock,
        Some("Low") => StockStatus::Low,
        _ => StockStatus::OutOfStock,
    }
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0u32), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / f64::from(n))
}

impl From<RawPod> for Pod {
    fn from(raw: RawPod) -> Self {
        let runtime = raw.runtime.unwrap_or_default();
        let uptime = runtime.uptime_in_seconds.unwrap_or(0);
        let status = raw
            .desired_status
            .as_deref()
            .map_or(PodStatus::Error, |s| map_pod_status(s, uptime));
        let machine = raw.machine.unwrap_or_default();
        let gpus = runtime.gpus.unwrap_or_default();

        let mut pod = Pod::new(raw.id, raw.name.unwrap_or_default())
            .with_status(status)
            .with_image(raw.image_name.unwrap_or_default())
            .with_cost(raw.cost_per_hr.unwrap_or(0.0))
            .with_uptime(uptime);
        pod.gpu_count = raw.gpu_count.unwrap_or(0);
        pod.gpu_display_name = machine.gpu_display_name.unwrap_or_default();
        pod.gpu_type_id = machine
            .gpu_type_id
            .unwrap_or_else(|| pod.gpu_display_name.clone());
        pod.template_id = raw.template_id.filter(|t| !t.is_empty());
        pod.gpu_utilization = average(gpus.iter().filter_map(|g| g.gpu_util_percent));
        pod.memory_utilization = average(gpus.iter().filter_map(|g| g.memory_util_percent));
        pod.volume_in_gb = raw.volume_in_gb.unwrap_or(0.0).max(0.0) as u32;
        pod.container_disk_in_gb = raw.container_disk_in_gb.unwrap_or(0.0).max(0.0) as u32;
        if let Some(path) = raw.volume_mount_path.filter(|p| !p.is_empty()) {
            pod.volume_mount_path = path;
        }
        pod.ports = raw.ports.unwrap_or_default();
        pod.env = raw.env.unwrap_or_default();
        pod
    }
}

impl From<RawGpuType> for GpuType {
    fn from(raw: RawGpuType) -> Self {
        let lowest = raw.lowest_price.unwrap_or_default();
        let available = match (lowest.total_count, lowest.rented_count) {
            (Some(total), Some(rented)) if total > 0 => (total - rented).max(0) as u32,
            _ => lowest.max_unreserved_gpu_count.unwrap_or(0),
        };

        let mut gpu = GpuType::new(raw.id, available, map_stock(lowest.stock_status.as_deref()))
            .with_prices(
                raw.secure_price.unwrap_or(0.0),
                raw.community_price.unwrap_or(0.0),
            )
            .with_memory(raw.memory_in_gb.unwrap_or(0));
        if let Some(name) = raw.display_name.filter(|n| !n.is_empty()) {
            gpu.display_name = name;
        }
        gpu.max_gpu_count = raw.max_gpu_count.unwrap_or(0);
        gpu
    }
}

impl From<RawTemplate> for Template {
    fn from(raw: RawTemplate) -> Self {
        let mut template = Template::new(
            raw.id,
            raw.name.unwrap_or_default(),
            raw.image_name.unwrap_or_default(),
        );
        template.category = raw.category.unwrap_or_default();
        template.container_disk_in_gb = raw.container_disk_in_gb.unwrap_or(5);
        template.volume_in_gb = raw.volume_in_gb.unwrap_or(0);
        template.volume_mount_path = raw
            .volume_mount_path
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/workspace".to_string());
        template.env = raw.env.as_ref().map(env_strings).unwrap_or_default();
        template.ports = match raw.ports {
            Some(Value::String(ports)) => ports,
            Some(Value::Array(ports)) => ports
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(","),
            _ => String::new(),
        };
        template.is_public = raw.is_public.unwrap_or(false);
        template.is_serverless = raw.is_serverless.unwrap_or(false);
        template
    }
}

/// Template env as `KEY=VALUE` strings; RunPod sends either a map or a
/// list of `{key, value}` objects
fn env_strings(env: &Value) -> Vec<String> {
    let pair = |key: &str, value: &Value| match value {
        Value::String(v) => format!("{}={}", key, v),
        Value::Null => format!("{}=", key),
        other => format!("{}={}", key, other),
    };
    match env {
        Value::Object(map) => map.iter().map(|(k, v)| pair(k, v)).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let key = item.get("key")?.as_str()?;
                Some(pair(key, item.get("value").unwrap_or(&Value::Null)))
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Templates from a REST body: a bare list or one wrapped in
/// `templates` / `data`
fn parse_templates(body: &str) -> podfleet_core::Result<Vec<Template>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| GatewayError::provider(format!("malformed RunPod response: {}", e)))?;
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => map
            .remove("templates")
            .or_else(|| map.remove("data"))
            .unwrap_or(Value::Array(Vec::new())),
        _ => return Err(GatewayError::provider("unexpected templates payload")),
    };
    let raw: Vec<RawTemplate> = serde_json::from_value(list)
        .map_err(|e| GatewayError::provider(format!("malformed RunPod templates: {}", e)))?;
    Ok(raw.into_iter().map(Template::from).collect())
}

/// `KEY=VALUE` strings as RunPod `EnvironmentVariableInput` objects
fn env_input(env: &[String]) -> Vec<Value> {
    env.iter()
        .map(|item| match item.split_once('=') {
            Some((key, value)) => json!({ "key": key, "value": value }),
            None => json!({ "key": item, "value": "" }),
        })
        .collect()
}

fn create_input(spec: &PodSpec) -> Value {
    let mut input = json!({
        "name": spec.name,
        "imageName": spec.image,
        "gpuTypeId": spec.gpu_type_id,
        "gpuCount": spec.gpu_count,
        "cloudType": spec.cloud_type.as_str(),
        "volumeInGb": spec.volume_in_gb,
        "containerDiskInGb": spec.container_disk_in_gb,
        "ports": spec.ports,
        "volumeMountPath": spec.volume_mount_path,
        "minVcpuCount": MIN_VCPU_COUNT,
        "minMemoryInGb": MIN_MEMORY_IN_GB,
    });
    if !spec.env.is_empty() {
        input["env"] = Value::Array(env_input(&spec.env));
    }
    if let Some(template_id) = &spec.template_id {
        input["templateId"] = json!(template_id);
    }
    input
}

fn resume_input(id: &PodId, gpu_count: u32) -> Value {
    json!({ "podId": id.as_str(), "gpuCount": gpu_count.max(1) })
}

// ============================================================================
// Classification
// ============================================================================

fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        GatewayError::transient(err.to_string())
    } else {
        GatewayError::provider(err.to_string())
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Errors decided by the HTTP status alone
fn classify_status(status: u16, retry_after: Option<&str>, body: &str) -> Option<GatewayError> {
    match status {
        401 | 403 => Some(GatewayError::auth(format!(
            "RunPod rejected the API key (HTTP {})",
            status
        ))),
        429 => Some(GatewayError::rate_limited(
            retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        )),
        500..=599 => Some(GatewayError::provider(format!(
            "HTTP {}: {}",
            status,
            snippet(body)
        ))),
        _ => None,
    }
}

fn classify_graphql_errors(errors: &[GraphQlError]) -> GatewayError {
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    if message.to_lowercase().contains("not found") {
        GatewayError::not_found(message)
    } else {
        GatewayError::provider(message)
    }
}

fn decode_response<T: DeserializeOwned>(
    status: u16,
    retry_after: Option<&str>,
    body: &str,
) -> podfleet_core::Result<T> {
    if let Some(err) = classify_status(status, retry_after, body) {
        return Err(err);
    }

    let parsed: GraphQlResponse<T> = serde_json::from_str(body).map_err(|e| {
        if status >= 400 {
            GatewayError::provider(format!("HTTP {}: {}", status, snippet(body)))
        } else {
            GatewayError::provider(format!("malformed RunPod response: {}", e))
        }
    })?;

    if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
        return Err(classify_graphql_errors(&errors));
    }
    if status >= 400 {
        return Err(GatewayError::provider(format!("HTTP {}: {}", status, snippet(body))));
    }
    parsed
        .data
        .ok_or_else(|| GatewayError::provider("RunPod response carried no data"))
}

// ============================================================================
// Gateway
// ============================================================================

/// [`ProviderGateway`] backed by the RunPod GraphQL API
pub struct RunPodGateway {
    client: reqwest::Client,
    endpoint: String,
    rest_endpoint: String,
    api_key: String,
}

impl RunPodGateway {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: RUNPOD_GRAPHQL_URL.to_string(),
            rest_endpoint: RUNPOD_REST_URL.to_string(),
            api_key: api_key.into(),
        })
    }

    /// Point at a different GraphQL endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Point at a different REST base URL
    pub fn with_rest_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.rest_endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    async fn graphql<T: DeserializeOwned>(&self, operation: &str, query: &str, variables: Value) -> podfleet_core::Result<T> {
        debug!(operation, endpoint = %self.endpoint, "RunPod request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await.map_err(classify_transport)?;

        debug!(operation, status, bytes = body.len(), "RunPod response");
        decode_response(status, retry_after.as_deref(), &body)
    }

    async fn pod_mutation(&self, operation: &str, mutation: &str, input: Value) -> podfleet_core::Result<()> {
        self.graphql::<Value>(operation, mutation, json!({ "input": input }))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ProviderGateway for RunPodGateway {
    fn name(&self) -> &str {
        "runpod"
    }

    async fn list_pods(&self) -> podfleet_core::Result<Vec<Pod>> {
        let data: ListPodsData = self.graphql("list_pods", LIST_PODS_QUERY, json!({})).await?;
        Ok(data
            .myself
            .and_then(|m| m.pods)
            .unwrap_or_default()
            .into_iter()
            .map(Pod::from)
            .collect())
    }

    async fn list_gpu_availability(&self) -> podfleet_core::Result<Vec<GpuType>> {
        let data: GpuTypesData = self.graphql("list_gpu_types", GPU_TYPES_QUERY, json!({})).await?;
        Ok(data
            .gpu_types
            .unwrap_or_default()
            .into_iter()
            .map(GpuType::from)
            .collect())
    }

    async fn create_pod(&self, spec: &PodSpec) -> podfleet_core::Result<Pod> {
        let data: CreatePodData = self
            .graphql(
                "create_pod",
                CREATE_POD_MUTATION,
                json!({ "input": create_input(spec) }),
            )
            .await?;
        let raw = data
            .pod
            .ok_or_else(|| GatewayError::provider("pod creation returned no data"))?;

        // The deploy response omits most of the shape; fill it from the request
        let mut pod = Pod::from(raw);
        if pod.name.is_empty() {
            pod.name = spec.name.clone();
        }
        if pod.image.is_empty() {
            pod.image = spec.image.clone();
        }
        pod.gpu_type_id = spec.gpu_type_id.clone();
        pod.gpu_count = spec.gpu_count;
        pod.template_id = spec.template_id.clone();
        pod.volume_in_gb = spec.volume_in_gb;
        pod.container_disk_in_gb = spec.container_disk_in_gb;
        pod.volume_mount_path = spec.volume_mount_path.clone();
        pod.ports = spec.ports.clone();
        pod.env = spec.env.clone();
        if pod.status == PodStatus::Error {
            pod.status = PodStatus::Provisioning;
        }
        Ok(pod)
    }

    async fn stop_pod(&self, id: &PodId) -> podfleet_core::Result<()> {
        self.pod_mutation("stop_pod", STOP_POD_MUTATION, json!({ "podId": id.as_str() }))
            .await
    }

    async fn terminate_pod(&self, id: &PodId) -> podfleet_core::Result<()> {
        self.pod_mutation(
            "terminate_pod",
            TERMINATE_POD_MUTATION,
            json!({ "podId": id.as_str() }),
        )
        .await
    }

    async fn list_templates(&self, include_public: bool) -> podfleet_core::Result<Vec<Template>> {
        let url = format!("{}/templates", self.rest_endpoint);
        debug!(operation = "list_templates", endpoint = %url, include_public, "RunPod request");

        let mut request = self.client.get(&url).bearer_auth(&self.api_key);
        if include_public {
            request = request.query(&[("includePublicTemplates", "true")]);
        }
        let response = request.send().await.map_err(classify_transport)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await.map_err(classify_transport)?;

        debug!(operation = "list_templates", status, bytes = body.len(), "RunPod response");
        if let Some(err) = classify_status(status, retry_after.as_deref(), &body) {
            return Err(err);
        }
        if status == 404 {
            return Err(GatewayError::not_found(format!("templates endpoint {}", url)));
        }
        if status >= 400 {
            return Err(GatewayError::provider(format!("HTTP {}: {}", status, snippet(&body))));
        }
        parse_templates(&body)
    }

    async fn restart_pod(&self, id: &PodId, gpu_count: u32) -> podfleet_core::Result<()> {
        self.pod_mutation("resume_pod", RESUME_POD_MUTATION, resume_input(id, gpu_count))
            .await
    }

    async fn update_pod_image(&self, id: &PodId, image: &str) -> podfleet_core::Result<()> {
        self.pod_mutation(
            "edit_pod",
            EDIT_POD_MUTATION,
            json!({ "podId": id.as_str(), "imageName": image }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podfleet_core::{CloudType, GatewayErrorKind};

    const PODS_BODY: &str = r#"{
      "data": {
        "myself": {
          "pods": [
            {
              "id": "abc123",
              "name": "llm-0",
              "imageName": "vllm/vllm-openai:v0.6",
              "desiredStatus": "RUNNING",
              "costPerHr": 0.79,
              "gpuCount": 2,
              "volumeInGb": 20,
              "containerDiskInGb": 40,
              "volumeMountPath": "/workspace",
              "templateId": "tpl-1",
              "env": ["MODEL=llama"],
              "ports": "8000/http",
              "runtime": {
                "uptimeInSeconds": 3600,
                "gpus": [
                  { "gpuUtilPercent": 80.0, "memoryUtilPercent": 50.0 },
                  { "gpuUtilPercent": 60.0, "memoryUtilPercent": 30.0 }
                ]
              },
              "machine": { "gpuDisplayName": "A40", "gpuTypeId": "NVIDIA A40" }
            },
            {
              "id": "def456",
              "name": "llm-1",
              "desiredStatus": "RUNNING",
              "runtime": null,
              "machine": null,
              "templateId": ""
            }
          ]
        }
      }
    }"#;

    #[test]
    fn test_parse_pods() {
        let data: ListPodsData = decode_response(200, None, PODS_BODY).unwrap();
        let pods: Vec<Pod> = data.myself.unwrap().pods.unwrap().into_iter().map(Pod::from).collect();

        let running = &pods[0];
        assert_eq!(running.id, PodId::new("abc123"));
        assert_eq!(running.status, PodStatus::Running);
        assert_eq!(running.gpu_type_id, "NVIDIA A40");
        assert_eq!(running.gpu_display_name, "A40");
        assert_eq!(running.gpu_count, 2);
        assert_eq!(running.template_id.as_deref(), Some("tpl-1"));
        assert_eq!(running.gpu_utilization, Some(70.0));
        assert_eq!(running.memory_utilization, Some(40.0));
        assert_eq!(running.container_disk_in_gb, 40);
        assert_eq!(running.env, vec!["MODEL=llama".to_string()]);

        let booting = &pods[1];
        assert_eq!(booting.status, PodStatus::Provisioning);
        assert_eq!(booting.template_id, None);
        assert_eq!(booting.gpu_utilization, None);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_pod_status("RUNNING", 10), PodStatus::Running);
        assert_eq!(map_pod_status("RUNNING", 0), PodStatus::Provisioning);
        assert_eq!(map_pod_status("CREATED", 0), PodStatus::Provisioning);
        assert_eq!(map_pod_status("RESTARTING", 0), PodStatus::Provisioning);
        assert_eq!(map_pod_status("EXITED", 0), PodStatus::Stopped);
        assert_eq!(map_pod_status("PAUSED", 0), PodStatus::Stopped);
        assert_eq!(map_pod_status("TERMINATED", 0), PodStatus::Terminated);
        assert_eq!(map_pod_status("WHATEVER", 0), PodStatus::Error);
    }

    #[test]
    fn test_parse_gpu_types() {
        let body = r#"{
          "data": {
            "gpuTypes": [
              {
                "id": "NVIDIA A40",
                "displayName": "A40",
                "memoryInGb": 48,
                "securePrice": 0.44,
                "communityPrice": 0.35,
                "maxGpuCount": 8,
                "lowestPrice": { "stockStatus": "High", "totalCount": 10, "rentedCount": 7, "maxUnreservedGpuCount": 2 }
              },
              {
                "id": "NVIDIA H100",
                "lowestPrice": { "stockStatus": "Low", "totalCount": 0, "maxUnreservedGpuCount": 1 }
              },
              {
                "id": "NVIDIA RTX 4090",
                "lowestPrice": { "stockStatus": null, "totalCount": 4, "rentedCount": 9 }
              }
            ]
          }
        }"#;
        let data: GpuTypesData = decode_response(200, None, body).unwrap();
        let gpus: Vec<GpuType> = data.gpu_types.unwrap().into_iter().map(GpuType::from).collect();

        assert_eq!(gpus[0].display_name, "A40");
        assert_eq!(gpus[0].available_count, 3);
        assert_eq!(gpus[0].stock_status, StockStatus::InStock);
        assert_eq!(gpus[0].memory_gb, 48);
        assert_eq!(gpus[0].price_for(CloudType::Community), 0.35);

        assert_eq!(gpus[1].display_name, "NVIDIA H100");
        assert_eq!(gpus[1].available_count, 1);
        assert_eq!(gpus[1].stock_status, StockStatus::Low);

        assert_eq!(gpus[2].available_count, 0);
        assert_eq!(gpus[2].stock_status, StockStatus::OutOfStock);
    }

    #[test]
    fn test_http_status_classification() {
        let err = decode_response::<Value>(401, None, "").unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::Auth);

        let err = decode_response::<Value>(403, None, "").unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::Auth);

        let err = decode_response::<Value>(429, Some("7"), "").unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = decode_response::<Value>(429, Some("soon"), "").unwrap_err();
        assert_eq!(err, GatewayError::rate_limited(None));

        let err = decode_response::<Value>(502, None, "<html>bad gateway</html>").unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::Provider);
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_graphql_error_classification() {
        let body = r#"{"errors": [{"message": "Pod not found"}], "data": null}"#;
        let err = decode_response::<Value>(200, None, body).unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::NotFound);

        let body = r#"{"errors": [{"message": "There are no longer any instances available with the requested specifications."}]}"#;
        let err = decode_response::<Value>(200, None, body).unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::Provider);
        assert!(err.to_string().contains("no longer any instances available"));

        let err = decode_response::<Value>(200, None, "not json").unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::Provider);

        let err = decode_response::<Value>(200, None, r#"{"data": null}"#).unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::Provider);
    }

    #[test]
    fn test_create_input() {
        let template = Template::new("tpl-1", "vllm", "vllm/vllm-openai:v0.6");
        let mut spec = PodSpec::from_template(&template, "llm-0", "NVIDIA A40", 2)
            .with_cloud_type(CloudType::Secure);
        spec.env = vec!["MODEL=llama".into(), "DEBUG".into()];

        let input = create_input(&spec);
        assert_eq!(input["gpuTypeId"], "NVIDIA A40");
        assert_eq!(input["gpuCount"], 2);
        assert_eq!(input["cloudType"], "SECURE");
        assert_eq!(input["templateId"], "tpl-1");
        assert_eq!(input["minVcpuCount"], MIN_VCPU_COUNT);
        assert_eq!(input["env"][0], json!({ "key": "MODEL", "value": "llama" }));
        assert_eq!(input["env"][1], json!({ "key": "DEBUG", "value": "" }));
    }

    #[test]
    fn test_resume_input_carries_gpu_count() {
        let id = PodId::new("p1");
        assert_eq!(resume_input(&id, 4), json!({ "podId": "p1", "gpuCount": 4 }));
        assert_eq!(resume_input(&id, 0)["gpuCount"], 1);
    }

    #[test]
    fn test_parse_templates() {
        let body = r#"[
            {
                "id": "tpl-1",
                "name": "vllm",
                "imageName": "vllm/vllm-openai:v0.6",
                "category": "NVIDIA",
                "containerDiskInGb": 50,
                "volumeInGb": 100,
                "env": {"MODEL": "llama", "TP": 2},
                "ports": ["8000/http", "22/tcp"],
                "isPublic": true
            },
            {
                "id": "tpl-2",
                "name": "worker",
                "imageName": "acme/worker:1",
                "env": [{"key": "MODE", "value": "batch"}],
                "ports": "8888/http",
                "isServerless": true
            }
        ]"#;

        let templates = parse_templates(body).unwrap();
        assert_eq!(templates.len(), 2);

        let vllm = &templates[0];
        assert_eq!(vllm.image, "vllm/vllm-openai:v0.6");
        assert_eq!(vllm.category, "NVIDIA");
        assert_eq!(vllm.container_disk_in_gb, 50);
        assert_eq!(vllm.volume_in_gb, 100);
        assert_eq!(vllm.volume_mount_path, "/workspace");
        assert_eq!(vllm.env, vec!["MODEL=llama".to_string(), "TP=2".to_string()]);
        assert_eq!(vllm.ports, "8000/http,22/tcp");
        assert!(vllm.is_public);
        assert!(vllm.is_deployable());

        let worker = &templates[1];
        assert_eq!(worker.container_disk_in_gb, 5);
        assert_eq!(worker.volume_in_gb, 0);
        assert_eq!(worker.env, vec!["MODE=batch".to_string()]);
        assert_eq!(worker.ports, "8888/http");
        assert!(!worker.is_deployable());
    }

    #[test]
    fn test_parse_wrapped_templates() {
        let wrapped = r#"{"templates": [{"id": "tpl-1", "name": "a", "imageName": "img"}]}"#;
        assert_eq!(parse_templates(wrapped).unwrap()[0].id, "tpl-1");

        let data = r#"{"data": [{"id": "tpl-2", "name": "b", "imageName": "img"}]}"#;
        assert_eq!(parse_templates(data).unwrap()[0].id, "tpl-2");

        assert!(parse_templates(r#"{"other": 1}"#).unwrap().is_empty());
        let err = parse_templates("not json").unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::Provider);
    }

    #[test]
    fn test_gateway_builds_with_custom_endpoint() {
        let gateway = RunPodGateway::new("key")
            .unwrap()
            .with_endpoint("http://127.0.0.1:9/graphql");
        assert_eq!(gateway.name(), "runpod");
        assert!(!gateway.supports_batch_create());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        // Port 9 (discard) is closed on test hosts
        let gateway = RunPodGateway::new("key")
            .unwrap()
            .with_endpoint("http://127.0.0.1:9/graphql");
        let err = gateway.list_pods().await.unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::TransientNetwork);
    }

    #[tokio::test]
    async fn test_unreachable_rest_endpoint_is_transient() {
        let gateway = RunPodGateway::new("key")
            .unwrap()
            .with_rest_endpoint("http://127.0.0.1:9/v1/");
        let err = gateway.list_templates(true).await.unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::TransientNetwork);
    }
}
