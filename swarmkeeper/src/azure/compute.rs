//! Scale sets and deployments through Azure Resource Manager.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use url::Url;

use super::auth::{MANAGEMENT_RESOURCE, TokenSource};
use crate::error::ApiError;
use crate::scaleset::{
    Deployment, Instance, InstanceView, NetworkInterface, Operation, OperationStatus, Parameter,
    PowerState, ProvisioningState, ScaleSetProvider,
};

const COMPUTE_API_VERSION: &str = "2018-06-01";
// Scale-set network interfaces are only served by this older version.
const NETWORK_API_VERSION: &str = "2017-03-30";
const DEPLOYMENT_API_VERSION: &str = "2018-05-01";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmResource {
    instance_id: String,
    #[serde(default)]
    properties: VmProperties,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct VmProperties {
    #[serde(default)]
    latest_model_applied: bool,
    #[serde(default)]
    os_profile: Option<OsProfile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OsProfile {
    computer_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NicResource {
    properties: NicProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NicProperties {
    #[serde(default)]
    virtual_machine: Option<ResourceId>,
    #[serde(default)]
    ip_configurations: Vec<IpConfiguration>,
}

#[derive(Deserialize)]
struct ResourceId {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpConfiguration {
    properties: IpConfigurationProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpConfigurationProperties {
    #[serde(rename = "privateIPAddress", default)]
    private_ip_address: Option<String>,
    #[serde(default)]
    primary: Option<bool>,
}

#[derive(Deserialize)]
struct InstanceViewResponse {
    #[serde(default)]
    statuses: Vec<StatusEntry>,
}

#[derive(Deserialize)]
struct StatusEntry {
    code: String,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct DeploymentResponse {
    name: String,
    #[serde(default)]
    properties: DeploymentProperties,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DeploymentProperties {
    #[serde(default)]
    template_link: Option<TemplateLink>,
    #[serde(default)]
    parameters: BTreeMap<String, DeploymentParameter>,
}

#[derive(Deserialize)]
struct TemplateLink {
    uri: Url,
}

#[derive(Deserialize)]
struct DeploymentParameter {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    value: Option<Value>,
}

/// [`ScaleSetProvider`] for virtual machine scale sets in one resource group.
pub struct ComputeClient {
    client: Client,
    auth: Arc<TokenSource>,
    base: Url,
    subscription_id: String,
    resource_group: String,
}

impl ComputeClient {
    pub fn new(
        client: Client,
        auth: Arc<TokenSource>,
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let base = Url::parse(MANAGEMENT_RESOURCE)
            .map_err(|e| ApiError::Fatal(format!("bad management endpoint: {}", e)))?;
        Ok(ComputeClient {
            client,
            auth,
            base,
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
        })
    }

    fn url(&self, path: &str, api_version: &str) -> Result<Url, ApiError> {
        let mut url = self.base.join(&format!(
            "subscriptions/{}/resourceGroups/{}/providers/{}",
            self.subscription_id, self.resource_group, path
        ))
        .map_err(|e| ApiError::Fatal(format!("bad resource path {}: {}", path, e)))?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }

    fn scale_set_url(&self, scale_set: &str, rest: &str) -> Result<Url, ApiError> {
        self.url(
            &format!(
                "Microsoft.Compute/virtualMachineScaleSets/{}{}",
                scale_set, rest
            ),
            COMPUTE_API_VERSION,
        )
    }

    fn deployment_url(&self, name: &str) -> Result<Url, ApiError> {
        self.url(
            &format!("Microsoft.Resources/deployments/{}", name),
            DEPLOYMENT_API_VERSION,
        )
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        what: &str,
    ) -> Result<Response, ApiError> {
        let token = self.auth.token(MANAGEMENT_RESOURCE).await?;
        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", token));
        if let Some(body) = body {
            request = request.json(body);
        }
        super::check(request.send().await?, what).await
    }

    async fn get_json(&self, url: Url, what: &str) -> Result<Value, ApiError> {
        Ok(self.send(Method::GET, url, None, what).await?.json().await?)
    }

    /// Follow `nextLink` until every page has been read.
    async fn list_all<T: serde::de::DeserializeOwned>(
        &self,
        first: Url,
        what: &str,
    ) -> Result<Vec<T>, ApiError> {
        let mut items = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next.take() {
            let page: Page<T> = self.send(Method::GET, url, None, what).await?.json().await?;
            items.extend(page.value);
            next = page
                .next_link
                .map(|link| Url::parse(&link))
                .transpose()
                .map_err(|e| ApiError::Decode(format!("bad nextLink: {}", e)))?;
        }
        Ok(items)
    }

    async fn start(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        what: &str,
    ) -> Result<Operation, ApiError> {
        let response = self.send(method, url, body, what).await?;
        let operation = operation_from(response.status(), response.headers());
        tracing::debug!(what=%what, operation=?operation, "Provider operation started");
        Ok(operation)
    }
}

/// Long running calls report progress through `Azure-AsyncOperation` or, failing that,
/// `Location`.
fn operation_from(status: StatusCode, headers: &HeaderMap) -> Operation {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    match header("Azure-AsyncOperation").or_else(|| header("Location")) {
        Some(status_url) => Operation::Pending { status_url },
        None if status == StatusCode::ACCEPTED => {
            tracing::warn!("Accepted operation without a status URL, assuming done");
            Operation::Done
        }
        None => Operation::Done,
    }
}

fn parse_status(body: &Value) -> OperationStatus {
    let Some(status) = body.get("status").and_then(Value::as_str) else {
        // Location polling returns the finished resource without a status field.
        return OperationStatus::Succeeded;
    };
    match status.to_ascii_lowercase().as_str() {
        "succeeded" => OperationStatus::Succeeded,
        "failed" | "canceled" => OperationStatus::Failed(
            body.pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or(status)
                .to_string(),
        ),
        _ => OperationStatus::InProgress,
    }
}

fn parse_instance(vm: VmResource) -> Instance {
    Instance {
        computer_name: vm
            .properties
            .os_profile
            .map(|p| p.computer_name)
            .unwrap_or_default(),
        latest_model_applied: vm.properties.latest_model_applied,
        instance_id: vm.instance_id,
    }
}

fn parse_network_interfaces(nics: Vec<NicResource>) -> Vec<NetworkInterface> {
    let mut out = Vec::new();
    for nic in nics {
        let Some(vm) = nic.properties.virtual_machine else {
            continue;
        };
        let Some(instance_id) = vm.id.rsplit('/').next().map(str::to_string) else {
            continue;
        };
        let single = nic.properties.ip_configurations.len() == 1;
        for config in nic.properties.ip_configurations {
            let Some(ip) = config
                .properties
                .private_ip_address
                .as_deref()
                .and_then(|a| a.parse::<IpAddr>().ok())
            else {
                continue;
            };
            out.push(NetworkInterface {
                instance_id: instance_id.clone(),
                private_ip: ip,
                primary: config.properties.primary.unwrap_or(single),
            });
        }
    }
    out
}

fn parse_instance_view(view: InstanceViewResponse) -> InstanceView {
    let mut result = InstanceView {
        power_state: PowerState::Unknown,
        provisioning_state: ProvisioningState::Unknown,
        provisioned_at: None,
    };
    for status in view.statuses {
        if let Some(state) = status.code.strip_prefix("PowerState/") {
            result.power_state = PowerState::from(state);
        } else if let Some(state) = status.code.strip_prefix("ProvisioningState/") {
            result.provisioning_state = ProvisioningState::from(state);
            result.provisioned_at = status.time;
        }
    }
    result
}

fn parse_deployment(deployment: DeploymentResponse) -> Deployment {
    let parameters = deployment
        .properties
        .parameters
        .into_iter()
        .map(|(name, p)| {
            let secure = p.kind.to_ascii_lowercase().starts_with("secure");
            (
                name,
                Parameter {
                    value: p.value,
                    secure,
                },
            )
        })
        .collect();
    Deployment {
        name: deployment.name,
        template_link: deployment.properties.template_link.map(|l| l.uri),
        parameters,
    }
}

#[async_trait]
impl ScaleSetProvider for ComputeClient {
    async fn list_instances(&self, scale_set: &str) -> Result<Vec<Instance>, ApiError> {
        let url = self.scale_set_url(scale_set, "/virtualMachines")?;
        let vms: Vec<VmResource> = self
            .list_all(url, &format!("list instances of {}", scale_set))
            .await?;
        Ok(vms.into_iter().map(parse_instance).collect())
    }

    async fn list_network_interfaces(
        &self,
        scale_set: &str,
    ) -> Result<Vec<NetworkInterface>, ApiError> {
        let url = self.url(
            &format!(
                "Microsoft.Compute/virtualMachineScaleSets/{}/networkInterfaces",
                scale_set
            ),
            NETWORK_API_VERSION,
        )?;
        let nics: Vec<NicResource> = self
            .list_all(url, &format!("list network interfaces of {}", scale_set))
            .await?;
        Ok(parse_network_interfaces(nics))
    }

    async fn instance_view(
        &self,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<InstanceView, ApiError> {
        let url = self.scale_set_url(
            scale_set,
            &format!("/virtualMachines/{}/instanceView", instance_id),
        )?;
        let what = format!("instance view of {}/{}", scale_set, instance_id);
        let view: InstanceViewResponse =
            self.send(Method::GET, url, None, &what).await?.json().await?;
        Ok(parse_instance_view(view))
    }

    async fn update_instance_model(
        &self,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<Operation, ApiError> {
        let url = self.scale_set_url(scale_set, "/manualupgrade")?;
        let body = json!({ "instanceIds": [instance_id] });
        let what = format!("update model of {}/{}", scale_set, instance_id);
        self.start(Method::POST, url, Some(&body), &what).await
    }

    async fn reimage(&self, scale_set: &str, instance_id: &str) -> Result<Operation, ApiError> {
        let url = self.scale_set_url(
            scale_set,
            &format!("/virtualMachines/{}/reimage", instance_id),
        )?;
        let what = format!("reimage {}/{}", scale_set, instance_id);
        self.start(Method::POST, url, None, &what).await
    }

    async fn delete_instance(
        &self,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<Operation, ApiError> {
        let url = self.scale_set_url(scale_set, &format!("/virtualMachines/{}", instance_id))?;
        let what = format!("delete {}/{}", scale_set, instance_id);
        self.start(Method::DELETE, url, None, &what).await
    }

    async fn capacity(&self, scale_set: &str) -> Result<u32, ApiError> {
        let url = self.scale_set_url(scale_set, "")?;
        let body = self.get_json(url, &format!("get scale set {}", scale_set)).await?;
        body.pointer("/sku/capacity")
            .and_then(Value::as_u64)
            .and_then(|c| u32::try_from(c).ok())
            .ok_or_else(|| ApiError::Decode(format!("scale set {} has no sku capacity", scale_set)))
    }

    async fn set_capacity(&self, scale_set: &str, capacity: u32) -> Result<Operation, ApiError> {
        let url = self.scale_set_url(scale_set, "")?;
        let current = self
            .get_json(url.clone(), &format!("get scale set {}", scale_set))
            .await?;
        let mut sku = current.get("sku").cloned().unwrap_or_else(|| json!({}));
        if let Some(sku) = sku.as_object_mut() {
            sku.insert("capacity".to_string(), json!(capacity));
        }
        let body = json!({ "sku": sku });
        let what = format!("set capacity of {} to {}", scale_set, capacity);
        self.start(Method::PATCH, url, Some(&body), &what).await
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ApiError> {
        let url = self.deployment_url(name)?;
        let what = format!("get deployment {}", name);
        let deployment: DeploymentResponse =
            self.send(Method::GET, url, None, &what).await?.json().await?;
        Ok(parse_deployment(deployment))
    }

    async fn update_deployment(
        &self,
        name: &str,
        template: &Url,
        parameters: Map<String, Value>,
    ) -> Result<Operation, ApiError> {
        let url = self.deployment_url(name)?;
        let body = json!({
            "properties": {
                "mode": "Incremental",
                "templateLink": { "uri": template.as_str(), "contentVersion": "1.0.0.0" },
                "parameters": parameters,
            }
        });
        let what = format!("update deployment {}", name);
        self.start(Method::PUT, url, Some(&body), &what).await
    }

    async fn operation_status(&self, operation: &Operation) -> Result<OperationStatus, ApiError> {
        let Operation::Pending { status_url } = operation else {
            return Ok(OperationStatus::Succeeded);
        };
        let url = Url::parse(status_url)
            .map_err(|e| ApiError::Decode(format!("bad operation URL {}: {}", status_url, e)))?;
        let response = self
            .send(Method::GET, url, None, "poll operation status")
            .await?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(OperationStatus::InProgress);
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(OperationStatus::Succeeded);
        }
        Ok(parse_status(&serde_json::from_str(&text)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_instances_page() {
        let page: Page<VmResource> = serde_json::from_value(json!({
            "value": [
                {
                    "instanceId": "3",
                    "properties": {
                        "latestModelApplied": false,
                        "osProfile": { "computerName": "swarm-worker000003" }
                    }
                },
                { "instanceId": "4", "properties": {} }
            ],
            "nextLink": "https://management.azure.com/next?page=2"
        }))
        .unwrap();
        assert!(page.next_link.is_some());
        let instances: Vec<Instance> = page.value.into_iter().map(parse_instance).collect();
        assert_eq!(instances[0].instance_id, "3");
        assert_eq!(instances[0].computer_name, "swarm-worker000003");
        assert!(!instances[0].latest_model_applied);
        assert_eq!(instances[1].computer_name, "");
    }

    #[test]
    fn test_parse_network_interfaces() {
        let page: Page<NicResource> = serde_json::from_value(json!({
            "value": [
                {
                    "properties": {
                        "virtualMachine": { "id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachineScaleSets/wrk/virtualMachines/7" },
                        "ipConfigurations": [
                            { "properties": { "privateIPAddress": "10.0.1.8", "primary": true } },
                            { "properties": { "privateIPAddress": "192.168.255.1", "primary": false } }
                        ]
                    }
                },
                {
                    "properties": {
                        "virtualMachine": { "id": ".../virtualMachines/9" },
                        "ipConfigurations": [ { "properties": { "privateIPAddress": "10.0.1.9" } } ]
                    }
                },
                { "properties": { "ipConfigurations": [] } }
            ]
        }))
        .unwrap();
        let nics = parse_network_interfaces(page.value);
        assert_eq!(nics.len(), 3);
        assert_eq!(nics[0].instance_id, "7");
        assert!(nics[0].primary);
        assert!(!nics[1].primary);
        assert_eq!(nics[2].instance_id, "9");
        assert!(nics[2].primary);
    }

    #[test]
    fn test_parse_instance_view() {
        let view: InstanceViewResponse = serde_json::from_value(json!({
            "statuses": [
                { "code": "ProvisioningState/succeeded", "time": "2018-03-01T10:00:00+00:00" },
                { "code": "PowerState/running" }
            ]
        }))
        .unwrap();
        let view = parse_instance_view(view);
        assert_eq!(view.power_state, PowerState::Running);
        assert_eq!(view.provisioning_state, ProvisioningState::Succeeded);
        assert_eq!(
            view.provisioned_at.map(|t| t.to_rfc3339()).as_deref(),
            Some("2018-03-01T10:00:00+00:00")
        );

        let bare = parse_instance_view(serde_json::from_value(json!({})).unwrap());
        assert_eq!(bare.power_state, PowerState::Unknown);
        assert_eq!(bare.provisioned_at, None);
    }

    #[test]
    fn test_parse_deployment_marks_secure_parameters() {
        let deployment: DeploymentResponse = serde_json::from_value(json!({
            "name": "docker.template",
            "properties": {
                "templateLink": { "uri": "https://templates.example.com/v1/azure.json" },
                "parameters": {
                    "managerCount": { "type": "Int", "value": 3 },
                    "adServicePrincipalAppSecret": { "type": "SecureString" }
                }
            }
        }))
        .unwrap();
        let deployment = parse_deployment(deployment);
        assert_eq!(
            deployment.template_link.map(String::from).as_deref(),
            Some("https://templates.example.com/v1/azure.json")
        );
        let count = &deployment.parameters["managerCount"];
        assert_eq!(count.value, Some(json!(3)));
        assert!(!count.secure);
        let secret = &deployment.parameters["adServicePrincipalAppSecret"];
        assert_eq!(secret.value, None);
        assert!(secret.secure);
    }

    #[test]
    fn test_operation_status() {
        assert_eq!(parse_status(&json!({ "status": "InProgress" })), OperationStatus::InProgress);
        assert_eq!(parse_status(&json!({ "status": "Succeeded" })), OperationStatus::Succeeded);
        assert_eq!(parse_status(&json!({ "name": "vm" })), OperationStatus::Succeeded);
        assert_matches!(
            parse_status(&json!({ "status": "Failed", "error": { "message": "disk busy" } })),
            OperationStatus::Failed(reason) if reason == "disk busy"
        );
    }

    #[test]
    fn test_operation_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(operation_from(StatusCode::OK, &headers), Operation::Done);

        headers.insert("Location", HeaderValue::from_static("https://arm/location"));
        assert_eq!(
            operation_from(StatusCode::ACCEPTED, &headers),
            Operation::Pending {
                status_url: "https://arm/location".into()
            }
        );

        headers.insert(
            "Azure-AsyncOperation",
            HeaderValue::from_static("https://arm/async"),
        );
        assert_eq!(
            operation_from(StatusCode::ACCEPTED, &headers),
            Operation::Pending {
                status_url: "https://arm/async".into()
            }
        );
    }

    #[test]
    fn test_resource_urls() {
        let auth = Arc::new(TokenSource::new(Client::new(), "t", "a", crate::config::Secret::new("s")).unwrap());
        let client = ComputeClient::new(Client::new(), auth, "sub-1", "rg-1").unwrap();
        assert_eq!(
            client.scale_set_url("wrk", "/virtualMachines/3/reimage").unwrap().as_str(),
            "https://management.azure.com/subscriptions/sub-1/resourceGroups/rg-1/providers/Microsoft.Compute/virtualMachineScaleSets/wrk/virtualMachines/3/reimage?api-version=2018-06-01"
        );
        assert!(
            client
                .deployment_url("docker.template")
                .unwrap()
                .as_str()
                .ends_with("Microsoft.Resources/deployments/docker.template?api-version=2018-05-01")
        );
    }
}
