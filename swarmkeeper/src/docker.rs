//! [`ClusterMembership`] over the Docker Engine HTTP API.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::ApiError;
use crate::membership::{ClusterMembership, ClusterNode, JoinTokens};
use crate::node::{ClusterStatus, Role};

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeResponse {
    #[serde(rename = "ID")]
    id: String,
    version: ObjectVersion,
    spec: Value,
    #[serde(default)]
    description: Option<NodeDescription>,
    status: NodeStatus,
    #[serde(default)]
    manager_status: Option<ManagerStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectVersion {
    index: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeDescription {
    #[serde(default)]
    hostname: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeStatus {
    state: String,
    #[serde(default)]
    addr: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManagerStatus {
    #[serde(default)]
    leader: bool,
    #[serde(default)]
    addr: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmResponse {
    join_tokens: SwarmJoinTokens,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmJoinTokens {
    worker: String,
    manager: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InfoResponse {
    swarm: SwarmInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmInfo {
    #[serde(rename = "NodeID", default)]
    node_id: String,
    #[serde(default)]
    local_node_state: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Clone)]
pub struct DockerMembership {
    client: Client,
    base: Url,
    swarm_port: u16,
}

impl DockerMembership {
    pub fn new(base: Url, swarm_port: u16, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(DockerMembership {
            client,
            base,
            swarm_port,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::Fatal(format!("bad engine path {}: {}", path, e)))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        tracing::debug!(what=%what, status=%status, message=%message, "Engine request failed");
        Err(ApiError::from_status(
            status.as_u16(),
            format!("{}: {}", what, message.trim()),
        ))
    }

    async fn get_node(&self, node_id: &str) -> Result<NodeResponse, ApiError> {
        let url = self.url(&format!("nodes/{}", node_id))?;
        let what = format!("inspect node {}", node_id);
        Ok(self.send(self.client.get(url), &what).await?.json().await?)
    }
}

fn parse_node(node: NodeResponse) -> Result<ClusterNode, ApiError> {
    let role = node
        .spec
        .get("Role")
        .and_then(Value::as_str)
        .unwrap_or("worker")
        .parse::<Role>()
        .map_err(ApiError::Decode)?;

    // Managers may report 0.0.0.0 as their status address; the manager address is reliable.
    let manager_addr = node
        .manager_status
        .as_ref()
        .and_then(|m| m.addr.as_deref())
        .and_then(|a| a.parse::<SocketAddr>().ok())
        .map(|a| a.ip());
    let status_addr = node
        .status
        .addr
        .as_deref()
        .and_then(|a| a.parse::<IpAddr>().ok())
        .filter(|ip| !ip.is_unspecified());
    let addr = status_addr
        .or(manager_addr)
        .ok_or_else(|| ApiError::Decode(format!("node {} has no address", node.id)))?;

    Ok(ClusterNode {
        hostname: node.description.map(|d| d.hostname).unwrap_or_default(),
        addr,
        role,
        status: ClusterStatus::from(node.status.state.as_str()),
        is_leader: node.manager_status.is_some_and(|m| m.leader),
        id: node.id,
    })
}

#[async_trait]
impl ClusterMembership for DockerMembership {
    async fn list_nodes(&self, role: Option<Role>) -> Result<Vec<ClusterNode>, ApiError> {
        let mut request = self.client.get(self.url("nodes")?);
        if let Some(role) = role {
            let filters = json!({ "role": [role.as_str()] }).to_string();
            request = request.query(&[("filters", filters)]);
        }
        let nodes: Vec<NodeResponse> = self.send(request, "list nodes").await?.json().await?;
        nodes.into_iter().map(parse_node).collect()
    }

    async fn inspect_node(&self, node_id: &str) -> Result<ClusterNode, ApiError> {
        parse_node(self.get_node(node_id).await?)
    }

    async fn local_node_id(&self) -> Result<Option<String>, ApiError> {
        let info: InfoResponse = self
            .send(self.client.get(self.url("info")?), "engine info")
            .await?
            .json()
            .await?;
        let swarm = info.swarm;
        if swarm.local_node_state != "active" || swarm.node_id.is_empty() {
            return Ok(None);
        }
        Ok(Some(swarm.node_id))
    }

    async fn demote(&self, node_id: &str) -> Result<(), ApiError> {
        let node = self.get_node(node_id).await?;
        let mut spec = node.spec;
        if let Some(spec) = spec.as_object_mut() {
            spec.insert("Role".to_string(), json!("worker"));
        }
        let url = self.url(&format!("nodes/{}/update", node_id))?;
        let request = self
            .client
            .post(url)
            .query(&[("version", node.version.index)])
            .json(&spec);
        self.send(request, &format!("demote node {}", node_id)).await?;
        Ok(())
    }

    async fn remove(&self, node_id: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("nodes/{}", node_id))?;
        let request = self.client.delete(url).query(&[("force", "true")]);
        self.send(request, &format!("remove node {}", node_id)).await?;
        Ok(())
    }

    async fn join_tokens(&self) -> Result<JoinTokens, ApiError> {
        let swarm: SwarmResponse = self
            .send(self.client.get(self.url("swarm")?), "inspect swarm")
            .await?
            .json()
            .await?;
        Ok(JoinTokens {
            manager: swarm.join_tokens.manager,
            worker: swarm.join_tokens.worker,
        })
    }

    async fn leave(&self) -> Result<(), ApiError> {
        let request = self
            .client
            .post(self.url("swarm/leave")?)
            .query(&[("force", "true")]);
        self.send(request, "leave swarm").await?;
        Ok(())
    }

    async fn join(&self, remote: IpAddr, token: &str) -> Result<(), ApiError> {
        let body = json!({
            "ListenAddr": format!("0.0.0.0:{}", self.swarm_port),
            "RemoteAddrs": [SocketAddr::new(remote, self.swarm_port).to_string()],
            "JoinToken": token,
        });
        let request = self.client.post(self.url("swarm/join")?).json(&body);
        self.send(request, &format!("join swarm at {}", remote)).await?;
        Ok(())
    }

    fn at(&self, addr: IpAddr) -> Arc<dyn ClusterMembership> {
        let mut remote = self.clone();
        if remote.base.set_ip_host(addr).is_err() {
            tracing::warn!(base=%self.base, addr=%addr, "Cannot retarget engine URL, using local engine");
        }
        Arc::new(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn node(value: Value) -> NodeResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_manager_node() {
        let parsed = parse_node(node(json!({
            "ID": "24ifsmvkjbyhk",
            "Version": { "Index": 373531 },
            "Spec": { "Role": "manager", "Availability": "active" },
            "Description": { "Hostname": "swarm-manager000000" },
            "Status": { "State": "ready", "Addr": "0.0.0.0" },
            "ManagerStatus": { "Leader": true, "Reachability": "reachable", "Addr": "10.0.0.4:2377" }
        })))
        .unwrap();
        assert_eq!(parsed.id, "24ifsmvkjbyhk");
        assert_eq!(parsed.role, Role::Manager);
        assert_eq!(parsed.addr.to_string(), "10.0.0.4");
        assert_eq!(parsed.hostname, "swarm-manager000000");
        assert!(parsed.is_leader);
        assert!(parsed.status.is_ready());
    }

    #[test]
    fn test_parse_down_worker() {
        let parsed = parse_node(node(json!({
            "ID": "abc",
            "Version": { "Index": 1 },
            "Spec": { "Role": "worker" },
            "Description": { "Hostname": "swarm-worker000003" },
            "Status": { "State": "down", "Addr": "10.0.1.7" }
        })))
        .unwrap();
        assert_eq!(parsed.role, Role::Worker);
        assert_eq!(parsed.status, ClusterStatus::Down);
        assert!(!parsed.is_leader);
    }

    #[test]
    fn test_parse_node_without_address() {
        let result = parse_node(node(json!({
            "ID": "abc",
            "Version": { "Index": 1 },
            "Spec": { "Role": "worker" },
            "Status": { "State": "unknown" }
        })));
        assert_matches!(result, Err(ApiError::Decode(_)));
    }

    #[test]
    fn test_at_retargets_host() {
        let local = DockerMembership::new(
            Url::parse("http://127.0.0.1:2375/").unwrap(),
            2377,
            Duration::from_secs(5),
        )
        .unwrap();
        let mut remote = local.clone();
        remote.base.set_ip_host("10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(remote.url("nodes").unwrap().as_str(), "http://10.0.0.5:2375/nodes");
    }
}
