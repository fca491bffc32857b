//! Rolling upgrade coordinator.
//!
//! Points the deployment at a new template, then walks every manager and then every worker
//! through the per-node [`NodeState`] machine, one node at a time:
//!
//! ```text
//! Active -> DrainDatacenterService -> Demoted -> RemovedFromMembership
//!        -> TemplateOSRefPending -> Reimaging -> Booting -> RejoinedReady
//! ```
//!
//! The node the coordinator runs on is never touched directly. After everything else is done it
//! is named in a rejoin signal on the upgrade mutex, and finishes its own upgrade through
//! [`RejoinAgent::complete_handoff`](crate::rejoin::RejoinAgent::complete_handoff), which also
//! releases the lock.
//!
//! Any failure releases the lock and stops the run. Nodes that were already upgraded stay
//! upgraded.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::addon::AddonError;
use crate::config::Config;
use crate::error::{ApiError, ignore_not_found};
use crate::membership::{ClusterMembership, ClusterNode, current_leader, evict};
use crate::mutex::{LockAcquire, MutexError};
use crate::node::{Node, NodeState, ReplicaDescription, ReplicaRecord, Role};
use crate::resolver::ResolutionError;
use crate::retry::{RetryError, RetryPolicy, poll_until, retry_transient};
use crate::scaleset::{OperationError, OperationStatus, wait_for_operation};
use crate::services::Services;
use crate::state::StateError;

#[cfg(test)]
#[path = "upgrade.test.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum UpgradeError {
    #[error("Invalid deployment template {url}: {reason}")]
    InvalidTemplate { url: String, reason: String },

    #[error("An upgrade is already in progress")]
    AlreadyInProgress,

    #[error("Refusing to upgrade a swarm with a single manager")]
    SingleManager,

    #[error("Demoting {node} would risk quorum, managers not ready: {unready:?}")]
    QuorumRisk { node: String, unready: Vec<String> },

    #[error("Deployment parameter {0} has no value and cannot be re-supplied")]
    MissingParameter(String),

    #[error("Node {node} aborted in state {state}: {source}")]
    Aborted {
        node: String,
        state: NodeState,
        #[source]
        source: Box<UpgradeError>,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("State store error: {0}")]
    State(#[from] StateError),

    #[error("Upgrade lock error: {0}")]
    Mutex(#[from] MutexError),

    #[error("Provider operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("Add-on error: {0}")]
    Addon(#[from] AddonError),
}

impl<E> From<RetryError<E>> for UpgradeError
where
    UpgradeError: From<E>,
{
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Exhausted {
                what,
                attempts,
                last_error,
            } => UpgradeError::Timeout(match last_error {
                Some(last) => format!("{} after {} attempts (last error: {})", what, attempts, last),
                None => format!("{} after {} attempts", what, attempts),
            }),
            RetryError::Failed(e) => e.into(),
        }
    }
}

/// Where deployment templates are fetched from for validation.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Value, ApiError>;
}

pub struct HttpTemplateSource {
    client: reqwest::Client,
}

impl HttpTemplateSource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTemplateSource { client })
    }
}

#[async_trait]
impl TemplateSource for HttpTemplateSource {
    async fn fetch(&self, url: &Url) -> Result<Value, ApiError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16(), format!("GET {}", url)));
        }
        Ok(response.json().await?)
    }
}

/// Check that `raw` is a usable template link before anything is locked or changed.
pub async fn validate_template_url(
    source: &dyn TemplateSource,
    raw: &str,
    allow_insecure: bool,
) -> Result<Url, UpgradeError> {
    let invalid = |reason: String| UpgradeError::InvalidTemplate {
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "https" => {}
        "http" if allow_insecure => {}
        other => return Err(invalid(format!("scheme '{}' is not allowed", other))),
    }
    if !url.path().ends_with(".json") {
        return Err(invalid("path does not end in .json".to_string()));
    }

    let body = source
        .fetch(&url)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !body.as_object().is_some_and(|o| o.contains_key("resources")) {
        return Err(invalid("body is not a template with resources".to_string()));
    }
    Ok(url)
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeReport {
    pub hostname: String,
    pub role: Role,
    pub state: NodeState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeReport {
    pub template: Url,
    /// Every upgraded node, in processing order.
    pub nodes: Vec<NodeReport>,
    /// Instances that are not cluster members and were left for the health monitor.
    pub skipped: Vec<String>,
    /// Cluster node id named in the final rejoin signal.
    pub handed_off: Option<String>,
    /// `true` when the run released the lock itself (nothing to hand off).
    pub lock_released: bool,
}

pub struct Coordinator {
    services: Services,
    config: Arc<Config>,
}

impl Coordinator {
    pub fn new(services: Services, config: Arc<Config>) -> Self {
        Coordinator { services, config }
    }

    #[tracing::instrument(skip(self))]
    pub async fn run(&self, template_url: &str) -> Result<UpgradeReport, UpgradeError> {
        let template = validate_template_url(
            self.services.templates.as_ref(),
            template_url,
            self.config.cluster.allow_insecure_template,
        )
        .await?;

        if self.services.mutex.acquire().await? == LockAcquire::AlreadyLocked {
            return Err(UpgradeError::AlreadyInProgress);
        }

        match self.run_locked(template).await {
            Ok(report) => Ok(report),
            Err(err) => {
                tracing::error!(error=%err, "Upgrade failed, releasing lock");
                if let Err(release_err) = self.services.mutex.release().await {
                    tracing::error!(error=%release_err, "Failed to release upgrade lock");
                }
                Err(err)
            }
        }
    }

    async fn run_locked(&self, template: Url) -> Result<UpgradeReport, UpgradeError> {
        let self_id = self.services.cluster.local_node_id().await?;
        let managers = self.services.cluster.list_nodes(Some(Role::Manager)).await?;
        if let [only] = managers.as_slice() {
            // A reset is only possible through the handoff of the coordinator's own node.
            let is_self = self_id.as_deref() == Some(only.id.as_str());
            if !(is_self && self.config.cluster.reset_single_manager) {
                return Err(UpgradeError::SingleManager);
            }
        }

        self.update_deployment(&template).await?;

        let mut report = UpgradeReport {
            template,
            nodes: Vec::new(),
            skipped: Vec::new(),
            handed_off: None,
            lock_released: false,
        };
        let mut self_node = None;
        let cluster = &self.config.cluster;
        let groups = [
            (cluster.manager_scale_set.as_str(), Role::Manager),
            (cluster.worker_scale_set.as_str(), Role::Worker),
        ];

        for (scale_set, role) in groups {
            let resolved = self.services.resolver().resolve(scale_set, role).await?;
            tracing::info!(scale_set=%scale_set, role=%role, nodes=resolved.nodes.len(), "Upgrading scale set");

            for node in resolved.nodes {
                if self_id.as_deref().is_some_and(|id| node.has_node_id(id)) {
                    tracing::info!(node=%node.hostname, "Deferring own node to the end");
                    self_node = Some(node);
                    continue;
                }
                if !node.is_member() {
                    tracing::warn!(node=%node.hostname, provisioned_at=?node.provisioned_at, "Instance is not a cluster member, skipping");
                    report.skipped.push(node.hostname);
                    continue;
                }
                let state = self.upgrade_node(scale_set, &node).await?;
                report.nodes.push(NodeReport {
                    hostname: node.hostname,
                    role,
                    state,
                });
            }
        }

        match (self_node, self_id) {
            (Some(node), Some(id)) => {
                if let Some(replica) =
                    drain_replica(&self.services, &self.config, &node.hostname).await?
                {
                    self.services.state.delete_replica(&replica.replica_id).await?;
                }
                self.services.mutex.enqueue_rejoin(&id).await?;
                tracing::info!(node=%node.hostname, node_id=%id, "Handed own node off, lock stays held");
                report.handed_off = Some(id);
            }
            _ => {
                self.services.mutex.release().await?;
                report.lock_released = true;
            }
        }

        tracing::info!(upgraded=report.nodes.len(), skipped=report.skipped.len(), "Upgrade complete");
        Ok(report)
    }

    /// Swap the template link, carrying every parameter forward.
    async fn update_deployment(&self, template: &Url) -> Result<(), UpgradeError> {
        let name = &self.config.cluster.deployment_name;
        let deployment = self.services.provider.get_deployment(name).await?;
        tracing::info!(
            deployment=%name,
            from=%deployment.template_link.as_ref().map(Url::as_str).unwrap_or("-"),
            to=%template,
            "Updating deployment template"
        );

        let mut parameters = Map::new();
        for (key, parameter) in deployment.parameters {
            let value = match parameter.value {
                Some(value) => value,
                None if key == self.config.cluster.secret_parameter => {
                    Value::String(self.config.azure.app_secret.expose().to_string())
                }
                None if parameter.secure => return Err(UpgradeError::MissingParameter(key)),
                None => continue,
            };
            parameters.insert(key, json!({ "value": value }));
        }

        let op = self
            .services
            .provider
            .update_deployment(name, template, parameters)
            .await?;
        wait_for_operation(
            self.services.provider.as_ref(),
            &op,
            self.config.timings.provider_poll(),
            &format!("update deployment {}", name),
        )
        .await?;
        Ok(())
    }

    /// Walk one node to `RejoinedReady`, or report the state it aborted in.
    async fn upgrade_node(&self, scale_set: &str, node: &Node) -> Result<NodeState, UpgradeError> {
        let mut state = NodeState::Active;
        log_state(node, state);
        match self.transition(scale_set, node, &mut state).await {
            Ok(()) => Ok(state),
            Err(err) => {
                log_state(node, NodeState::Aborted);
                Err(UpgradeError::Aborted {
                    node: node.hostname.clone(),
                    state,
                    source: Box::new(err),
                })
            }
        }
    }

    async fn transition(
        &self,
        scale_set: &str,
        node: &Node,
        state: &mut NodeState,
    ) -> Result<(), UpgradeError> {
        let cluster = self.services.cluster.as_ref();
        let provider = self.services.provider.as_ref();
        let timings = &self.config.timings;
        let node_id = node.cluster_node_id.as_deref().unwrap_or_default();

        if self.services.addon.is_some() {
            enter(node, state, NodeState::DrainDatacenterService);
        }
        let replica = drain_replica(&self.services, &self.config, &node.hostname).await?;

        if node.role == Role::Manager {
            self.demote_manager(node, node_id).await?;
            enter(node, state, NodeState::Demoted);
        }

        ignore_not_found(cluster.remove(node_id).await)?;
        if let Some(replica) = replica {
            self.services.state.delete_replica(&replica.replica_id).await?;
        }
        enter(node, state, NodeState::RemovedFromMembership);

        let op = provider.update_instance_model(scale_set, &node.instance_id).await?;
        wait_for_operation(
            provider,
            &op,
            timings.provider_poll(),
            &format!("update model of {}", node.hostname),
        )
        .await?;
        enter(node, state, NodeState::TemplateOSRefPending);

        let op = provider.reimage(scale_set, &node.instance_id).await?;
        enter(node, state, NodeState::Reimaging);
        let role = node.role;
        let op = &op;
        let status = poll_until(
            timings.provider_poll(),
            &format!("reimage of {}", node.hostname),
            move || async move {
                if let Err(err) = self.remove_overprovisioned(scale_set, role).await {
                    return Err(err);
                }
                provider.operation_status(op).await.map(|status| match status {
                    OperationStatus::InProgress => None,
                    done => Some(done),
                })
            },
        )
        .await?;
        if let OperationStatus::Failed(reason) = status {
            return Err(OperationError::Failed {
                what: format!("reimage of {}", node.hostname),
                reason,
            }
            .into());
        }

        enter(node, state, NodeState::Booting);
        let hostname = node.hostname.as_str();
        let rejoined = poll_until(
            timings.rejoin_poll(),
            &format!("{} to rejoin", hostname),
            move || async move {
                cluster.list_nodes(Some(role)).await.map(|nodes| {
                    nodes
                        .into_iter()
                        .find(|n| n.hostname.eq_ignore_ascii_case(hostname) && n.status.is_ready())
                })
            },
        )
        .await?;
        tracing::debug!(node=%hostname, node_id=%rejoined.id, "Node rejoined");
        enter(node, state, NodeState::RejoinedReady);
        Ok(())
    }

    /// Quorum guard, demotion and, when the node led the swarm, the leader record refresh.
    ///
    /// The last manager is never demoted here; only its own handoff may reset it.
    async fn demote_manager(&self, node: &Node, node_id: &str) -> Result<(), UpgradeError> {
        let cluster = self.services.cluster.as_ref();
        let managers = cluster.list_nodes(Some(Role::Manager)).await?;
        let others: Vec<&ClusterNode> = managers.iter().filter(|m| m.id != node_id).collect();

        if others.is_empty() {
            return Err(UpgradeError::SingleManager);
        }

        let unready: Vec<String> = others
            .iter()
            .filter(|m| !m.status.is_ready())
            .map(|m| m.hostname.clone())
            .collect();
        if !unready.is_empty() {
            return Err(UpgradeError::QuorumRisk {
                node: node.hostname.clone(),
                unready,
            });
        }

        let was_leader = managers.iter().any(|m| m.id == node_id && m.is_leader);
        cluster.demote(node_id).await?;
        if was_leader {
            let leader =
                await_new_leader(cluster, node_id, self.config.timings.leader_poll()).await?;
            self.services.state.set_leader(leader.addr).await?;
        }
        Ok(())
    }

    /// Evict members of `role` whose hostname matches no instance of the scale set.
    async fn remove_overprovisioned(&self, scale_set: &str, role: Role) -> Result<(), ApiError> {
        let hostnames: HashSet<String> = self
            .services
            .provider
            .list_instances(scale_set)
            .await?
            .into_iter()
            .map(|i| i.computer_name.to_ascii_lowercase())
            .collect();
        let members = self.services.cluster.list_nodes(Some(role)).await?;
        for member in members
            .iter()
            .filter(|m| !hostnames.contains(&m.hostname.to_ascii_lowercase()))
        {
            tracing::warn!(node=%member.hostname, scale_set=%scale_set, "Removing overprovisioned node");
            evict(self.services.cluster.as_ref(), &member.id, role).await?;
        }
        Ok(())
    }
}

fn enter(node: &Node, state: &mut NodeState, next: NodeState) {
    *state = next;
    log_state(node, next);
}

fn log_state(node: &Node, state: NodeState) {
    tracing::info!(node=%node.hostname, role=%node.role, state=%state, "Node state transition");
}

/// Remove the add-on replica hosted on `hostname`, if an add-on is installed and has one there.
///
/// The record is marked as upgrading first so a crash mid-drain leaves a trace.
pub(crate) async fn drain_replica(
    services: &Services,
    config: &Config,
    hostname: &str,
) -> Result<Option<ReplicaRecord>, UpgradeError> {
    let Some(addon) = services.addon.as_deref() else {
        return Ok(None);
    };
    let Some(replica) = services.state.replica_for_node(hostname).await? else {
        return Ok(None);
    };

    let replica = services
        .state
        .mark_replica(&replica, ReplicaDescription::UpgradeInProgress)
        .await?;
    let target = &replica;
    retry_transient(
        config.timings.addon_retry(),
        &format!("remove replica {}", replica.replica_id),
        move || async move { addon.remove_replica(target).await },
    )
    .await?;
    Ok(Some(replica))
}

/// Wait for the swarm to report a leader other than `demoted_id`.
pub(crate) async fn await_new_leader(
    cluster: &dyn ClusterMembership,
    demoted_id: &str,
    policy: RetryPolicy,
) -> Result<ClusterNode, UpgradeError> {
    let leader = poll_until(policy, "new leader election", move || async move {
        current_leader(cluster)
            .await
            .map(|leader| leader.filter(|l| l.id != demoted_id))
    })
    .await?;
    tracing::info!(leader=%leader.hostname, addr=%leader.addr, "New leader elected");
    Ok(leader)
}
