//! Cluster membership API.
//!
//! swarmkeeper never implements consensus itself. It only asks an existing swarm control plane
//! to list, demote and remove nodes, and to hand out join tokens.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::{ApiError, ignore_not_found};
use crate::node::{ClusterStatus, Role};

/// A node as the cluster control plane sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterNode {
    pub id: String,
    pub hostname: String,
    pub addr: IpAddr,
    pub role: Role,
    pub status: ClusterStatus,
    pub is_leader: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinTokens {
    pub manager: String,
    pub worker: String,
}

impl JoinTokens {
    pub fn for_role(&self, role: Role) -> &str {
        match role {
            Role::Manager => &self.manager,
            Role::Worker => &self.worker,
        }
    }
}

#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// List cluster members, optionally restricted to one role.
    async fn list_nodes(&self, role: Option<Role>) -> Result<Vec<ClusterNode>, ApiError>;

    async fn inspect_node(&self, node_id: &str) -> Result<ClusterNode, ApiError>;

    /// The cluster node id of the host this process runs on, `None` if it is not a member.
    async fn local_node_id(&self) -> Result<Option<String>, ApiError>;

    async fn demote(&self, node_id: &str) -> Result<(), ApiError>;

    /// Forcibly remove a node from the membership list.
    async fn remove(&self, node_id: &str) -> Result<(), ApiError>;

    async fn join_tokens(&self) -> Result<JoinTokens, ApiError>;

    /// Forcibly leave the cluster from the local node.
    async fn leave(&self) -> Result<(), ApiError>;

    /// Join the local node to the cluster managed at `remote`.
    async fn join(&self, remote: IpAddr, token: &str) -> Result<(), ApiError>;

    /// A client for the same control plane, reached through the manager at `addr`.
    fn at(&self, addr: IpAddr) -> Arc<dyn ClusterMembership>;
}

/// The manager currently reported as leader, if any.
pub async fn current_leader(
    cluster: &dyn ClusterMembership,
) -> Result<Option<ClusterNode>, ApiError> {
    let managers = cluster.list_nodes(Some(Role::Manager)).await?;
    Ok(managers.into_iter().find(|n| n.is_leader))
}

/// Take a node out of the cluster: demote first when it is a manager, then force-remove.
///
/// A node that is already gone counts as evicted.
pub async fn evict(
    cluster: &dyn ClusterMembership,
    node_id: &str,
    role: Role,
) -> Result<(), ApiError> {
    if role == Role::Manager {
        tracing::info!(node_id=%node_id, "Demoting manager");
        ignore_not_found(cluster.demote(node_id).await)?;
    }
    tracing::info!(node_id=%node_id, role=%role, "Removing node from cluster");
    ignore_not_found(cluster.remove(node_id).await)
}
