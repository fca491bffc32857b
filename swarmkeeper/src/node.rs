//! Node data model.
//!
//! Nodes are never cached across runs: every control-loop pass rebuilds them from live
//! scale-set and cluster queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

#[cfg(test)]
#[path = "node.test.rs"]
mod tests;

/// The role a node plays in the swarm. Each role is backed by its own scale set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Manager,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Worker => "worker",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manager" => Ok(Role::Manager),
            "worker" => Ok(Role::Worker),
            other => Err(format!("unknown node role '{}'", other)),
        }
    }
}

/// Status of a node as reported by the cluster control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Ready,
    Down,
    /// The control plane reported something else, or the node is not a member at all.
    Unknown,
}

impl ClusterStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ClusterStatus::Ready)
    }
}

impl From<&str> for ClusterStatus {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "ready" => ClusterStatus::Ready,
            "down" | "disconnected" => ClusterStatus::Down,
            _ => ClusterStatus::Unknown,
        }
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            ClusterStatus::Ready => "ready",
            ClusterStatus::Down => "down",
            ClusterStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A scale-set instance joined with its cluster identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub instance_id: String,
    pub private_ip: IpAddr,
    /// `None` when the instance has no matching cluster member (e.g. it never joined).
    pub cluster_node_id: Option<String>,
    pub role: Role,
    pub hostname: String,
    pub cluster_status: ClusterStatus,
    /// Time of the instance's last provisioning-state change, when the provider reports one.
    pub provisioned_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_member(&self) -> bool {
        self.cluster_node_id.is_some()
    }

    pub fn has_node_id(&self, node_id: &str) -> bool {
        self.cluster_node_id.as_deref() == Some(node_id)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "node(hostname={}, instance={}, ip={}, role={})",
            self.hostname, self.instance_id, self.private_ip, self.role
        )
    }
}

/// One scale set and the nodes it currently backs, in provider order.
#[derive(Debug, Clone)]
pub struct ScaleSet {
    pub name: String,
    pub role: Role,
    pub nodes: Vec<Node>,
}

/// Persisted pointer to the manager believed to be the cluster leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub leader_ip: IpAddr,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaDescription {
    Stable,
    UpgradeInProgress,
}

impl ReplicaDescription {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaDescription::Stable => "stable",
            ReplicaDescription::UpgradeInProgress => "upgrade in progress",
        }
    }
}

impl From<&str> for ReplicaDescription {
    fn from(s: &str) -> Self {
        if s == ReplicaDescription::UpgradeInProgress.as_str() {
            ReplicaDescription::UpgradeInProgress
        } else {
            ReplicaDescription::Stable
        }
    }
}

/// Bookkeeping for one datacenter add-on replica and the node hosting it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaRecord {
    pub replica_id: String,
    pub node_name: String,
    pub description: ReplicaDescription,
}

/// Handoff message naming the node that must complete its own upgrade next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejoinSignal {
    pub node_id: String,
    pub enqueued_at: DateTime<Utc>,
}

impl RejoinSignal {
    pub fn new(node_id: impl Into<String>) -> Self {
        RejoinSignal {
            node_id: node_id.into(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn is_for(&self, node_id: &str) -> bool {
        self.node_id == node_id
    }
}

/// Per-node upgrade state machine.
///
/// ```text
/// Active
///  -> DrainDatacenterService   (only with a datacenter add-on)
///  -> Demoted                  (only managers)
///  -> RemovedFromMembership
///  -> TemplateOSRefPending
///  -> Reimaging
///  -> Booting
///  -> RejoinedReady
/// ```
///
/// Any failure moves the node to `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Active,
    DrainDatacenterService,
    Demoted,
    RemovedFromMembership,
    TemplateOSRefPending,
    Reimaging,
    Booting,
    RejoinedReady,
    Aborted,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            NodeState::Active => "active",
            NodeState::DrainDatacenterService => "drain-datacenter-service",
            NodeState::Demoted => "demoted",
            NodeState::RemovedFromMembership => "removed-from-membership",
            NodeState::TemplateOSRefPending => "template-os-ref-pending",
            NodeState::Reimaging => "reimaging",
            NodeState::Booting => "booting",
            NodeState::RejoinedReady => "rejoined-ready",
            NodeState::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}
