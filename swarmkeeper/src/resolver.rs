//! Node registry resolver.
//!
//! Correlates scale-set instances with cluster members through the private IP of each
//! instance's primary network interface. Read-only.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::ApiError;
use crate::membership::ClusterMembership;
use crate::node::{ClusterStatus, Node, Role, ScaleSet};
use crate::scaleset::ScaleSetProvider;

#[cfg(test)]
#[path = "resolver.test.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum ResolutionError {
    /// A cluster member has no NIC in the scale set, i.e. inventory and membership drifted.
    #[error("Cluster node {node_id} ({hostname}, {addr}) has no network interface in scale set {scale_set}")]
    UnknownAddress {
        scale_set: String,
        node_id: String,
        hostname: String,
        addr: IpAddr,
    },

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

/// One row of the instance <-> IP table.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceAddress {
    pub instance_id: String,
    pub private_ip: IpAddr,
    pub computer_name: String,
}

#[derive(Clone)]
pub struct NodeResolver {
    provider: Arc<dyn ScaleSetProvider>,
    cluster: Arc<dyn ClusterMembership>,
}

impl NodeResolver {
    pub fn new(provider: Arc<dyn ScaleSetProvider>, cluster: Arc<dyn ClusterMembership>) -> Self {
        NodeResolver { provider, cluster }
    }

    /// Primary private IP of every instance in the scale set, in provider instance order.
    ///
    /// Instances without a primary IP configuration (still provisioning) are left out.
    pub async fn instance_table(&self, scale_set: &str) -> Result<Vec<InstanceAddress>, ApiError> {
        let instances = self.provider.list_instances(scale_set).await?;
        let nics = self.provider.list_network_interfaces(scale_set).await?;

        let primary: HashMap<&str, IpAddr> = nics
            .iter()
            .filter(|nic| nic.primary)
            .map(|nic| (nic.instance_id.as_str(), nic.private_ip))
            .collect();

        let table = instances
            .into_iter()
            .filter_map(|instance| {
                let ip = primary.get(instance.instance_id.as_str()).copied();
                if ip.is_none() {
                    tracing::debug!(scale_set=%scale_set, instance=%instance.instance_id, "Instance has no primary IP yet");
                }
                ip.map(|private_ip| InstanceAddress {
                    instance_id: instance.instance_id,
                    private_ip,
                    computer_name: instance.computer_name,
                })
            })
            .collect();
        Ok(table)
    }

    /// Join the scale set's instance table with the cluster members of `role`.
    ///
    /// Fails if any member's IP has no NIC in the scale set. Instances that are not members
    /// come back with no cluster node id and an unknown status.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, scale_set: &str, role: Role) -> Result<ScaleSet, ResolutionError> {
        let table = self.instance_table(scale_set).await?;
        let members = self.cluster.list_nodes(Some(role)).await?;

        for member in &members {
            if !table.iter().any(|row| row.private_ip == member.addr) {
                return Err(ResolutionError::UnknownAddress {
                    scale_set: scale_set.to_string(),
                    node_id: member.id.clone(),
                    hostname: member.hostname.clone(),
                    addr: member.addr,
                });
            }
        }

        let mut nodes = Vec::with_capacity(table.len());
        for row in table {
            // Prefer a ready member if the IP is listed twice (old entry not yet removed).
            let member = members
                .iter()
                .filter(|m| m.addr == row.private_ip)
                .max_by_key(|m| m.status.is_ready());
            let provisioned_at = match self.provider.instance_view(scale_set, &row.instance_id).await {
                Ok(view) => view.provisioned_at,
                Err(ApiError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };
            nodes.push(Node {
                instance_id: row.instance_id,
                private_ip: row.private_ip,
                cluster_node_id: member.map(|m| m.id.clone()),
                role,
                hostname: member
                    .map(|m| m.hostname.clone())
                    .unwrap_or(row.computer_name),
                cluster_status: member.map(|m| m.status).unwrap_or(ClusterStatus::Unknown),
                provisioned_at,
            });
        }

        tracing::debug!(scale_set=%scale_set, nodes=nodes.len(), members=members.len(), "Resolved scale set");
        Ok(ScaleSet {
            name: scale_set.to_string(),
            role,
            nodes,
        })
    }
}
