//! Node-side halves of the upgrade.
//!
//! [`RejoinAgent::complete_handoff`] runs on the managers after a coordinator run. Only the
//! node named by the head rejoin signal acts: it leaves the swarm, releases the upgrade lock
//! and reimages itself.
//!
//! [`RejoinAgent::join_cluster`] runs at boot and joins a freshly imaged node back through the
//! leader recorded in the state store.

use std::net::IpAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{ApiError, ignore_not_found};
use crate::membership::ClusterMembership;
use crate::mutex::MutexError;
use crate::node::{ReplicaDescription, ReplicaRecord, Role};
use crate::retry::{RetryError, retry_transient};
use crate::scaleset::{OperationError, wait_for_operation};
use crate::services::Services;
use crate::state::StateError;
use crate::upgrade::{UpgradeError, await_new_leader, drain_replica};

#[cfg(test)]
#[path = "rejoin.test.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum RejoinError {
    #[error("No leader record to join through")]
    NoLeader,

    #[error("Node {node_id} ({addr}) has no instance in scale set {scale_set}")]
    NotInScaleSet {
        node_id: String,
        addr: IpAddr,
        scale_set: String,
    },

    #[error("Local node is still not a swarm member after joining")]
    JoinNotVisible,

    #[error("Upgrade step failed: {0}")]
    Upgrade(#[from] UpgradeError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("State store error: {0}")]
    State(#[from] StateError),

    #[error("Upgrade lock error: {0}")]
    Mutex(#[from] MutexError),

    #[error("Provider operation error: {0}")]
    Operation(#[from] OperationError),
}

impl From<RetryError<ApiError>> for RejoinError {
    fn from(err: RetryError<ApiError>) -> Self {
        RejoinError::Upgrade(err.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandoffOutcome {
    /// No signal pending, or this host is not a swarm member.
    Idle,
    /// The head signal names another node; it was left in place with `pending` signals queued.
    NotForUs { target: String, pending: usize },
    /// This node left the swarm, released the lock and started its own reimage.
    Completed { node_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    AlreadyMember { node_id: String },
    Joined {
        node_id: String,
        leader_ip: IpAddr,
        replica_id: Option<String>,
    },
}

pub struct RejoinAgent {
    services: Services,
    config: Arc<Config>,
}

impl RejoinAgent {
    pub fn new(services: Services, config: Arc<Config>) -> Self {
        RejoinAgent { services, config }
    }

    #[tracing::instrument(skip(self))]
    pub async fn complete_handoff(&self) -> Result<HandoffOutcome, RejoinError> {
        let cluster = self.services.cluster.as_ref();
        let Some(node_id) = cluster.local_node_id().await? else {
            return Ok(HandoffOutcome::Idle);
        };
        match self.services.mutex.peek_rejoin().await? {
            None => return Ok(HandoffOutcome::Idle),
            Some(signal) if !signal.is_for(&node_id) => {
                let pending = self.services.mutex.pending_signals().await?;
                return Ok(HandoffOutcome::NotForUs {
                    target: signal.node_id,
                    pending,
                });
            }
            Some(_) => {}
        }
        if self
            .services
            .mutex
            .consume_rejoin_if_self(&node_id)
            .await?
            .is_none()
        {
            return Ok(HandoffOutcome::Idle);
        }

        let me = cluster.inspect_node(&node_id).await?;
        let scale_set = match me.role {
            Role::Manager => self.config.cluster.manager_scale_set.as_str(),
            Role::Worker => self.config.cluster.worker_scale_set.as_str(),
        };
        let instance = self
            .services
            .resolver()
            .instance_table(scale_set)
            .await?
            .into_iter()
            .find(|row| row.private_ip == me.addr)
            .ok_or_else(|| RejoinError::NotInScaleSet {
                node_id: node_id.clone(),
                addr: me.addr,
                scale_set: scale_set.to_string(),
            })?;
        tracing::info!(node=%me.hostname, node_id=%node_id, "Completing own upgrade");

        if let Some(replica) = drain_replica(&self.services, &self.config, &me.hostname).await? {
            self.services.state.delete_replica(&replica.replica_id).await?;
        }

        // Removal has to go through a manager that is not us.
        let remote: Option<Arc<dyn ClusterMembership>> = match me.role {
            Role::Manager => self.step_down(&node_id, me.is_leader).await?,
            Role::Worker => {
                let leader = self
                    .services
                    .state
                    .get_leader()
                    .await?
                    .ok_or(RejoinError::NoLeader)?;
                Some(cluster.at(leader.leader_ip))
            }
        };

        cluster.leave().await?;
        if let Some(remote) = remote {
            ignore_not_found(remote.remove(&node_id).await)?;
        }
        self.services.mutex.release().await?;

        let provider = self.services.provider.as_ref();
        let op = provider
            .update_instance_model(scale_set, &instance.instance_id)
            .await?;
        wait_for_operation(
            provider,
            &op,
            self.config.timings.provider_poll(),
            &format!("update model of {}", me.hostname),
        )
        .await?;
        // This host goes down with the reimage, so there is nothing to wait for.
        provider.reimage(scale_set, &instance.instance_id).await?;
        tracing::info!(node=%me.hostname, "Own reimage started");

        Ok(HandoffOutcome::Completed { node_id })
    }

    /// Demote the local manager and return a client for the manager that takes over.
    ///
    /// On a single-manager swarm there is no one to hand over to; the leader record is cleared
    /// when a reset is allowed.
    async fn step_down(
        &self,
        node_id: &str,
        was_leader: bool,
    ) -> Result<Option<Arc<dyn ClusterMembership>>, RejoinError> {
        let cluster = self.services.cluster.as_ref();
        let managers = cluster.list_nodes(Some(Role::Manager)).await?;
        let Some(peer) = managers
            .iter()
            .find(|m| m.id != node_id && m.status.is_ready())
        else {
            if !self.config.cluster.reset_single_manager {
                return Err(UpgradeError::SingleManager.into());
            }
            tracing::warn!("Last manager leaving, clearing leader record");
            self.services.state.clear_leader().await?;
            return Ok(None);
        };

        cluster.demote(node_id).await?;
        // Once demoted the local daemon can no longer answer membership queries.
        let peer = cluster.at(peer.addr);
        let leader =
            await_new_leader(peer.as_ref(), node_id, self.config.timings.leader_poll()).await?;
        if was_leader {
            self.services.state.set_leader(leader.addr).await?;
        }
        Ok(Some(cluster.at(leader.addr)))
    }

    #[tracing::instrument(skip(self))]
    pub async fn join_cluster(&self, role: Role) -> Result<JoinOutcome, RejoinError> {
        let cluster = self.services.cluster.as_ref();
        if let Some(node_id) = cluster.local_node_id().await? {
            tracing::info!(node_id=%node_id, "Already a swarm member");
            return Ok(JoinOutcome::AlreadyMember { node_id });
        }

        let leader = self
            .services
            .state
            .get_leader()
            .await?
            .ok_or(RejoinError::NoLeader)?;
        let remote = cluster.at(leader.leader_ip);
        let remote = remote.as_ref();
        let tokens = retry_transient(
            self.config.timings.api_retry(),
            "fetch join tokens",
            move || async move { remote.join_tokens().await },
        )
        .await?;

        cluster.join(leader.leader_ip, tokens.for_role(role)).await?;
        let node_id = cluster
            .local_node_id()
            .await?
            .ok_or(RejoinError::JoinNotVisible)?;
        tracing::info!(node_id=%node_id, role=%role, leader_ip=%leader.leader_ip, "Joined swarm");

        let mut replica_id = None;
        if let (Role::Manager, Some(addon)) = (role, self.services.addon.as_deref()) {
            let me = cluster.inspect_node(&node_id).await?;
            let id = addon
                .join_replica(&me.hostname)
                .await
                .map_err(UpgradeError::from)?;
            self.services
                .state
                .put_replica(&ReplicaRecord {
                    replica_id: id.clone(),
                    node_name: me.hostname,
                    description: ReplicaDescription::Stable,
                })
                .await?;
            replica_id = Some(id);
        }

        Ok(JoinOutcome::Joined {
            node_id,
            leader_ip: leader.leader_ip,
            replica_id,
        })
    }
}
