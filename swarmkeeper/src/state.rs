//! Leader and replica bookkeeping kept in the key-value table.
//!
//! Only the upgrade coordinator (and the self-node handoff it starts) writes here, always while
//! holding the upgrade mutex. Readers take no lock and must tolerate a slightly stale record.

use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::{ApiError, ignore_not_found};
use crate::node::{LeaderRecord, ReplicaDescription, ReplicaRecord};
use crate::storage::{Entity, KeyValueTable};

#[cfg(test)]
#[path = "state.test.rs"]
mod tests;

const LEADER_PARTITION: &str = "leader";
const LEADER_ROW: &str = "current";
const REPLICA_PARTITION: &str = "replicas";

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("Table error: {0}")]
    Api(#[from] ApiError),

    #[error("Malformed {what} record: {reason}")]
    Malformed { what: &'static str, reason: String },
}

#[derive(Clone)]
pub struct StateStore {
    table: Arc<dyn KeyValueTable>,
    leader_table: String,
    replica_table: String,
}

impl StateStore {
    pub fn new(
        table: Arc<dyn KeyValueTable>,
        leader_table: impl Into<String>,
        replica_table: impl Into<String>,
    ) -> Self {
        StateStore {
            table,
            leader_table: leader_table.into(),
            replica_table: replica_table.into(),
        }
    }

    pub async fn get_leader(&self) -> Result<Option<LeaderRecord>, StateError> {
        let Some(entity) = self
            .table
            .get(&self.leader_table, LEADER_PARTITION, LEADER_ROW)
            .await?
        else {
            return Ok(None);
        };

        let leader_ip = entity
            .get_str("leader_ip")
            .ok_or_else(|| malformed("leader", "missing leader_ip"))?
            .parse::<IpAddr>()
            .map_err(|e| malformed("leader", e.to_string()))?;
        let updated_at = entity
            .get_str("updated_at")
            .map(DateTime::parse_from_rfc3339)
            .transpose()
            .map_err(|e| malformed("leader", e.to_string()))?
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Some(LeaderRecord {
            leader_ip,
            updated_at,
        }))
    }

    pub async fn set_leader(&self, leader_ip: IpAddr) -> Result<LeaderRecord, StateError> {
        let record = LeaderRecord {
            leader_ip,
            updated_at: Utc::now(),
        };
        let entity = Entity::new(LEADER_PARTITION, LEADER_ROW)
            .with("leader_ip", record.leader_ip.to_string())
            .with("updated_at", record.updated_at.to_rfc3339());
        self.table.upsert(&self.leader_table, entity).await?;
        tracing::info!(leader_ip=%leader_ip, "Leader record updated");
        Ok(record)
    }

    /// Drop the leader record entirely. Only used when a single-manager swarm is reset.
    pub async fn clear_leader(&self) -> Result<(), StateError> {
        ignore_not_found(
            self.table
                .delete(&self.leader_table, LEADER_PARTITION, LEADER_ROW)
                .await,
        )?;
        tracing::warn!("Leader record cleared");
        Ok(())
    }

    pub async fn list_replicas(&self) -> Result<Vec<ReplicaRecord>, StateError> {
        let entities = self
            .table
            .query(&self.replica_table, REPLICA_PARTITION)
            .await?;
        entities.iter().map(replica_from_entity).collect()
    }

    pub async fn replica_for_node(
        &self,
        node_name: &str,
    ) -> Result<Option<ReplicaRecord>, StateError> {
        let replicas = self.list_replicas().await?;
        Ok(replicas
            .into_iter()
            .find(|r| r.node_name.eq_ignore_ascii_case(node_name)))
    }

    pub async fn put_replica(&self, replica: &ReplicaRecord) -> Result<(), StateError> {
        let entity = Entity::new(REPLICA_PARTITION, replica.replica_id.as_str())
            .with("node_name", replica.node_name.as_str())
            .with("description", replica.description.as_str());
        self.table.upsert(&self.replica_table, entity).await?;
        Ok(())
    }

    pub async fn mark_replica(
        &self,
        replica: &ReplicaRecord,
        description: ReplicaDescription,
    ) -> Result<ReplicaRecord, StateError> {
        let updated = ReplicaRecord {
            description,
            ..replica.clone()
        };
        self.put_replica(&updated).await?;
        tracing::debug!(
            replica_id=%updated.replica_id,
            node=%updated.node_name,
            description=%description.as_str(),
            "Replica record updated"
        );
        Ok(updated)
    }

    pub async fn delete_replica(&self, replica_id: &str) -> Result<(), StateError> {
        ignore_not_found(
            self.table
                .delete(&self.replica_table, REPLICA_PARTITION, replica_id)
                .await,
        )?;
        Ok(())
    }
}

fn malformed(what: &'static str, reason: impl Into<String>) -> StateError {
    StateError::Malformed {
        what,
        reason: reason.into(),
    }
}

fn replica_from_entity(entity: &Entity) -> Result<ReplicaRecord, StateError> {
    let node_name = entity
        .get_str("node_name")
        .ok_or_else(|| malformed("replica", format!("{} has no node_name", entity.row_key)))?;
    Ok(ReplicaRecord {
        replica_id: entity.row_key.clone(),
        node_name: node_name.to_string(),
        description: entity
            .get_str("description")
            .map(ReplicaDescription::from)
            .unwrap_or(ReplicaDescription::Stable),
    })
}
