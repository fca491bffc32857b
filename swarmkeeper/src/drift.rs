//! Drift reconciler.
//!
//! Removes cluster members that no scale-set instance backs any more, typically because the
//! VM was deleted out of band. Members whose IP is still present are never touched here, even
//! when unhealthy; that is the health monitor's job.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::ApiError;
use crate::membership::evict;
use crate::mutex::MutexError;
use crate::node::Role;
use crate::services::Services;

#[cfg(test)]
#[path = "drift.test.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum DriftError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Upgrade lock error: {0}")]
    Mutex(#[from] MutexError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftReport {
    pub scale_set: String,
    /// Hostnames of the stale members that were removed.
    pub removed: Vec<String>,
    /// Members with no backing instance that are still ready, and so were left alone.
    pub orphaned_ready: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriftOutcome {
    StoodDown,
    Reconciled(DriftReport),
}

pub struct DriftReconciler {
    services: Services,
}

impl DriftReconciler {
    pub fn new(services: Services) -> Self {
        DriftReconciler { services }
    }

    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, scale_set: &str, role: Role) -> Result<DriftOutcome, DriftError> {
        if self.services.mutex.lock_exists().await? {
            tracing::info!(scale_set=%scale_set, "Upgrade in progress, drift reconciler standing down");
            return Ok(DriftOutcome::StoodDown);
        }

        let ips: HashSet<IpAddr> = self
            .services
            .resolver()
            .instance_table(scale_set)
            .await?
            .into_iter()
            .map(|row| row.private_ip)
            .collect();
        let members = self.services.cluster.list_nodes(Some(role)).await?;

        let mut report = DriftReport {
            scale_set: scale_set.to_string(),
            ..Default::default()
        };
        for member in members.iter().filter(|m| !ips.contains(&m.addr)) {
            if member.status.is_ready() {
                tracing::warn!(node=%member.hostname, ip=%member.addr, "Member has no instance but is ready, leaving it");
                report.orphaned_ready.push(member.hostname.clone());
                continue;
            }
            tracing::info!(node=%member.hostname, ip=%member.addr, role=%role, "Removing stale member");
            evict(self.services.cluster.as_ref(), &member.id, role).await?;
            report.removed.push(member.hostname.clone());
        }

        tracing::info!(scale_set=%scale_set, removed=report.removed.len(), "Drift reconciliation complete");
        Ok(DriftOutcome::Reconciled(report))
    }
}
