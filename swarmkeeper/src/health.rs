//! Health monitor.
//!
//! Finds scale-set instances that are dead, takes them out of the cluster, deletes them and
//! scales the set back up so the provider provisions replacements.
//!
//! A node is only declared dead when two independent signals agree:
//!
//! 1. the cluster does not report it `ready`, and
//! 2. its diagnostic endpoint does not answer within the whole probe budget.
//!
//! Freshly provisioned instances are never checked at all (see [`Timings::grace_period`]).
//!
//! [`Timings::grace_period`]: crate::config::Timings::grace_period

use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::drift::{DriftError, DriftOutcome, DriftReconciler};
use crate::error::ApiError;
use crate::membership::{ClusterNode, evict};
use crate::mutex::MutexError;
use crate::node::{ClusterStatus, Role};
use crate::probe::probe_with_budget;
use crate::resolver::InstanceAddress;
use crate::scaleset::{OperationError, PowerState, wait_for_operation};
use crate::services::Services;

#[cfg(test)]
#[path = "health.test.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum HealthError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Upgrade lock error: {0}")]
    Mutex(#[from] MutexError),

    #[error("Provider operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("Drift reconciliation failed: {0}")]
    Drift(#[from] DriftError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub scale_set: String,
    /// Hostnames that were probed.
    pub checked: Vec<String>,
    /// Hostnames left alone because they are not running or still inside the grace window.
    pub skipped: Vec<String>,
    /// Hostnames that were removed and deleted.
    pub dead: Vec<String>,
    /// Target capacity after scaling up, when anything died.
    pub new_capacity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthOutcome {
    /// The upgrade lock is held; nothing was inspected.
    StoodDown,
    Checked(HealthReport),
}

pub struct HealthMonitor {
    services: Services,
    config: Arc<Config>,
}

impl HealthMonitor {
    pub fn new(services: Services, config: Arc<Config>) -> Self {
        HealthMonitor { services, config }
    }

    #[tracing::instrument(skip(self))]
    pub async fn check(&self, scale_set: &str, role: Role) -> Result<HealthOutcome, HealthError> {
        if self.services.mutex.lock_exists().await? {
            tracing::info!(scale_set=%scale_set, "Upgrade in progress, health check standing down");
            return Ok(HealthOutcome::StoodDown);
        }

        let table = self.services.resolver().instance_table(scale_set).await?;
        let members = self.services.cluster.list_nodes(Some(role)).await?;
        let status_by_ip = cluster_status_by_ip(&members);

        let mut report = HealthReport {
            scale_set: scale_set.to_string(),
            ..Default::default()
        };
        let mut dead = Vec::new();

        for row in &table {
            if !self.eligible(scale_set, row).await? {
                report.skipped.push(row.computer_name.clone());
                continue;
            }
            report.checked.push(row.computer_name.clone());

            let status = status_by_ip
                .get(&row.private_ip)
                .copied()
                .unwrap_or(ClusterStatus::Unknown);
            if status.is_ready() {
                continue;
            }
            let alive = probe_with_budget(
                self.services.probe.as_ref(),
                row.private_ip,
                self.config.timings.probe(),
            )
            .await;
            if alive {
                tracing::debug!(node=%row.computer_name, status=%status, "Node answers its probe, not dead");
                continue;
            }

            tracing::warn!(node=%row.computer_name, ip=%row.private_ip, status=%status, "Node is dead");
            dead.push(row);
        }

        for row in &dead {
            self.replace(scale_set, role, row, &members).await?;
            report.dead.push(row.computer_name.clone());
        }

        if !dead.is_empty() {
            let capacity = self.services.provider.capacity(scale_set).await?;
            let target = capacity + dead.len() as u32;
            tracing::info!(scale_set=%scale_set, from=capacity, to=target, "Scaling up to replace dead nodes");
            let op = self.services.provider.set_capacity(scale_set, target).await?;
            wait_for_operation(
                self.services.provider.as_ref(),
                &op,
                self.config.timings.provider_poll(),
                &format!("scale {} to {}", scale_set, target),
            )
            .await?;
            report.new_capacity = Some(target);
        }

        tracing::info!(
            scale_set=%scale_set,
            checked=report.checked.len(),
            skipped=report.skipped.len(),
            dead=report.dead.len(),
            "Health check complete"
        );
        Ok(HealthOutcome::Checked(report))
    }

    /// Running and provisioned longer ago than the grace period.
    async fn eligible(&self, scale_set: &str, row: &InstanceAddress) -> Result<bool, ApiError> {
        let view = match self
            .services
            .provider
            .instance_view(scale_set, &row.instance_id)
            .await
        {
            Ok(view) => view,
            Err(ApiError::NotFound(_)) => {
                tracing::debug!(node=%row.computer_name, "Skipping, instance gone since listing");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        if view.power_state != PowerState::Running {
            tracing::debug!(node=%row.computer_name, power=?view.power_state, "Skipping, not running");
            return Ok(false);
        }
        let Some(provisioned_at) = view.provisioned_at else {
            tracing::debug!(node=%row.computer_name, "Skipping, provisioning time unknown");
            return Ok(false);
        };
        let age = (Utc::now() - provisioned_at).to_std().unwrap_or_default();
        if age <= self.config.timings.grace_period() {
            tracing::debug!(node=%row.computer_name, age_secs=age.as_secs(), "Skipping, inside grace period");
            return Ok(false);
        }
        Ok(true)
    }

    async fn replace(
        &self,
        scale_set: &str,
        role: Role,
        row: &InstanceAddress,
        members: &[ClusterNode],
    ) -> Result<(), HealthError> {
        for member in members.iter().filter(|m| m.addr == row.private_ip) {
            evict(self.services.cluster.as_ref(), &member.id, role).await?;
        }
        tracing::info!(node=%row.computer_name, instance=%row.instance_id, "Deleting dead instance");
        let op = self
            .services
            .provider
            .delete_instance(scale_set, &row.instance_id)
            .await?;
        wait_for_operation(
            self.services.provider.as_ref(),
            &op,
            self.config.timings.provider_poll(),
            &format!("delete {}", row.computer_name),
        )
        .await?;
        Ok(())
    }
}

/// Cluster status per member IP. A ready member wins over a stale entry for the same IP.
fn cluster_status_by_ip(members: &[ClusterNode]) -> HashMap<IpAddr, ClusterStatus> {
    let mut statuses: HashMap<IpAddr, ClusterStatus> = HashMap::new();
    for member in members {
        let entry = statuses.entry(member.addr).or_insert(member.status);
        if member.status.is_ready() {
            *entry = member.status;
        }
    }
    statuses
}

/// Outcome of one `heal` pass over a single scale set.
#[derive(Debug, Clone, PartialEq)]
pub struct HealPass {
    pub role: Role,
    pub health: HealthOutcome,
    pub drift: DriftOutcome,
}

/// The periodic entrypoint: health check then drift reconciliation, managers first.
///
/// Returns an empty list when an upgrade holds the lock. A failed role is logged
/// and the remaining roles still run; the first error is returned afterwards.
pub async fn heal(services: &Services, config: Arc<Config>) -> Result<Vec<HealPass>, HealthError> {
    if services.mutex.lock_exists().await? {
        tracing::info!(queue=%services.mutex.name(), "Upgrade in progress, skipping heal pass");
        return Ok(Vec::new());
    }

    let monitor = HealthMonitor::new(services.clone(), config.clone());
    let reconciler = DriftReconciler::new(services.clone());
    let sets = [
        (config.cluster.manager_scale_set.as_str(), Role::Manager),
        (config.cluster.worker_scale_set.as_str(), Role::Worker),
    ];

    let mut passes = Vec::with_capacity(sets.len());
    let mut first_error = None;
    for (scale_set, role) in sets {
        match heal_role(&monitor, &reconciler, scale_set, role).await {
            Ok(pass) => passes.push(pass),
            Err(err) => {
                tracing::error!(scale_set=%scale_set, role=%role, error=%err, "Heal pass failed");
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(passes),
    }
}

async fn heal_role(
    monitor: &HealthMonitor,
    reconciler: &DriftReconciler,
    scale_set: &str,
    role: Role,
) -> Result<HealPass, HealthError> {
    let health = monitor.check(scale_set, role).await?;
    let drift = reconciler.reconcile(scale_set, role).await?;
    Ok(HealPass {
        role,
        health,
        drift,
    })
}
