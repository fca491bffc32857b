//! # swarmkeeper
//!
//! Rolling OS upgrades and self-healing for a manager/worker swarm whose nodes live in
//! cloud scale sets.
//!
//! The crate is split into three layers:
//!
//! - **Collaborator interfaces**: [`membership::ClusterMembership`],
//!   [`scaleset::ScaleSetProvider`], [`storage::KeyValueTable`] and [`storage::QueueService`].
//!   Concrete implementations live in [`docker`] and [`azure`].
//! - **Shared clients**: the [`resolver::NodeResolver`], the leader/replica
//!   [`state::StateStore`] and the [`mutex::UpgradeMutex`].
//! - **Control loops**: the [`upgrade::Coordinator`], the [`health::HealthMonitor`], the
//!   [`drift::DriftReconciler`] and the [`rejoin::RejoinAgent`].
//!
//! Every control loop is a run-to-completion pass. The only cross-process synchronization is
//! the upgrade mutex: while it exists the health monitor and drift reconciler stand down.

pub mod addon;
pub mod azure;
pub mod config;
pub mod docker;
pub mod drift;
pub mod error;
pub mod health;
pub mod membership;
pub mod mutex;
pub mod node;
pub mod prelude;
pub mod probe;
pub mod rejoin;
pub mod resolver;
pub mod retry;
pub mod scaleset;
pub mod services;
pub mod state;
pub mod storage;
pub mod upgrade;

#[cfg(test)]
mod test_utils;
