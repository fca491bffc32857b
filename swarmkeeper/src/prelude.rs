//! Commonly used swarmkeeper types and traits.
//!
//! Import this module to get the collaborator traits and the control loops in one go.

pub use super::addon::DatacenterAddon; // Optional registry add-on
pub use super::config::Config; // Immutable process configuration
pub use super::drift::DriftReconciler; // Stale member cleanup
pub use super::error::ApiError; // Error taxonomy shared by every collaborator
pub use super::health::HealthMonitor; // Dead node replacement
pub use super::membership::{ClusterMembership, ClusterNode}; // Swarm control plane
pub use super::mutex::UpgradeMutex; // Distributed upgrade lock
pub use super::node::{ClusterStatus, Node, NodeState, Role, ScaleSet};
pub use super::probe::LivenessProbe; // Diagnostic port check
pub use super::rejoin::RejoinAgent; // Self-node handoff and boot-time join
pub use super::resolver::NodeResolver; // Instance <-> cluster node mapping
pub use super::retry::RetryPolicy;
pub use super::scaleset::ScaleSetProvider; // Cloud scale-set API
pub use super::services::Services; // Bundle of collaborator handles
pub use super::state::StateStore; // Leader and replica bookkeeping
pub use super::storage::{KeyValueTable, QueueService};
pub use super::upgrade::Coordinator; // Rolling upgrade state machine
