//! Scale-set provider API.
//!
//! Long running provider calls hand back an [`Operation`] so callers can decide how to wait for
//! it, and what else to do while waiting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::net::IpAddr;
use url::Url;

use crate::error::ApiError;
use crate::retry::{RetryError, RetryPolicy, poll_until};

#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub instance_id: String,
    pub computer_name: String,
    pub latest_model_applied: bool,
}

/// One IP configuration of a scale-set network interface.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInterface {
    pub instance_id: String,
    pub private_ip: IpAddr,
    pub primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Starting,
    Stopping,
    Stopped,
    Deallocated,
    Unknown,
}

impl From<&str> for PowerState {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "running" => PowerState::Running,
            "starting" => PowerState::Starting,
            "stopping" | "deallocating" => PowerState::Stopping,
            "stopped" => PowerState::Stopped,
            "deallocated" => PowerState::Deallocated,
            _ => PowerState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Creating,
    Updating,
    Succeeded,
    Failed,
    Deleting,
    Unknown,
}

impl From<&str> for ProvisioningState {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "creating" => ProvisioningState::Creating,
            "updating" => ProvisioningState::Updating,
            "succeeded" => ProvisioningState::Succeeded,
            "failed" => ProvisioningState::Failed,
            "deleting" => ProvisioningState::Deleting,
            _ => ProvisioningState::Unknown,
        }
    }
}

/// Power and provisioning view of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceView {
    pub power_state: PowerState,
    pub provisioning_state: ProvisioningState,
    /// Time of the last provisioning-state transition.
    pub provisioned_at: Option<DateTime<Utc>>,
}

/// A deployment template parameter as echoed back by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Secure parameters come back without a value.
    pub value: Option<serde_json::Value>,
    pub secure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub name: String,
    pub template_link: Option<Url>,
    pub parameters: BTreeMap<String, Parameter>,
}

/// Handle to a provider-side asynchronous operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// The provider finished synchronously.
    Done,
    Pending { status_url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed(String),
}

#[async_trait]
pub trait ScaleSetProvider: Send + Sync {
    async fn list_instances(&self, scale_set: &str) -> Result<Vec<Instance>, ApiError>;

    async fn list_network_interfaces(
        &self,
        scale_set: &str,
    ) -> Result<Vec<NetworkInterface>, ApiError>;

    async fn instance_view(
        &self,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<InstanceView, ApiError>;

    /// Apply the scale set's current model (and so its OS image reference) to one instance.
    async fn update_instance_model(
        &self,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<Operation, ApiError>;

    async fn reimage(&self, scale_set: &str, instance_id: &str) -> Result<Operation, ApiError>;

    async fn delete_instance(
        &self,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<Operation, ApiError>;

    async fn capacity(&self, scale_set: &str) -> Result<u32, ApiError>;

    async fn set_capacity(&self, scale_set: &str, capacity: u32) -> Result<Operation, ApiError>;

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ApiError>;

    /// Point the deployment at a new template, supplying every parameter value.
    async fn update_deployment(
        &self,
        name: &str,
        template: &Url,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Operation, ApiError>;

    async fn operation_status(&self, operation: &Operation) -> Result<OperationStatus, ApiError>;
}

#[derive(thiserror::Error, Debug)]
pub enum OperationError {
    #[error("Provider operation '{what}' failed: {reason}")]
    Failed { what: String, reason: String },

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl From<RetryError<ApiError>> for OperationError {
    fn from(err: RetryError<ApiError>) -> Self {
        match err {
            RetryError::Exhausted { what, attempts, .. } => OperationError::Timeout(format!(
                "{} did not complete after {} attempts",
                what, attempts
            )),
            RetryError::Failed(e) => OperationError::Api(e),
        }
    }
}

/// Wait until a provider operation reaches a final state.
pub async fn wait_for_operation(
    provider: &dyn ScaleSetProvider,
    operation: &Operation,
    policy: RetryPolicy,
    what: &str,
) -> Result<(), OperationError> {
    if *operation == Operation::Done {
        return Ok(());
    }
    let status = poll_until(policy, what, move || async move {
        provider
            .operation_status(operation)
            .await
            .map(|status| match status {
                OperationStatus::InProgress => None,
                done => Some(done),
            })
    })
    .await?;

    match status {
        OperationStatus::Failed(reason) => Err(OperationError::Failed {
            what: what.to_string(),
            reason,
        }),
        _ => Ok(()),
    }
}
