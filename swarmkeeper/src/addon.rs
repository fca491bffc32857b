//! Optional datacenter add-on.
//!
//! A registry-style add-on keeps replicas on manager nodes. Before such a node leaves the swarm
//! its replica has to be removed through the add-on's own tooling, which ships as a container.

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{AddonSettings, Secret};
use crate::node::ReplicaRecord;
use crate::retry::Retryable;

#[derive(thiserror::Error, Debug)]
pub enum AddonError {
    #[error("Failed to launch add-on command: {0}")]
    Launch(#[from] std::io::Error),

    #[error("Add-on command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Add-on command did not report a replica id")]
    MissingReplicaId,

    #[error("Add-on is not configured: {0}")]
    NotConfigured(&'static str),
}

impl Retryable for AddonError {
    fn is_transient(&self) -> bool {
        // The add-on tooling fails while the management endpoint is reconverging.
        matches!(self, AddonError::CommandFailed { .. })
    }
}

#[async_trait]
pub trait DatacenterAddon: Send + Sync {
    async fn remove_replica(&self, replica: &ReplicaRecord) -> Result<(), AddonError>;

    /// Start a replica on `node_name`, returning its id.
    async fn join_replica(&self, node_name: &str) -> Result<String, AddonError>;
}

/// Runs the add-on's management container through the local docker CLI.
pub struct ContainerAddon {
    docker_bin: String,
    image: String,
    endpoint: String,
    username: Option<String>,
    password: Option<Secret>,
}

impl ContainerAddon {
    pub fn from_settings(settings: &AddonSettings) -> Result<Self, AddonError> {
        let image = settings
            .image
            .clone()
            .ok_or(AddonError::NotConfigured("addon-image"))?;
        let endpoint = settings
            .endpoint
            .clone()
            .ok_or(AddonError::NotConfigured("addon-endpoint"))?;
        Ok(ContainerAddon {
            docker_bin: settings.docker_bin.clone(),
            image,
            endpoint,
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn base_args(&self, action: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            self.image.clone(),
            action.to_string(),
            "--ucp-url".to_string(),
            self.endpoint.clone(),
            "--ucp-insecure-tls".to_string(),
        ];
        if let Some(username) = &self.username {
            args.push("--ucp-username".to_string());
            args.push(username.clone());
        }
        if let Some(password) = &self.password {
            args.push("--ucp-password".to_string());
            args.push(password.expose().to_string());
        }
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<String, AddonError> {
        tracing::debug!(image=%self.image, action=%args.get(3).map(String::as_str).unwrap_or(""), "Running add-on command");
        let output = Command::new(&self.docker_bin).args(&args).output().await?;
        if !output.status.success() {
            return Err(AddonError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl DatacenterAddon for ContainerAddon {
    async fn remove_replica(&self, replica: &ReplicaRecord) -> Result<(), AddonError> {
        let mut args = self.base_args("remove");
        args.push("--existing-replica-id".to_string());
        args.push(replica.replica_id.clone());
        args.push("--replica-ids".to_string());
        args.push(replica.replica_id.clone());
        self.run(args).await?;
        tracing::info!(replica_id=%replica.replica_id, node=%replica.node_name, "Add-on replica removed");
        Ok(())
    }

    async fn join_replica(&self, node_name: &str) -> Result<String, AddonError> {
        let mut args = self.base_args("join");
        args.push("--ucp-node".to_string());
        args.push(node_name.to_string());
        let stdout = self.run(args).await?;
        let replica_id = parse_replica_id(&stdout).ok_or(AddonError::MissingReplicaId)?;
        tracing::info!(replica_id=%replica_id, node=%node_name, "Add-on replica joined");
        Ok(replica_id)
    }
}

/// The join command prints the new replica id as the last non-empty line of its output.
fn parse_replica_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.rsplit(' ').next()?;
    (id.len() == 12 && id.chars().all(|c| c.is_ascii_hexdigit())).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replica_id() {
        let out = "INFO joining\nINFO Replica ID: 0a1b2c3d4e5f\n\n";
        assert_eq!(parse_replica_id(out).as_deref(), Some("0a1b2c3d4e5f"));
        assert_eq!(parse_replica_id("done\n"), None);
        assert_eq!(parse_replica_id(""), None);
    }

    #[test]
    fn test_from_settings_requires_image() {
        let settings = AddonSettings::default();
        assert!(matches!(
            ContainerAddon::from_settings(&settings),
            Err(AddonError::NotConfigured("addon-image"))
        ));
    }

    #[test]
    fn test_base_args_include_credentials() {
        let settings = AddonSettings {
            image: Some("docker/dtr:2.6.0".into()),
            endpoint: Some("https://ucp.internal".into()),
            username: Some("admin".into()),
            password: Some(Secret::new("pw")),
            docker_bin: "docker".into(),
        };
        let addon = ContainerAddon::from_settings(&settings).unwrap();
        let args = addon.base_args("remove");
        assert_eq!(&args[..4], ["run", "--rm", "docker/dtr:2.6.0", "remove"]);
        assert!(args.windows(2).any(|w| w == ["--ucp-username", "admin"]));
        assert!(args.windows(2).any(|w| w == ["--ucp-password", "pw"]));
    }
}
