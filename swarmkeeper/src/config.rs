//! Process configuration.
//!
//! A [`Config`] is built once at start-up from command line flags and environment variables and
//! then handed, read-only, to every component. Nothing reads the environment after that.

use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::retry::RetryPolicy;

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Secret(s.to_string()))
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, clap::Args)]
pub struct Config {
    #[command(flatten)]
    pub azure: AzureSettings,

    #[command(flatten)]
    pub cluster: ClusterSettings,

    #[command(flatten)]
    pub addon: AddonSettings,

    #[command(flatten)]
    pub timings: Timings,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("subscription-id", &self.azure.subscription_id),
            ("resource-group", &self.azure.resource_group),
            ("tenant-id", &self.azure.tenant_id),
            ("app-id", &self.azure.app_id),
            ("storage-account", &self.azure.storage_account),
            ("manager-scale-set", &self.cluster.manager_scale_set),
            ("worker-scale-set", &self.cluster.worker_scale_set),
            ("deployment-name", &self.cluster.deployment_name),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }

        // Queues are stored as tables, so the name has to be a valid table name.
        let queue = &self.cluster.upgrade_queue;
        if queue.is_empty()
            || !queue.chars().all(|c| c.is_ascii_alphanumeric())
            || !queue.starts_with(|c: char| c.is_ascii_alphabetic())
        {
            return Err(ConfigError::Invalid {
                name: "upgrade-queue",
                reason: format!("'{}' must be alphanumeric and start with a letter", queue),
            });
        }

        if self.timings.probe_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "probe-attempts",
                reason: "at least one liveness probe is required".to_string(),
            });
        }

        if self.addon.image.is_some() && self.addon.endpoint.is_none() {
            return Err(ConfigError::Missing("addon-endpoint"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct AzureSettings {
    #[arg(long, env = "SUB_ID")]
    pub subscription_id: String,

    #[arg(long, env = "GROUP_NAME")]
    pub resource_group: String,

    #[arg(long, env = "TENANT_ID")]
    pub tenant_id: String,

    #[arg(long, env = "APP_ID")]
    pub app_id: String,

    #[arg(long, env = "APP_SECRET", hide_env_values = true)]
    pub app_secret: Secret,

    #[arg(long, env = "SA_NAME")]
    pub storage_account: String,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ClusterSettings {
    #[arg(long, env = "MANAGER_VMSS", default_value = "swarm-manager-vmss")]
    pub manager_scale_set: String,

    #[arg(long, env = "WORKER_VMSS", default_value = "swarm-worker-vmss")]
    pub worker_scale_set: String,

    #[arg(long, env = "DEPLOYMENT_NAME", default_value = "docker.template")]
    pub deployment_name: String,

    #[arg(long, env = "LEADER_TABLE", default_value = "swarminfo")]
    pub leader_table: String,

    #[arg(long, env = "REPLICA_TABLE", default_value = "dtrtable")]
    pub replica_table: String,

    #[arg(long, env = "UPGRADE_QUEUE", default_value = "upgradequeue")]
    pub upgrade_queue: String,

    /// Docker Engine API of the local node.
    #[arg(long, env = "DOCKER_HOST_URL", default_value = "http://127.0.0.1:2375")]
    pub docker_host: Url,

    #[arg(long, env = "SWARM_PORT", default_value_t = 2377)]
    pub swarm_port: u16,

    /// Port of the node diagnostic endpoint used for liveness probes.
    #[arg(long, env = "DIAGNOSTIC_PORT", default_value_t = 44554)]
    pub diagnostic_port: u16,

    /// Secure template parameter that is re-supplied from `app_secret` on upgrade.
    #[arg(
        long,
        env = "SECRET_PARAMETER",
        default_value = "adServicePrincipalAppSecret"
    )]
    pub secret_parameter: String,

    /// Allow upgrading a swarm with a single manager by resetting it.
    #[arg(long, env = "RESET_SINGLE_MANAGER")]
    pub reset_single_manager: bool,

    /// Accept plain http template URLs.
    #[arg(long, env = "ALLOW_INSECURE_TEMPLATE")]
    pub allow_insecure_template: bool,
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct AddonSettings {
    /// Container image of the datacenter add-on. Leave unset when no add-on is installed.
    #[arg(long = "addon-image", env = "DTR_IMAGE")]
    pub image: Option<String>,

    #[arg(long = "addon-endpoint", env = "UCP_URL")]
    pub endpoint: Option<String>,

    #[arg(long = "addon-username", env = "UCP_USERNAME")]
    pub username: Option<String>,

    #[arg(long = "addon-password", env = "UCP_PASSWORD", hide_env_values = true)]
    pub password: Option<Secret>,

    #[arg(long = "docker-bin", env = "DOCKER_BIN", default_value = "docker")]
    pub docker_bin: String,
}

impl AddonSettings {
    pub fn enabled(&self) -> bool {
        self.image.is_some()
    }
}

const GRACE_PERIOD_SECS: u64 = 600;
const PROBE_INTERVAL_SECS: u64 = 30;
const PROBE_ATTEMPTS: u32 = 4;
const PROBE_TIMEOUT_SECS: u64 = 10;
const PROVIDER_POLL_SECS: u64 = 10;
const PROVIDER_POLL_ATTEMPTS: u32 = 360;
const REJOIN_POLL_SECS: u64 = 10;
const REJOIN_POLL_ATTEMPTS: u32 = 180;
const ADDON_RETRY_SECS: u64 = 30;
const ADDON_RETRY_ATTEMPTS: u32 = 5;
const LEADER_POLL_SECS: u64 = 5;
const LEADER_POLL_ATTEMPTS: u32 = 24;
const API_RETRY_SECS: u64 = 5;
const API_RETRY_ATTEMPTS: u32 = 5;

/// Sleep intervals and attempt budgets for every bounded wait.
#[derive(Debug, Clone, clap::Args)]
pub struct Timings {
    /// Instances provisioned more recently than this are never health checked.
    #[arg(long, env = "GRACE_PERIOD_SECS", default_value_t = GRACE_PERIOD_SECS)]
    pub grace_period_secs: u64,

    #[arg(long, default_value_t = PROBE_INTERVAL_SECS)]
    pub probe_interval_secs: u64,

    #[arg(long, default_value_t = PROBE_ATTEMPTS)]
    pub probe_attempts: u32,

    #[arg(long, default_value_t = PROBE_TIMEOUT_SECS)]
    pub probe_timeout_secs: u64,

    #[arg(long, default_value_t = PROVIDER_POLL_SECS)]
    pub provider_poll_secs: u64,

    #[arg(long, default_value_t = PROVIDER_POLL_ATTEMPTS)]
    pub provider_poll_attempts: u32,

    #[arg(long, default_value_t = REJOIN_POLL_SECS)]
    pub rejoin_poll_secs: u64,

    #[arg(long, default_value_t = REJOIN_POLL_ATTEMPTS)]
    pub rejoin_poll_attempts: u32,

    #[arg(long, default_value_t = ADDON_RETRY_SECS)]
    pub addon_retry_secs: u64,

    #[arg(long, default_value_t = ADDON_RETRY_ATTEMPTS)]
    pub addon_retry_attempts: u32,

    #[arg(long, default_value_t = LEADER_POLL_SECS)]
    pub leader_poll_secs: u64,

    #[arg(long, default_value_t = LEADER_POLL_ATTEMPTS)]
    pub leader_poll_attempts: u32,

    #[arg(long, default_value_t = API_RETRY_SECS)]
    pub api_retry_secs: u64,

    #[arg(long, default_value_t = API_RETRY_ATTEMPTS)]
    pub api_retry_attempts: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            grace_period_secs: GRACE_PERIOD_SECS,
            probe_interval_secs: PROBE_INTERVAL_SECS,
            probe_attempts: PROBE_ATTEMPTS,
            probe_timeout_secs: PROBE_TIMEOUT_SECS,
            provider_poll_secs: PROVIDER_POLL_SECS,
            provider_poll_attempts: PROVIDER_POLL_ATTEMPTS,
            rejoin_poll_secs: REJOIN_POLL_SECS,
            rejoin_poll_attempts: REJOIN_POLL_ATTEMPTS,
            addon_retry_secs: ADDON_RETRY_SECS,
            addon_retry_attempts: ADDON_RETRY_ATTEMPTS,
            leader_poll_secs: LEADER_POLL_SECS,
            leader_poll_attempts: LEADER_POLL_ATTEMPTS,
            api_retry_secs: API_RETRY_SECS,
            api_retry_attempts: API_RETRY_ATTEMPTS,
        }
    }
}

impl Timings {
    /// Every interval zero, every budget small. For tests and dry runs against fakes.
    pub fn immediate() -> Self {
        Timings {
            grace_period_secs: GRACE_PERIOD_SECS,
            probe_interval_secs: 0,
            probe_attempts: 3,
            probe_timeout_secs: 1,
            provider_poll_secs: 0,
            provider_poll_attempts: 10,
            rejoin_poll_secs: 0,
            rejoin_poll_attempts: 10,
            addon_retry_secs: 0,
            addon_retry_attempts: 3,
            leader_poll_secs: 0,
            leader_poll_attempts: 5,
            api_retry_secs: 0,
            api_retry_attempts: 3,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe(&self) -> RetryPolicy {
        RetryPolicy::from_secs(self.probe_interval_secs, self.probe_attempts)
    }

    pub fn provider_poll(&self) -> RetryPolicy {
        RetryPolicy::from_secs(self.provider_poll_secs, self.provider_poll_attempts)
    }

    pub fn rejoin_poll(&self) -> RetryPolicy {
        RetryPolicy::from_secs(self.rejoin_poll_secs, self.rejoin_poll_attempts)
    }

    pub fn addon_retry(&self) -> RetryPolicy {
        RetryPolicy::from_secs(self.addon_retry_secs, self.addon_retry_attempts)
    }

    pub fn leader_poll(&self) -> RetryPolicy {
        RetryPolicy::from_secs(self.leader_poll_secs, self.leader_poll_attempts)
    }

    pub fn api_retry(&self) -> RetryPolicy {
        RetryPolicy::from_secs(self.api_retry_secs, self.api_retry_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn test_defaults_from_flags() {
        let cli = Cli::try_parse_from([
            "swarmkeeper",
            "--subscription-id",
            "sub",
            "--resource-group",
            "rg",
            "--tenant-id",
            "tenant",
            "--app-id",
            "app",
            "--app-secret",
            "hunter2",
            "--storage-account",
            "sa",
        ])
        .unwrap();

        let config = cli.config;
        assert_eq!(config.cluster.manager_scale_set, "swarm-manager-vmss");
        assert_eq!(config.cluster.diagnostic_port, 44554);
        assert_eq!(config.timings.grace_period(), Duration::from_secs(600));
        assert_eq!(config.timings.probe().budget(), Duration::from_secs(90));
        assert!(!config.addon.enabled());
        assert!(config.validate().is_ok());
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_validate_rejects_bad_queue_name() {
        let mut config = test_config();
        config.cluster.upgrade_queue = "upgrade-queue".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "upgrade-queue", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_probe_budget() {
        let mut config = test_config();
        config.timings.probe_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_addon_requires_endpoint() {
        let mut config = test_config();
        config.addon.image = Some("docker/dtr:2.6".into());
        assert_eq!(config.validate(), Err(ConfigError::Missing("addon-endpoint")));
    }
}
