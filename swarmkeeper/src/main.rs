use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use swarmkeeper::addon::{ContainerAddon, DatacenterAddon};
use swarmkeeper::azure::{ComputeClient, TableClient, TokenSource};
use swarmkeeper::config::Config;
use swarmkeeper::docker::DockerMembership;
use swarmkeeper::health::heal;
use swarmkeeper::mutex::UpgradeMutex;
use swarmkeeper::node::Role;
use swarmkeeper::probe::HttpProbe;
use swarmkeeper::rejoin::{HandoffOutcome, JoinOutcome, RejoinAgent};
use swarmkeeper::services::Services;
use swarmkeeper::state::StateStore;
use swarmkeeper::upgrade::{Coordinator, HttpTemplateSource};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Rolling OS upgrades and self-healing for swarms on cloud scale sets.
#[derive(Parser, Debug)]
#[command(author, version, about = "Swarm upgrade and self-healing coordinator")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Point the deployment at a new template and roll every node onto it
    Upgrade {
        /// URL of the new deployment template
        template_url: String,
    },
    /// Replace dead nodes and drop stale members; stands down while an upgrade runs
    Heal,
    /// Without a role, finish this node's own upgrade if it was handed off.
    /// With a role, join the swarm through the recorded leader.
    Rejoin {
        #[arg(long)]
        role: Option<Role>,
    },
}

fn build_services(config: &Config) -> Result<Services, BoxError> {
    let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let azure = &config.azure;
    let auth = Arc::new(TokenSource::new(
        http.clone(),
        &azure.tenant_id,
        azure.app_id.clone(),
        azure.app_secret.clone(),
    )?);
    let compute = ComputeClient::new(
        http.clone(),
        auth.clone(),
        azure.subscription_id.clone(),
        azure.resource_group.clone(),
    )?;
    let tables = Arc::new(TableClient::new(http, auth, &azure.storage_account)?);

    let cluster = &config.cluster;
    let docker = DockerMembership::new(cluster.docker_host.clone(), cluster.swarm_port, HTTP_TIMEOUT)?;
    let addon: Option<Arc<dyn DatacenterAddon>> = if config.addon.enabled() {
        Some(Arc::new(ContainerAddon::from_settings(&config.addon)?))
    } else {
        None
    };

    Ok(Services {
        cluster: Arc::new(docker),
        provider: Arc::new(compute),
        state: StateStore::new(
            tables.clone(),
            cluster.leader_table.clone(),
            cluster.replica_table.clone(),
        ),
        mutex: UpgradeMutex::new(tables, cluster.upgrade_queue.clone()),
        probe: Arc::new(HttpProbe::new(
            cluster.diagnostic_port,
            config.timings.probe_timeout(),
        )?),
        templates: Arc::new(HttpTemplateSource::new(HTTP_TIMEOUT)?),
        addon,
    })
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    cli.config.validate()?;
    let services = build_services(&cli.config)?;
    let config = Arc::new(cli.config);

    match cli.command {
        Command::Upgrade { template_url } => {
            let report = Coordinator::new(services, config).run(&template_url).await?;
            for node in &report.nodes {
                tracing::info!(node=%node.hostname, role=%node.role, state=%node.state, "Upgraded");
            }
            tracing::info!(
                template=%report.template,
                upgraded=report.nodes.len(),
                skipped=?report.skipped,
                handed_off=?report.handed_off,
                lock_released=report.lock_released,
                "Upgrade run finished"
            );
        }
        Command::Heal => {
            let passes = heal(&services, config).await?;
            if passes.is_empty() {
                tracing::info!("Heal pass skipped");
            }
            for pass in passes {
                tracing::info!(role=%pass.role, health=?pass.health, drift=?pass.drift, "Heal pass finished");
            }
        }
        Command::Rejoin { role: None } => {
            match RejoinAgent::new(services, config).complete_handoff().await? {
                HandoffOutcome::Idle => tracing::info!("No handoff pending"),
                HandoffOutcome::NotForUs { target, pending } => {
                    tracing::info!(target_node=%target, pending, "Handoff is for another node")
                }
                HandoffOutcome::Completed { node_id } => {
                    tracing::info!(node_id=%node_id, "Handoff completed, reimaging")
                }
            }
        }
        Command::Rejoin { role: Some(role) } => {
            match RejoinAgent::new(services, config).join_cluster(role).await? {
                JoinOutcome::AlreadyMember { node_id } => {
                    tracing::info!(node_id=%node_id, "Already a swarm member")
                }
                JoinOutcome::Joined {
                    node_id,
                    leader_ip,
                    replica_id,
                } => {
                    tracing::info!(node_id=%node_id, leader_ip=%leader_ip, replica_id=?replica_id, "Joined swarm")
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("swarmkeeper=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error=%err, "swarmkeeper failed");
            ExitCode::FAILURE
        }
    }
}
