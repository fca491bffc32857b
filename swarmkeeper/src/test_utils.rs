//! In-memory collaborators for tests.
//!
//! A [`Harness`] owns one fake [`World`] (cluster membership plus scale sets) and in-memory
//! table, queue, probe, template and add-on fakes. Every mutation is appended to the world
//! journal so tests can assert on ordering.
//!
//! # Quick Start
//!
//! ```ignore
//! let h = Harness::new();
//! let m1 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
//! h.set_leader(&m1);
//! h.set_local(&m1);
//! let coordinator = Coordinator::new(h.services(), h.config());
//! ```

use async_trait::async_trait;
use chrono::{Duration as TimeDelta, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use url::Url;

use crate::addon::{AddonError, DatacenterAddon};
use crate::config::{AddonSettings, AzureSettings, ClusterSettings, Config, Secret, Timings};
use crate::error::ApiError;
use crate::membership::{ClusterMembership, ClusterNode, JoinTokens};
use crate::mutex::UpgradeMutex;
use crate::node::{ClusterStatus, ReplicaRecord, Role};
use crate::probe::LivenessProbe;
use crate::scaleset::{
    Deployment, Instance, InstanceView, NetworkInterface, Operation, OperationStatus, Parameter,
    PowerState, ProvisioningState, ScaleSetProvider,
};
use crate::services::Services;
use crate::state::StateStore;
use crate::storage::{Entity, KeyValueTable, QueueMessage, QueueService};
use crate::upgrade::TemplateSource;

pub const MANAGER_SET: &str = "mgr-vmss";
pub const WORKER_SET: &str = "wrk-vmss";
pub const DEPLOYMENT: &str = "docker.template";
pub const TEMPLATE_URL: &str = "https://templates.example.com/swarm/v2/azure.json";
pub const APP_SECRET: &str = "app-secret-value";

pub fn test_config() -> Config {
    Config {
        azure: AzureSettings {
            subscription_id: "sub".into(),
            resource_group: "rg".into(),
            tenant_id: "tenant".into(),
            app_id: "app".into(),
            app_secret: Secret::new(APP_SECRET),
            storage_account: "sa".into(),
        },
        cluster: ClusterSettings {
            manager_scale_set: MANAGER_SET.into(),
            worker_scale_set: WORKER_SET.into(),
            deployment_name: DEPLOYMENT.into(),
            leader_table: "swarminfo".into(),
            replica_table: "dtrtable".into(),
            upgrade_queue: "upgradequeue".into(),
            docker_host: Url::parse("http://127.0.0.1:2375").unwrap(),
            swarm_port: 2377,
            diagnostic_port: 44554,
            secret_parameter: "adServicePrincipalAppSecret".into(),
            reset_single_manager: false,
            allow_insecure_template: false,
        },
        addon: AddonSettings::default(),
        timings: Timings::immediate(),
    }
}

/// Cluster-side health of a fake node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Health {
    Ready,
    Down,
}

pub struct FakeInstance {
    pub instance_id: String,
    pub computer_name: String,
    pub ip: IpAddr,
    pub view: InstanceView,
}

pub struct FakeScaleSet {
    pub role: Role,
    pub instances: Vec<FakeInstance>,
    pub capacity: u32,
    pub next_instance: u32,
}

enum OpEffect {
    Nothing,
    Reimaged { scale_set: String, instance_id: String },
}

struct PendingOp {
    remaining_polls: u32,
    effect: OpEffect,
    fail: Option<String>,
}

pub struct World {
    pub nodes: Vec<ClusterNode>,
    pub local_node_id: Option<String>,
    pub local_hostname: String,
    pub local_ip: Option<IpAddr>,
    pub scale_sets: BTreeMap<String, FakeScaleSet>,
    pub deployment: Deployment,
    pub deployed_parameters: Option<serde_json::Map<String, Value>>,
    pub journal: Vec<String>,
    /// Journal entries that fail instead of taking effect.
    pub failures: HashMap<String, ApiError>,
    /// Reimaged instances come back as ready cluster members.
    pub rejoin_after_reimage: bool,
    /// A reimage surfaces one transient, overprovisioned member.
    pub ghost_on_reimage: bool,
    /// Demoting the leader elects a new one.
    pub elect_on_demote: bool,
    pub polls_per_operation: u32,
    next_node: u32,
    next_op: u32,
    ops: HashMap<String, PendingOp>,
}

impl World {
    fn new() -> Self {
        let mut scale_sets = BTreeMap::new();
        for (name, role) in [(MANAGER_SET, Role::Manager), (WORKER_SET, Role::Worker)] {
            scale_sets.insert(
                name.to_string(),
                FakeScaleSet {
                    role,
                    instances: Vec::new(),
                    capacity: 0,
                    next_instance: 0,
                },
            );
        }
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "managerCount".to_string(),
            Parameter {
                value: Some(json!(3)),
                secure: false,
            },
        );
        parameters.insert(
            "adServicePrincipalAppSecret".to_string(),
            Parameter {
                value: None,
                secure: true,
            },
        );
        World {
            nodes: Vec::new(),
            local_node_id: None,
            local_hostname: "local-host".to_string(),
            local_ip: None,
            scale_sets,
            deployment: Deployment {
                name: DEPLOYMENT.to_string(),
                template_link: Url::parse("https://templates.example.com/swarm/v1/azure.json").ok(),
                parameters,
            },
            deployed_parameters: None,
            journal: Vec::new(),
            failures: HashMap::new(),
            rejoin_after_reimage: true,
            ghost_on_reimage: false,
            elect_on_demote: true,
            polls_per_operation: 2,
            next_node: 0,
            next_op: 0,
            ops: HashMap::new(),
        }
    }

    fn record(&mut self, entry: String) -> Result<(), ApiError> {
        if let Some(err) = self.failures.get(&entry) {
            let err = err.clone();
            self.journal.push(format!("failed:{}", entry));
            return Err(err);
        }
        self.journal.push(entry);
        Ok(())
    }

    fn new_node_id(&mut self) -> String {
        self.next_node += 1;
        format!("node-{:03}", self.next_node)
    }

    fn hostname_of(&self, node_id: &str) -> String {
        self.nodes
            .iter()
            .find(|n| n.id == node_id)
            .map(|n| n.hostname.clone())
            .unwrap_or_else(|| node_id.to_string())
    }

    fn scale_set(&self, name: &str) -> Result<&FakeScaleSet, ApiError> {
        self.scale_sets
            .get(name)
            .ok_or_else(|| ApiError::NotFound(format!("scale set {}", name)))
    }

    fn scale_set_mut(&mut self, name: &str) -> Result<&mut FakeScaleSet, ApiError> {
        self.scale_sets
            .get_mut(name)
            .ok_or_else(|| ApiError::NotFound(format!("scale set {}", name)))
    }

    fn instance(&self, scale_set: &str, instance_id: &str) -> Result<&FakeInstance, ApiError> {
        self.scale_set(scale_set)?
            .instances
            .iter()
            .find(|i| i.instance_id == instance_id)
            .ok_or_else(|| ApiError::NotFound(format!("instance {}/{}", scale_set, instance_id)))
    }

    fn elect_leader(&mut self) {
        if self.nodes.iter().any(|n| n.is_leader) {
            return;
        }
        if let Some(next) = self
            .nodes
            .iter_mut()
            .find(|n| n.role == Role::Manager && n.status.is_ready())
        {
            next.is_leader = true;
        }
    }

    fn start_op(&mut self, effect: OpEffect) -> Operation {
        self.next_op += 1;
        let status_url = format!("op-{}", self.next_op);
        self.ops.insert(
            status_url.clone(),
            PendingOp {
                remaining_polls: self.polls_per_operation,
                effect,
                fail: None,
            },
        );
        Operation::Pending { status_url }
    }

    fn complete(&mut self, effect: OpEffect) {
        let OpEffect::Reimaged {
            scale_set,
            instance_id,
        } = effect
        else {
            return;
        };
        let Ok(set) = self.scale_set_mut(&scale_set) else {
            return;
        };
        let role = set.role;
        let Some(instance) = set.instances.iter_mut().find(|i| i.instance_id == instance_id) else {
            return;
        };
        instance.view.provisioned_at = Some(Utc::now());
        let (hostname, ip) = (instance.computer_name.clone(), instance.ip);
        if self.rejoin_after_reimage {
            let id = self.new_node_id();
            self.nodes.push(ClusterNode {
                id,
                hostname,
                addr: ip,
                role,
                status: ClusterStatus::Ready,
                is_leader: false,
            });
        }
    }
}

/// Shared fake for both the cluster control plane and the scale-set provider.
#[derive(Clone)]
pub struct FakeCloud {
    pub world: Arc<Mutex<World>>,
}

#[async_trait]
impl ClusterMembership for FakeCloud {
    async fn list_nodes(&self, role: Option<Role>) -> Result<Vec<ClusterNode>, ApiError> {
        let world = self.world.lock();
        Ok(world
            .nodes
            .iter()
            .filter(|n| role.is_none_or(|r| n.role == r))
            .cloned()
            .collect())
    }

    async fn inspect_node(&self, node_id: &str) -> Result<ClusterNode, ApiError> {
        let world = self.world.lock();
        world
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("node {}", node_id)))
    }

    async fn local_node_id(&self) -> Result<Option<String>, ApiError> {
        Ok(self.world.lock().local_node_id.clone())
    }

    async fn demote(&self, node_id: &str) -> Result<(), ApiError> {
        let mut world = self.world.lock();
        let hostname = world.hostname_of(node_id);
        world.record(format!("demote:{}", hostname))?;
        let elect = world.elect_on_demote;
        let node = world
            .nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| ApiError::NotFound(format!("node {}", node_id)))?;
        node.role = Role::Worker;
        node.is_leader = false;
        if elect {
            world.elect_leader();
        }
        Ok(())
    }

    async fn remove(&self, node_id: &str) -> Result<(), ApiError> {
        let mut world = self.world.lock();
        let hostname = world.hostname_of(node_id);
        world.record(format!("remove:{}", hostname))?;
        let before = world.nodes.len();
        world.nodes.retain(|n| n.id != node_id);
        if world.nodes.len() == before {
            return Err(ApiError::NotFound(format!("node {}", node_id)));
        }
        Ok(())
    }

    async fn join_tokens(&self) -> Result<JoinTokens, ApiError> {
        Ok(JoinTokens {
            manager: "SWMTKN-manager".to_string(),
            worker: "SWMTKN-worker".to_string(),
        })
    }

    async fn leave(&self) -> Result<(), ApiError> {
        let mut world = self.world.lock();
        let hostname = world.local_hostname.clone();
        world.record(format!("leave:{}", hostname))?;
        if let Some(id) = world.local_node_id.take() {
            if let Some(node) = world.nodes.iter_mut().find(|n| n.id == id) {
                node.status = ClusterStatus::Down;
            }
        }
        Ok(())
    }

    async fn join(&self, remote: IpAddr, token: &str) -> Result<(), ApiError> {
        let mut world = self.world.lock();
        world.record(format!("join:{}:{}", remote, token))?;
        let role = if token.contains("manager") {
            Role::Manager
        } else {
            Role::Worker
        };
        let id = world.new_node_id();
        let hostname = world.local_hostname.clone();
        let addr = world.local_ip.unwrap_or(remote);
        world.nodes.push(ClusterNode {
            id: id.clone(),
            hostname,
            addr,
            role,
            status: ClusterStatus::Ready,
            is_leader: false,
        });
        world.local_node_id = Some(id);
        Ok(())
    }

    fn at(&self, addr: IpAddr) -> Arc<dyn ClusterMembership> {
        self.world.lock().journal.push(format!("at:{}", addr));
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ScaleSetProvider for FakeCloud {
    async fn list_instances(&self, scale_set: &str) -> Result<Vec<Instance>, ApiError> {
        let world = self.world.lock();
        Ok(world
            .scale_set(scale_set)?
            .instances
            .iter()
            .map(|i| Instance {
                instance_id: i.instance_id.clone(),
                computer_name: i.computer_name.clone(),
                latest_model_applied: true,
            })
            .collect())
    }

    async fn list_network_interfaces(
        &self,
        scale_set: &str,
    ) -> Result<Vec<NetworkInterface>, ApiError> {
        let world = self.world.lock();
        let mut nics = Vec::new();
        for instance in &world.scale_set(scale_set)?.instances {
            // A secondary configuration that must never be picked for correlation.
            nics.push(NetworkInterface {
                instance_id: instance.instance_id.clone(),
                private_ip: "192.168.255.1".parse().unwrap(),
                primary: false,
            });
            nics.push(NetworkInterface {
                instance_id: instance.instance_id.clone(),
                private_ip: instance.ip,
                primary: true,
            });
        }
        Ok(nics)
    }

    async fn instance_view(
        &self,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<InstanceView, ApiError> {
        let world = self.world.lock();
        let instance = world.instance(scale_set, instance_id)?;
        // Reads are not journaled; a "view:{host}" failure still applies.
        if let Some(err) = world.failures.get(&format!("view:{}", instance.computer_name)) {
            return Err(err.clone());
        }
        Ok(instance.view.clone())
    }

    async fn update_instance_model(
        &self,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<Operation, ApiError> {
        let mut world = self.world.lock();
        let name = world.instance(scale_set, instance_id)?.computer_name.clone();
        world.record(format!("update-model:{}", name))?;
        Ok(world.start_op(OpEffect::Nothing))
    }

    async fn reimage(&self, scale_set: &str, instance_id: &str) -> Result<Operation, ApiError> {
        let mut world = self.world.lock();
        let (name, role) = {
            let role = world.scale_set(scale_set)?.role;
            (world.instance(scale_set, instance_id)?.computer_name.clone(), role)
        };
        world.record(format!("reimage:{}", name))?;
        if world.ghost_on_reimage {
            let id = world.new_node_id();
            world.nodes.push(ClusterNode {
                hostname: format!("ghost-{}", id),
                id,
                addr: "10.99.0.1".parse().unwrap(),
                role,
                status: ClusterStatus::Down,
                is_leader: false,
            });
        }
        Ok(world.start_op(OpEffect::Reimaged {
            scale_set: scale_set.to_string(),
            instance_id: instance_id.to_string(),
        }))
    }

    async fn delete_instance(
        &self,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<Operation, ApiError> {
        let mut world = self.world.lock();
        let name = world.instance(scale_set, instance_id)?.computer_name.clone();
        world.record(format!("delete:{}", name))?;
        let set = world.scale_set_mut(scale_set)?;
        set.instances.retain(|i| i.instance_id != instance_id);
        set.capacity = set.capacity.saturating_sub(1);
        Ok(Operation::Done)
    }

    async fn capacity(&self, scale_set: &str) -> Result<u32, ApiError> {
        Ok(self.world.lock().scale_set(scale_set)?.capacity)
    }

    async fn set_capacity(&self, scale_set: &str, capacity: u32) -> Result<Operation, ApiError> {
        let mut world = self.world.lock();
        world.record(format!("capacity:{}={}", scale_set, capacity))?;
        world.scale_set_mut(scale_set)?.capacity = capacity;
        Ok(world.start_op(OpEffect::Nothing))
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ApiError> {
        let world = self.world.lock();
        if world.deployment.name != name {
            return Err(ApiError::NotFound(format!("deployment {}", name)));
        }
        Ok(world.deployment.clone())
    }

    async fn update_deployment(
        &self,
        name: &str,
        template: &Url,
        parameters: serde_json::Map<String, Value>,
    ) -> Result<Operation, ApiError> {
        let mut world = self.world.lock();
        world.record(format!("update-deployment:{}", template))?;
        if world.deployment.name != name {
            return Err(ApiError::NotFound(format!("deployment {}", name)));
        }
        world.deployment.template_link = Some(template.clone());
        world.deployed_parameters = Some(parameters);
        Ok(world.start_op(OpEffect::Nothing))
    }

    async fn operation_status(&self, operation: &Operation) -> Result<OperationStatus, ApiError> {
        let Operation::Pending { status_url } = operation else {
            return Ok(OperationStatus::Succeeded);
        };
        let mut world = self.world.lock();
        let op = world
            .ops
            .get_mut(status_url)
            .ok_or_else(|| ApiError::NotFound(format!("operation {}", status_url)))?;
        if op.remaining_polls > 1 {
            op.remaining_polls -= 1;
            return Ok(OperationStatus::InProgress);
        }
        let Some(op) = world.ops.remove(status_url) else {
            return Ok(OperationStatus::Succeeded);
        };
        if let Some(reason) = op.fail {
            return Ok(OperationStatus::Failed(reason));
        }
        world.complete(op.effect);
        Ok(OperationStatus::Succeeded)
    }
}

/// In-memory key-value table.
#[derive(Default)]
pub struct MemoryTable {
    tables: Mutex<BTreeMap<String, BTreeMap<(String, String), Entity>>>,
    /// `table/partition/row` of every write, in order.
    pub writes: Mutex<Vec<String>>,
}

impl MemoryTable {
    pub fn len(&self, table: &str) -> usize {
        self.tables.lock().get(table).map(|t| t.len()).unwrap_or(0)
    }

    pub fn writes_to(&self, table: &str, partition: &str, row: &str) -> usize {
        let key = format!("{}/{}/{}", table, partition, row);
        self.writes.lock().iter().filter(|w| **w == key).count()
    }

    fn log_write(&self, table: &str, entity: &Entity) {
        self.writes.lock().push(format!(
            "{}/{}/{}",
            table, entity.partition_key, entity.row_key
        ));
    }
}

#[async_trait]
impl KeyValueTable for MemoryTable {
    async fn get(
        &self,
        table: &str,
        partition: &str,
        row: &str,
    ) -> Result<Option<Entity>, ApiError> {
        let tables = self.tables.lock();
        Ok(tables
            .get(table)
            .and_then(|t| t.get(&(partition.to_string(), row.to_string())))
            .cloned())
    }

    async fn insert(&self, table: &str, entity: Entity) -> Result<(), ApiError> {
        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        if rows.contains_key(&key) {
            return Err(ApiError::Conflict(format!("{}/{:?}", table, key)));
        }
        self.log_write(table, &entity);
        rows.insert(key, entity);
        Ok(())
    }

    async fn upsert(&self, table: &str, entity: Entity) -> Result<(), ApiError> {
        let mut tables = self.tables.lock();
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        self.log_write(table, &entity);
        tables.entry(table.to_string()).or_default().insert(key, entity);
        Ok(())
    }

    async fn delete(&self, table: &str, partition: &str, row: &str) -> Result<(), ApiError> {
        let mut tables = self.tables.lock();
        tables
            .get_mut(table)
            .and_then(|t| t.remove(&(partition.to_string(), row.to_string())))
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(format!("{}/{}/{}", table, partition, row)))
    }

    async fn query(&self, table: &str, partition: &str) -> Result<Vec<Entity>, ApiError> {
        let tables = self.tables.lock();
        Ok(tables
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|e| e.partition_key == partition)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// In-memory queue service with an event log of queue lifecycle calls.
#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<BTreeMap<String, VecDeque<QueueMessage>>>,
    pub events: Mutex<Vec<String>>,
    next_id: AtomicU32,
}

impl MemoryQueue {
    pub fn exists(&self, queue: &str) -> bool {
        self.queues.lock().contains_key(queue)
    }

    pub fn messages(&self, queue: &str) -> Vec<String> {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.iter().map(|m| m.text.clone()).collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl QueueService for MemoryQueue {
    async fn create_queue(&self, queue: &str) -> Result<bool, ApiError> {
        let mut queues = self.queues.lock();
        if queues.contains_key(queue) {
            return Ok(false);
        }
        queues.insert(queue.to_string(), VecDeque::new());
        self.events.lock().push(format!("create:{}", queue));
        Ok(true)
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), ApiError> {
        let mut queues = self.queues.lock();
        queues
            .remove(queue)
            .map(|_| self.events.lock().push(format!("delete:{}", queue)))
            .ok_or_else(|| ApiError::NotFound(format!("queue {}", queue)))
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, ApiError> {
        Ok(self.queues.lock().contains_key(queue))
    }

    async fn put_message(&self, queue: &str, text: &str) -> Result<(), ApiError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let mut queues = self.queues.lock();
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| ApiError::NotFound(format!("queue {}", queue)))?;
        q.push_back(QueueMessage {
            id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn peek_message(&self, queue: &str) -> Result<Option<QueueMessage>, ApiError> {
        let queues = self.queues.lock();
        let q = queues
            .get(queue)
            .ok_or_else(|| ApiError::NotFound(format!("queue {}", queue)))?;
        Ok(q.front().cloned())
    }

    async fn get_message(&self, queue: &str) -> Result<Option<QueueMessage>, ApiError> {
        self.peek_message(queue).await
    }

    async fn delete_message(&self, queue: &str, message: &QueueMessage) -> Result<(), ApiError> {
        let mut queues = self.queues.lock();
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| ApiError::NotFound(format!("queue {}", queue)))?;
        q.retain(|m| m.id != message.id);
        Ok(())
    }

    async fn approximate_message_count(&self, queue: &str) -> Result<usize, ApiError> {
        let queues = self.queues.lock();
        Ok(queues.get(queue).map(|q| q.len()).unwrap_or(0))
    }
}

/// Liveness probe with a fixed answer per address. Unknown addresses are alive.
#[derive(Default)]
pub struct ScriptedProbe {
    dead: Mutex<Vec<IpAddr>>,
    calls: Mutex<HashMap<IpAddr, u32>>,
}

impl ScriptedProbe {
    pub fn kill(&self, addr: IpAddr) {
        self.dead.lock().push(addr);
    }

    pub fn calls(&self, addr: IpAddr) -> u32 {
        self.calls.lock().get(&addr).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl LivenessProbe for ScriptedProbe {
    async fn probe(&self, addr: IpAddr) -> bool {
        *self.calls.lock().entry(addr).or_default() += 1;
        !self.dead.lock().contains(&addr)
    }
}

/// Serves `{"resources": []}` for every URL unless told otherwise.
#[derive(Default)]
pub struct FakeTemplates {
    overrides: Mutex<HashMap<String, Result<Value, ApiError>>>,
    pub fetched: Mutex<Vec<String>>,
}

impl FakeTemplates {
    pub fn serve(&self, url: &str, response: Result<Value, ApiError>) {
        self.overrides.lock().insert(url.to_string(), response);
    }
}

#[async_trait]
impl TemplateSource for FakeTemplates {
    async fn fetch(&self, url: &Url) -> Result<Value, ApiError> {
        self.fetched.lock().push(url.to_string());
        self.overrides
            .lock()
            .get(url.as_str())
            .cloned()
            .unwrap_or_else(|| Ok(json!({ "resources": [] })))
    }
}

#[derive(Default)]
pub struct FakeAddon {
    pub removed: Mutex<Vec<String>>,
    pub joined: Mutex<Vec<String>>,
    /// Number of remove attempts that fail before one succeeds.
    pub flaky_removes: AtomicU32,
}

#[async_trait]
impl DatacenterAddon for FakeAddon {
    async fn remove_replica(&self, replica: &ReplicaRecord) -> Result<(), AddonError> {
        if self
            .flaky_removes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AddonError::CommandFailed {
                status: "exit status: 1".into(),
                stderr: "management endpoint unavailable".into(),
            });
        }
        self.removed.lock().push(replica.replica_id.clone());
        Ok(())
    }

    async fn join_replica(&self, node_name: &str) -> Result<String, AddonError> {
        self.joined.lock().push(node_name.to_string());
        Ok(format!("replica-{}", node_name))
    }
}

pub struct Harness {
    pub cloud: FakeCloud,
    pub table: Arc<MemoryTable>,
    pub queue: Arc<MemoryQueue>,
    pub probe: Arc<ScriptedProbe>,
    pub templates: Arc<FakeTemplates>,
    pub addon: Option<Arc<FakeAddon>>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Harness {
            cloud: FakeCloud {
                world: Arc::new(Mutex::new(World::new())),
            },
            table: Arc::new(MemoryTable::default()),
            queue: Arc::new(MemoryQueue::default()),
            probe: Arc::new(ScriptedProbe::default()),
            templates: Arc::new(FakeTemplates::default()),
            addon: None,
            config: test_config(),
        }
    }

    pub fn with_addon(mut self) -> Self {
        self.addon = Some(Arc::new(FakeAddon::default()));
        self
    }

    pub fn world(&self) -> parking_lot::MutexGuard<'_, World> {
        self.cloud.world.lock()
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::new(self.config.clone())
    }

    pub fn services(&self) -> Services {
        Services {
            cluster: Arc::new(self.cloud.clone()),
            provider: Arc::new(self.cloud.clone()),
            state: self.state(),
            mutex: self.mutex(),
            probe: self.probe.clone(),
            templates: self.templates.clone(),
            addon: self
                .addon
                .clone()
                .map(|a| a as Arc<dyn DatacenterAddon>),
        }
    }

    pub fn state(&self) -> StateStore {
        StateStore::new(
            self.table.clone(),
            self.config.cluster.leader_table.clone(),
            self.config.cluster.replica_table.clone(),
        )
    }

    pub fn mutex(&self) -> UpgradeMutex {
        UpgradeMutex::new(self.queue.clone(), self.config.cluster.upgrade_queue.clone())
    }

    /// Add an instance that is also a cluster member. Returns the cluster node id.
    pub fn add_node(&self, role: Role, hostname: &str, ip: &str, health: Health) -> String {
        self.add_instance(role, hostname, ip, TimeDelta::hours(1));
        self.add_member(role, hostname, ip, health)
    }

    /// Add a running scale-set instance provisioned `age` ago.
    pub fn add_instance(&self, role: Role, hostname: &str, ip: &str, age: TimeDelta) -> String {
        let mut world = self.world();
        let set_name = match role {
            Role::Manager => MANAGER_SET,
            Role::Worker => WORKER_SET,
        };
        let set = world.scale_sets.get_mut(set_name).unwrap();
        let instance_id = set.next_instance.to_string();
        set.next_instance += 1;
        set.capacity += 1;
        set.instances.push(FakeInstance {
            instance_id: instance_id.clone(),
            computer_name: hostname.to_string(),
            ip: ip.parse().unwrap(),
            view: InstanceView {
                power_state: PowerState::Running,
                provisioning_state: ProvisioningState::Succeeded,
                provisioned_at: Some(Utc::now() - age),
            },
        });
        instance_id
    }

    /// Add a cluster member without any scale-set instance behind it.
    pub fn add_member(&self, role: Role, hostname: &str, ip: &str, health: Health) -> String {
        let mut world = self.world();
        let id = world.new_node_id();
        world.nodes.push(ClusterNode {
            id: id.clone(),
            hostname: hostname.to_string(),
            addr: ip.parse().unwrap(),
            role,
            status: match health {
                Health::Ready => ClusterStatus::Ready,
                Health::Down => ClusterStatus::Down,
            },
            is_leader: false,
        });
        id
    }

    pub fn set_leader(&self, node_id: &str) {
        let mut world = self.world();
        for node in world.nodes.iter_mut() {
            node.is_leader = node.id == node_id;
        }
    }

    pub fn set_local(&self, node_id: &str) {
        let mut world = self.world();
        let (hostname, ip) = world
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .map(|n| (n.hostname.clone(), n.addr))
            .unwrap();
        world.local_node_id = Some(node_id.to_string());
        world.local_hostname = hostname;
        world.local_ip = Some(ip);
    }

    pub fn fail(&self, journal_entry: &str, err: ApiError) {
        self.world().failures.insert(journal_entry.to_string(), err);
    }

    pub fn journal(&self) -> Vec<String> {
        self.world().journal.clone()
    }

    /// Position of the first journal entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.journal().iter().position(|e| e == entry)
    }

    pub fn hostnames(&self, role: Role) -> Vec<String> {
        self.world()
            .nodes
            .iter()
            .filter(|n| n.role == role)
            .map(|n| n.hostname.clone())
            .collect()
    }
}
