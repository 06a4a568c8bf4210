//! Group controllers — lifecycle of replicated instance groups.
//!
//! `GroupCore` is the spine shared by every group type: KV blueprint and
//! allocation writes, container creation and removal, service registration,
//! the in-container reconfiguration scripts. The per-type modules
//! (`memcached`, `tarantool`, `tarantino`) drive it with their own create
//! sequences and extras (backup/restore, self-heal).

mod memcached;
mod tarantino;
mod tarantool;

pub use memcached::Memcached;
pub use tarantino::Tarantino;
pub use tarantool::Tarantool;

use crate::allocator;
use crate::backup::archive;
use crate::consul::{CheckRegistration, ConsulClient, ServiceRegistration};
use crate::docker::{ContainerSpec, DockerClient};
use crate::error::{Error, Result};
use crate::sense::{
    Allocation, Blueprint, ContainerGroup, DockerHost, ServiceGroup, MANAGED_LABEL,
};
use crate::state::Fleet;
use crate::task::{Task, TaskStatus};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const REPLICATION_PORT: u16 = 3301;
const REPLICATION_ATTEMPTS: u32 = 5;
const RETRY_PAUSE: Duration = Duration::from_secs(1);

const REPLICATION_CHECK: &str = "/var/lib/mon.d/tarantool_replication.sh";
const MEMORY_CHECK: &str = "/var/lib/mon.d/tarantool_memory.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupType {
    Memcached,
    Tarantool,
    Tarantino,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Memcached => "memcached",
            GroupType::Tarantool => "tarantool",
            GroupType::Tarantino => "tarantino",
        }
    }

    pub fn parse(value: &str) -> Option<GroupType> {
        match value {
            "memcached" => Some(GroupType::Memcached),
            "tarantool" => Some(GroupType::Tarantool),
            "tarantino" => Some(GroupType::Tarantino),
            _ => None,
        }
    }

    pub fn all() -> [GroupType; 3] {
        [
            GroupType::Memcached,
            GroupType::Tarantool,
            GroupType::Tarantino,
        ]
    }

    pub fn image(&self) -> &'static str {
        match self {
            GroupType::Memcached => "tarantool-cloud-memcached",
            GroupType::Tarantool => "tarantool-cloud-tarantool",
            GroupType::Tarantino => "tarantool/tarantino",
        }
    }

    pub fn service_port(&self) -> u16 {
        match self {
            GroupType::Tarantino => 80,
            _ => REPLICATION_PORT,
        }
    }

    /// Two-instance types replicate symmetrically; tarantino runs alone.
    pub fn replicated(&self) -> bool {
        !matches!(self, GroupType::Tarantino)
    }

    pub fn instance_numbers(&self) -> &'static [&'static str] {
        if self.replicated() {
            &["1", "2"]
        } else {
            &["1"]
        }
    }

    fn command(&self) -> Option<Vec<String>> {
        match self {
            GroupType::Memcached => Some(vec![
                "tarantool".to_string(),
                "/opt/tarantool/app.lua".to_string(),
            ]),
            _ => None,
        }
    }

    /// Container environment. Memory reaches the container as a GiB float
    /// (`TARANTOOL_SLAB_ALLOC_ARENA`) while the KV store keeps MiB.
    fn environment(
        &self,
        memsize: u64,
        password: Option<&str>,
        replica_addr: Option<&str>,
    ) -> Vec<String> {
        let arena = memsize as f64 / 1024.0;
        let mut env = vec![format!("TARANTOOL_SLAB_ALLOC_ARENA={arena}")];

        match self {
            GroupType::Memcached => {}
            GroupType::Tarantool => {
                env.push("TARANTOOL_USER_NAME=tarantool".to_string());
                if let Some(password) = password {
                    env.push(format!("TARANTOOL_USER_PASSWORD={password}"));
                }
            }
            GroupType::Tarantino => {
                if let Some(password) = password {
                    env.push(format!("MEMCACHED_PASSWORD={password}"));
                }
            }
        }

        if let Some(replica) = replica_addr {
            env.push(format!(
                "TARANTOOL_REPLICATION_SOURCE={replica}:{REPLICATION_PORT}"
            ));
        }

        env
    }
}

/// Update sub-operations, applied in a fixed order. A failed step aborts
/// the rest and marks the task `error`.
#[derive(Default)]
pub struct UpdateRequest {
    pub name: Option<String>,
    pub memsize: Option<u64>,
    pub password: Option<String>,
    /// `(file name, raw bytes)` — `.tar.gz`, `.tgz`, or a single `.lua`.
    pub config: Option<(String, Vec<u8>)>,
    pub docker_image: bool,
    pub heal: bool,
    pub restore_backup: Option<String>,
}

/// Instance-level controller spine shared by all group types. The healer
/// drives these operations directly; the typed controllers sequence them.
pub struct GroupCore {
    pub fleet: Arc<Fleet>,
    pub group_id: String,
    pub kind: GroupType,
}

impl GroupCore {
    pub fn new(fleet: Arc<Fleet>, group_id: &str, kind: GroupType) -> GroupCore {
        GroupCore {
            fleet,
            group_id: group_id.to_string(),
            kind,
        }
    }

    // ── Views ────────────────────────────────────────────────────

    pub fn blueprint(&self) -> Result<Blueprint> {
        self.fleet
            .sense
            .blueprints()
            .remove(&self.group_id)
            .ok_or_else(|| Error::NotFound(format!("no such blueprint: '{}'", self.group_id)))
    }

    pub fn allocation(&self) -> Allocation {
        self.fleet
            .sense
            .allocations()
            .remove(&self.group_id)
            .unwrap_or_default()
    }

    pub fn services(&self) -> ServiceGroup {
        self.fleet
            .sense
            .services()
            .remove(&self.group_id)
            .unwrap_or_default()
    }

    pub fn containers(&self) -> ContainerGroup {
        self.fleet
            .sense
            .containers()
            .remove(&self.group_id)
            .unwrap_or_default()
    }

    pub fn instance_id(&self, num: &str) -> String {
        format!("{}_{num}", self.group_id)
    }

    // ── Host resolution ──────────────────────────────────────────

    fn docker_addr_for(&self, host: &str) -> Result<String> {
        let hosts = self.fleet.sense.docker_hosts();
        find_docker_host(&hosts, host)
            .map(|h| h.addr.clone())
            .ok_or_else(|| Error::NotFound(format!("no such docker host: '{host}'")))
    }

    fn docker_for(&self, host: &str) -> Result<DockerClient> {
        self.fleet.docker_client(&self.docker_addr_for(host)?)
    }

    /// The Consul agent co-located with a docker host; checks exec into
    /// containers, so they must be registered on that agent.
    fn agent_for(&self, host: &str) -> Result<ConsulClient> {
        let hosts = self.fleet.sense.docker_hosts();
        let record = find_docker_host(&hosts, host)
            .ok_or_else(|| Error::NotFound(format!("failed to find consul host of '{host}'")))?;
        Ok(self.fleet.consul.for_agent(&record.consul_host))
    }

    fn allocated_host(&self, num: &str) -> Result<String> {
        self.allocation()
            .instances
            .get(num)
            .map(|i| i.host.clone())
            .ok_or_else(|| {
                Error::NotFound(format!("instance '{}' is not allocated", self.instance_id(num)))
            })
    }

    // ── Blueprint & allocation writes ────────────────────────────

    pub async fn write_blueprint(
        &self,
        name: &str,
        memsize: u64,
        check_period: u64,
        addrs: &[Ipv4Addr],
    ) -> Result<()> {
        if memsize == 0 {
            return Err(Error::ConfigInvalid("memsize must be positive".into()));
        }

        let kv = &self.fleet.consul;
        let prefix = format!("tarantool/{}/blueprint", self.group_id);
        let creation_time = Utc::now().to_rfc3339();

        kv.kv_put(&format!("{prefix}/type"), self.kind.as_str()).await?;
        kv.kv_put(&format!("{prefix}/name"), name).await?;
        kv.kv_put(&format!("{prefix}/memsize"), &memsize.to_string()).await?;
        kv.kv_put(&format!("{prefix}/check_period"), &check_period.to_string())
            .await?;
        kv.kv_put(&format!("{prefix}/creation_time"), &creation_time)
            .await?;
        for (i, addr) in addrs.iter().enumerate() {
            kv.kv_put(
                &format!("{prefix}/instances/{}/addr", i + 1),
                &addr.to_string(),
            )
            .await?;
        }

        Ok(())
    }

    pub async fn remove_blueprint(&self) -> Result<()> {
        info!("Removing blueprint '{}'", self.group_id);
        self.fleet
            .consul
            .kv_delete_recursive(&format!("tarantool/{}/blueprint", self.group_id))
            .await
    }

    /// Choose a host for every blueprint instance; each pick passes the
    /// previous hosts as anti-affinity so a pair lands on two machines
    /// whenever two healthy hosts exist.
    pub async fn allocate_group(&self) -> Result<()> {
        let blueprint = self.blueprint()?;
        let hosts = self.fleet.sense.docker_hosts();
        let blueprints = self.fleet.sense.blueprints();
        let allocations = self.fleet.sense.allocations();

        let mut picked: Vec<String> = Vec::new();
        for num in blueprint.instances.keys() {
            let host = allocator::choose_host(
                &hosts,
                &blueprints,
                &allocations,
                blueprint.memsize,
                &picked,
            )?;
            self.fleet
                .consul
                .kv_put(
                    &format!("tarantool/{}/allocation/instances/{num}/host", self.group_id),
                    &host,
                )
                .await?;
            picked.push(host);
        }

        Ok(())
    }

    /// Re-place a single instance, anti-affine to its surviving peers.
    pub async fn allocate_instance(&self, num: &str) -> Result<String> {
        let blueprint = self.blueprint()?;
        let allocation = self.allocation();
        let anti_affinity: Vec<String> = allocation
            .instances
            .iter()
            .filter(|(other, _)| other.as_str() != num)
            .map(|(_, i)| i.host.clone())
            .collect();

        let host = allocator::choose_host(
            &self.fleet.sense.docker_hosts(),
            &self.fleet.sense.blueprints(),
            &self.fleet.sense.allocations(),
            blueprint.memsize,
            &anti_affinity,
        )?;

        self.fleet
            .consul
            .kv_put(
                &format!("tarantool/{}/allocation/instances/{num}/host", self.group_id),
                &host,
            )
            .await?;

        Ok(host)
    }

    pub async fn unallocate_group(&self) -> Result<()> {
        info!("Unallocating '{}'", self.group_id);
        self.fleet
            .consul
            .kv_delete_recursive(&format!("tarantool/{}/allocation", self.group_id))
            .await
    }

    pub async fn unallocate_instance(&self, num: &str) -> Result<()> {
        info!("Unallocating '{}'", self.instance_id(num));
        self.fleet
            .consul
            .kv_delete_recursive(&format!(
                "tarantool/{}/allocation/instances/{num}",
                self.group_id
            ))
            .await
    }

    // ── Service registration ─────────────────────────────────────

    pub async fn register_instance(&self, num: &str) -> Result<()> {
        let blueprint = self.blueprint()?;
        let host = self.allocated_host(num)?;
        let agent = self.agent_for(&host)?;

        let instance_id = self.instance_id(num);
        let addr = blueprint
            .instances
            .get(num)
            .map(|i| i.addr.clone())
            .ok_or_else(|| Error::NotFound(format!("instance '{instance_id}' has no addr")))?;

        info!("Registering instance '{instance_id}' on '{}'", agent.host());

        let service_check = if self.kind.replicated() {
            CheckRegistration::docker_script(&instance_id, REPLICATION_CHECK, blueprint.check_period)
        } else {
            CheckRegistration::docker_script(&instance_id, "/bin/true", blueprint.check_period)
        };

        agent
            .register_service(&ServiceRegistration {
                name: self.kind.as_str().to_string(),
                id: instance_id.clone(),
                address: addr,
                port: self.kind.service_port(),
                tags: vec![MANAGED_LABEL.to_string()],
                check: Some(service_check),
            })
            .await?;

        if self.kind.replicated() {
            let mut memory_check = CheckRegistration::docker_script(
                &instance_id,
                MEMORY_CHECK,
                blueprint.check_period,
            );
            memory_check.name = Some("Memory Utilization".to_string());
            memory_check.check_id = Some(format!("{instance_id}_memory"));
            memory_check.service_id = Some(instance_id.clone());
            agent.register_check(&memory_check).await?;
        }

        Ok(())
    }

    pub async fn register_group(&self) -> Result<()> {
        for num in self.blueprint()?.instances.keys() {
            self.register_instance(num).await?;
        }
        Ok(())
    }

    /// Deregister an instance from the agent carrying it. When that agent
    /// is gone from the catalog the registration is removed catalog-side.
    pub async fn unregister_instance(&self, num: &str) -> Result<()> {
        let instance_id = self.instance_id(num);
        let services = self.services();
        let Some(instance) = services.instances.get(num) else {
            info!("Not unregistering '{instance_id}', as it's not registered");
            return Ok(());
        };

        for entry in instance.entries.clone() {
            self.unregister_instance_on(num, &entry.node).await?;
        }
        Ok(())
    }

    /// Deregister one instance from one specific agent node.
    pub async fn unregister_instance_on(&self, num: &str, node_addr: &str) -> Result<()> {
        let instance_id = self.instance_id(num);
        let consul_hosts = self.fleet.sense.consul_hosts();

        let known = consul_hosts
            .iter()
            .find(|h| h.addr.split(':').next() == Some(node_addr));

        match known {
            Some(_) => {
                let agent = self.fleet.consul.for_agent(node_addr);
                info!("Unregistering instance '{instance_id}' from '{node_addr}'");
                agent
                    .deregister_check(&format!("{instance_id}_memory"))
                    .await
                    .ok();
                agent
                    .deregister_check(&format!("service:{instance_id}"))
                    .await
                    .ok();
                agent.deregister_service(&instance_id).await?;
            }
            None => {
                // Agent is gone; scrub the registration from the catalog.
                let node_name = self
                    .fleet
                    .consul
                    .catalog_nodes()
                    .await?
                    .into_iter()
                    .find(|n| n.address == node_addr)
                    .map(|n| n.node);
                match node_name {
                    Some(name) => {
                        info!("Deregistering '{instance_id}' from catalog node '{name}'");
                        self.fleet.consul.catalog_deregister(&name, &instance_id).await?;
                    }
                    None => {
                        info!(
                            "Not unregistering '{instance_id}': node '{node_addr}' left the catalog"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn unregister_group(&self) -> Result<()> {
        for num in self.kind.instance_numbers() {
            self.unregister_instance(num).await?;
        }
        Ok(())
    }

    // ── Containers ───────────────────────────────────────────────

    /// Create and start one instance container on its allocated host,
    /// attached to the managed network at its blueprint address.
    pub async fn create_container(
        &self,
        num: &str,
        replica_of: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        let blueprint = self.blueprint()?;
        let instance_id = self.instance_id(num);
        let addr = blueprint
            .instances
            .get(num)
            .map(|i| i.addr.clone())
            .ok_or_else(|| Error::NotFound(format!("instance '{instance_id}' has no addr")))?;

        let network = self.fleet.sense.network_settings();
        let network_name = network.network_name.clone().ok_or_else(|| {
            Error::ConfigInvalid("network name is not specified in settings".into())
        })?;
        let subnet = network
            .subnet
            .clone()
            .ok_or_else(|| Error::ConfigInvalid("subnet is not specified in settings".into()))?;

        let host = self.allocated_host(num)?;
        let docker = self.docker_for(&host)?;

        docker.ensure_image(self.kind.image(), false).await?;
        docker
            .ensure_network(&network_name, &subnet, network.create_automatically)
            .await?;

        match replica_of {
            Some(replica) => info!(
                "Creating {} '{instance_id}' on '{}' with ip '{addr}' and replication source '{replica}'",
                self.kind.as_str(),
                docker.addr(),
            ),
            None => info!(
                "Creating {} '{instance_id}' on '{}' with ip '{addr}'",
                self.kind.as_str(),
                docker.addr(),
            ),
        }

        let spec = ContainerSpec {
            name: instance_id,
            image: self.kind.image().to_string(),
            command: self.kind.command(),
            env: self.kind.environment(blueprint.memsize, password, replica_of),
            labels: managed_labels(),
            binds: Vec::new(),
            network: network_name,
            ipv4_address: addr,
        };
        docker.create_and_start(&spec).await?;

        Ok(())
    }

    /// Create one instance pointing at its peer as replication source —
    /// the shape every healer-driven recreation takes.
    pub async fn run_instance(&self, num: &str) -> Result<()> {
        let replica = self.peer_addr(num)?;
        self.create_container(num, replica.as_deref(), None).await
    }

    /// Create every container of the group and wire replication.
    pub async fn run_group(&self, task: &Task) -> Result<()> {
        let blueprint = self.blueprint()?;
        let nums: Vec<String> = blueprint.instances.keys().cloned().collect();

        for (i, num) in nums.iter().enumerate() {
            let replica = if i == 0 {
                None
            } else {
                blueprint.instances.get(&nums[0]).map(|b| b.addr.clone())
            };
            self.create_container(num, replica.as_deref(), None).await?;
        }

        if self.kind.replicated() {
            self.wait_for_instances(task).await?;
            self.enable_replication().await?;
        }
        Ok(())
    }

    fn peer_addr(&self, num: &str) -> Result<Option<String>> {
        let blueprint = self.blueprint()?;
        Ok(blueprint
            .instances
            .iter()
            .find(|(other, _)| other.as_str() != num)
            .map(|(_, b)| b.addr.clone()))
    }

    /// Stop and remove one instance container, wherever it actually runs.
    /// A missing container is a no-op.
    pub async fn remove_container(&self, num: &str) -> Result<()> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        let Some(instance) = containers.instances.get(num) else {
            info!("Not removing container '{instance_id}', as it doesn't exist");
            return Ok(());
        };

        info!("Removing container '{instance_id}' from '{}'", instance.host);
        let docker = self.docker_for(&instance.host)?;
        match docker.stop_container(&instance_id).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match docker.remove_container(&instance_id, true).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn remove_containers(&self) -> Result<()> {
        for num in self.kind.instance_numbers() {
            self.remove_container(num).await?;
        }
        Ok(())
    }

    pub async fn stop_container(&self, num: &str) -> Result<()> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        let Some(instance) = containers.instances.get(num) else {
            info!("Not stopping container '{instance_id}', as it doesn't exist");
            return Ok(());
        };
        info!("Stopping container '{instance_id}' on '{}'", instance.host);
        self.docker_for(&instance.host)?
            .stop_container(&instance_id)
            .await
    }

    pub async fn start_container(&self, num: &str) -> Result<()> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        let Some(instance) = containers.instances.get(num) else {
            info!("Not starting container '{instance_id}', as it doesn't exist");
            return Ok(());
        };
        info!("Starting container '{instance_id}' on '{}'", instance.host);
        self.docker_for(&instance.host)?
            .start_container(&instance_id)
            .await
    }

    /// Force-detach a dead slot from the managed network so its fixed
    /// address can be attached to the replacement container.
    pub async fn disconnect_instance(&self, num: &str) -> Result<()> {
        let instance_id = self.instance_id(num);
        let network = self.fleet.sense.network_settings();
        let Some(network_name) = network.network_name else {
            return Err(Error::ConfigInvalid(
                "network name is not specified in settings".into(),
            ));
        };

        let host = self.allocated_host(num)?;
        let docker = self.docker_for(&host)?;
        docker
            .network_disconnect(&network_name, &instance_id, true)
            .await
            .ok();
        Ok(())
    }

    /// Recreate a container on a fresh image, keeping every mount except
    /// the code mount (the code ships with the image).
    pub async fn upgrade_container(&self, num: &str) -> Result<()> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        let Some(instance) = containers.instances.get(num) else {
            info!("Not upgrading container '{instance_id}', as it doesn't exist");
            return Ok(());
        };

        let blueprint = self.blueprint()?;
        let network = self.fleet.sense.network_settings();
        let network_name = network.network_name.clone().ok_or_else(|| {
            Error::ConfigInvalid("network name is not specified in settings".into())
        })?;
        let subnet = network
            .subnet
            .clone()
            .ok_or_else(|| Error::ConfigInvalid("subnet is not specified in settings".into()))?;

        let docker = self.docker_for(&instance.host)?;
        docker.ensure_image(self.kind.image(), true).await?;
        docker
            .ensure_network(&network_name, &subnet, network.create_automatically)
            .await?;

        let inspect = docker.inspect_container(&instance_id).await?;
        let mut binds = Vec::new();
        for mount in inspect.mounts.unwrap_or_default() {
            let (Some(source), Some(destination)) = (mount.source, mount.destination) else {
                continue;
            };
            if destination == "/opt/tarantool" {
                continue;
            }
            info!("Keeping mount {source}:{destination}");
            let mode = if mount.rw.unwrap_or(true) { "rw" } else { "ro" };
            binds.push(format!("{source}:{destination}:{mode}"));
        }

        docker.stop_container(&instance_id).await?;
        docker.remove_container(&instance_id, false).await?;

        let addr = blueprint
            .instances
            .get(num)
            .map(|i| i.addr.clone())
            .ok_or_else(|| Error::NotFound(format!("instance '{instance_id}' has no addr")))?;
        let replica = self.peer_addr(num)?;

        let spec = ContainerSpec {
            name: instance_id,
            image: self.kind.image().to_string(),
            command: Some(vec![
                "tarantool".to_string(),
                "/opt/tarantool/app.lua".to_string(),
            ]),
            env: self
                .kind
                .environment(blueprint.memsize, None, replica.as_deref()),
            labels: managed_labels(),
            binds,
            network: network_name,
            ipv4_address: addr,
        };
        docker.create_and_start(&spec).await?;

        Ok(())
    }

    // ── In-container reconfiguration ─────────────────────────────

    /// Block until the instance answers its in-container liveness probe.
    /// Loading a large dataset from disk can take a while, so this retries
    /// without bound; the surrounding task is what gets cancelled.
    pub async fn wait_instance_up(&self, num: &str, task: &Task) -> Result<()> {
        let instance_id = self.instance_id(num);
        let host = self.allocated_host(num)?;
        let docker = self.docker_for(&host)?;

        task.log(format!(
            "Waiting for '{instance_id}' to go up. It may take time to load data from disk."
        ));

        let mut attempts = 0u32;
        loop {
            let result = docker.exec(&instance_id, &["tarantool_is_up"]).await?;
            if result.success() {
                return Ok(());
            }
            attempts += 1;
            task.log(format!(
                "Waiting for '{instance_id}' to go up. Attempt {attempts}."
            ));
            tokio::time::sleep(RETRY_PAUSE).await;
        }
    }

    pub async fn wait_for_instances(&self, task: &Task) -> Result<()> {
        for num in self.allocation().instances.keys() {
            self.wait_instance_up(num, task).await?;
        }
        Ok(())
    }

    /// Point every member at its peers via the in-container set-config
    /// script, making replication symmetric.
    pub async fn enable_replication(&self) -> Result<()> {
        let blueprint = self.blueprint()?;
        let allocation = self.allocation();

        for num in allocation.instances.keys() {
            let others: Vec<String> = blueprint
                .instances
                .iter()
                .filter(|(other, _)| other != &num)
                .map(|(_, b)| format!("{}:{REPLICATION_PORT}", b.addr))
                .collect();
            if others.is_empty() {
                continue;
            }

            let instance_id = self.instance_id(num);
            let host = self.allocated_host(num)?;
            let docker = self.docker_for(&host)?;
            let sources = others.join(",");

            info!("Enabling replication for '{instance_id}' from '{sources}'");

            let mut attempts = 0;
            loop {
                let result = docker
                    .exec(
                        &instance_id,
                        &[
                            "tarantool_set_config.lua",
                            "TARANTOOL_REPLICATION_SOURCE",
                            &sources,
                        ],
                    )
                    .await?;
                if result.success() {
                    break;
                }
                attempts += 1;
                if attempts >= REPLICATION_ATTEMPTS {
                    return Err(Error::ExternalFailure(format!(
                        "failed to enable replication for group {}",
                        self.group_id
                    )));
                }
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }

        Ok(())
    }

    pub async fn resize_instance(&self, num: &str, memsize: u64) -> Result<()> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        let Some(instance) = containers.instances.get(num) else {
            info!("Not resizing container '{instance_id}', as it doesn't exist");
            return Ok(());
        };

        info!(
            "Resizing container '{instance_id}' to {memsize} MiB on '{}'",
            instance.host
        );
        let docker = self.docker_for(&instance.host)?;
        let arena = format!("{}", memsize as f64 / 1024.0);
        docker
            .exec(
                &instance_id,
                &["tarantool_set_config.lua", "TARANTOOL_SLAB_ALLOC_ARENA", &arena],
            )
            .await?
            .into_result("tarantool_set_config.lua")?;
        docker.restart_container(&instance_id).await
    }

    pub async fn set_instance_password(&self, num: &str, password: &str) -> Result<()> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        let Some(instance) = containers.instances.get(num) else {
            info!("Not setting password for '{instance_id}', as it doesn't exist");
            return Ok(());
        };

        info!("Setting password for '{instance_id}' on '{}'", instance.host);
        let docker = self.docker_for(&instance.host)?;
        docker
            .exec(
                &instance_id,
                &["tarantool_set_config.lua", "TARANTOOL_USER_PASSWORD", password],
            )
            .await?
            .into_result("tarantool_set_config.lua")?;
        Ok(())
    }

    /// Upload a new application tree under a timestamped `/opt/deploy`
    /// directory and re-point the code symlink. History stays in place.
    pub async fn update_instance_config(&self, num: &str, tar: Vec<u8>) -> Result<()> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        let Some(instance) = containers.instances.get(num) else {
            info!("Not setting config for container '{instance_id}', as it doesn't exist");
            return Ok(());
        };

        info!("Uploading new config for container '{instance_id}' on '{}'", instance.host);
        let docker = self.docker_for(&instance.host)?;

        let destdir = format!("/opt/deploy/{}", Utc::now().format("%Y-%m-%dT%H:%M:%S"));
        docker
            .exec(&instance_id, &["mkdir", "-p", &destdir])
            .await?
            .into_result("mkdir")?;
        docker.put_archive(&instance_id, &destdir, tar).await?;
        docker
            .exec(&instance_id, &["ln", "-snf", &destdir, "/opt/tarantool"])
            .await?
            .into_result("ln")?;
        docker.restart_container(&instance_id).await
    }

    /// Read the survivor's password out of its container config, if any.
    pub async fn get_instance_password(&self, num: &str) -> Result<Option<String>> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        let Some(instance) = containers.instances.get(num) else {
            return Err(Error::NotFound(format!("no such container: '{instance_id}'")));
        };

        let docker = self.docker_for(&instance.host)?;
        let tar = match docker
            .get_archive(&instance_id, "/etc/tarantool/config.yml")
            .await
        {
            Ok(tar) => tar,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        read_password_from_config_tar(&tar)
    }

    /// Where the instance's code symlink currently points.
    pub async fn get_instance_current_code(&self, num: &str) -> Result<Option<String>> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        let Some(instance) = containers.instances.get(num) else {
            return Err(Error::NotFound(format!("no such container: '{instance_id}'")));
        };

        let docker = self.docker_for(&instance.host)?;
        let result = docker
            .exec(&instance_id, &["readlink", "/opt/tarantool"])
            .await?;
        if !result.success() {
            return Ok(None);
        }
        let target = result.stdout.trim().to_string();
        Ok(if target.is_empty() { None } else { Some(target) })
    }

    /// Archive the deploy tree an instance currently serves.
    pub async fn get_instance_code(&self, num: &str, code_link: &str) -> Result<Option<Vec<u8>>> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        let Some(instance) = containers.instances.get(num) else {
            return Err(Error::NotFound(format!("no such container: '{instance_id}'")));
        };

        let docker = self.docker_for(&instance.host)?;
        match docker.get_archive(&instance_id, code_link).await {
            Ok(tar) => Ok(Some(tar)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Upload a previously captured deploy tree and re-point the symlink.
    pub async fn set_instance_code(&self, num: &str, tar: Vec<u8>, code_link: &str) -> Result<()> {
        let instance_id = self.instance_id(num);
        let containers = self.containers();
        if !containers.instances.contains_key(num) {
            return Ok(());
        }
        let instance = &containers.instances[num];

        info!("Restoring code of container '{instance_id}' on '{}'", instance.host);
        let docker = self.docker_for(&instance.host)?;
        docker.put_archive(&instance_id, "/opt/deploy", tar).await?;
        docker
            .exec(&instance_id, &["ln", "-snf", code_link, "/opt/tarantool"])
            .await?
            .into_result("ln")?;
        docker.restart_container(&instance_id).await
    }

    // ── Whole-group sequences ────────────────────────────────────

    /// Tear a group down completely. Every step tolerates its target
    /// already being gone, so a half-deleted group can be deleted again.
    pub async fn delete_group(&self, task: &Task) -> Result<()> {
        task.log("Removing containers");
        self.remove_containers().await?;

        task.log("Unregistering services");
        self.unregister_group().await?;

        task.log("Unallocating instance");
        self.unallocate_group().await?;

        task.log("Removing blueprint");
        self.remove_blueprint().await?;

        task.log("Completed removing group");
        self.fleet.sense.refresh().await?;
        Ok(())
    }

    /// Stop the group's containers and pull their registrations, keeping
    /// blueprint and allocation so `start_group` can bring it back.
    pub async fn stop_group(&self, task: &Task) -> Result<()> {
        for num in self.kind.instance_numbers() {
            task.log(format!("Stopping instance {num}"));
            self.stop_container(num).await?;
            self.unregister_instance(num).await?;
        }
        self.fleet.sense.refresh().await?;
        Ok(())
    }

    pub async fn start_group(&self, task: &Task) -> Result<()> {
        let services = self.services();
        for num in self.kind.instance_numbers() {
            if !services.instances.contains_key(*num) {
                task.log(format!("Registering instance {num}"));
                self.register_instance(num).await?;
            }
            task.log(format!("Starting instance {num}"));
            self.start_container(num).await?;
        }

        if self.kind.replicated() {
            task.log("Enabling replication");
            self.wait_for_instances(task).await?;
            self.enable_replication().await?;
        }
        self.fleet.sense.refresh().await?;
        Ok(())
    }

    /// The fixed-order update pipeline: heal, rename, resize, password,
    /// config, image upgrade, restore. The first failing step aborts the
    /// rest.
    pub async fn update_group(&self, request: UpdateRequest, task: &Task) -> Result<()> {
        if request.heal {
            self.heal_self(task).await?;
        }

        if let Some(name) = &request.name {
            let blueprint = self.blueprint()?;
            if *name != blueprint.name {
                task.log(format!("Renaming group '{}' to '{name}'", self.group_id));
                self.fleet
                    .consul
                    .kv_put(&format!("tarantool/{}/blueprint/name", self.group_id), name)
                    .await?;
            }
        }

        if let Some(memsize) = request.memsize {
            let blueprint = self.blueprint()?;
            if memsize != blueprint.memsize {
                for num in self.kind.instance_numbers() {
                    task.log(format!("Resizing instance {num}"));
                    self.resize_instance(num, memsize).await?;
                }
                self.fleet
                    .consul
                    .kv_put(
                        &format!("tarantool/{}/blueprint/memsize", self.group_id),
                        &memsize.to_string(),
                    )
                    .await?;
                task.log("Completed resizing");
            }
        }

        if let Some(password) = &request.password {
            for num in self.kind.instance_numbers() {
                task.log(format!("Setting password for instance {num}"));
                self.set_instance_password(num, password).await?;
            }
        }

        if let Some((filename, data)) = &request.config {
            task.log(format!("Updating config of group {}", self.group_id));
            let tar = config_to_tar(filename, data)?;
            for num in self.kind.instance_numbers() {
                task.log(format!("Updating config of instance {num}"));
                self.update_instance_config(num, tar.clone()).await?;
            }
        }

        if request.docker_image {
            for num in self.kind.instance_numbers() {
                task.log(format!("Upgrading container {num}"));
                self.upgrade_container(num).await?;
            }
            task.log("Completed upgrading containers");
        }

        if let Some(backup_id) = &request.restore_backup {
            if self.kind != GroupType::Tarantool {
                return Err(Error::ConfigInvalid(format!(
                    "{} groups do not support restore",
                    self.kind.as_str()
                )));
            }
            Tarantool::restore_into(self, backup_id, task).await?;
        }

        if self.kind.replicated() && request.restore_backup.is_none() {
            self.enable_replication().await?;
        }
        self.fleet.sense.refresh().await?;
        Ok(())
    }

    /// Single-group repair: when exactly one container of a pair is
    /// missing, rebuild it from the survivor without touching the
    /// survivor.
    pub async fn heal_self(&self, task: &Task) -> Result<()> {
        if !self.kind.replicated() {
            return Err(Error::ConfigInvalid(format!(
                "{} groups do not support healing",
                self.kind.as_str()
            )));
        }

        let containers = self.containers();
        if containers.instances.len() == 2 {
            task.log("All containers are present. No need to heal.");
            return Ok(());
        }
        let Some(survivor) = containers.instances.keys().next().cloned() else {
            task.log("No live containers. Can't heal.");
            return Err(Error::NotFound(format!(
                "group '{}' has no live containers to heal from",
                self.group_id
            )));
        };

        let dead = if survivor == "1" { "2" } else { "1" };
        task.log(format!("Re-creating container {dead} from {survivor}"));

        let password = self.get_instance_password(&survivor).await?;
        if password.is_some() {
            task.log(format!("Will set password for {dead}"));
        }
        let code_link = self.get_instance_current_code(&survivor).await?;
        let code = match &code_link {
            Some(link) => self.get_instance_code(&survivor, link).await?,
            None => None,
        };

        task.log(format!("Unregistering container {dead}"));
        self.unregister_instance(dead).await?;

        task.log(format!("Disconnecting container {dead}"));
        self.disconnect_instance(dead).await?;

        task.log(format!("Creating container {dead}"));
        let survivor_addr = self
            .blueprint()?
            .instances
            .get(&survivor)
            .map(|b| b.addr.clone());
        self.create_container(dead, survivor_addr.as_deref(), password.as_deref())
            .await?;

        self.fleet.sense.refresh().await?;

        if let (Some(link), Some(code)) = (code_link, code) {
            task.log(format!("Recovering code: {link}"));
            self.set_instance_code(dead, code, &link).await?;
        }

        task.log(format!("Registering container {dead}"));
        self.register_instance(dead).await?;

        Ok(())
    }
}

fn managed_labels() -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), String::new());
    labels
}

pub(crate) fn find_docker_host<'a>(hosts: &'a [DockerHost], host: &str) -> Option<&'a DockerHost> {
    hosts
        .iter()
        .find(|h| h.host() == host || h.consul_host == host)
}

/// Accept `.tar.gz` / `.tgz` bundles (decompressed to the tar Docker
/// wants) or a bare `.lua` file (wrapped as a tar holding `app.lua`).
fn config_to_tar(filename: &str, data: &[u8]) -> Result<Vec<u8>> {
    if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        archive::gunzip(data)
    } else if filename.ends_with(".lua") {
        archive::tar_single_file("app.lua", data)
    } else {
        Err(Error::ConfigInvalid(format!(
            "file of type '{filename}' is not supported; supported types: .tar.gz, .tgz, .lua"
        )))
    }
}

#[derive(Deserialize)]
struct InstanceConfig {
    #[serde(rename = "TARANTOOL_USER_PASSWORD")]
    password: Option<String>,
}

fn read_password_from_config_tar(tar: &[u8]) -> Result<Option<String>> {
    let mut archive = tar::Archive::new(tar);
    for entry in archive
        .entries()
        .map_err(|e| Error::Transient(format!("tar read: {e}")))?
    {
        let mut entry = entry.map_err(|e| Error::Transient(format!("tar read: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::Transient(format!("tar read: {e}")))?
            .to_string_lossy()
            .into_owned();
        if !path.ends_with("config.yml") {
            continue;
        }
        let mut content = String::new();
        entry.read_to_string(&mut content)?;
        let config: InstanceConfig = serde_yaml::from_str(&content)
            .map_err(|e| Error::InvariantViolation(format!("bad instance config: {e}")))?;
        return Ok(config.password);
    }
    Ok(None)
}

/// Typed dispatch over the three group kinds.
pub enum Controller {
    Memcached(Memcached),
    Tarantool(Tarantool),
    Tarantino(Tarantino),
}

impl Controller {
    pub fn new(fleet: Arc<Fleet>, group_id: &str, kind: GroupType) -> Controller {
        match kind {
            GroupType::Memcached => Controller::Memcached(Memcached::new(fleet, group_id)),
            GroupType::Tarantool => Controller::Tarantool(Tarantool::new(fleet, group_id)),
            GroupType::Tarantino => Controller::Tarantino(Tarantino::new(fleet, group_id)),
        }
    }

    /// Resolve the controller for an existing blueprint.
    pub fn for_group(fleet: Arc<Fleet>, group_id: &str) -> Result<Controller> {
        let kind = fleet
            .sense
            .blueprints()
            .get(group_id)
            .map(|b| b.group_type)
            .ok_or_else(|| Error::NotFound(format!("no such blueprint: '{group_id}'")))?;
        Ok(Controller::new(fleet, group_id, kind))
    }

    pub fn core(&self) -> &GroupCore {
        match self {
            Controller::Memcached(c) => &c.core,
            Controller::Tarantool(c) => &c.core,
            Controller::Tarantino(c) => &c.core,
        }
    }

    pub async fn create(
        &self,
        task: &Task,
        name: &str,
        memsize: u64,
        password: Option<&str>,
        check_period: u64,
    ) -> Result<()> {
        let result = match self {
            Controller::Memcached(c) => c.create(task, name, memsize, password, check_period).await,
            Controller::Tarantool(c) => c.create(task, name, memsize, password, check_period).await,
            Controller::Tarantino(c) => c.create(task, name, memsize, password, check_period).await,
        };
        finish_task(task, result)
    }

    pub async fn delete(&self, task: &Task) -> Result<()> {
        let result = self.core().delete_group(task).await;
        finish_task(task, result)
    }

    pub async fn update(&self, task: &Task, request: UpdateRequest) -> Result<()> {
        let result = self.core().update_group(request, task).await;
        finish_task(task, result)
    }

    /// Capture a backup. Only tarantool pairs carry the data layout the
    /// archive format describes.
    pub async fn backup(
        &self,
        task: &Task,
        storage: &crate::backup::BackupStorage,
    ) -> Result<String> {
        let result = match self {
            Controller::Tarantool(c) => c.backup(task, storage).await,
            other => Err(Error::ConfigInvalid(format!(
                "{} groups do not support backup",
                other.core().kind.as_str()
            ))),
        };
        match result {
            Ok(backup_id) => {
                task.set_status(TaskStatus::Success, None);
                Ok(backup_id)
            }
            Err(e) => {
                task.set_status(TaskStatus::Error, Some(&e.to_string()));
                Err(e)
            }
        }
    }
}

/// Record the operation outcome on its task, keeping the error moving.
pub fn finish_task(task: &Task, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            task.set_status(TaskStatus::Success, None);
            Ok(())
        }
        Err(e) => {
            let status = if e.is_retryable() {
                TaskStatus::Warning
            } else {
                TaskStatus::Error
            };
            task.set_status(status, Some(&e.to_string()));
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::CheckStatus;

    #[test]
    fn test_group_type_round_trip() {
        for kind in GroupType::all() {
            assert_eq!(GroupType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(GroupType::parse("redis"), None);
    }

    #[test]
    fn test_instance_counts() {
        assert_eq!(GroupType::Memcached.instance_numbers(), &["1", "2"]);
        assert_eq!(GroupType::Tarantool.instance_numbers(), &["1", "2"]);
        assert_eq!(GroupType::Tarantino.instance_numbers(), &["1"]);
    }

    #[test]
    fn test_environment_converts_memsize_to_gib() {
        let env = GroupType::Tarantool.environment(512, Some("s3cret"), Some("172.20.0.2"));
        assert!(env.contains(&"TARANTOOL_SLAB_ALLOC_ARENA=0.5".to_string()));
        assert!(env.contains(&"TARANTOOL_USER_NAME=tarantool".to_string()));
        assert!(env.contains(&"TARANTOOL_USER_PASSWORD=s3cret".to_string()));
        assert!(env.contains(&"TARANTOOL_REPLICATION_SOURCE=172.20.0.2:3301".to_string()));
    }

    #[test]
    fn test_environment_tarantino_password() {
        let env = GroupType::Tarantino.environment(1024, Some("pw"), None);
        assert!(env.contains(&"TARANTOOL_SLAB_ALLOC_ARENA=1".to_string()));
        assert!(env.contains(&"MEMCACHED_PASSWORD=pw".to_string()));
        assert!(!env.iter().any(|e| e.starts_with("TARANTOOL_USER_NAME")));
    }

    #[test]
    fn test_environment_memcached_has_no_password() {
        let env = GroupType::Memcached.environment(500, Some("ignored"), None);
        assert!(!env.iter().any(|e| e.contains("PASSWORD")));
    }

    #[test]
    fn test_config_to_tar_wraps_lua() {
        let tar = config_to_tar("app.lua", b"box.cfg{}").unwrap();
        let mut archive = tar::Archive::new(tar.as_slice());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "app.lua");
    }

    #[test]
    fn test_config_to_tar_unwraps_tgz() {
        let inner = archive::tar_single_file("init.lua", b"return 1").unwrap();
        let gz = archive::gzip_deterministic(&inner).unwrap();
        assert_eq!(config_to_tar("bundle.tar.gz", &gz).unwrap(), inner);
        assert_eq!(config_to_tar("bundle.tgz", &gz).unwrap(), inner);
    }

    #[test]
    fn test_config_to_tar_rejects_unknown() {
        assert!(matches!(
            config_to_tar("app.py", b"print()"),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_read_password_from_config_tar() {
        let yaml = "TARANTOOL_USER_NAME: tarantool\nTARANTOOL_USER_PASSWORD: hunter2\n";
        let tar = archive::tar_single_file("config.yml", yaml.as_bytes()).unwrap();
        assert_eq!(
            read_password_from_config_tar(&tar).unwrap().as_deref(),
            Some("hunter2")
        );

        let yaml = "TARANTOOL_USER_NAME: tarantool\n";
        let tar = archive::tar_single_file("config.yml", yaml.as_bytes()).unwrap();
        assert_eq!(read_password_from_config_tar(&tar).unwrap(), None);
    }

    #[test]
    fn test_find_docker_host_by_either_address() {
        let hosts = vec![DockerHost {
            addr: "10.0.0.1:2375".to_string(),
            consul_host: "10.0.0.9".to_string(),
            tags: vec!["im".to_string()],
            status: CheckStatus::Passing,
            cpus: 4,
            memory: 8192,
        }];
        assert!(find_docker_host(&hosts, "10.0.0.1").is_some());
        assert!(find_docker_host(&hosts, "10.0.0.9").is_some());
        assert!(find_docker_host(&hosts, "10.0.0.2").is_none());
    }
}
