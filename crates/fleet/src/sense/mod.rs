//! Sensing layer — four parallel views of the world derived from the
//! Consul KV store, the service catalog, and per-host Docker listings.
//!
//! `refresh()` replaces the raw payloads atomically; accessors parse the
//! current payloads into immutable views, so every caller observes one
//! consistent snapshot.

mod probe;
mod views;

pub use views::*;

use crate::consul::{CatalogNode, ConsulClient, KvPair, ServiceHealthEntry};
use crate::docker::{DockerClient, DockerTls};
use crate::error::Result;
use crate::health::{combine_statuses, CheckStatus};
use bollard::models::{ContainerSummary, SystemInfo};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RawWorld {
    kv: Vec<KvPair>,
    settings: Vec<KvPair>,
    backups: Vec<KvPair>,
    services: BTreeMap<String, Vec<ServiceHealthEntry>>,
    nodes: Vec<CatalogNode>,
    containers: BTreeMap<String, Vec<ContainerSummary>>,
    docker_info: BTreeMap<String, SystemInfo>,
}

/// One consistent, immutable picture of the cluster, for the healer and
/// anything else that must reason about several views at once.
#[derive(Clone, Default)]
pub struct WorldSnapshot {
    pub blueprints: BTreeMap<String, Blueprint>,
    pub allocations: BTreeMap<String, Allocation>,
    pub services: BTreeMap<String, ServiceGroup>,
    pub containers: BTreeMap<String, ContainerGroup>,
    pub docker_hosts: Vec<DockerHost>,
    pub consul_hosts: Vec<ConsulHost>,
    pub backups: BTreeMap<String, BackupRecord>,
    pub network: NetworkSettings,
}

impl WorldSnapshot {
    /// Resolve an allocation's host (a consul node address or a docker
    /// endpoint host) to the docker host record serving it.
    pub fn find_docker_host(&self, host: &str) -> Option<&DockerHost> {
        self.docker_hosts
            .iter()
            .find(|h| h.host() == host || h.consul_host == host)
    }
}

pub struct Sense {
    consul: ConsulClient,
    defaults: NetworkSettings,
    docker_tls: Option<DockerTls>,
    raw: RwLock<RawWorld>,
    probe_statuses: Arc<DashMap<String, CheckStatus>>,
}

impl Sense {
    pub fn new(
        consul: ConsulClient,
        defaults: NetworkSettings,
        docker_tls: Option<DockerTls>,
    ) -> Self {
        Sense {
            consul,
            defaults,
            docker_tls,
            raw: RwLock::new(RawWorld::default()),
            probe_statuses: Arc::new(DashMap::new()),
        }
    }

    /// Re-read everything: the KV subtrees, the catalog, per-service
    /// health, and container listings from every docker host the probe
    /// loop currently trusts.
    pub async fn refresh(&self) -> Result<()> {
        let kv = self.consul.kv_get_recursive(KV_PREFIX).await?;
        let settings = self.consul.kv_get_recursive(SETTINGS_PREFIX).await?;
        let backups = self.consul.kv_get_recursive(BACKUPS_PREFIX).await?;

        let mut services = BTreeMap::new();
        for name in self.consul.catalog_services().await?.keys() {
            services.insert(name.clone(), self.consul.service_health(name).await?);
        }

        let nodes = self.consul.catalog_nodes().await?;

        let mut containers = BTreeMap::new();
        let mut docker_info = BTreeMap::new();
        for entry in services.get(DOCKER_SERVICE).map(Vec::as_slice).unwrap_or(&[]) {
            let mut addr = entry.service_address().to_string();
            if entry.service.port != 0 {
                addr = format!("{addr}:{}", entry.service.port);
            }

            let agent_says = combine_statuses(
                entry.checks.iter().map(|c| CheckStatus::parse(&c.status)),
            );
            let probed = self
                .probe_statuses
                .get(&addr)
                .map(|s| *s.value())
                .unwrap_or(CheckStatus::Critical);
            if agent_says != CheckStatus::Passing || probed != CheckStatus::Passing {
                continue;
            }

            let node_addr = entry.node.address.clone();
            match self.list_host(&addr).await {
                Ok((list, info)) => {
                    containers.insert(node_addr.clone(), list);
                    docker_info.insert(node_addr, info);
                }
                Err(e) => {
                    warn!(host = %addr, "Skipping docker host during refresh: {e}");
                }
            }
        }

        let mut raw = self.raw.write();
        *raw = RawWorld {
            kv,
            settings,
            backups,
            services,
            nodes,
            containers,
            docker_info,
        };

        Ok(())
    }

    async fn list_host(&self, addr: &str) -> Result<(Vec<ContainerSummary>, SystemInfo)> {
        let client = DockerClient::connect(addr, self.docker_tls.as_ref())?;
        let list = client.list_containers().await?;
        let info = client.info().await?;
        Ok((list, info))
    }

    // ── Views ────────────────────────────────────────────────────

    pub fn blueprints(&self) -> BTreeMap<String, Blueprint> {
        parse_blueprints(&self.raw.read().kv)
    }

    pub fn allocations(&self) -> BTreeMap<String, Allocation> {
        parse_allocations(&self.raw.read().kv)
    }

    pub fn services(&self) -> BTreeMap<String, ServiceGroup> {
        parse_services(&self.raw.read().services)
    }

    pub fn containers(&self) -> BTreeMap<String, ContainerGroup> {
        let raw = self.raw.read();
        let network = parse_network_settings(&raw.settings, &self.defaults);
        parse_containers(&raw.containers, network.network_name.as_deref())
    }

    pub fn docker_hosts(&self) -> Vec<DockerHost> {
        let raw = self.raw.read();
        let probe = self.probe_map();
        let entries = raw
            .services
            .get(DOCKER_SERVICE)
            .cloned()
            .unwrap_or_default();
        parse_docker_hosts(&entries, &raw.docker_info, &probe)
    }

    pub fn consul_hosts(&self) -> Vec<ConsulHost> {
        parse_consul_hosts(&self.raw.read().nodes)
    }

    pub fn network_settings(&self) -> NetworkSettings {
        parse_network_settings(&self.raw.read().settings, &self.defaults)
    }

    pub fn backups(&self) -> BTreeMap<String, BackupRecord> {
        parse_backups(&self.raw.read().backups)
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        let raw = self.raw.read();
        let probe = self.probe_map();
        let network = parse_network_settings(&raw.settings, &self.defaults);
        let docker_entries = raw
            .services
            .get(DOCKER_SERVICE)
            .cloned()
            .unwrap_or_default();

        WorldSnapshot {
            blueprints: parse_blueprints(&raw.kv),
            allocations: parse_allocations(&raw.kv),
            services: parse_services(&raw.services),
            containers: parse_containers(&raw.containers, network.network_name.as_deref()),
            docker_hosts: parse_docker_hosts(&docker_entries, &raw.docker_info, &probe),
            consul_hosts: parse_consul_hosts(&raw.nodes),
            backups: parse_backups(&raw.backups),
            network,
        }
    }

    fn probe_map(&self) -> BTreeMap<String, CheckStatus> {
        self.probe_statuses
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    // ── Background tasks ─────────────────────────────────────────

    /// Periodic full refresh. The watch loop forces extra refreshes on
    /// events; this keeps the views warm in between.
    pub async fn refresh_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            "Starting sense refresh loop (interval: {}s)",
            REFRESH_INTERVAL.as_secs()
        );

        let mut interval = time::interval(REFRESH_INTERVAL);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("Sense refresh failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Stopping sense refresh loop");
                        break;
                    }
                }
            }
        }
    }

    /// One synchronous probe pass. One-shot commands run this before the
    /// first refresh so container listings are not gated on a probe loop
    /// that has not ticked yet.
    pub async fn probe_now(&self) -> Result<()> {
        probe::probe_all(
            &self.consul,
            &self.probe_statuses,
            self.docker_tls.as_ref(),
        )
        .await
    }

    /// Spawn the per-host probe loop.
    pub fn spawn_probe_loop(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let consul = self.consul.clone();
        let statuses = self.probe_statuses.clone();
        let tls = self.docker_tls.clone();
        tokio::spawn(probe::probe_loop(consul, statuses, tls, shutdown))
    }
}
