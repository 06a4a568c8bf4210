//! Fleet handle — configuration, gateways, sensing, shared pools, and the
//! background tasks that keep them fresh.

use crate::backup::BackupStorage;
use crate::config::FleetConfig;
use crate::consul::ConsulClient;
use crate::docker::{DockerClient, DockerTls};
use crate::error::{Error, Result};
use crate::ip_pool::IpPool;
use crate::sense::Sense;
use crate::task::TaskRegistry;
use std::sync::Arc;
use tracing::info;

pub struct Fleet {
    pub config: FleetConfig,
    pub consul: ConsulClient,
    pub sense: Arc<Sense>,
    pub ip_pool: Arc<IpPool>,
    pub tasks: TaskRegistry,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl Fleet {
    pub fn new(config: FleetConfig) -> Result<Arc<Fleet>> {
        let consul_host = config
            .consul_host
            .clone()
            .ok_or_else(|| Error::ConfigInvalid("consul_host is not set".into()))?;

        let consul = ConsulClient::new(&consul_host, config.consul_acl_token.as_deref())?;
        let docker_tls = docker_tls_from(&config);
        let sense = Arc::new(Sense::new(
            consul.clone(),
            config.default_network_settings(),
            docker_tls,
        ));
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Ok(Arc::new(Fleet {
            config,
            consul,
            sense,
            ip_pool: Arc::new(IpPool::new()),
            tasks: TaskRegistry::new(),
            shutdown_tx,
        }))
    }

    pub fn docker_tls(&self) -> Option<DockerTls> {
        docker_tls_from(&self.config)
    }

    /// Client for the daemon at `addr` (`host:port`), with the fleet's TLS
    /// material when configured.
    pub fn docker_client(&self, addr: &str) -> Result<DockerClient> {
        DockerClient::connect(addr, self.docker_tls().as_ref())
    }

    pub fn backup_storage(&self) -> Result<BackupStorage> {
        BackupStorage::from_config(&self.config)
    }

    /// Spawn the long-lived loops: sense refresh, docker-host probe, and
    /// the IP reservation sweeper. An initial probe + refresh runs first so
    /// callers see a populated world.
    pub async fn start_background(self: &Arc<Self>) {
        let _ = self.sense.spawn_probe_loop(self.shutdown_rx());

        tokio::spawn(self.sense.clone().refresh_loop(self.shutdown_rx()));
        tokio::spawn(self.ip_pool.clone().expire_loop(self.shutdown_rx()));

        info!("Background tasks started");
    }

    pub fn shutdown_rx(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn docker_tls_from(config: &FleetConfig) -> Option<DockerTls> {
    match (
        &config.docker_client_cert,
        &config.docker_client_key,
        &config.docker_server_cert,
    ) {
        (Some(cert), Some(key), Some(ca)) => Some(DockerTls {
            client_cert: cert.into(),
            client_key: key.into(),
            server_ca: ca.into(),
        }),
        _ => None,
    }
}
