//! Docker-host probe loop.
//!
//! Runs independently of the main refresh so a stalled daemon can never
//! block sensing: each host gets a bounded-deadline `info` + container
//! listing every cycle, and only hosts the probe marks passing are listed
//! during `Sense::refresh`.

use crate::consul::ConsulClient;
use crate::docker::{DockerClient, DockerTls};
use crate::health::{combine_statuses, CheckStatus};
use crate::sense::views::DOCKER_SERVICE;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

const PROBE_INTERVAL: Duration = Duration::from_secs(10);
const PROBE_DEADLINE: Duration = Duration::from_secs(10);

pub(super) async fn probe_loop(
    consul: ConsulClient,
    statuses: Arc<DashMap<String, CheckStatus>>,
    docker_tls: Option<DockerTls>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!("Starting docker host probe loop");

    let mut interval = time::interval(PROBE_INTERVAL);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = probe_all(&consul, &statuses, docker_tls.as_ref()).await {
                    warn!("Docker probe pass failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Stopping docker host probe loop");
                    break;
                }
            }
        }
    }
}

pub(super) async fn probe_all(
    consul: &ConsulClient,
    statuses: &DashMap<String, CheckStatus>,
    docker_tls: Option<&DockerTls>,
) -> crate::error::Result<()> {
    let entries = consul.service_health(DOCKER_SERVICE).await?;

    let mut fresh: HashMap<String, CheckStatus> = HashMap::new();
    for entry in &entries {
        let mut addr = entry.service_address().to_string();
        if entry.service.port != 0 {
            addr = format!("{addr}:{}", entry.service.port);
        }

        let agent_says = combine_statuses(
            entry.checks.iter().map(|c| CheckStatus::parse(&c.status)),
        );
        let status = if agent_says == CheckStatus::Passing {
            probe_host(&addr, docker_tls).await
        } else {
            CheckStatus::Critical
        };
        fresh.insert(addr, status);
    }

    statuses.retain(|addr, _| fresh.contains_key(addr));
    for (addr, status) in fresh {
        statuses.insert(addr, status);
    }

    Ok(())
}

/// A host is passing iff `info` and a full container listing both answer
/// within the deadline.
async fn probe_host(addr: &str, docker_tls: Option<&DockerTls>) -> CheckStatus {
    let attempt = async {
        let client = DockerClient::connect(addr, docker_tls)?;
        client.info().await?;
        client.list_containers().await?;
        Ok::<(), crate::error::Error>(())
    };

    match time::timeout(PROBE_DEADLINE, attempt).await {
        Ok(Ok(())) => CheckStatus::Passing,
        Ok(Err(e)) => {
            error!(host = addr, "Docker host probe failed: {e}");
            CheckStatus::Critical
        }
        Err(_) => {
            error!(host = addr, "Docker host probe timed out");
            CheckStatus::Critical
        }
    }
}
