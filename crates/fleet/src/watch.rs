//! Watch loop — blocking Consul health watches that trigger healing, and
//! the snapshot diff behind the `watch` command.

use crate::error::Result;
use crate::group::GroupType;
use crate::healer::Healer;
use crate::health::{combine_statuses, CheckStatus};
use crate::sense::WorldSnapshot;
use crate::state::Fleet;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const DEFAULT_WATCH_PERIOD_SECS: u64 = 300;

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
enum HealTrigger {
    /// The watch window elapsed with no events; run a periodic heal.
    Periodic { service: String },
    /// Some instance of the service went critical.
    Critical { service: String },
}

/// Long-lived loop: one blocking watcher per managed service type, all
/// funneled into a single heal executor so concurrent triggers coalesce
/// into one healing run.
pub struct WatchLoop {
    fleet: Arc<Fleet>,
    healer: Healer,
}

impl WatchLoop {
    pub fn new(fleet: Arc<Fleet>) -> WatchLoop {
        let healer = Healer::new(fleet.clone());
        WatchLoop { fleet, healer }
    }

    pub async fn run(
        self,
        period_secs: u64,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!("Watching for changes in health (window: {period_secs}s)");

        let (tx, mut rx) = mpsc::channel::<HealTrigger>(16);
        for kind in GroupType::all() {
            tokio::spawn(watch_service(
                self.fleet.clone(),
                kind.as_str().to_string(),
                period_secs,
                tx.clone(),
                shutdown.clone(),
            ));
        }
        drop(tx);

        loop {
            tokio::select! {
                trigger = rx.recv() => {
                    let Some(trigger) = trigger else { break };
                    // Coalesce whatever else queued up while we were busy.
                    while rx.try_recv().is_ok() {}

                    match &trigger {
                        HealTrigger::Periodic { service } => {
                            info!(service, "Running periodic healing");
                        }
                        HealTrigger::Critical { service } => {
                            info!(service, "One of the services failed. Running healing.");
                        }
                    }
                    if let Err(e) = self.healer.heal().await {
                        warn!("Healing run failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Stopping watch loop");
                        break;
                    }
                }
            }
        }
    }
}

async fn watch_service(
    fleet: Arc<Fleet>,
    service: String,
    period_secs: u64,
    tx: mpsc::Sender<HealTrigger>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut index: Option<u64> = None;
    let mut backoff = BACKOFF_MIN;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let watch = fleet
            .consul
            .watch_health(&service, index, Some(period_secs));
        let result = tokio::select! {
            result = watch => result,
            _ = shutdown.changed() => break,
        };

        match result {
            Ok((new_index, entries)) => {
                backoff = BACKOFF_MIN;

                let trigger = if index == Some(new_index) {
                    // The watch window elapsed without events. It is quite
                    // safe to heal during such quiet periods.
                    Some(HealTrigger::Periodic {
                        service: service.clone(),
                    })
                } else {
                    let any_critical = entries.iter().any(|entry| {
                        combine_statuses(
                            entry.checks.iter().map(|c| CheckStatus::parse(&c.status)),
                        ) == CheckStatus::Critical
                    });
                    any_critical.then(|| HealTrigger::Critical {
                        service: service.clone(),
                    })
                };

                index = Some(new_index);
                if let Some(trigger) = trigger {
                    if tx.send(trigger).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(service, "Health watch failed: {e}; backing off {:?}", backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
}

/// Wait until the service's health index moves, then hand back the new
/// snapshot. Used by the `watch` command between diffs.
pub async fn await_change(
    fleet: &Fleet,
    service: &str,
    index: Option<u64>,
    period_secs: u64,
) -> Result<u64> {
    let (new_index, _) = fleet
        .consul
        .watch_health(service, index, Some(period_secs))
        .await?;
    Ok(new_index)
}

// ── Snapshot diffing ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    GroupCreated(String),
    GroupDeleted(String),
    GroupAllocated(String),
    GroupUnallocated(String),
    GroupRegistered(String),
    GroupUnregistered(String),
    ContainersStarted(String),
    ContainersStopped(String),
    InstanceStatus { instance: String, status: CheckStatus },
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEvent::GroupCreated(g) => write!(f, "Created group '{g}'"),
            WatchEvent::GroupDeleted(g) => write!(f, "Deleted group '{g}'"),
            WatchEvent::GroupAllocated(g) => write!(f, "Allocated group '{g}'"),
            WatchEvent::GroupUnallocated(g) => write!(f, "Unallocated group '{g}'"),
            WatchEvent::GroupRegistered(g) => write!(f, "Registered group '{g}'"),
            WatchEvent::GroupUnregistered(g) => write!(f, "Unregistered group '{g}'"),
            WatchEvent::ContainersStarted(g) => {
                write!(f, "Started containers for group '{g}'")
            }
            WatchEvent::ContainersStopped(g) => {
                write!(f, "Stopped containers for group '{g}'")
            }
            WatchEvent::InstanceStatus { instance, status } => {
                write!(f, "Instance '{instance}' is {status}")
            }
        }
    }
}

/// Everything that changed between two snapshots, in reporting order:
/// appearances, disappearances, then per-instance status transitions.
pub fn diff_snapshots(old: &WorldSnapshot, new: &WorldSnapshot) -> Vec<WatchEvent> {
    let mut events = Vec::new();

    for group in new.blueprints.keys() {
        if !old.blueprints.contains_key(group) {
            events.push(WatchEvent::GroupCreated(group.clone()));
        }
    }
    for group in new.allocations.keys() {
        if !old.allocations.contains_key(group) {
            events.push(WatchEvent::GroupAllocated(group.clone()));
        }
    }
    for group in new.services.keys() {
        if !old.services.contains_key(group) {
            events.push(WatchEvent::GroupRegistered(group.clone()));
        }
    }
    for group in new.containers.keys() {
        if !old.containers.contains_key(group) {
            events.push(WatchEvent::ContainersStarted(group.clone()));
        }
    }

    for group in old.blueprints.keys() {
        if !new.blueprints.contains_key(group) {
            events.push(WatchEvent::GroupDeleted(group.clone()));
        }
    }
    for group in old.allocations.keys() {
        if !new.allocations.contains_key(group) {
            events.push(WatchEvent::GroupUnallocated(group.clone()));
        }
    }
    for group in old.services.keys() {
        if !new.services.contains_key(group) {
            events.push(WatchEvent::GroupUnregistered(group.clone()));
        }
    }
    for group in old.containers.keys() {
        if !new.containers.contains_key(group) {
            events.push(WatchEvent::ContainersStopped(group.clone()));
        }
    }

    for (group, new_services) in &new.services {
        let Some(old_services) = old.services.get(group) else {
            continue;
        };
        let instances: BTreeSet<&String> = new_services
            .instances
            .keys()
            .chain(old_services.instances.keys())
            .collect();
        for num in instances {
            let (Some(new_inst), Some(old_inst)) = (
                new_services.instances.get(num),
                old_services.instances.get(num),
            ) else {
                continue;
            };
            let status = new_inst.status();
            if status != old_inst.status() {
                events.push(WatchEvent::InstanceStatus {
                    instance: format!("{group}_{num}"),
                    status,
                });
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sense::{ServiceEntry, ServiceGroup, ServiceInstance};

    fn snapshot_with_service(group: &str, status: CheckStatus) -> WorldSnapshot {
        let mut snapshot = WorldSnapshot::default();
        let mut service_group = ServiceGroup {
            group_type: "memcached".to_string(),
            ..Default::default()
        };
        service_group.instances.insert(
            "1".to_string(),
            ServiceInstance {
                addr: "172.20.0.2:3301".to_string(),
                port: 3301,
                mem_used: 0,
                entries: vec![ServiceEntry {
                    node: "10.0.0.1".to_string(),
                    status,
                }],
            },
        );
        snapshot.services.insert(group.to_string(), service_group);
        snapshot
    }

    #[test]
    fn test_diff_reports_new_and_gone_groups() {
        let old = WorldSnapshot::default();
        let new = snapshot_with_service("abc", CheckStatus::Passing);

        let events = diff_snapshots(&old, &new);
        assert_eq!(events, vec![WatchEvent::GroupRegistered("abc".to_string())]);

        let events = diff_snapshots(&new, &old);
        assert_eq!(events, vec![WatchEvent::GroupUnregistered("abc".to_string())]);
    }

    #[test]
    fn test_diff_reports_status_transition() {
        let old = snapshot_with_service("abc", CheckStatus::Warning);
        let new = snapshot_with_service("abc", CheckStatus::Passing);

        let events = diff_snapshots(&old, &new);
        assert_eq!(
            events,
            vec![WatchEvent::InstanceStatus {
                instance: "abc_1".to_string(),
                status: CheckStatus::Passing,
            }]
        );
    }

    #[test]
    fn test_diff_quiet_when_nothing_changed() {
        let snapshot = snapshot_with_service("abc", CheckStatus::Passing);
        assert!(diff_snapshots(&snapshot, &snapshot).is_empty());
    }
}
