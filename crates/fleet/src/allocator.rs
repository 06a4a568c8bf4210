//! Host selection for new instances.

use crate::error::{Error, Result};
use crate::sense::{Allocation, Blueprint, DockerHost};
use std::collections::BTreeMap;
use tracing::info;

/// Hosts must carry this tag to receive instances.
pub const PLACEMENT_TAG: &str = "im";

/// Pick a host for an instance needing `memory` MiB. Placement prefers
/// hosts outside `anti_affinity`, then the host with the most free memory.
/// When no host clears the requested amount the top-scored host is used
/// anyway — running tight beats not running.
pub fn choose_host(
    docker_hosts: &[DockerHost],
    blueprints: &BTreeMap<String, Blueprint>,
    allocations: &BTreeMap<String, Allocation>,
    memory: u64,
    anti_affinity: &[String],
) -> Result<String> {
    let candidates: Vec<&DockerHost> = docker_hosts
        .iter()
        .filter(|h| h.is_passing() && h.tags.iter().any(|t| t == PLACEMENT_TAG))
        .collect();

    if candidates.is_empty() {
        return Err(Error::CapacityExhausted(
            "there are no healthy docker nodes".to_string(),
        ));
    }

    let memory_used = memory_used_per_host(blueprints, allocations);

    let mut scored: Vec<(u8, i64, &DockerHost)> = candidates
        .iter()
        .map(|host| {
            let addr = host.host();
            let used = memory_used.get(addr).copied().unwrap_or(0);
            let free_mem = host.memory as i64 - used as i64;
            let affinity = if anti_affinity.iter().any(|a| a == addr) {
                0
            } else {
                1
            };
            (affinity, free_mem, *host)
        })
        .collect();

    scored.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));

    for (_, free_mem, host) in &scored {
        if *free_mem > memory as i64 {
            info!(
                "Allocating new instance with {} MiB memory at '{}'",
                memory,
                host.host()
            );
            return Ok(host.host().to_string());
        }
    }

    let fallback = scored[0].2;
    info!(
        "There were no hosts with {} MiB of free memory, so allocating instance on '{}'",
        memory,
        fallback.host()
    );
    Ok(fallback.host().to_string())
}

/// Committed memory per host: the memsize of every blueprint instance that
/// is currently allocated there.
fn memory_used_per_host(
    blueprints: &BTreeMap<String, Blueprint>,
    allocations: &BTreeMap<String, Allocation>,
) -> BTreeMap<String, u64> {
    let mut used: BTreeMap<String, u64> = BTreeMap::new();

    for (group_id, blueprint) in blueprints {
        let Some(allocation) = allocations.get(group_id) else {
            continue;
        };
        for instance in allocation.instances.values() {
            let host = instance.host.split(':').next().unwrap_or(&instance.host);
            *used.entry(host.to_string()).or_default() += blueprint.memsize;
        }
    }

    used
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupType;
    use crate::health::CheckStatus;
    use crate::sense::{AllocatedInstance, BlueprintInstance};

    fn host(addr: &str, memory: u64, tags: &[&str], status: CheckStatus) -> DockerHost {
        DockerHost {
            addr: format!("{addr}:2375"),
            consul_host: addr.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            status,
            cpus: 4,
            memory,
        }
    }

    fn world(
        entries: &[(&str, u64, &str)],
    ) -> (BTreeMap<String, Blueprint>, BTreeMap<String, Allocation>) {
        let mut blueprints = BTreeMap::new();
        let mut allocations = BTreeMap::new();
        for (i, (gid, memsize, host)) in entries.iter().enumerate() {
            let mut instances = BTreeMap::new();
            instances.insert(
                "1".to_string(),
                BlueprintInstance {
                    addr: format!("172.20.0.{}", i + 2),
                },
            );
            blueprints.insert(
                gid.to_string(),
                Blueprint {
                    group_type: GroupType::Tarantool,
                    name: gid.to_string(),
                    memsize: *memsize,
                    check_period: 10,
                    creation_time: None,
                    instances,
                },
            );
            let mut alloc = Allocation::default();
            alloc.instances.insert(
                "1".to_string(),
                AllocatedInstance {
                    host: host.to_string(),
                },
            );
            allocations.insert(gid.to_string(), alloc);
        }
        (blueprints, allocations)
    }

    #[test]
    fn test_prefers_most_free_memory() {
        let hosts = vec![
            host("10.0.0.1", 4096, &["im"], CheckStatus::Passing),
            host("10.0.0.2", 8192, &["im"], CheckStatus::Passing),
        ];
        let (blueprints, allocations) = world(&[]);

        let picked = choose_host(&hosts, &blueprints, &allocations, 500, &[]).unwrap();
        assert_eq!(picked, "10.0.0.2");
    }

    #[test]
    fn test_anti_affinity_beats_free_memory() {
        let hosts = vec![
            host("10.0.0.1", 4096, &["im"], CheckStatus::Passing),
            host("10.0.0.2", 8192, &["im"], CheckStatus::Passing),
        ];
        let (blueprints, allocations) = world(&[]);

        let picked = choose_host(
            &hosts,
            &blueprints,
            &allocations,
            500,
            &["10.0.0.2".to_string()],
        )
        .unwrap();
        assert_eq!(picked, "10.0.0.1");
    }

    #[test]
    fn test_existing_allocations_count_against_host() {
        let hosts = vec![
            host("10.0.0.1", 8192, &["im"], CheckStatus::Passing),
            host("10.0.0.2", 8192, &["im"], CheckStatus::Passing),
        ];
        let (blueprints, allocations) = world(&[("g1", 6000, "10.0.0.1")]);

        let picked = choose_host(&hosts, &blueprints, &allocations, 500, &[]).unwrap();
        assert_eq!(picked, "10.0.0.2");
    }

    #[test]
    fn test_fallback_when_nothing_fits() {
        let hosts = vec![host("10.0.0.1", 1024, &["im"], CheckStatus::Passing)];
        let (blueprints, allocations) = world(&[]);

        let picked = choose_host(&hosts, &blueprints, &allocations, 4096, &[]).unwrap();
        assert_eq!(picked, "10.0.0.1");
    }

    #[test]
    fn test_untagged_and_unhealthy_excluded() {
        let hosts = vec![
            host("10.0.0.1", 8192, &[], CheckStatus::Passing),
            host("10.0.0.2", 8192, &["im"], CheckStatus::Critical),
        ];
        let (blueprints, allocations) = world(&[]);

        let err = choose_host(&hosts, &blueprints, &allocations, 500, &[]).unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted(_)));
    }
}
