//! The ordered reconciliation rules as pure planning functions.
//!
//! Each rule inspects one group in a `WorldSnapshot` and either produces
//! the `Action` that would move it toward its blueprint, or nothing. The
//! executor applies the first action planned, refreshes, and plans again —
//! so priority is exactly the order below, and the rules can be unit
//! tested without any I/O.

use crate::health::CheckStatus;
use crate::sense::WorldSnapshot;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Rule 1: an instance is registered on more than one agent, or on an
    /// agent that left the catalog; drop the bogus registrations.
    CleanupStaleRegistrations {
        group: String,
        instance: String,
        nodes: Vec<String>,
    },
    /// Rule 2: containers exist for a group without a blueprint.
    CleanupLostContainers { group: String },
    /// Rule 3: a blueprint with no allocation at all.
    AllocateGroup { group: String },
    /// Rule 4: blueprint and allocation exist but no containers run.
    RerunGroup { group: String, reallocate: bool },
    /// Rule 5: one blueprint instance lost its allocation.
    RecreateMissingAllocation { group: String, instance: String },
    /// Rule 6: an allocated instance has no container and sits on an
    /// unhealthy host; free the slot so rule 5 can re-place it.
    UnallocateFromFailingNode { group: String, instance: String },
    /// Rule 7: an allocated instance is simply not running.
    RerunInstance { group: String, instance: String },
    /// Rule 8: an allocated instance is not registered.
    RegisterInstance { group: String, instance: String },
    /// Rule 9: the container runs on a different host than allocated.
    MigrateInstance { group: String, instance: String },
    /// Rule 10: the registration lives on the wrong agent.
    ReregisterInstance {
        group: String,
        instance: String,
        wrong_node: String,
    },
    /// Rule 11: a registered instance went critical; rebuild it elsewhere.
    RecreateFailedInstance { group: String, instance: String },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::CleanupStaleRegistrations { group, instance, nodes } => write!(
                f,
                "cleanup stale registrations of '{group}_{instance}' on {nodes:?}"
            ),
            Action::CleanupLostContainers { group } => {
                write!(f, "remove '{group}' because there is no blueprint")
            }
            Action::AllocateGroup { group } => {
                write!(f, "allocate '{group}' because it's not allocated")
            }
            Action::RerunGroup { group, .. } => {
                write!(f, "rerun '{group}' because it's stopped")
            }
            Action::RecreateMissingAllocation { group, instance } => {
                write!(f, "reallocate '{group}_{instance}' because it's not allocated")
            }
            Action::UnallocateFromFailingNode { group, instance } => {
                write!(f, "unallocate '{group}_{instance}' because its node failed")
            }
            Action::RerunInstance { group, instance } => {
                write!(f, "create '{group}_{instance}' because it is missing")
            }
            Action::RegisterInstance { group, instance } => {
                write!(f, "register '{group}_{instance}' because it is not registered")
            }
            Action::MigrateInstance { group, instance } => {
                write!(f, "migrate '{group}_{instance}' to its allocated host")
            }
            Action::ReregisterInstance { group, instance, wrong_node } => {
                write!(f, "move registration of '{group}_{instance}' off '{wrong_node}'")
            }
            Action::RecreateFailedInstance { group, instance } => {
                write!(f, "recreate '{group}_{instance}' because it has failed")
            }
        }
    }
}

/// Plan the single highest-priority action for the whole snapshot, or
/// `None` when the world matches the blueprints — the healer's fixed
/// point.
pub fn plan(snapshot: &WorldSnapshot) -> Option<Action> {
    if let Some(action) = cleanup_stale_registrations(snapshot) {
        return Some(action);
    }

    let mut groups: BTreeSet<&String> = BTreeSet::new();
    groups.extend(snapshot.blueprints.keys());
    groups.extend(snapshot.allocations.keys());
    groups.extend(snapshot.services.keys());
    groups.extend(snapshot.containers.keys());

    let rules: &[fn(&str, &WorldSnapshot) -> Option<Action>] = &[
        cleanup_lost_containers,
        allocate_non_existing_groups,
        rerun_stopped_groups,
        recreate_missing_allocation,
        unallocate_instances_from_failing_nodes,
        rerun_missing_instance,
        register_unregistered_instance,
        migrate_instance_to_correct_host,
        register_instance_on_correct_host,
        recreate_and_reallocate_failed_instance,
    ];

    for group in groups {
        for rule in rules {
            if let Some(action) = rule(group, snapshot) {
                return Some(action);
            }
        }
    }

    None
}

fn node_in_catalog(snapshot: &WorldSnapshot, node_addr: &str) -> bool {
    snapshot
        .consul_hosts
        .iter()
        .any(|h| h.addr.split(':').next() == Some(node_addr))
}

/// Rule 1. Duplicates keep the entry matching the emergent host; every
/// other agent loses its copy. Registrations whose agent disappeared from
/// the catalog entirely are stale no matter what.
fn cleanup_stale_registrations(snapshot: &WorldSnapshot) -> Option<Action> {
    for (group, service_group) in &snapshot.services {
        for (num, instance) in &service_group.instances {
            let mut wrong: Vec<String> = Vec::new();

            if instance.entries.len() > 1 {
                if let Some(emergent) = snapshot
                    .containers
                    .get(group)
                    .and_then(|c| c.instances.get(num))
                {
                    wrong.extend(
                        instance
                            .entries
                            .iter()
                            .filter(|e| e.node != emergent.host)
                            .map(|e| e.node.clone()),
                    );
                }
            }
            wrong.extend(
                instance
                    .entries
                    .iter()
                    .filter(|e| !node_in_catalog(snapshot, &e.node))
                    .map(|e| e.node.clone()),
            );

            wrong.sort();
            wrong.dedup();
            if !wrong.is_empty() {
                return Some(Action::CleanupStaleRegistrations {
                    group: group.clone(),
                    instance: num.clone(),
                    nodes: wrong,
                });
            }
        }
    }
    None
}

/// Rule 2.
fn cleanup_lost_containers(group: &str, snapshot: &WorldSnapshot) -> Option<Action> {
    if snapshot.containers.contains_key(group) && !snapshot.blueprints.contains_key(group) {
        return Some(Action::CleanupLostContainers {
            group: group.to_string(),
        });
    }
    None
}

/// Rule 3.
fn allocate_non_existing_groups(group: &str, snapshot: &WorldSnapshot) -> Option<Action> {
    if snapshot.blueprints.contains_key(group) && !snapshot.allocations.contains_key(group) {
        return Some(Action::AllocateGroup {
            group: group.to_string(),
        });
    }
    None
}

/// Rule 4. A partial allocation is rebuilt from scratch; a complete one is
/// reused as-is.
fn rerun_stopped_groups(group: &str, snapshot: &WorldSnapshot) -> Option<Action> {
    let blueprint = snapshot.blueprints.get(group)?;
    let allocation = snapshot.allocations.get(group)?;
    if snapshot.containers.contains_key(group) {
        return None;
    }

    let blueprint_nums: BTreeSet<&String> = blueprint.instances.keys().collect();
    let allocated_nums: BTreeSet<&String> = allocation.instances.keys().collect();

    Some(Action::RerunGroup {
        group: group.to_string(),
        reallocate: blueprint_nums != allocated_nums,
    })
}

/// Rule 5.
fn recreate_missing_allocation(group: &str, snapshot: &WorldSnapshot) -> Option<Action> {
    let blueprint = snapshot.blueprints.get(group)?;
    let allocation = snapshot.allocations.get(group)?;

    for num in blueprint.instances.keys() {
        if !allocation.instances.contains_key(num) {
            return Some(Action::RecreateMissingAllocation {
                group: group.to_string(),
                instance: num.clone(),
            });
        }
    }
    None
}

/// Rule 6.
fn unallocate_instances_from_failing_nodes(
    group: &str,
    snapshot: &WorldSnapshot,
) -> Option<Action> {
    if !snapshot.blueprints.contains_key(group) {
        return None;
    }
    let allocation = snapshot.allocations.get(group)?;

    for (num, instance) in &allocation.instances {
        let emergent = snapshot
            .containers
            .get(group)
            .is_some_and(|c| c.instances.contains_key(num));
        let host_healthy = snapshot
            .find_docker_host(&instance.host)
            .is_some_and(|h| h.is_passing());

        if !emergent && !host_healthy {
            return Some(Action::UnallocateFromFailingNode {
                group: group.to_string(),
                instance: num.clone(),
            });
        }
    }
    None
}

/// Rule 7.
fn rerun_missing_instance(group: &str, snapshot: &WorldSnapshot) -> Option<Action> {
    let blueprint = snapshot.blueprints.get(group)?;
    let allocation = snapshot.allocations.get(group)?;

    for num in blueprint.instances.keys() {
        let allocated = allocation.instances.contains_key(num);
        let emergent = snapshot
            .containers
            .get(group)
            .is_some_and(|c| c.instances.contains_key(num));
        if allocated && !emergent {
            return Some(Action::RerunInstance {
                group: group.to_string(),
                instance: num.clone(),
            });
        }
    }
    None
}

/// Rule 8.
fn register_unregistered_instance(group: &str, snapshot: &WorldSnapshot) -> Option<Action> {
    let blueprint = snapshot.blueprints.get(group)?;
    let allocation = snapshot.allocations.get(group)?;

    for num in blueprint.instances.keys() {
        let allocated = allocation.instances.contains_key(num);
        let registered = snapshot
            .services
            .get(group)
            .is_some_and(|s| s.instances.contains_key(num));
        if allocated && !registered {
            return Some(Action::RegisterInstance {
                group: group.to_string(),
                instance: num.clone(),
            });
        }
    }
    None
}

/// Rule 9.
fn migrate_instance_to_correct_host(group: &str, snapshot: &WorldSnapshot) -> Option<Action> {
    if !snapshot.blueprints.contains_key(group) {
        return None;
    }
    let allocation = snapshot.allocations.get(group)?;
    let containers = snapshot.containers.get(group)?;

    for (num, allocated) in &allocation.instances {
        let Some(emergent) = containers.instances.get(num) else {
            continue;
        };
        // Allocation stores the docker host; emergent records the consul
        // node address of that host. Compare through the host record.
        let allocated_node = snapshot
            .find_docker_host(&allocated.host)
            .map(|h| h.consul_host.as_str());
        if allocated_node != Some(emergent.host.as_str()) && emergent.host != allocated.host {
            return Some(Action::MigrateInstance {
                group: group.to_string(),
                instance: num.clone(),
            });
        }
    }
    None
}

/// Rule 10.
fn register_instance_on_correct_host(group: &str, snapshot: &WorldSnapshot) -> Option<Action> {
    if !snapshot.blueprints.contains_key(group) {
        return None;
    }
    let allocation = snapshot.allocations.get(group)?;
    let services = snapshot.services.get(group)?;

    for (num, allocated) in &allocation.instances {
        let Some(instance) = services.instances.get(num) else {
            continue;
        };
        let Some(expected_node) = snapshot
            .find_docker_host(&allocated.host)
            .map(|h| h.consul_host.clone())
        else {
            continue;
        };

        for entry in &instance.entries {
            if entry.node != expected_node {
                return Some(Action::ReregisterInstance {
                    group: group.to_string(),
                    instance: num.clone(),
                    wrong_node: entry.node.clone(),
                });
            }
        }
    }
    None
}

/// Rule 11.
fn recreate_and_reallocate_failed_instance(
    group: &str,
    snapshot: &WorldSnapshot,
) -> Option<Action> {
    if !snapshot.blueprints.contains_key(group) {
        return None;
    }
    let services = snapshot.services.get(group)?;

    for (num, instance) in &services.instances {
        if instance.status() == CheckStatus::Critical {
            return Some(Action::RecreateFailedInstance {
                group: group.to_string(),
                instance: num.clone(),
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupType;
    use crate::sense::{
        AllocatedInstance, Allocation, Blueprint, BlueprintInstance, ConsulHost, ContainerGroup,
        ContainerInstance, DockerHost, ServiceEntry, ServiceGroup, ServiceInstance,
    };

    fn docker_host(ip: &str, status: CheckStatus) -> DockerHost {
        DockerHost {
            addr: format!("{ip}:2375"),
            consul_host: ip.to_string(),
            tags: vec!["im".to_string()],
            status,
            cpus: 4,
            memory: 8192,
        }
    }

    fn consul_host(ip: &str) -> ConsulHost {
        ConsulHost {
            addr: format!("{ip}:8300"),
            name: format!("node-{ip}"),
            status: CheckStatus::Passing,
        }
    }

    fn blueprint(nums: &[(&str, &str)]) -> Blueprint {
        Blueprint {
            group_type: GroupType::Memcached,
            name: "alice".to_string(),
            memsize: 500,
            check_period: 10,
            creation_time: None,
            instances: nums
                .iter()
                .map(|(num, addr)| {
                    (
                        num.to_string(),
                        BlueprintInstance {
                            addr: addr.to_string(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn allocation(nums: &[(&str, &str)]) -> Allocation {
        Allocation {
            instances: nums
                .iter()
                .map(|(num, host)| {
                    (
                        num.to_string(),
                        AllocatedInstance {
                            host: host.to_string(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn containers(nums: &[(&str, &str)]) -> ContainerGroup {
        ContainerGroup {
            instances: nums
                .iter()
                .map(|(num, host)| {
                    (
                        num.to_string(),
                        ContainerInstance {
                            addr: Some("172.20.0.2".to_string()),
                            host: host.to_string(),
                            is_running: true,
                            image_name: "tarantool-cloud-memcached".to_string(),
                            image_id: "abcdef".to_string(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn registrations(nums: &[(&str, &[(&str, CheckStatus)])]) -> ServiceGroup {
        ServiceGroup {
            group_type: "memcached".to_string(),
            instances: nums
                .iter()
                .map(|(num, entries)| {
                    (
                        num.to_string(),
                        ServiceInstance {
                            addr: "172.20.0.2:3301".to_string(),
                            port: 3301,
                            mem_used: 10,
                            entries: entries
                                .iter()
                                .map(|(node, status)| ServiceEntry {
                                    node: node.to_string(),
                                    status: *status,
                                })
                                .collect(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// A healthy converged two-host world with one pair on it.
    fn converged() -> WorldSnapshot {
        let mut snapshot = WorldSnapshot {
            docker_hosts: vec![
                docker_host("10.0.0.1", CheckStatus::Passing),
                docker_host("10.0.0.2", CheckStatus::Passing),
            ],
            consul_hosts: vec![consul_host("10.0.0.1"), consul_host("10.0.0.2")],
            ..Default::default()
        };
        snapshot.blueprints.insert(
            "abc".to_string(),
            blueprint(&[("1", "172.20.0.2"), ("2", "172.20.0.3")]),
        );
        snapshot.allocations.insert(
            "abc".to_string(),
            allocation(&[("1", "10.0.0.1"), ("2", "10.0.0.2")]),
        );
        snapshot.containers.insert(
            "abc".to_string(),
            containers(&[("1", "10.0.0.1"), ("2", "10.0.0.2")]),
        );
        snapshot.services.insert(
            "abc".to_string(),
            registrations(&[
                ("1", &[("10.0.0.1", CheckStatus::Passing)]),
                ("2", &[("10.0.0.2", CheckStatus::Passing)]),
            ]),
        );
        snapshot
    }

    #[test]
    fn test_converged_world_plans_nothing() {
        assert_eq!(plan(&converged()), None);
    }

    #[test]
    fn test_planning_is_idempotent_on_converged_state() {
        let snapshot = converged();
        assert_eq!(plan(&snapshot), plan(&snapshot));
    }

    #[test]
    fn test_rule1_duplicate_registration() {
        let mut snapshot = converged();
        snapshot.services.insert(
            "abc".to_string(),
            registrations(&[
                (
                    "1",
                    &[
                        ("10.0.0.1", CheckStatus::Passing),
                        ("10.0.0.2", CheckStatus::Passing),
                    ],
                ),
                ("2", &[("10.0.0.2", CheckStatus::Passing)]),
            ]),
        );

        assert_eq!(
            plan(&snapshot),
            Some(Action::CleanupStaleRegistrations {
                group: "abc".to_string(),
                instance: "1".to_string(),
                nodes: vec!["10.0.0.2".to_string()],
            })
        );
    }

    #[test]
    fn test_rule1_registration_on_vanished_node() {
        let mut snapshot = converged();
        snapshot.services.insert(
            "abc".to_string(),
            registrations(&[
                ("1", &[("10.0.0.66", CheckStatus::Passing)]),
                ("2", &[("10.0.0.2", CheckStatus::Passing)]),
            ]),
        );

        assert_eq!(
            plan(&snapshot),
            Some(Action::CleanupStaleRegistrations {
                group: "abc".to_string(),
                instance: "1".to_string(),
                nodes: vec!["10.0.0.66".to_string()],
            })
        );
    }

    #[test]
    fn test_rule2_orphan_containers() {
        let mut snapshot = converged();
        snapshot
            .containers
            .insert("dead".to_string(), containers(&[("1", "10.0.0.1")]));

        assert_eq!(
            plan(&snapshot),
            Some(Action::CleanupLostContainers {
                group: "dead".to_string()
            })
        );
    }

    #[test]
    fn test_rule3_unallocated_blueprint() {
        let mut snapshot = converged();
        snapshot.allocations.remove("abc");

        assert_eq!(
            plan(&snapshot),
            Some(Action::AllocateGroup {
                group: "abc".to_string()
            })
        );
    }

    #[test]
    fn test_rule4_stopped_group() {
        let mut snapshot = converged();
        snapshot.containers.remove("abc");
        snapshot.services.remove("abc");

        assert_eq!(
            plan(&snapshot),
            Some(Action::RerunGroup {
                group: "abc".to_string(),
                reallocate: false,
            })
        );
    }

    #[test]
    fn test_rule4_partial_allocation_reallocates() {
        let mut snapshot = converged();
        snapshot.containers.remove("abc");
        snapshot.services.remove("abc");
        snapshot
            .allocations
            .insert("abc".to_string(), allocation(&[("1", "10.0.0.1")]));

        assert_eq!(
            plan(&snapshot),
            Some(Action::RerunGroup {
                group: "abc".to_string(),
                reallocate: true,
            })
        );
    }

    #[test]
    fn test_rule5_missing_single_allocation() {
        let mut snapshot = converged();
        snapshot
            .allocations
            .insert("abc".to_string(), allocation(&[("1", "10.0.0.1")]));

        assert_eq!(
            plan(&snapshot),
            Some(Action::RecreateMissingAllocation {
                group: "abc".to_string(),
                instance: "2".to_string(),
            })
        );
    }

    #[test]
    fn test_rule6_failing_node_frees_allocation() {
        let mut snapshot = converged();
        snapshot.docker_hosts[0].status = CheckStatus::Critical;
        snapshot
            .containers
            .insert("abc".to_string(), containers(&[("2", "10.0.0.2")]));

        assert_eq!(
            plan(&snapshot),
            Some(Action::UnallocateFromFailingNode {
                group: "abc".to_string(),
                instance: "1".to_string(),
            })
        );
    }

    #[test]
    fn test_rule7_missing_container_on_healthy_node() {
        let mut snapshot = converged();
        snapshot
            .containers
            .insert("abc".to_string(), containers(&[("2", "10.0.0.2")]));

        assert_eq!(
            plan(&snapshot),
            Some(Action::RerunInstance {
                group: "abc".to_string(),
                instance: "1".to_string(),
            })
        );
    }

    #[test]
    fn test_rule8_unregistered_instance() {
        let mut snapshot = converged();
        snapshot.services.insert(
            "abc".to_string(),
            registrations(&[("2", &[("10.0.0.2", CheckStatus::Passing)])]),
        );

        assert_eq!(
            plan(&snapshot),
            Some(Action::RegisterInstance {
                group: "abc".to_string(),
                instance: "1".to_string(),
            })
        );
    }

    #[test]
    fn test_rule9_container_on_wrong_host() {
        let mut snapshot = converged();
        snapshot.containers.insert(
            "abc".to_string(),
            containers(&[("1", "10.0.0.2"), ("2", "10.0.0.2")]),
        );

        assert_eq!(
            plan(&snapshot),
            Some(Action::MigrateInstance {
                group: "abc".to_string(),
                instance: "1".to_string(),
            })
        );
    }

    #[test]
    fn test_rule10_registration_on_wrong_agent() {
        let mut snapshot = converged();
        snapshot.services.insert(
            "abc".to_string(),
            registrations(&[
                ("1", &[("10.0.0.2", CheckStatus::Passing)]),
                ("2", &[("10.0.0.2", CheckStatus::Passing)]),
            ]),
        );

        assert_eq!(
            plan(&snapshot),
            Some(Action::ReregisterInstance {
                group: "abc".to_string(),
                instance: "1".to_string(),
                wrong_node: "10.0.0.2".to_string(),
            })
        );
    }

    #[test]
    fn test_rule11_critical_instance_recreated() {
        let mut snapshot = converged();
        snapshot.services.insert(
            "abc".to_string(),
            registrations(&[
                ("1", &[("10.0.0.1", CheckStatus::Critical)]),
                ("2", &[("10.0.0.2", CheckStatus::Passing)]),
            ]),
        );

        assert_eq!(
            plan(&snapshot),
            Some(Action::RecreateFailedInstance {
                group: "abc".to_string(),
                instance: "1".to_string(),
            })
        );
    }

    #[test]
    fn test_warning_instance_is_left_alone() {
        let mut snapshot = converged();
        snapshot.services.insert(
            "abc".to_string(),
            registrations(&[
                ("1", &[("10.0.0.1", CheckStatus::Warning)]),
                ("2", &[("10.0.0.2", CheckStatus::Passing)]),
            ]),
        );
        assert_eq!(plan(&snapshot), None);
    }

    #[test]
    fn test_rule_order_lost_containers_before_rerun() {
        // A group with containers but no blueprint, plus a stopped group:
        // the orphan cleanup ranks first by group order, rule order breaks
        // the tie within a group.
        let mut snapshot = converged();
        snapshot.containers.remove("abc");
        snapshot.services.remove("abc");
        snapshot
            .containers
            .insert("aaa".to_string(), containers(&[("1", "10.0.0.1")]));

        assert_eq!(
            plan(&snapshot),
            Some(Action::CleanupLostContainers {
                group: "aaa".to_string()
            })
        );
    }

    #[test]
    fn test_stale_registration_outranks_everything() {
        let mut snapshot = converged();
        // a stopped group (rule 4 material) ...
        snapshot.containers.remove("abc");
        // ... and a duplicate registration: rule 1 wins.
        snapshot.services.insert(
            "abc".to_string(),
            registrations(&[(
                "1",
                &[
                    ("10.0.0.1", CheckStatus::Passing),
                    ("10.0.0.2", CheckStatus::Passing),
                ],
            )]),
        );
        // duplicate cleanup needs the emergent container to pick the
        // right survivor
        snapshot
            .containers
            .insert("abc".to_string(), containers(&[("1", "10.0.0.1")]));

        assert!(matches!(
            plan(&snapshot),
            Some(Action::CleanupStaleRegistrations { .. })
        ));
    }
}
