//! `ps` row synthesis: one line per blueprint instance, with a state
//! derived from the registration, emergent, and allocation views.

use fleet::sense::WorldSnapshot;

pub const PS_HEADER: [&str; 8] = [
    "GROUP",
    "INSTANCE #",
    "NAME",
    "TYPE",
    "SIZE",
    "STATE",
    "ADDRESS",
    "NODE",
];

/// One row per instance of every blueprint, in group order.
pub fn ps_rows(snapshot: &WorldSnapshot) -> Vec<Vec<String>> {
    let mut rows = Vec::new();

    for (group, blueprint) in &snapshot.blueprints {
        for (num, instance) in &blueprint.instances {
            let node = snapshot
                .allocations
                .get(group)
                .and_then(|a| a.instances.get(num))
                .map(|a| a.host.clone())
                .unwrap_or_else(|| "N/A".to_string());

            rows.push(vec![
                group.clone(),
                num.clone(),
                blueprint.name.clone(),
                blueprint.group_type.as_str().to_string(),
                blueprint.memsize.to_string(),
                instance_state(snapshot, group, num),
                instance.addr.clone(),
                node,
            ]);
        }
    }

    rows
}

/// Registered instances report their folded check status, except that a
/// stopped container trumps whatever the checks last said. Unregistered
/// instances are `unregistered` when running, `stopped` when present, and
/// `missing` otherwise.
fn instance_state(snapshot: &WorldSnapshot, group: &str, num: &str) -> String {
    let emergent = snapshot
        .containers
        .get(group)
        .and_then(|c| c.instances.get(num));
    let registered = snapshot
        .services
        .get(group)
        .and_then(|s| s.instances.get(num));

    match (registered, emergent) {
        (Some(_), Some(container)) if !container.is_running => "stopped".to_string(),
        (Some(instance), _) => instance.status().to_string(),
        (None, Some(container)) if container.is_running => "unregistered".to_string(),
        (None, Some(_)) => "stopped".to_string(),
        (None, None) => "missing".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet::group::GroupType;
    use fleet::health::CheckStatus;
    use fleet::sense::{
        AllocatedInstance, Allocation, Blueprint, BlueprintInstance, ContainerGroup,
        ContainerInstance, ServiceEntry, ServiceGroup, ServiceInstance,
    };
    use std::collections::BTreeMap;

    fn snapshot() -> WorldSnapshot {
        let mut snapshot = WorldSnapshot::default();

        let mut instances = BTreeMap::new();
        instances.insert(
            "1".to_string(),
            BlueprintInstance {
                addr: "172.20.0.2".to_string(),
            },
        );
        instances.insert(
            "2".to_string(),
            BlueprintInstance {
                addr: "172.20.0.3".to_string(),
            },
        );
        snapshot.blueprints.insert(
            "abc".to_string(),
            Blueprint {
                group_type: GroupType::Memcached,
                name: "alice".to_string(),
                memsize: 500,
                check_period: 10,
                creation_time: None,
                instances,
            },
        );

        let mut allocation = Allocation::default();
        allocation.instances.insert(
            "1".to_string(),
            AllocatedInstance {
                host: "10.0.0.1".to_string(),
            },
        );
        snapshot.allocations.insert("abc".to_string(), allocation);

        let mut services = ServiceGroup {
            group_type: "memcached".to_string(),
            ..Default::default()
        };
        services.instances.insert(
            "1".to_string(),
            ServiceInstance {
                addr: "172.20.0.2:3301".to_string(),
                port: 3301,
                mem_used: 0,
                entries: vec![ServiceEntry {
                    node: "10.0.0.1".to_string(),
                    status: CheckStatus::Passing,
                }],
            },
        );
        snapshot.services.insert("abc".to_string(), services);

        let mut containers = ContainerGroup::default();
        containers.instances.insert(
            "1".to_string(),
            ContainerInstance {
                addr: Some("172.20.0.2".to_string()),
                host: "10.0.0.1".to_string(),
                is_running: true,
                image_name: "tarantool-cloud-memcached".to_string(),
                image_id: "abcdef".to_string(),
            },
        );
        snapshot.containers.insert("abc".to_string(), containers);

        snapshot
    }

    #[test]
    fn test_rows_cover_all_blueprint_instances() {
        let rows = ps_rows(&snapshot());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "abc");
        assert_eq!(rows[0][5], "passing");
        // instance 2 has no allocation, registration or container
        assert_eq!(rows[1][5], "missing");
        assert_eq!(rows[1][7], "N/A");
    }

    #[test]
    fn test_stopped_container_overrides_checks() {
        let mut snapshot = snapshot();
        snapshot
            .containers
            .get_mut("abc")
            .unwrap()
            .instances
            .get_mut("1")
            .unwrap()
            .is_running = false;

        let rows = ps_rows(&snapshot);
        assert_eq!(rows[0][5], "stopped");
    }

    #[test]
    fn test_running_without_registration_is_unregistered() {
        let mut snapshot = snapshot();
        snapshot.services.clear();

        let rows = ps_rows(&snapshot);
        assert_eq!(rows[0][5], "unregistered");
    }
}
