//! View derivation — pure functions turning raw Consul/Docker payloads into
//! the four world views the healer and the CLI consume.

use crate::consul::{CatalogNode, KvPair, ServiceHealthEntry};
use crate::group::GroupType;
use crate::health::{combine_statuses, CheckStatus};
use bollard::models::{ContainerSummary, SystemInfo};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const KV_PREFIX: &str = "tarantool";
pub const SETTINGS_PREFIX: &str = "tarantool_settings";
pub const BACKUPS_PREFIX: &str = "tarantool_backups";

/// The label every managed container carries; lookups filter on it.
pub const MANAGED_LABEL: &str = "tarantool";

/// Consul service advertising docker daemons.
pub const DOCKER_SERVICE: &str = "docker";

// ── Blueprints ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Blueprint {
    pub group_type: GroupType,
    pub name: String,
    /// MiB. Stored as a decimal integer in the KV store; converted to the
    /// GiB float the container environment wants only at that boundary.
    pub memsize: u64,
    pub check_period: u64,
    pub creation_time: Option<DateTime<Utc>>,
    pub instances: BTreeMap<String, BlueprintInstance>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlueprintInstance {
    pub addr: String,
}

// ── Allocations ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allocation {
    pub instances: BTreeMap<String, AllocatedInstance>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocatedInstance {
    pub host: String,
}

// ── Registered services ──────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ServiceGroup {
    pub group_type: String,
    pub instances: BTreeMap<String, ServiceInstance>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceInstance {
    pub addr: String,
    pub port: u16,
    /// MiB, parsed from the memory check's byte-count output.
    pub mem_used: u64,
    /// One per agent carrying the registration. More than one entry means
    /// a stale duplicate the healer must clean up.
    pub entries: Vec<ServiceEntry>,
}

#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub node: String,
    pub status: CheckStatus,
}

impl ServiceInstance {
    pub fn status(&self) -> CheckStatus {
        combine_statuses(self.entries.iter().map(|e| e.status))
    }

    pub fn node(&self) -> Option<&str> {
        self.entries.first().map(|e| e.node.as_str())
    }
}

// ── Emergent containers ──────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ContainerGroup {
    pub instances: BTreeMap<String, ContainerInstance>,
}

#[derive(Debug, Clone)]
pub struct ContainerInstance {
    pub addr: Option<String>,
    pub host: String,
    pub is_running: bool,
    pub image_name: String,
    pub image_id: String,
}

// ── Hosts & settings ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DockerHost {
    /// Docker API endpoint, `host:port`.
    pub addr: String,
    /// Address of the Consul agent on the same machine.
    pub consul_host: String,
    pub tags: Vec<String>,
    pub status: CheckStatus,
    pub cpus: u64,
    pub memory: u64,
}

impl DockerHost {
    /// The host part of the docker endpoint, which is what allocations
    /// store.
    pub fn host(&self) -> &str {
        self.addr.split(':').next().unwrap_or(&self.addr)
    }

    pub fn is_passing(&self) -> bool {
        self.status == CheckStatus::Passing
    }
}

#[derive(Debug, Clone)]
pub struct ConsulHost {
    pub addr: String,
    pub name: String,
    pub status: CheckStatus,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkSettings {
    pub network_name: Option<String>,
    pub subnet: Option<String>,
    pub gateway_ip: Option<String>,
    pub create_automatically: bool,
}

#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub group_type: String,
    pub group_id: String,
    pub archive_id: String,
    pub creation_time: Option<DateTime<Utc>>,
    pub storage: String,
    /// Archive size, bytes.
    pub size: u64,
    /// Memory in use when the backup was taken, bytes.
    pub mem_used: u64,
}

impl BackupRecord {
    pub fn mem_used_mb(&self) -> u64 {
        self.mem_used / (1024 * 1024)
    }
}

// ── Parsers ──────────────────────────────────────────────────────

fn kv_to_map(pairs: &[KvPair]) -> BTreeMap<&str, &str> {
    pairs
        .iter()
        .map(|p| (p.key.as_str(), p.value.as_str()))
        .collect()
}

/// Split `<prefix>/<gid>/<rest>` and return `(gid, rest)`.
fn strip_group_key<'a>(key: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;
    rest.split_once('/')
}

pub fn parse_blueprints(kv: &[KvPair]) -> BTreeMap<String, Blueprint> {
    let map = kv_to_map(kv);
    let mut groups: BTreeMap<String, Blueprint> = BTreeMap::new();

    // The type key anchors a blueprint; everything else attaches to it.
    for (key, value) in &map {
        if let Some((gid, "blueprint/type")) = strip_group_key(key, KV_PREFIX) {
            if let Some(group_type) = GroupType::parse(value) {
                groups.insert(
                    gid.to_string(),
                    Blueprint {
                        group_type,
                        name: String::new(),
                        memsize: 0,
                        check_period: 0,
                        creation_time: None,
                        instances: BTreeMap::new(),
                    },
                );
            } else {
                tracing::error!(group = gid, value, "Blueprint with unknown type");
            }
        }
    }

    for (key, value) in &map {
        let Some((gid, rest)) = strip_group_key(key, KV_PREFIX) else {
            continue;
        };
        let Some(blueprint) = groups.get_mut(gid) else {
            continue;
        };

        match rest {
            "blueprint/name" => blueprint.name = value.to_string(),
            "blueprint/memsize" => {
                blueprint.memsize = value.parse().unwrap_or_else(|_| {
                    tracing::error!(group = gid, value, "Unparseable memsize");
                    0
                });
            }
            "blueprint/check_period" => {
                blueprint.check_period = value.parse().unwrap_or(10);
            }
            "blueprint/creation_time" => {
                blueprint.creation_time = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
            }
            _ => {
                if let Some(num) = rest
                    .strip_prefix("blueprint/instances/")
                    .and_then(|r| r.strip_suffix("/addr"))
                {
                    blueprint.instances.insert(
                        num.to_string(),
                        BlueprintInstance {
                            addr: value.to_string(),
                        },
                    );
                }
            }
        }
    }

    groups
}

pub fn parse_allocations(kv: &[KvPair]) -> BTreeMap<String, Allocation> {
    let mut groups: BTreeMap<String, Allocation> = BTreeMap::new();

    for pair in kv {
        let Some((gid, rest)) = strip_group_key(&pair.key, KV_PREFIX) else {
            continue;
        };
        if let Some(num) = rest
            .strip_prefix("allocation/instances/")
            .and_then(|r| r.strip_suffix("/host"))
        {
            groups.entry(gid.to_string()).or_default().instances.insert(
                num.to_string(),
                AllocatedInstance {
                    host: pair.value.clone(),
                },
            );
        }
    }

    groups
}

pub fn parse_backups(kv: &[KvPair]) -> BTreeMap<String, BackupRecord> {
    let mut backups: BTreeMap<String, BackupRecord> = BTreeMap::new();

    for pair in kv {
        let Some((bid, field)) = strip_group_key(&pair.key, BACKUPS_PREFIX) else {
            continue;
        };
        let record = backups.entry(bid.to_string()).or_insert(BackupRecord {
            group_type: String::new(),
            group_id: String::new(),
            archive_id: String::new(),
            creation_time: None,
            storage: String::new(),
            size: 0,
            mem_used: 0,
        });

        match field {
            "type" => record.group_type = pair.value.clone(),
            "group_id" => record.group_id = pair.value.clone(),
            "archive_id" => record.archive_id = pair.value.clone(),
            "storage" => record.storage = pair.value.clone(),
            "size" => record.size = pair.value.parse().unwrap_or(0),
            "mem_used" => record.mem_used = pair.value.parse().unwrap_or(0),
            "creation_time" => {
                record.creation_time = DateTime::parse_from_rfc3339(&pair.value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
            }
            _ => {}
        }
    }

    backups
}

/// Registered managed instances, keyed by group. Only services tagged with
/// the managed label count; `docker`, `consul` and foreign services are
/// ignored.
pub fn parse_services(
    services: &BTreeMap<String, Vec<ServiceHealthEntry>>,
) -> BTreeMap<String, ServiceGroup> {
    let mut groups: BTreeMap<String, ServiceGroup> = BTreeMap::new();

    for entries in services.values() {
        for entry in entries {
            let tagged = entry
                .service
                .tags
                .as_ref()
                .is_some_and(|tags| tags.iter().any(|t| t == MANAGED_LABEL));
            if !tagged {
                continue;
            }

            let Some((gid, num)) = entry.service.id.split_once('_') else {
                tracing::error!(id = %entry.service.id, "Malformed managed service id");
                continue;
            };

            let mut mem_used = 0;
            for check in &entry.checks {
                if check.name == "Memory Utilization" {
                    if let Ok(bytes) = check.output.trim().parse::<u64>() {
                        mem_used = bytes / (1024 * 1024);
                    }
                }
            }

            let status = combine_statuses(
                entry.checks.iter().map(|c| CheckStatus::parse(&c.status)),
            );

            let group = groups.entry(gid.to_string()).or_default();
            group.group_type = entry.service.service.clone();

            let instance = group.instances.entry(num.to_string()).or_default();
            instance.addr = format!("{}:{}", entry.service_address(), entry.service.port);
            instance.port = entry.service.port;
            if mem_used > 0 {
                instance.mem_used = mem_used;
            }
            instance.entries.push(ServiceEntry {
                node: entry.node.address.clone(),
                status,
            });
        }
    }

    groups
}

/// Live managed containers per group, derived from the per-host listings.
/// `containers` is keyed by the consul node address of the docker host.
pub fn parse_containers(
    containers: &BTreeMap<String, Vec<ContainerSummary>>,
    network_name: Option<&str>,
) -> BTreeMap<String, ContainerGroup> {
    let mut groups: BTreeMap<String, ContainerGroup> = BTreeMap::new();

    for (host, list) in containers {
        for container in list {
            let managed = container
                .labels
                .as_ref()
                .is_some_and(|labels| labels.contains_key(MANAGED_LABEL));
            if !managed {
                continue;
            }

            let Some(name) = container
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/'))
            else {
                continue;
            };
            let Some((gid, num)) = name.split_once('_') else {
                continue;
            };

            let addr = network_name.and_then(|net| {
                container
                    .network_settings
                    .as_ref()
                    .and_then(|ns| ns.networks.as_ref())
                    .and_then(|networks| networks.get(net))
                    .and_then(|endpoint| endpoint.ipam_config.as_ref())
                    .and_then(|ipam| ipam.ipv4_address.clone())
            });

            let is_running = container
                .state
                .as_ref()
                .map(|s| s.to_string().eq_ignore_ascii_case("running"))
                .unwrap_or(false);

            let image_id = container
                .image_id
                .as_deref()
                .map(|id| id.split(':').next_back().unwrap_or(id).to_string())
                .unwrap_or_default();

            groups
                .entry(gid.to_string())
                .or_default()
                .instances
                .insert(
                    num.to_string(),
                    ContainerInstance {
                        addr,
                        host: host.clone(),
                        is_running,
                        image_name: container.image.clone().unwrap_or_default(),
                        image_id,
                    },
                );
        }
    }

    groups
}

/// Docker hosts as advertised by the `docker` service, folded with the
/// probe loop's verdict: a host whose probe is not passing is reported with
/// the probe status no matter what its agent checks say.
pub fn parse_docker_hosts(
    docker_entries: &[ServiceHealthEntry],
    docker_info: &BTreeMap<String, SystemInfo>,
    probe_status: &BTreeMap<String, CheckStatus>,
) -> Vec<DockerHost> {
    let mut hosts = Vec::new();

    for entry in docker_entries {
        let mut addr = entry.service_address().to_string();
        if entry.service.port != 0 {
            addr = format!("{addr}:{}", entry.service.port);
        }

        let mut status = combine_statuses(
            entry.checks.iter().map(|c| CheckStatus::parse(&c.status)),
        );
        match probe_status.get(&addr) {
            Some(CheckStatus::Passing) => {}
            Some(probed) => status = *probed,
            None => status = CheckStatus::Critical,
        }

        let consul_host = entry.node.address.clone();
        let (cpus, memory) = docker_info
            .get(&consul_host)
            .map(|info| {
                (
                    info.ncpu.unwrap_or(0) as u64,
                    info.mem_total.unwrap_or(0) as u64 / (1024 * 1024),
                )
            })
            .unwrap_or((0, 0));

        hosts.push(DockerHost {
            addr,
            consul_host,
            tags: entry.service.tags.clone().unwrap_or_default(),
            status,
            cpus,
            memory,
        });
    }

    hosts
}

pub fn parse_consul_hosts(nodes: &[CatalogNode]) -> Vec<ConsulHost> {
    nodes
        .iter()
        .map(|node| ConsulHost {
            addr: format!("{}:8300", node.address),
            name: node.node.clone(),
            status: CheckStatus::Passing,
        })
        .collect()
}

pub fn parse_network_settings(kv: &[KvPair], defaults: &NetworkSettings) -> NetworkSettings {
    let mut settings = NetworkSettings {
        network_name: None,
        subnet: None,
        gateway_ip: defaults.gateway_ip.clone(),
        create_automatically: defaults.create_automatically,
    };

    for pair in kv {
        match pair.key.as_str() {
            "tarantool_settings/network_name" => {
                settings.network_name = Some(pair.value.clone());
            }
            "tarantool_settings/subnet" => settings.subnet = Some(pair.value.clone()),
            _ => {}
        }
    }

    settings.network_name = settings
        .network_name
        .filter(|v| !v.is_empty())
        .or_else(|| defaults.network_name.clone());
    settings.subnet = settings
        .subnet
        .filter(|v| !v.is_empty())
        .or_else(|| defaults.subnet.clone());

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(key: &str, value: &str) -> KvPair {
        KvPair {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_parse_blueprints() {
        let pairs = vec![
            kv("tarantool/abc/blueprint/type", "memcached"),
            kv("tarantool/abc/blueprint/name", "alice"),
            kv("tarantool/abc/blueprint/memsize", "500"),
            kv("tarantool/abc/blueprint/check_period", "10"),
            kv(
                "tarantool/abc/blueprint/creation_time",
                "2016-04-01T12:00:00+00:00",
            ),
            kv("tarantool/abc/blueprint/instances/1/addr", "172.20.0.2"),
            kv("tarantool/abc/blueprint/instances/2/addr", "172.20.0.3"),
        ];

        let blueprints = parse_blueprints(&pairs);
        assert_eq!(blueprints.len(), 1);

        let bp = &blueprints["abc"];
        assert_eq!(bp.group_type, GroupType::Memcached);
        assert_eq!(bp.name, "alice");
        assert_eq!(bp.memsize, 500);
        assert_eq!(bp.check_period, 10);
        assert!(bp.creation_time.is_some());
        assert_eq!(bp.instances["1"].addr, "172.20.0.2");
        assert_eq!(bp.instances["2"].addr, "172.20.0.3");
    }

    #[test]
    fn test_parse_blueprints_skips_unknown_type() {
        let pairs = vec![
            kv("tarantool/abc/blueprint/type", "redis"),
            kv("tarantool/abc/blueprint/memsize", "500"),
        ];
        assert!(parse_blueprints(&pairs).is_empty());
    }

    #[test]
    fn test_parse_allocations() {
        let pairs = vec![
            kv("tarantool/abc/allocation/instances/1/host", "10.0.0.1"),
            kv("tarantool/abc/allocation/instances/2/host", "10.0.0.2"),
            kv("tarantool/abc/blueprint/type", "tarantool"),
        ];

        let allocations = parse_allocations(&pairs);
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations["abc"].instances["1"].host, "10.0.0.1");
        assert_eq!(allocations["abc"].instances["2"].host, "10.0.0.2");
    }

    #[test]
    fn test_parse_backups() {
        let pairs = vec![
            kv("tarantool_backups/b1/type", "tarantool"),
            kv("tarantool_backups/b1/group_id", "abc"),
            kv("tarantool_backups/b1/archive_id", "deadbeef"),
            kv("tarantool_backups/b1/storage", "filesystem"),
            kv("tarantool_backups/b1/size", "1024"),
            kv("tarantool_backups/b1/mem_used", "209715200"),
        ];

        let backups = parse_backups(&pairs);
        let record = &backups["b1"];
        assert_eq!(record.group_id, "abc");
        assert_eq!(record.archive_id, "deadbeef");
        assert_eq!(record.size, 1024);
        assert_eq!(record.mem_used_mb(), 200);
    }

    fn service_entry(
        id: &str,
        service: &str,
        node_addr: &str,
        status: &str,
        mem_output: Option<&str>,
    ) -> ServiceHealthEntry {
        let mut checks = vec![serde_json::json!({
            "CheckID": format!("service:{id}"),
            "Name": "Service check",
            "Status": status,
            "Output": ""
        })];
        if let Some(output) = mem_output {
            checks.push(serde_json::json!({
                "CheckID": format!("{id}_memory"),
                "Name": "Memory Utilization",
                "Status": "passing",
                "Output": output
            }));
        }
        serde_json::from_value(serde_json::json!({
            "Node": {"Node": "node", "Address": node_addr},
            "Service": {"ID": id, "Service": service, "Tags": ["tarantool"],
                        "Address": "172.20.0.2", "Port": 3301},
            "Checks": checks
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_services_memory_and_status() {
        let mut services = BTreeMap::new();
        services.insert(
            "tarantool".to_string(),
            vec![service_entry(
                "abc_1",
                "tarantool",
                "10.0.0.1",
                "passing",
                Some("209715200"),
            )],
        );

        let groups = parse_services(&services);
        let instance = &groups["abc"].instances["1"];
        assert_eq!(instance.mem_used, 200);
        assert_eq!(instance.status(), CheckStatus::Passing);
        assert_eq!(instance.node(), Some("10.0.0.1"));
        assert_eq!(instance.addr, "172.20.0.2:3301");
    }

    #[test]
    fn test_parse_services_collects_duplicate_entries() {
        let mut services = BTreeMap::new();
        services.insert(
            "tarantool".to_string(),
            vec![
                service_entry("abc_1", "tarantool", "10.0.0.1", "passing", None),
                service_entry("abc_1", "tarantool", "10.0.0.2", "critical", None),
            ],
        );

        let groups = parse_services(&services);
        let instance = &groups["abc"].instances["1"];
        assert_eq!(instance.entries.len(), 2);
        assert_eq!(instance.status(), CheckStatus::Critical);
    }

    #[test]
    fn test_parse_services_ignores_untagged() {
        let mut entry = service_entry("abc_1", "tarantool", "10.0.0.1", "passing", None);
        entry.service.tags = Some(vec![]);
        let mut services = BTreeMap::new();
        services.insert("tarantool".to_string(), vec![entry]);

        assert!(parse_services(&services).is_empty());
    }

    fn container_summary(name: &str, running: bool, ip: Option<&str>) -> ContainerSummary {
        let networks = ip.map(|ip| {
            serde_json::json!({"im-net": {"IPAMConfig": {"IPv4Address": ip}}})
        });
        serde_json::from_value(serde_json::json!({
            "Id": "c0ffee",
            "Names": [format!("/{name}")],
            "Image": "tarantool-cloud-tarantool",
            "ImageID": "sha256:abcdef",
            "State": if running { "running" } else { "exited" },
            "Labels": {"tarantool": ""},
            "NetworkSettings": {"Networks": networks.unwrap_or(serde_json::json!({}))}
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_containers() {
        let mut by_host = BTreeMap::new();
        by_host.insert(
            "10.0.0.1".to_string(),
            vec![container_summary("abc_1", true, Some("172.20.0.2"))],
        );

        let groups = parse_containers(&by_host, Some("im-net"));
        let instance = &groups["abc"].instances["1"];
        assert_eq!(instance.host, "10.0.0.1");
        assert!(instance.is_running);
        assert_eq!(instance.addr.as_deref(), Some("172.20.0.2"));
        assert_eq!(instance.image_id, "abcdef");
    }

    #[test]
    fn test_parse_containers_skips_unlabeled() {
        let mut summary = container_summary("abc_1", true, None);
        summary.labels = Some(Default::default());
        let mut by_host = BTreeMap::new();
        by_host.insert("10.0.0.1".to_string(), vec![summary]);

        assert!(parse_containers(&by_host, None).is_empty());
    }

    fn docker_entry(node_addr: &str, port: u16, tags: &[&str], status: &str) -> ServiceHealthEntry {
        serde_json::from_value(serde_json::json!({
            "Node": {"Node": "node", "Address": node_addr},
            "Service": {"ID": "docker", "Service": "docker",
                        "Tags": tags.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
                        "Address": "", "Port": port},
            "Checks": [{"CheckID": "service:docker", "Name": "Service check",
                        "Status": status, "Output": ""}]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_docker_hosts_probe_overrides() {
        let entries = vec![docker_entry("10.0.0.1", 2375, &["im"], "passing")];
        let mut probe = BTreeMap::new();
        probe.insert("10.0.0.1:2375".to_string(), CheckStatus::Critical);

        let hosts = parse_docker_hosts(&entries, &BTreeMap::new(), &probe);
        assert_eq!(hosts[0].status, CheckStatus::Critical);
        assert_eq!(hosts[0].host(), "10.0.0.1");
    }

    #[test]
    fn test_parse_docker_hosts_unprobed_is_critical() {
        let entries = vec![docker_entry("10.0.0.1", 2375, &["im"], "passing")];
        let hosts = parse_docker_hosts(&entries, &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(hosts[0].status, CheckStatus::Critical);
    }

    #[test]
    fn test_parse_network_settings_defaults() {
        let defaults = NetworkSettings {
            network_name: Some("im-net".to_string()),
            subnet: Some("172.20.0.0/16".to_string()),
            gateway_ip: Some("172.20.0.1".to_string()),
            create_automatically: true,
        };

        let settings = parse_network_settings(&[], &defaults);
        assert_eq!(settings.network_name.as_deref(), Some("im-net"));
        assert_eq!(settings.subnet.as_deref(), Some("172.20.0.0/16"));

        let overridden = parse_network_settings(
            &[kv("tarantool_settings/subnet", "10.1.0.0/24")],
            &defaults,
        );
        assert_eq!(overridden.subnet.as_deref(), Some("10.1.0.0/24"));
        assert!(overridden.create_automatically);
    }
}
