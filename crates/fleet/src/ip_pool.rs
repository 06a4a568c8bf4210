//! Fixed-IP leases from the managed subnet.
//!
//! Between the moment an address is handed out and the moment it lands in a
//! blueprint there is a multi-step KV write plus a sense refresh; the
//! reservation cache keeps concurrent callers from picking the same address
//! in that window. Reservations expire after 30 s — by then the blueprint
//! write has either happened (the address shows up in the views) or the
//! operation failed and the address may be reused. Anti-collision across
//! processes is not provided; a single process writes blueprints.

use crate::error::{Error, Result};
use crate::sense::{Blueprint, NetworkSettings};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{debug, info};

const RESERVATION_TTL: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct IpPool {
    reservations: Mutex<HashMap<Ipv4Addr, Instant>>,
}

impl IpPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease the first free address of the subnet. Excluded: current
    /// reservations, every instance address of every blueprint, the
    /// caller's `skip` set, the gateway, and the subnet's network and
    /// broadcast addresses.
    pub fn allocate(
        &self,
        settings: &NetworkSettings,
        blueprints: &BTreeMap<String, Blueprint>,
        skip: &[Ipv4Addr],
    ) -> Result<Ipv4Addr> {
        let subnet = settings
            .subnet
            .as_deref()
            .ok_or_else(|| Error::ConfigInvalid("subnet is not specified in settings".into()))?;
        let net: ipnet::Ipv4Net = subnet
            .parse()
            .map_err(|e| Error::ConfigInvalid(format!("bad subnet '{subnet}': {e}")))?;

        let mut used: HashSet<Ipv4Addr> = skip.iter().copied().collect();
        if let Some(gateway) = settings.gateway_ip.as_deref() {
            if let Ok(ip) = gateway.parse() {
                used.insert(ip);
            }
        }
        for blueprint in blueprints.values() {
            for instance in blueprint.instances.values() {
                if let Ok(ip) = instance.addr.parse() {
                    used.insert(ip);
                }
            }
        }

        self.expire();
        let mut reservations = self.reservations.lock();
        used.extend(reservations.keys().copied());

        for addr in net.hosts() {
            if !used.contains(&addr) {
                reservations.insert(addr, Instant::now());
                debug!(%addr, "Leased address");
                return Ok(addr);
            }
        }

        Err(Error::CapacityExhausted(format!(
            "ip address range {subnet} exhausted"
        )))
    }

    fn expire(&self) {
        let now = Instant::now();
        self.reservations.lock().retain(|addr, reserved_at| {
            let keep = now.duration_since(*reserved_at) < RESERVATION_TTL;
            if !keep {
                info!(%addr, "Expiring reserved address");
            }
            keep
        });
    }

    /// Background sweep so abandoned reservations do not pin addresses
    /// between allocations.
    pub async fn expire_loop(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut interval = time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => self.expire(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupType;
    use crate::sense::BlueprintInstance;

    fn settings(subnet: &str, gateway: Option<&str>) -> NetworkSettings {
        NetworkSettings {
            network_name: Some("im-net".to_string()),
            subnet: Some(subnet.to_string()),
            gateway_ip: gateway.map(|g| g.to_string()),
            create_automatically: false,
        }
    }

    fn blueprint_with(addrs: &[&str]) -> BTreeMap<String, Blueprint> {
        let mut instances = BTreeMap::new();
        for (i, addr) in addrs.iter().enumerate() {
            instances.insert(
                (i + 1).to_string(),
                BlueprintInstance {
                    addr: addr.to_string(),
                },
            );
        }
        let mut blueprints = BTreeMap::new();
        blueprints.insert(
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
        blueprints
    }

    #[test]
    fn test_skips_network_gateway_and_blueprint_addrs() {
        let pool = IpPool::new();
        let settings = settings("172.20.0.0/29", Some("172.20.0.1"));
        let blueprints = blueprint_with(&["172.20.0.2", "172.20.0.3"]);

        let addr = pool.allocate(&settings, &blueprints, &[]).unwrap();
        assert_eq!(addr, "172.20.0.4".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_reservation_blocks_reuse() {
        let pool = IpPool::new();
        let settings = settings("172.20.0.0/29", None);
        let blueprints = BTreeMap::new();

        let first = pool.allocate(&settings, &blueprints, &[]).unwrap();
        let second = pool.allocate(&settings, &blueprints, &[]).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_exhaustion() {
        let pool = IpPool::new();
        // /30 has exactly two usable host addresses
        let settings = settings("172.20.0.0/30", None);
        let blueprints = BTreeMap::new();

        pool.allocate(&settings, &blueprints, &[]).unwrap();
        pool.allocate(&settings, &blueprints, &[]).unwrap();
        let err = pool.allocate(&settings, &blueprints, &[]).unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted(_)));
    }

    #[test]
    fn test_missing_subnet_is_config_error() {
        let pool = IpPool::new();
        let settings = NetworkSettings::default();
        let err = pool.allocate(&settings, &BTreeMap::new(), &[]).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn test_caller_skip_respected() {
        let pool = IpPool::new();
        let settings = settings("172.20.0.0/29", None);
        let skip: Vec<Ipv4Addr> = vec!["172.20.0.1".parse().unwrap()];
        let addr = pool.allocate(&settings, &BTreeMap::new(), &skip).unwrap();
        assert_eq!(addr, "172.20.0.2".parse::<Ipv4Addr>().unwrap());
    }
}
