//! Memcached pairs — two replicated instances speaking the memcached
//! protocol. No user password; clients talk to whichever member is up.

use super::{GroupCore, GroupType};
use crate::error::Result;
use crate::state::Fleet;
use crate::task::Task;
use std::sync::Arc;

pub struct Memcached {
    pub core: GroupCore,
}

impl Memcached {
    pub fn new(fleet: Arc<Fleet>, group_id: &str) -> Memcached {
        Memcached {
            core: GroupCore::new(fleet, group_id, GroupType::Memcached),
        }
    }

    pub async fn create(
        &self,
        task: &Task,
        name: &str,
        memsize: u64,
        _password: Option<&str>,
        check_period: u64,
    ) -> Result<()> {
        let core = &self.core;
        let fleet = &core.fleet;

        task.log(format!("Creating group '{}'", core.group_id));

        let settings = fleet.sense.network_settings();
        let blueprints = fleet.sense.blueprints();
        let ip1 = fleet.ip_pool.allocate(&settings, &blueprints, &[])?;
        let ip2 = fleet.ip_pool.allocate(&settings, &blueprints, &[])?;

        core.write_blueprint(name, memsize, check_period, &[ip1, ip2])
            .await?;
        fleet.sense.refresh().await?;

        task.log("Allocating instance to physical nodes");
        core.allocate_group().await?;
        fleet.sense.refresh().await?;

        task.log("Registering services");
        core.register_group().await?;
        fleet.sense.refresh().await?;

        task.log("Creating containers");
        core.create_container("1", None, None).await?;
        core.create_container("2", Some(&ip1.to_string()), None).await?;
        fleet.sense.refresh().await?;

        task.log("Enabling replication");
        core.wait_for_instances(task).await?;
        core.enable_replication().await?;

        task.log("Completed creating group");
        Ok(())
    }
}
