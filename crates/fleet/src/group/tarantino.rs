//! Tarantino groups — a single application instance, no replication. The
//! service check only asserts the container runs; replication and memory
//! checks do not apply.

use super::{GroupCore, GroupType};
use crate::error::Result;
use crate::state::Fleet;
use crate::task::Task;
use std::sync::Arc;

pub struct Tarantino {
    pub core: GroupCore,
}

impl Tarantino {
    pub fn new(fleet: Arc<Fleet>, group_id: &str) -> Tarantino {
        Tarantino {
            core: GroupCore::new(fleet, group_id, GroupType::Tarantino),
        }
    }

    pub async fn create(
        &self,
        task: &Task,
        name: &str,
        memsize: u64,
        password: Option<&str>,
        check_period: u64,
    ) -> Result<()> {
        let core = &self.core;
        let fleet = &core.fleet;

        task.log(format!("Creating group '{}'", core.group_id));

        let settings = fleet.sense.network_settings();
        let blueprints = fleet.sense.blueprints();
        let ip = fleet.ip_pool.allocate(&settings, &blueprints, &[])?;

        core.write_blueprint(name, memsize, check_period, &[ip]).await?;
        fleet.sense.refresh().await?;

        task.log("Allocating instance to physical nodes");
        core.allocate_group().await?;
        fleet.sense.refresh().await?;

        task.log("Registering services");
        core.register_group().await?;
        fleet.sense.refresh().await?;

        task.log("Creating containers");
        core.create_container("1", None, password).await?;
        fleet.sense.refresh().await?;

        task.log("Completed creating group");
        Ok(())
    }
}
