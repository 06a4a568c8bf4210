//! Healer — drives the cluster from observed state to declared state by
//! repeatedly applying the highest-priority reconciliation rule.

mod rules;

pub use rules::{plan, Action};

use crate::error::Result;
use crate::group::{GroupCore, GroupType};
use crate::sense::WorldSnapshot;
use crate::state::Fleet;
use crate::task::Task;
use std::sync::Arc;
use tracing::{info, warn};

/// Upper bound on rules applied per invocation. Every rule strictly
/// shrinks the set of instances out of their intended state, so a healthy
/// cluster converges in a handful of passes; the cap only guards against
/// a rule that keeps planning itself.
const MAX_PASSES: u32 = 32;

pub struct Healer {
    fleet: Arc<Fleet>,
}

impl Healer {
    pub fn new(fleet: Arc<Fleet>) -> Healer {
        Healer { fleet }
    }

    /// One healing run: refresh, plan, apply, repeat until a pass plans
    /// nothing. Rule failures are logged and end the run — the next
    /// invocation retries from a fresh snapshot, and every rule is
    /// idempotent.
    pub async fn heal(&self) -> Result<()> {
        for pass in 1..=MAX_PASSES {
            self.fleet.sense.refresh().await?;
            let snapshot = self.fleet.sense.snapshot();

            let Some(action) = rules::plan(&snapshot) else {
                if pass > 1 {
                    info!("Healing converged after {} rule applications", pass - 1);
                }
                return Ok(());
            };

            info!("Healing: {action}");
            if let Err(e) = self.apply(&action, &snapshot).await {
                warn!("Healing rule failed ({action}): {e}; will retry on the next run");
                return Ok(());
            }
        }

        warn!("Healing did not converge within {MAX_PASSES} passes; giving up until next run");
        Ok(())
    }

    fn core_for(&self, group: &str, snapshot: &WorldSnapshot) -> GroupCore {
        let kind = snapshot
            .blueprints
            .get(group)
            .map(|b| b.group_type)
            .or_else(|| {
                snapshot
                    .services
                    .get(group)
                    .and_then(|s| GroupType::parse(&s.group_type))
            })
            .unwrap_or(GroupType::Memcached);
        GroupCore::new(self.fleet.clone(), group, kind)
    }

    async fn apply(&self, action: &Action, snapshot: &WorldSnapshot) -> Result<()> {
        match action {
            Action::CleanupStaleRegistrations {
                group,
                instance,
                nodes,
            } => {
                let core = self.core_for(group, snapshot);
                for node in nodes {
                    core.unregister_instance_on(instance, node).await?;
                }
                Ok(())
            }

            Action::CleanupLostContainers { group } => {
                let core = self.core_for(group, snapshot);
                let container_nums: Vec<String> = snapshot
                    .containers
                    .get(group)
                    .map(|c| c.instances.keys().cloned().collect())
                    .unwrap_or_default();
                for num in &container_nums {
                    core.remove_container(num).await?;
                }
                core.unallocate_group().await?;
                let service_nums: Vec<String> = snapshot
                    .services
                    .get(group)
                    .map(|s| s.instances.keys().cloned().collect())
                    .unwrap_or_default();
                for num in &service_nums {
                    core.unregister_instance(num).await?;
                }
                Ok(())
            }

            Action::AllocateGroup { group } => {
                let core = self.core_for(group, snapshot);
                // Whatever is running or registered predates the current
                // blueprint and must go before the fresh placement.
                let container_nums: Vec<String> = snapshot
                    .containers
                    .get(group)
                    .map(|c| c.instances.keys().cloned().collect())
                    .unwrap_or_default();
                for num in &container_nums {
                    core.remove_container(num).await?;
                }
                let service_nums: Vec<String> = snapshot
                    .services
                    .get(group)
                    .map(|s| s.instances.keys().cloned().collect())
                    .unwrap_or_default();
                for num in &service_nums {
                    core.unregister_instance(num).await?;
                }

                core.allocate_group().await?;
                self.fleet.sense.refresh().await?;

                let task = Task::new("heal", Some(group));
                core.run_group(&task).await?;
                core.register_group().await
            }

            Action::RerunGroup { group, reallocate } => {
                let core = self.core_for(group, snapshot);
                let service_nums: Vec<String> = snapshot
                    .services
                    .get(group)
                    .map(|s| s.instances.keys().cloned().collect())
                    .unwrap_or_default();
                for num in &service_nums {
                    core.unregister_instance(num).await?;
                }

                if *reallocate {
                    core.unallocate_group().await?;
                    core.allocate_group().await?;
                }
                self.fleet.sense.refresh().await?;

                let task = Task::new("heal", Some(group));
                core.run_group(&task).await?;
                core.register_group().await
            }

            Action::RecreateMissingAllocation { group, instance } => {
                let core = self.core_for(group, snapshot);
                core.remove_container(instance).await?;
                core.unregister_instance(instance).await?;
                core.allocate_instance(instance).await?;
                self.fleet.sense.refresh().await?;
                core.run_instance(instance).await?;
                core.register_instance(instance).await
            }

            Action::UnallocateFromFailingNode { group, instance } => {
                let core = self.core_for(group, snapshot);
                core.unallocate_instance(instance).await?;
                core.unregister_instance(instance).await
            }

            Action::RerunInstance { group, instance } => {
                let core = self.core_for(group, snapshot);
                core.run_instance(instance).await
            }

            Action::RegisterInstance { group, instance } => {
                let core = self.core_for(group, snapshot);
                core.register_instance(instance).await
            }

            Action::MigrateInstance { group, instance } => {
                let core = self.core_for(group, snapshot);
                core.remove_container(instance).await?;
                core.run_instance(instance).await
            }

            Action::ReregisterInstance {
                group,
                instance,
                wrong_node,
            } => {
                let core = self.core_for(group, snapshot);
                core.unregister_instance_on(instance, wrong_node).await?;
                core.register_instance(instance).await
            }

            Action::RecreateFailedInstance { group, instance } => {
                let core = self.core_for(group, snapshot);
                core.remove_container(instance).await?;
                core.unregister_instance(instance).await?;
                core.unallocate_instance(instance).await?;
                self.fleet.sense.refresh().await?;
                core.allocate_instance(instance).await?;
                self.fleet.sense.refresh().await?;
                core.run_instance(instance).await?;
                core.register_instance(instance).await
            }
        }
    }
}
