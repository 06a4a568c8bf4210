//! Tarantool pairs — two replicated application instances with password
//! auth, code deployment history, and backup/restore.

use super::{GroupCore, GroupType};
use crate::backup::{archive, BackupStorage};
use crate::error::{Error, Result};
use crate::state::Fleet;
use crate::task::Task;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const DATA_DIR: &str = "/var/lib/tarantool";
const DEPLOY_DIR: &str = "/opt/deploy";
const CODE_LINK: &str = "/opt/tarantool";

pub struct Tarantool {
    pub core: GroupCore,
}

impl Tarantool {
    pub fn new(fleet: Arc<Fleet>, group_id: &str) -> Tarantool {
        Tarantool {
            core: GroupCore::new(fleet, group_id, GroupType::Tarantool),
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
        core.create_container("1", None, password).await?;
        core.create_container("2", Some(&ip1.to_string()), password)
            .await?;
        fleet.sense.refresh().await?;

        task.log("Enabling replication");
        core.wait_for_instances(task).await?;
        core.enable_replication().await?;

        task.log("Completed creating group");
        Ok(())
    }

    /// Capture a consistent snapshot+xlog set, the deploy tree, and the
    /// code symlink of instance 1 into a digest-named archive.
    pub async fn backup(&self, task: &Task, storage: &BackupStorage) -> Result<String> {
        let core = &self.core;
        let group_id = &core.group_id;
        let num = "1";
        let instance_id = core.instance_id(num);

        task.log(format!("Backing up group '{group_id}'"));

        let services = core.services();
        let host = core.allocated_host(num)?;
        let docker = core.docker_for(&host)?;

        let listing = docker
            .exec(&instance_id, &["ls", DATA_DIR])
            .await?
            .into_result("ls")?;
        let files: Vec<&str> = listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let data_files = backup_file_set(&files)?;
        task.log(format!("Backing up data: {}", data_files.join(", ")));

        let deploy_listing = docker
            .exec(&instance_id, &["ls", DEPLOY_DIR])
            .await?
            .into_result("ls")?;
        let code_dirs: Vec<&str> = deploy_listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if code_dirs.is_empty() {
            task.log("No code to back up");
        } else {
            task.log(format!("Backing up code: {}", code_dirs.join(", ")));
        }

        let tmp_dir = format!("{DATA_DIR}/backup-{}", Uuid::new_v4().simple());
        for dir in [tmp_dir.clone(), format!("{tmp_dir}/code"), format!("{tmp_dir}/data")] {
            docker
                .exec(&instance_id, &["mkdir", "-p", &dir])
                .await?
                .into_result("mkdir")?;
        }

        // Hard links keep the capture cheap and atomic with respect to the
        // engine's own file rotation.
        for file in &data_files {
            docker
                .exec(
                    &instance_id,
                    &["ln", &format!("{DATA_DIR}/{file}"), &format!("{tmp_dir}/data/{file}")],
                )
                .await?
                .into_result("ln")?;
        }
        for dir in &code_dirs {
            docker
                .exec(
                    &instance_id,
                    &["cp", "-a", &format!("{DEPLOY_DIR}/{dir}"), &format!("{tmp_dir}/code/{dir}")],
                )
                .await?
                .into_result("cp")?;
        }
        docker
            .exec(&instance_id, &["cp", "-dp", CODE_LINK, &format!("{tmp_dir}/current")])
            .await?
            .into_result("cp")?;

        let tar = docker.get_archive(&instance_id, &format!("{tmp_dir}/.")).await?;
        let (archive_id, size) = storage.put_archive(&tar).await?;

        docker
            .exec_shell(&instance_id, &format!("rm -rf {DATA_DIR}/backup-*"))
            .await?
            .into_result("rm")?;

        let mem_used_bytes = services
            .instances
            .get(num)
            .map(|i| i.mem_used * 1024 * 1024)
            .unwrap_or(0);

        let backup_id = Uuid::new_v4().simple().to_string();
        storage
            .register_backup(
                &core.fleet.consul,
                &backup_id,
                &archive_id,
                group_id,
                core.kind.as_str(),
                size,
                mem_used_bytes,
            )
            .await?;

        core.fleet.sense.refresh().await?;
        task.log(format!("Completed backup '{backup_id}'"));
        Ok(backup_id)
    }

    pub async fn restore(&self, backup_id: &str, task: &Task) -> Result<()> {
        Tarantool::restore_into(&self.core, backup_id, task).await
    }

    /// Restore an archive into every instance of the group: wipe data and
    /// code, move the archived set into place, re-point the code symlink
    /// to its archived target, restart, and re-wire replication.
    pub(super) async fn restore_into(core: &GroupCore, backup_id: &str, task: &Task) -> Result<()> {
        let group_id = &core.group_id;
        task.log(format!("Restoring group '{group_id}'"));

        let backups = core.fleet.sense.backups();
        let record = backups
            .get(backup_id)
            .ok_or_else(|| Error::NotFound(format!("backup '{backup_id}'")))?;

        let blueprint = core.blueprint()?;
        if record.mem_used_mb() > blueprint.memsize {
            return Err(Error::ConfigInvalid(format!(
                "backed up instance used {} MiB of RAM, but group {} only has {} MiB max",
                record.mem_used_mb(),
                group_id,
                blueprint.memsize
            )));
        }

        let storage = core.fleet.backup_storage()?;
        let tar = storage.get_archive(&record.archive_id).await?;
        let code_link = archive::symlink_target(&tar, "current")?.ok_or_else(|| {
            Error::InvariantViolation(format!(
                "archive '{}' carries no code symlink",
                record.archive_id
            ))
        })?;

        let nums: Vec<String> = core.allocation().instances.keys().cloned().collect();
        for num in &nums {
            let instance_id = core.instance_id(num);
            task.log(format!("Restoring instance: '{instance_id}'"));

            let host = core.allocated_host(num)?;
            let docker = core.docker_for(&host)?;

            let tmp_dir = format!("{DATA_DIR}/restore-{}", Uuid::new_v4().simple());
            docker
                .exec(&instance_id, &["mkdir", &tmp_dir])
                .await?
                .into_result("mkdir")?;
            docker.put_archive(&instance_id, &tmp_dir, tar.clone()).await?;

            for script in [
                format!("rm -rf {DATA_DIR}/*.snap"),
                format!("rm -rf {DATA_DIR}/*.xlog"),
                format!("ln -snf / {CODE_LINK}"),
                format!("rm -rf {DEPLOY_DIR}/*"),
                format!("mv {tmp_dir}/data/* {DATA_DIR}"),
                format!("mv {tmp_dir}/code/* {DEPLOY_DIR}"),
                format!("ln -snf '{code_link}' {CODE_LINK}"),
                format!("rm -rf '{tmp_dir}'"),
            ] {
                docker
                    .exec_shell(&instance_id, &script)
                    .await?
                    .into_result(&script)?;
            }

            task.log(format!("Restarting instance: '{instance_id}'"));
            docker.restart_container(&instance_id).await?;
        }

        task.log("Enabling replication");
        core.wait_for_instances(task).await?;
        core.enable_replication().await?;

        info!(group = %group_id, backup = backup_id, "Restore finished");
        Ok(())
    }
}

/// The minimal consistent file set: the newest snapshot, the last xlog
/// that starts at or before it, and every xlog after it. Stems are
/// zero-padded LSNs, so lexicographic order is numeric order.
fn backup_file_set(files: &[&str]) -> Result<Vec<String>> {
    let mut snap_lsns: Vec<&str> = files
        .iter()
        .filter_map(|f| f.strip_suffix(".snap"))
        .collect();
    snap_lsns.sort_unstable();
    let mut xlog_lsns: Vec<&str> = files
        .iter()
        .filter_map(|f| f.strip_suffix(".xlog"))
        .collect();
    xlog_lsns.sort_unstable();

    let Some(latest_snap) = snap_lsns.last() else {
        return Err(Error::ExternalFailure(
            "there are no snapshots to backup".to_string(),
        ));
    };

    let mut result = vec![format!("{latest_snap}.snap")];
    if let Some(older) = xlog_lsns.iter().filter(|x| *x <= latest_snap).next_back() {
        result.push(format!("{older}.xlog"));
    }
    for newer in xlog_lsns.iter().filter(|x| *x > latest_snap) {
        result.push(format!("{newer}.xlog"));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_file_set_snap_plus_covering_and_later_xlogs() {
        let files = vec![
            "00000000000000000000.snap",
            "00000000000000000000.xlog",
            "00000000000000000500.snap",
            "00000000000000000400.xlog",
            "00000000000000000700.xlog",
            "00000000000000000900.xlog",
        ];
        let set = backup_file_set(&files).unwrap();
        assert_eq!(
            set,
            vec![
                "00000000000000000500.snap",
                "00000000000000000400.xlog",
                "00000000000000000700.xlog",
                "00000000000000000900.xlog",
            ]
        );
    }

    #[test]
    fn test_backup_file_set_xlog_matching_snap_is_included() {
        let files = vec!["00000000000000000500.snap", "00000000000000000500.xlog"];
        let set = backup_file_set(&files).unwrap();
        assert_eq!(
            set,
            vec!["00000000000000000500.snap", "00000000000000000500.xlog"]
        );
    }

    #[test]
    fn test_backup_file_set_no_older_xlog() {
        let files = vec!["00000000000000000500.snap", "00000000000000000900.xlog"];
        let set = backup_file_set(&files).unwrap();
        assert_eq!(
            set,
            vec!["00000000000000000500.snap", "00000000000000000900.xlog"]
        );
    }

    #[test]
    fn test_backup_file_set_without_snapshots_fails() {
        let files = vec!["00000000000000000900.xlog"];
        assert!(matches!(
            backup_file_set(&files),
            Err(Error::ExternalFailure(_))
        ));
    }

    #[test]
    fn test_backup_file_set_ignores_other_files() {
        let files = vec!["00000000000000000500.snap", "tarantool.log", "backup-1234"];
        let set = backup_file_set(&files).unwrap();
        assert_eq!(set, vec!["00000000000000000500.snap"]);
    }
}
