//! Backup storage — archives named by digest, records in the KV store.

pub mod archive;
mod filesystem;
mod ssh;

pub use filesystem::FilesystemStorage;
pub use ssh::SshStorage;

use crate::config::{BackupStorageType, FleetConfig};
use crate::consul::ConsulClient;
use crate::error::{Error, Result};
use crate::sense::{BackupRecord, BACKUPS_PREFIX};
use crate::task::Task;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::info;

pub enum BackupStorage {
    Filesystem(FilesystemStorage),
    Ssh(SshStorage),
}

impl BackupStorage {
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        match config.backup_storage_type {
            BackupStorageType::Filesystem => {
                let base_dir = config.backup_base_dir.as_deref().ok_or_else(|| {
                    Error::ConfigInvalid("filesystem backup storage needs backup_base_dir".into())
                })?;
                Ok(BackupStorage::Filesystem(FilesystemStorage::new(base_dir)?))
            }
            BackupStorageType::Ssh => {
                let host = config.backup_host.as_deref().ok_or_else(|| {
                    Error::ConfigInvalid("ssh backup storage needs backup_host".into())
                })?;
                let base_dir = config.backup_base_dir.as_deref().ok_or_else(|| {
                    Error::ConfigInvalid("ssh backup storage needs backup_base_dir".into())
                })?;
                Ok(BackupStorage::Ssh(SshStorage::new(
                    host,
                    base_dir,
                    config.backup_user.as_deref(),
                    config.backup_identity.as_deref(),
                )))
            }
        }
    }

    pub fn storage_type(&self) -> &'static str {
        match self {
            BackupStorage::Filesystem(_) => "filesystem",
            BackupStorage::Ssh(_) => "ssh",
        }
    }

    /// Compress and store an uncompressed tar stream. Returns the sha256
    /// digest — which is also the archive's name — and the stored size in
    /// bytes. The gzip header is pinned so the digest depends on content
    /// only.
    pub async fn put_archive(&self, tar: &[u8]) -> Result<(String, u64)> {
        let compressed = archive::gzip_deterministic(tar)?;
        let digest = archive::sha256_hex(&compressed);
        let size = compressed.len() as u64;

        match self {
            BackupStorage::Filesystem(fs) => fs.put(&digest, &compressed).await?,
            BackupStorage::Ssh(ssh) => ssh.put(&digest, &compressed).await?,
        }

        Ok((digest, size))
    }

    /// Fetch and decompress an archive back into a tar stream.
    pub async fn get_archive(&self, digest: &str) -> Result<Vec<u8>> {
        let compressed = match self {
            BackupStorage::Filesystem(fs) => fs.get(digest).await?,
            BackupStorage::Ssh(ssh) => ssh.get(digest).await?,
        };
        archive::gunzip(&compressed)
    }

    pub async fn delete_archive(&self, digest: &str) -> Result<()> {
        match self {
            BackupStorage::Filesystem(fs) => fs.delete(digest).await,
            BackupStorage::Ssh(ssh) => ssh.delete(digest).await,
        }
    }

    /// Write the backup record under `tarantool_backups/<bid>/`.
    #[allow(clippy::too_many_arguments)]
    pub async fn register_backup(
        &self,
        consul: &ConsulClient,
        backup_id: &str,
        archive_id: &str,
        group_id: &str,
        group_type: &str,
        size: u64,
        mem_used_bytes: u64,
    ) -> Result<()> {
        let prefix = format!("{BACKUPS_PREFIX}/{backup_id}");
        let creation_time = Utc::now().to_rfc3339();

        consul.kv_put(&format!("{prefix}/group_id"), group_id).await?;
        consul.kv_put(&format!("{prefix}/type"), group_type).await?;
        consul
            .kv_put(&format!("{prefix}/archive_id"), archive_id)
            .await?;
        consul
            .kv_put(&format!("{prefix}/creation_time"), &creation_time)
            .await?;
        consul
            .kv_put(&format!("{prefix}/storage"), self.storage_type())
            .await?;
        consul
            .kv_put(&format!("{prefix}/size"), &size.to_string())
            .await?;
        consul
            .kv_put(&format!("{prefix}/mem_used"), &mem_used_bytes.to_string())
            .await?;

        Ok(())
    }

    /// Remove a backup record, and its archive when no other record still
    /// references the same digest.
    pub async fn unregister_backup(
        &self,
        consul: &ConsulClient,
        backups: &BTreeMap<String, BackupRecord>,
        backup_id: &str,
        task: &Task,
    ) -> Result<()> {
        let record = backups
            .get(backup_id)
            .ok_or_else(|| Error::NotFound(format!("backup '{backup_id}'")))?;
        let archive_id = record.archive_id.clone();

        task.log(format!("Unregistering backup '{backup_id}'"));
        consul
            .kv_delete_recursive(&format!("{BACKUPS_PREFIX}/{backup_id}"))
            .await?;

        let archive_used = backups
            .iter()
            .any(|(id, b)| id != backup_id && b.archive_id == archive_id);

        if archive_used {
            task.log(format!(
                "Archive '{archive_id}' is used by other backups. Keeping it."
            ));
        } else {
            task.log(format!("Archive no longer used: '{archive_id}'. Removing it."));
            self.delete_archive(&archive_id).await?;
        }

        info!(backup = backup_id, "Backup unregistered");
        Ok(())
    }
}
