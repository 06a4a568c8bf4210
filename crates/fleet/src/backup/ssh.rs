//! SSH backup backend: archives are shipped to a remote base directory
//! with scp; deletion runs rm over ssh.

use crate::error::{Error, Result};
use std::path::PathBuf;
use tokio::process::Command;
use uuid::Uuid;

pub struct SshStorage {
    host: String,
    base_dir: String,
    user: Option<String>,
    identity: Option<String>,
}

impl SshStorage {
    pub fn new(
        host: &str,
        base_dir: &str,
        user: Option<&str>,
        identity: Option<&str>,
    ) -> Self {
        SshStorage {
            host: host.to_string(),
            base_dir: base_dir.to_string(),
            user: user.map(|u| u.to_string()),
            identity: identity.map(|i| i.to_string()),
        }
    }

    fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn remote_path(&self, digest: &str) -> String {
        format!("{}/{digest}.tar.gz", self.base_dir.trim_end_matches('/'))
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-o").arg("BatchMode=yes");
        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd
    }

    async fn run(&self, mut cmd: Command, what: &str) -> Result<()> {
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(Error::ExternalFailure(format!(
                "{what}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn scratch_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("fleet-backup-{}.tar.gz", Uuid::new_v4().simple()))
    }

    pub async fn put(&self, digest: &str, compressed: &[u8]) -> Result<()> {
        let scratch = self.scratch_path();
        tokio::fs::write(&scratch, compressed).await?;

        let mut cmd = self.command("scp");
        cmd.arg(&scratch)
            .arg(format!("{}:{}", self.target(), self.remote_path(digest)));
        let result = self.run(cmd, "scp upload").await;

        tokio::fs::remove_file(&scratch).await.ok();
        result
    }

    pub async fn get(&self, digest: &str) -> Result<Vec<u8>> {
        let scratch = self.scratch_path();

        let mut cmd = self.command("scp");
        cmd.arg(format!("{}:{}", self.target(), self.remote_path(digest)))
            .arg(&scratch);
        self.run(cmd, "scp download").await?;

        let data = tokio::fs::read(&scratch).await?;
        tokio::fs::remove_file(&scratch).await.ok();
        Ok(data)
    }

    pub async fn delete(&self, digest: &str) -> Result<()> {
        let mut cmd = self.command("ssh");
        cmd.arg(self.target())
            .arg(format!("rm -f '{}'", self.remote_path(digest)));
        self.run(cmd, "ssh rm").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_path_and_target() {
        let storage = SshStorage::new("backup.example", "/srv/backups/", Some("ops"), None);
        assert_eq!(storage.target(), "ops@backup.example");
        assert_eq!(
            storage.remote_path("cafe"),
            "/srv/backups/cafe.tar.gz"
        );
    }
}
