//! Filesystem backup backend: archives live under a base directory, named
//! by their digest.

use crate::error::{Error, Result};
use std::path::PathBuf;
use uuid::Uuid;

pub struct FilesystemStorage {
    base_dir: PathBuf,
}

impl FilesystemStorage {
    pub fn new(base_dir: &str) -> Result<Self> {
        let base_dir = PathBuf::from(base_dir);
        if !base_dir.exists() {
            return Err(Error::ConfigInvalid(format!(
                "backup base dir '{}' does not exist",
                base_dir.display()
            )));
        }
        Ok(FilesystemStorage { base_dir })
    }

    fn archive_path(&self, digest: &str) -> PathBuf {
        self.base_dir.join(format!("{digest}.tar.gz"))
    }

    /// Store pre-compressed archive bytes under their digest. Written to a
    /// pending name first so a crash never leaves a digest-named partial
    /// file behind.
    pub async fn put(&self, digest: &str, compressed: &[u8]) -> Result<()> {
        let pending = self
            .base_dir
            .join(format!("{}_pending.tar.gz", Uuid::new_v4().simple()));
        tokio::fs::write(&pending, compressed).await?;
        tokio::fs::rename(&pending, self.archive_path(digest)).await?;
        Ok(())
    }

    pub async fn get(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.archive_path(digest);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("archive '{digest}'")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, digest: &str) -> Result<()> {
        match tokio::fs::remove_file(self.archive_path(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path().to_str().unwrap()).unwrap();

        storage.put("abcd", b"archive bytes").await.unwrap();
        assert_eq!(storage.get("abcd").await.unwrap(), b"archive bytes");

        storage.delete("abcd").await.unwrap();
        assert!(matches!(
            storage.get("abcd").await,
            Err(Error::NotFound(_))
        ));
        // deleting again is a no-op
        storage.delete("abcd").await.unwrap();
    }

    #[test]
    fn test_missing_base_dir_rejected() {
        assert!(matches!(
            FilesystemStorage::new("/definitely/not/a/dir"),
            Err(Error::ConfigInvalid(_))
        ));
    }
}
