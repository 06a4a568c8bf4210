//! Archive helpers: deterministic gzip, digests, and small tar utilities.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Gzip with the header mtime pinned to 0 and no embedded file name, so
/// identical input always yields an identical byte stream — and therefore
/// an identical sha256 digest.
pub fn gzip_deterministic(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Wrap one file into an uncompressed tar stream, the shape
/// `put_archive` expects for single-file config uploads.
pub fn tar_single_file(name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    builder
        .append_data(&mut header, name, data)
        .map_err(|e| Error::Transient(format!("tar build: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| Error::Transient(format!("tar build: {e}")))
}

/// Find the target of a symlink entry whose path ends with `suffix`.
/// Used to recover the archived `/opt/tarantool` code link on restore.
pub fn symlink_target(tar_bytes: &[u8], suffix: &str) -> Result<Option<String>> {
    let mut archive = tar::Archive::new(tar_bytes);
    for entry in archive
        .entries()
        .map_err(|e| Error::Transient(format!("tar read: {e}")))?
    {
        let entry = entry.map_err(|e| Error::Transient(format!("tar read: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::Transient(format!("tar read: {e}")))?
            .to_string_lossy()
            .into_owned();
        if !path.ends_with(suffix) {
            continue;
        }
        if let Some(target) = entry
            .link_name()
            .map_err(|e| Error::Transient(format!("tar read: {e}")))?
        {
            return Ok(Some(target.to_string_lossy().into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_is_deterministic() {
        let data = b"snapshot and xlog bytes".repeat(100);
        let first = gzip_deterministic(&data).unwrap();
        let second = gzip_deterministic(&data).unwrap();
        assert_eq!(first, second);
        assert_eq!(sha256_hex(&first), sha256_hex(&second));
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = b"0000000000000010.snap".to_vec();
        let packed = gzip_deterministic(&data).unwrap();
        assert_eq!(gunzip(&packed).unwrap(), data);
    }

    #[test]
    fn test_tar_single_file_readable() {
        let tar_bytes = tar_single_file("app.lua", b"box.cfg{}").unwrap();
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "app.lua");
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "box.cfg{}");
    }

    #[test]
    fn test_symlink_target_found() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "backup/current", "/opt/deploy/2016-04-01T12:00:00")
            .unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let target = symlink_target(&tar_bytes, "current").unwrap();
        assert_eq!(target.as_deref(), Some("/opt/deploy/2016-04-01T12:00:00"));
    }

    #[test]
    fn test_symlink_target_absent() {
        let tar_bytes = tar_single_file("app.lua", b"x").unwrap();
        assert_eq!(symlink_target(&tar_bytes, "current").unwrap(), None);
    }
}
