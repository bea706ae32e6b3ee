//! Storage sink — where segments and manifests land.
//!
//! The engines only ever talk to [`StorageSink`]; object-store backends
//! (swift, s3, ...) plug in behind it. [`LocalStorage`] is the built-in
//! directory backend: segments under `<root>/<backup_id>/<seq>` with
//! zero-padded decimal sequence names, the manifest at
//! `<root>/<backup_id>.meta`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no backup named {0:?} in storage")]
    NotFound(String),
    #[error("invalid backup id {0:?}")]
    InvalidBackupId(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait StorageSink: Send + Sync {
    fn write_segment(&self, backup_id: &str, seq: u64, data: &[u8]) -> Result<(), StorageError>;
    fn write_meta(&self, backup_id: &str, data: &[u8]) -> Result<(), StorageError>;
    /// Segments in ascending sequence order.
    fn read_segments(
        &self,
        backup_id: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<Vec<u8>, StorageError>> + Send>, StorageError>;
    fn read_meta(&self, backup_id: &str) -> Result<Vec<u8>, StorageError>;
}

// ── Local directory backend ──────────────────────────────────────────────────

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_owned();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Backup ids become path components; refuse anything that could
    /// escape the storage root.
    fn check_id(backup_id: &str) -> Result<(), StorageError> {
        if backup_id.is_empty()
            || backup_id == "."
            || backup_id == ".."
            || backup_id.contains('/')
            || backup_id.contains('\\')
            || backup_id.contains('\0')
        {
            return Err(StorageError::InvalidBackupId(backup_id.to_owned()));
        }
        Ok(())
    }

    fn segment_dir(&self, backup_id: &str) -> PathBuf {
        self.root.join(backup_id)
    }

    fn meta_path(&self, backup_id: &str) -> PathBuf {
        self.root.join(format!("{backup_id}.meta"))
    }
}

impl StorageSink for LocalStorage {
    fn write_segment(&self, backup_id: &str, seq: u64, data: &[u8]) -> Result<(), StorageError> {
        Self::check_id(backup_id)?;
        let dir = self.segment_dir(backup_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{seq:08}"));
        let mut file = fs::File::create(&path)?;
        file.write_all(data)?;
        debug!(backup_id, seq, bytes = data.len(), "segment written");
        Ok(())
    }

    fn write_meta(&self, backup_id: &str, data: &[u8]) -> Result<(), StorageError> {
        Self::check_id(backup_id)?;
        fs::write(self.meta_path(backup_id), data)?;
        debug!(backup_id, bytes = data.len(), "manifest written");
        Ok(())
    }

    fn read_segments(
        &self,
        backup_id: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<Vec<u8>, StorageError>> + Send>, StorageError>
    {
        Self::check_id(backup_id)?;
        let dir = self.segment_dir(backup_id);
        if !dir.is_dir() {
            return Err(StorageError::NotFound(backup_id.to_owned()));
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        paths.sort();
        Ok(Box::new(
            paths
                .into_iter()
                .map(|p| fs::read(p).map_err(StorageError::from)),
        ))
    }

    fn read_meta(&self, backup_id: &str) -> Result<Vec<u8>, StorageError> {
        Self::check_id(backup_id)?;
        let path = self.meta_path(backup_id);
        if !path.is_file() {
            return Err(StorageError::NotFound(backup_id.to_owned()));
        }
        Ok(fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_come_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        for seq in 0..12u64 {
            storage
                .write_segment("b1", seq, format!("segment {seq}").as_bytes())
                .unwrap();
        }
        let collected: Vec<Vec<u8>> = storage
            .read_segments("b1")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(collected.len(), 12);
        assert_eq!(collected[0], b"segment 0");
        assert_eq!(collected[10], b"segment 10");
    }

    #[test]
    fn meta_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        storage.write_meta("b1", b"{}").unwrap();
        assert_eq!(storage.read_meta("b1").unwrap(), b"{}");
        assert!(matches!(
            storage.read_meta("absent"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn hostile_backup_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        for id in ["", ".", "..", "a/b", "a\\b"] {
            assert!(matches!(
                storage.write_meta(id, b""),
                Err(StorageError::InvalidBackupId(_))
            ));
        }
    }
}
