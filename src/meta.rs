//! FSMeta — the per-generation manifest.
//!
//! One `FsMeta` is created at walk start, mutated only by the walker thread
//! during traversal, sealed when the walk completes, and uploaded as a
//! separate object next to the data stream. On restore it is read-only.
//!
//! Serialization is JSON over `BTreeMap`s, so the same manifest always
//! serializes to the same bytes — the storage sink may deduplicate or
//! checksum manifest objects and relies on that stability.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::checksum::BlockSignature;
use crate::header::{InodeRecord, DATA_VERSION};

/// One manifest entry: the captured inode plus the block signature list
/// (empty for non-regular entries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub inode: InodeRecord,
    /// `(weak, hex(strong))` pairs, one per aligned block.
    pub signature: Vec<(u32, String)>,
}

impl FileEntry {
    pub fn signatures(&self) -> Vec<BlockSignature> {
        self.signature
            .iter()
            .filter_map(|(weak, strong)| BlockSignature::from_manifest_pair(*weak, strong))
            .collect()
    }
}

/// Totals and identity of one backup generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaInfo {
    pub backup_size_on_disk:    u64,
    pub backup_size_compressed: u64,
    pub rsync_block_size:       u32,
    pub data_version:           u32,
    pub platform:               String,
    pub engine:                 String,
    pub level_id:               u32,
    pub created_at:             String,
    /// Stream codec of the data segments; restore reads it from here
    /// rather than trusting the caller to repeat the backup settings.
    pub compression:            String,
    pub encryption:             bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsMeta {
    pub files:       BTreeMap<String, FileEntry>,
    pub directories: BTreeSet<String>,
    pub meta:        MetaInfo,
}

impl FsMeta {
    pub fn new(engine: &str, level_id: u32, rsync_block_size: u32) -> Self {
        Self {
            files:       BTreeMap::new(),
            directories: BTreeSet::new(),
            meta: MetaInfo {
                backup_size_on_disk:    0,
                backup_size_compressed: 0,
                rsync_block_size,
                data_version: DATA_VERSION,
                platform:     std::env::consts::OS.to_owned(),
                engine:       engine.to_owned(),
                level_id,
                created_at:   chrono::Utc::now().to_rfc3339(),
                compression:  String::new(),
                encryption:   false,
            },
        }
    }

    /// Generation id for the next backup in a series: `0` for a base
    /// backup, previous + 1 otherwise.
    pub fn next_level(prev: Option<&FsMeta>) -> u32 {
        prev.map_or(0, |m| m.meta.level_id + 1)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Look up the previous generation's record for a path. Tombstoned
    /// entries answer `None`: a path deleted and re-created is a new file.
    pub fn get_old_file_meta(&self, rel_path: &str) -> Option<&FileEntry> {
        self.files.get(rel_path).filter(|e| !e.inode.deleted)
    }

    /// A change in either mtime or ctime marks the file modified; ctime
    /// catches metadata-only and hardlink churn that mtime misses.
    pub fn is_file_modified(old: &InodeRecord, current: &InodeRecord) -> bool {
        old.mtime != current.mtime || old.ctime != current.ctime
    }

    pub fn insert_file(&mut self, rel_path: String, inode: InodeRecord, sigs: &[BlockSignature]) {
        let signature = sigs.iter().map(BlockSignature::to_manifest_pair).collect();
        self.files.insert(rel_path, FileEntry { inode, signature });
    }

    pub fn insert_dir(&mut self, rel_path: String, inode: InodeRecord) {
        self.directories.insert(rel_path.clone());
        self.files.insert(
            rel_path,
            FileEntry {
                inode,
                signature: Vec::new(),
            },
        );
    }

    /// Live entries of this generation, tombstones excluded.
    pub fn live_files(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.files.iter().filter(|(_, e)| !e.inode.deleted)
    }

    pub fn live_count(&self) -> usize {
        self.live_files().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::FileType;

    fn record(ftype: FileType, mtime: i64, ctime: i64) -> InodeRecord {
        InodeRecord {
            inumber:  1,
            nlink:    1,
            mode:     0o644,
            uid:      0,
            gid:      0,
            size:     10,
            devmajor: 0,
            devminor: 0,
            mtime,
            ctime,
            uname:    "root".into(),
            gname:    "root".into(),
            ftype,
            lname:    String::new(),
            rsync_block_size: 4096,
            level_id: 0,
            deleted:  false,
        }
    }

    #[test]
    fn modified_on_either_timestamp() {
        let old = record(FileType::Regular, 1, 2);
        let same = record(FileType::Regular, 1, 2);
        let mtime_changed = record(FileType::Regular, 3, 2);
        let ctime_changed = record(FileType::Regular, 1, 4);
        assert!(!FsMeta::is_file_modified(&old, &same));
        assert!(FsMeta::is_file_modified(&old, &mtime_changed));
        assert!(FsMeta::is_file_modified(&old, &ctime_changed));
    }

    #[test]
    fn tombstone_hidden_from_lookup() {
        let mut meta = FsMeta::new("rsync", 1, 4096);
        let mut rec = record(FileType::Regular, 1, 1);
        rec.deleted = true;
        meta.insert_file("gone".into(), rec, &[]);
        assert!(meta.get_old_file_meta("gone").is_none());
        assert_eq!(meta.live_count(), 0);
    }

    #[test]
    fn serialization_is_byte_stable() {
        let mut meta = FsMeta::new("rsync", 0, 4096);
        meta.insert_file("b".into(), record(FileType::Regular, 1, 1), &[]);
        meta.insert_file("a".into(), record(FileType::Regular, 2, 2), &[]);
        meta.insert_dir("d".into(), record(FileType::Directory, 3, 3));
        let first = meta.to_bytes().unwrap();
        let second = meta.to_bytes().unwrap();
        assert_eq!(first, second);

        let reparsed = FsMeta::from_bytes(&first).unwrap();
        assert_eq!(reparsed.to_bytes().unwrap(), first);
    }

    #[test]
    fn level_progression() {
        assert_eq!(FsMeta::next_level(None), 0);
        let base = FsMeta::new("rsync", 0, 4096);
        assert_eq!(FsMeta::next_level(Some(&base)), 1);
    }
}
