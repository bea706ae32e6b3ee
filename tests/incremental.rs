//! Incremental chains: modified files travel as block deltas, deletions as
//! tombstones, and replaying B0..Bn reproduces the final tree exactly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use filetime::FileTime;
use icebox::{
    BackupEngine, Compression, FsMeta, LocalStorage, RsyncConfig, RsyncEngine, StorageSink,
};

struct Fixture {
    _root:   tempfile::TempDir,
    source:  PathBuf,
    target:  PathBuf,
    storage: Arc<LocalStorage>,
    engine:  RsyncEngine,
}

impl Fixture {
    fn new(config: RsyncConfig) -> Self {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source");
        let target = root.path().join("target");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&target).unwrap();
        let storage = Arc::new(LocalStorage::new(root.path().join("store")).unwrap());
        let engine_storage: Arc<dyn StorageSink> = storage.clone() as Arc<dyn StorageSink>;
        let engine = RsyncEngine::new(config, engine_storage).unwrap();
        Self {
            _root: root,
            source,
            target,
            storage,
            engine,
        }
    }

    fn write(&self, rel: &str, content: &[u8]) {
        static CLOCK: AtomicI64 = AtomicI64::new(0);
        let path = self.source.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        // Give every write a distinct, strictly increasing mtime so a
        // same-second rewrite still registers as a modification.
        let offset = CLOCK.fetch_add(60, Ordering::SeqCst);
        let bumped = FileTime::from_unix_time(FileTime::now().unix_seconds() + 60 + offset, 0);
        filetime::set_file_mtime(&path, bumped).unwrap();
    }

    fn backup(&self, id: &str, parent: Option<&str>) -> FsMeta {
        let prev = parent.map(|p| self.storage.read_meta(p).unwrap());
        let manifest = self
            .engine
            .backup(id, &self.source, prev.as_deref())
            .unwrap();
        self.engine.post_backup(id, &manifest).unwrap();
        FsMeta::from_bytes(&manifest).unwrap()
    }

    fn restore_chain(&self, ids: &[&str]) {
        for id in ids {
            self.engine.restore(id, &self.target).unwrap();
        }
    }
}

/// Flatten a tree into rel-path → (kind, content) for comparison.
fn snapshot(root: &Path) -> BTreeMap<String, (char, Vec<u8>)> {
    fn visit(root: &Path, dir: &Path, out: &mut BTreeMap<String, (char, Vec<u8>)>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned();
            let md = std::fs::symlink_metadata(&path).unwrap();
            if md.file_type().is_symlink() {
                let target = std::fs::read_link(&path).unwrap();
                out.insert(rel, ('l', target.to_string_lossy().into_owned().into_bytes()));
            } else if md.is_dir() {
                out.insert(rel.clone(), ('d', Vec::new()));
                visit(root, &path, out);
            } else {
                out.insert(rel, ('r', std::fs::read(&path).unwrap()));
            }
        }
    }
    let mut out = BTreeMap::new();
    visit(root, root, &mut out);
    out
}

#[test]
fn s2_incremental_modify() {
    let fx = Fixture::new(RsyncConfig::default());
    fx.write("a/hello.txt", b"hi\n");

    fx.backup("b0", None);
    fx.write("a/hello.txt", b"hi there\n");
    let b1 = fx.backup("b1", Some("b0"));

    assert_eq!(b1.meta.level_id, 1);
    fx.restore_chain(&["b0", "b1"]);
    assert_eq!(
        std::fs::read(fx.target.join("a/hello.txt")).unwrap(),
        b"hi there\n"
    );
}

#[test]
fn small_edit_ships_small_delta() {
    let fx = Fixture::new(RsyncConfig {
        compression: Compression::None,
        ..RsyncConfig::default()
    });
    let original: Vec<u8> = (0..400_000u32).map(|i| (i % 251) as u8).collect();
    fx.write("big.bin", &original);
    let b0 = fx.backup("b0", None);

    let mut edited = original.clone();
    edited[123_456] ^= 0xFF;
    fx.write("big.bin", &edited);
    let b1 = fx.backup("b1", Some("b0"));

    // The delta generation moves a fraction of the file, not the file.
    assert!(b0.meta.backup_size_compressed > 400_000);
    assert!(
        b1.meta.backup_size_compressed < 100_000,
        "incremental stream unexpectedly large: {}",
        b1.meta.backup_size_compressed
    );

    fx.restore_chain(&["b0", "b1"]);
    assert_eq!(std::fs::read(fx.target.join("big.bin")).unwrap(), edited);
}

#[test]
fn s3_deletion_tombstone() {
    let fx = Fixture::new(RsyncConfig::default());
    fx.write("a/hello.txt", b"hi\n");
    std::os::unix::fs::symlink("hello.txt", fx.source.join("a/link")).unwrap();

    fx.backup("b0", None);
    std::fs::remove_file(fx.source.join("a/link")).unwrap();
    let b1 = fx.backup("b1", Some("b0"));

    // Exactly one tombstone frame for the vanished path.
    let entry = b1.files.get("a/link").expect("tombstone recorded");
    assert!(entry.inode.deleted);

    fx.restore_chain(&["b0", "b1"]);
    assert!(fx.target.join("a/hello.txt").exists());
    assert!(std::fs::symlink_metadata(fx.target.join("a/link")).is_err());
}

#[test]
fn deleted_directory_removed_recursively() {
    let fx = Fixture::new(RsyncConfig::default());
    fx.write("keep/file.txt", b"stay");
    fx.write("drop/inner/file.txt", b"go");

    fx.backup("b0", None);
    std::fs::remove_dir_all(fx.source.join("drop")).unwrap();
    fx.backup("b1", Some("b0"));

    fx.restore_chain(&["b0", "b1"]);
    assert!(fx.target.join("keep/file.txt").exists());
    assert!(!fx.target.join("drop").exists());
}

#[test]
fn three_level_chain_composes_exactly() {
    let fx = Fixture::new(RsyncConfig {
        compression: Compression::Gzip,
        ..RsyncConfig::default()
    });

    // T0
    fx.write("docs/readme.md", b"v1");
    fx.write("docs/notes.txt", b"constant");
    fx.write("bin/tool", &vec![0xEEu8; 9000]);
    fx.backup("b0", None);

    // T1: modify, add, delete
    fx.write("docs/readme.md", b"v2 with more words");
    fx.write("new/appeared.txt", b"fresh");
    std::fs::remove_file(fx.source.join("bin/tool")).unwrap();
    fx.backup("b1", Some("b0"));

    // T2: modify again, delete a dir, re-add under the old name
    fx.write("docs/readme.md", b"v3");
    std::fs::remove_dir_all(fx.source.join("new")).unwrap();
    fx.write("bin/tool", b"reborn as text");
    fx.backup("b2", Some("b1"));

    fx.restore_chain(&["b0", "b1", "b2"]);
    assert_eq!(snapshot(&fx.source), snapshot(&fx.target));
}

#[test]
fn unchanged_files_are_metadata_only() {
    let fx = Fixture::new(RsyncConfig {
        compression: Compression::None,
        ..RsyncConfig::default()
    });
    let payload = vec![0x42u8; 200_000];
    fx.write("static.bin", &payload);

    fx.backup("b0", None);
    let b1 = fx.backup("b1", Some("b0"));

    // No content moved for the untouched file.
    assert!(
        b1.meta.backup_size_compressed < 2_000,
        "metadata-only generation too large: {}",
        b1.meta.backup_size_compressed
    );

    fx.restore_chain(&["b0", "b1"]);
    assert_eq!(std::fs::read(fx.target.join("static.bin")).unwrap(), payload);
}

#[test]
fn recreated_after_delete_is_a_new_file() {
    let fx = Fixture::new(RsyncConfig::default());
    fx.write("phoenix.txt", b"first life");
    fx.backup("b0", None);

    std::fs::remove_file(fx.source.join("phoenix.txt")).unwrap();
    fx.backup("b1", Some("b0"));

    fx.write("phoenix.txt", b"second life");
    let b2 = fx.backup("b2", Some("b1"));
    assert!(!b2.files.get("phoenix.txt").unwrap().inode.deleted);

    fx.restore_chain(&["b0", "b1", "b2"]);
    assert_eq!(
        std::fs::read(fx.target.join("phoenix.txt")).unwrap(),
        b"second life"
    );
}

#[test]
fn level_ids_strictly_increase() {
    let fx = Fixture::new(RsyncConfig::default());
    fx.write("f", b"x");
    let b0 = fx.backup("b0", None);
    let b1 = fx.backup("b1", Some("b0"));
    let b2 = fx.backup("b2", Some("b1"));
    assert_eq!(
        (b0.meta.level_id, b1.meta.level_id, b2.meta.level_id),
        (0, 1, 2)
    );
    assert_eq!(b2.files.get("f").unwrap().inode.level_id, 2);
}
