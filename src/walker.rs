//! Backup walker — produces the framed stream for one generation.
//!
//! Depth-first traversal of the source tree, exclusion globs applied to
//! both the relative path and the entry name, entries emitted in sorted
//! order so identical trees always produce identical streams. Regular files
//! dispatch to full content at level 0 and to the block-delta path at
//! level ≥ 1; after the walk, entries present in the previous manifest but
//! gone from disk are emitted as tombstones.
//!
//! Error policy: any failure to stat, read, or open a source entry aborts
//! the walk. A silently partial backup is worse than a loud failure, so
//! permission errors are never skipped.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use glob::Pattern;
use thiserror::Error;
use tracing::{debug, info};

use crate::checksum::{blockchecksums, BlockSignature, RSYNC_BLOCK_SIZE};
use crate::delta::{emit_full, generate_delta, write_terminator};
use crate::header::{encode_header, FileType, HeaderError, InodeRecord};
use crate::meta::FsMeta;
use crate::queue::{QueueError, RichQueue};

/// Queue chunk size used when streaming payload bytes.
const WRITE_CHUNK: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum WalkError {
    /// Failure to stat/read/open a source entry. Fatal to the backup.
    #[error("cannot read source entry {path:?}: {source}")]
    Entry {
        path:   String,
        source: io::Error,
    },
    /// Entry name cannot travel on the wire (non-UTF-8 or embedded NUL).
    #[error(transparent)]
    BadName(#[from] HeaderError),
    /// The consumer force-stopped the pipeline.
    #[error("backup cancelled")]
    Cancelled,
}

impl WalkError {
    fn entry(path: &Path, source: io::Error) -> Self {
        WalkError::Entry {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<QueueError> for WalkError {
    fn from(_: QueueError) -> Self {
        WalkError::Cancelled
    }
}

// ── Queue adapter ────────────────────────────────────────────────────────────

/// `io::Write` over the pipeline queue, batching payload bytes into
/// fixed-size chunks. The delta generator and the full-content emitter both
/// write through this.
struct QueueWriter<'a> {
    queue: &'a RichQueue,
    buf:   Vec<u8>,
}

impl<'a> QueueWriter<'a> {
    fn new(queue: &'a RichQueue) -> Self {
        Self {
            queue,
            buf: Vec::with_capacity(WRITE_CHUNK),
        }
    }

    fn put_buf(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(WRITE_CHUNK));
            self.queue
                .put(chunk)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipeline cancelled"))?;
        }
        Ok(())
    }
}

impl Write for QueueWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= WRITE_CHUNK {
            self.put_buf()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.put_buf()
    }
}

/// A `BrokenPipe` from [`QueueWriter`] means the consumer aborted; anything
/// else is a real source-read failure.
fn map_io(path: &Path, e: io::Error) -> WalkError {
    if e.kind() == io::ErrorKind::BrokenPipe {
        WalkError::Cancelled
    } else {
        WalkError::entry(path, e)
    }
}

// ── Owner name cache ─────────────────────────────────────────────────────────

/// uid/gid → name resolution, cached per walk. A lookup miss falls back to
/// the numeric string and never fails the walk.
#[derive(Default)]
struct NameCache {
    users:  HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl NameCache {
    fn uname(&mut self, uid: u32) -> String {
        self.users
            .entry(uid)
            .or_insert_with(|| {
                nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
                    .ok()
                    .flatten()
                    .map_or_else(|| uid.to_string(), |u| u.name)
            })
            .clone()
    }

    fn gname(&mut self, gid: u32) -> String {
        self.groups
            .entry(gid)
            .or_insert_with(|| {
                nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
                    .ok()
                    .flatten()
                    .map_or_else(|| gid.to_string(), |g| g.name)
            })
            .clone()
    }
}

// ── Walker ───────────────────────────────────────────────────────────────────

pub struct Walker<'a> {
    root:        &'a Path,
    excludes:    &'a [Pattern],
    dereference: bool,
    prev:        Option<&'a FsMeta>,
    queue:       &'a RichQueue,
    names:       NameCache,
    level:       u32,
    meta:        FsMeta,
}

impl<'a> Walker<'a> {
    pub fn new(
        engine_name: &str,
        root: &'a Path,
        excludes: &'a [Pattern],
        dereference: bool,
        prev: Option<&'a FsMeta>,
        queue: &'a RichQueue,
    ) -> Self {
        let level = FsMeta::next_level(prev);
        Self {
            root,
            excludes,
            dereference,
            prev,
            queue,
            names: NameCache::default(),
            level,
            meta: FsMeta::new(engine_name, level, RSYNC_BLOCK_SIZE as u32),
        }
    }

    /// Run the walk to completion. The queue is finished on success and
    /// force-stopped on error, so the consumer always unblocks.
    pub fn run(mut self) -> Result<FsMeta, WalkError> {
        info!(root = %self.root.display(), level = self.level, "backup walk started");
        let root = self.root;
        let result = self.walk_dir(root, "").and_then(|()| self.emit_tombstones());
        match result {
            Ok(()) => {
                self.queue.finish();
                info!(
                    files = self.meta.files.len(),
                    dirs = self.meta.directories.len(),
                    bytes = self.meta.meta.backup_size_on_disk,
                    "backup walk finished"
                );
                Ok(self.meta)
            }
            Err(e) => {
                self.queue.force_stop();
                Err(e)
            }
        }
    }

    fn excluded(&self, rel_path: &str, name: &str) -> bool {
        self.excludes
            .iter()
            .any(|p| p.matches(rel_path) || p.matches(name))
    }

    fn walk_dir(&mut self, dir: &Path, rel: &str) -> Result<(), WalkError> {
        let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)
            .map_err(|e| WalkError::entry(dir, e))?
            .collect::<Result<_, _>>()
            .map_err(|e| WalkError::entry(dir, e))?;
        entries.sort_by_key(fs::DirEntry::file_name);

        for entry in entries {
            let abs = entry.path();
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    return Err(WalkError::BadName(HeaderError::InvalidPath(
                        raw.to_string_lossy().into_owned(),
                    )))
                }
            };
            let rel_path = if rel.is_empty() {
                name.clone()
            } else {
                format!("{rel}/{name}")
            };
            if self.excluded(&rel_path, &name) {
                debug!(path = %rel_path, "excluded");
                continue;
            }

            let md = self.stat(&abs)?;
            let (record, ftype) = self.inode_record(&abs, &md)?;
            match ftype {
                // Sockets and unclassifiable entries are never archived.
                FileType::Socket | FileType::Unknown => {
                    debug!(path = %rel_path, "skipped (not archivable)");
                }
                FileType::Directory => {
                    self.put_header(&rel_path, &record)?;
                    self.meta.insert_dir(rel_path.clone(), record);
                    self.walk_dir(&abs, &rel_path)?;
                }
                _ => self.process_file(&rel_path, &abs, record)?,
            }
        }
        Ok(())
    }

    fn stat(&self, abs: &Path) -> Result<fs::Metadata, WalkError> {
        let md = if self.dereference {
            fs::metadata(abs)
        } else {
            fs::symlink_metadata(abs)
        };
        md.map_err(|e| WalkError::entry(abs, e))
    }

    fn inode_record(
        &mut self,
        abs: &Path,
        md: &fs::Metadata,
    ) -> Result<(InodeRecord, FileType), WalkError> {
        let ft = md.file_type();
        let ftype = if ft.is_file() {
            FileType::Regular
        } else if ft.is_dir() {
            FileType::Directory
        } else if ft.is_symlink() {
            FileType::Symlink
        } else if ft.is_char_device() {
            FileType::CharDevice
        } else if ft.is_block_device() {
            FileType::BlockDevice
        } else if ft.is_fifo() {
            FileType::Fifo
        } else if ft.is_socket() {
            FileType::Socket
        } else {
            FileType::Unknown
        };

        let lname = if ftype == FileType::Symlink {
            let target = fs::read_link(abs).map_err(|e| WalkError::entry(abs, e))?;
            target
                .into_os_string()
                .into_string()
                .map_err(|raw| {
                    WalkError::BadName(HeaderError::InvalidPath(
                        raw.to_string_lossy().into_owned(),
                    ))
                })?
        } else {
            String::new()
        };

        let record = InodeRecord {
            inumber:  md.ino(),
            nlink:    md.nlink(),
            mode:     md.mode(),
            uid:      md.uid(),
            gid:      md.gid(),
            size:     md.size(),
            devmajor: nix::sys::stat::major(md.rdev()),
            devminor: nix::sys::stat::minor(md.rdev()),
            mtime:    md.mtime(),
            ctime:    md.ctime(),
            uname:    self.names.uname(md.uid()),
            gname:    self.names.gname(md.gid()),
            ftype,
            lname,
            rsync_block_size: RSYNC_BLOCK_SIZE as u32,
            level_id: self.level,
            deleted:  false,
        };
        Ok((record, ftype))
    }

    fn put_header(&self, rel_path: &str, record: &InodeRecord) -> Result<(), WalkError> {
        let frame = encode_header(rel_path, record)?;
        self.queue.put(frame)?;
        Ok(())
    }

    fn process_file(
        &mut self,
        rel_path: &str,
        abs: &Path,
        record: InodeRecord,
    ) -> Result<(), WalkError> {
        if record.ftype == FileType::Regular {
            self.meta.meta.backup_size_on_disk += record.size;
        }
        match self.prev {
            None => self.emit_level_zero(rel_path, abs, record),
            Some(prev) => self.compute_incrementals(rel_path, abs, record, prev),
        }
    }

    fn emit_level_zero(
        &mut self,
        rel_path: &str,
        abs: &Path,
        record: InodeRecord,
    ) -> Result<(), WalkError> {
        self.put_header(rel_path, &record)?;
        let sigs = if record.ftype == FileType::Regular {
            let sigs = self.signatures_of(abs)?;
            if record.size > 0 {
                let mut file = fs::File::open(abs).map_err(|e| WalkError::entry(abs, e))?;
                let mut out = QueueWriter::new(self.queue);
                emit_full(&mut file, record.size, &mut out).map_err(|e| map_io(abs, e))?;
                out.flush().map_err(|e| map_io(abs, e))?;
            }
            sigs
        } else {
            Vec::new()
        };
        self.meta.insert_file(rel_path.to_owned(), record, &sigs);
        Ok(())
    }

    /// Level ≥ 1 dispatch: new file → full content as one literal stream;
    /// modified regular → block delta against the previous signatures;
    /// anything else → metadata-only refresh.
    fn compute_incrementals(
        &mut self,
        rel_path: &str,
        abs: &Path,
        record: InodeRecord,
        prev: &FsMeta,
    ) -> Result<(), WalkError> {
        let old = prev.get_old_file_meta(rel_path);
        let is_reg = record.ftype == FileType::Regular;

        let sigs = match old {
            None => {
                // New since the previous generation: ship it whole.
                self.put_header(rel_path, &record)?;
                if is_reg {
                    let sigs = self.signatures_of(abs)?;
                    let mut file =
                        fs::File::open(abs).map_err(|e| WalkError::entry(abs, e))?;
                    let mut out = QueueWriter::new(self.queue);
                    emit_full(&mut file, record.size, &mut out).map_err(|e| map_io(abs, e))?;
                    write_terminator(&mut out).map_err(|e| map_io(abs, e))?;
                    out.flush().map_err(|e| map_io(abs, e))?;
                    sigs
                } else {
                    Vec::new()
                }
            }
            Some(old) if is_reg && FsMeta::is_file_modified(&old.inode, &record) => {
                let sigs = self.signatures_of(abs)?;
                self.put_header(rel_path, &record)?;
                let file = fs::File::open(abs).map_err(|e| WalkError::entry(abs, e))?;
                let mut out = QueueWriter::new(self.queue);
                let stats = generate_delta(file, &old.signatures(), &mut out)
                    .map_err(|e| map_io(abs, e))?;
                out.flush().map_err(|e| map_io(abs, e))?;
                debug!(
                    path = rel_path,
                    matched = stats.matched_blocks,
                    literal = stats.literal_bytes,
                    "delta emitted"
                );
                sigs
            }
            Some(old) => {
                // Unchanged, or a non-regular entry: header only. Unchanged
                // regulars still need the terminator so the applier can
                // frame the (empty) token stream.
                self.put_header(rel_path, &record)?;
                if is_reg {
                    let mut out = QueueWriter::new(self.queue);
                    write_terminator(&mut out).map_err(|e| map_io(abs, e))?;
                    out.flush().map_err(|e| map_io(abs, e))?;
                    old.signatures()
                } else {
                    Vec::new()
                }
            }
        };

        self.meta.insert_file(rel_path.to_owned(), record, &sigs);
        Ok(())
    }

    fn signatures_of(&self, abs: &Path) -> Result<Vec<BlockSignature>, WalkError> {
        let file = fs::File::open(abs).map_err(|e| WalkError::entry(abs, e))?;
        blockchecksums(file).map_err(|e| WalkError::entry(abs, e))
    }

    /// Emit a tombstone frame for every live entry of the previous
    /// generation that no longer exists in this one. Vanished directories
    /// are covered by the same enumeration since they are manifest entries
    /// too.
    fn emit_tombstones(&mut self) -> Result<(), WalkError> {
        let prev = match self.prev {
            Some(prev) => prev,
            None => return Ok(()),
        };
        let vanished: Vec<(String, InodeRecord)> = prev
            .live_files()
            .filter(|(path, _)| !self.meta.files.contains_key(*path))
            .map(|(path, entry)| (path.clone(), entry.inode.clone()))
            .collect();

        for (path, old_inode) in vanished {
            let mut record = old_inode;
            record.deleted = true;
            record.size = 0;
            record.level_id = self.level;
            self.put_header(&path, &record)?;
            debug!(path = %path, "tombstone emitted");
            self.meta.insert_file(path, record, &[]);
        }
        Ok(())
    }
}
