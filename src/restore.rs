//! Restore applier — consumes the framed stream and rebuilds the tree.
//!
//! Frames are applied sequentially: decode the header, dispatch on entry
//! type, consume the payload. Node-creation failures are logged and the
//! applier moves on (an unprivileged restore must not die on the first
//! device node), but the payload is always drained so the stream stays
//! frame-aligned. Decode failures are fatal; EOF between frames is the
//! terminal state, EOF inside a frame is [`RestoreError::TruncatedStream`].
//!
//! Regular files at level ≥ 1 are patched against their previous content:
//! the token stream is applied into a scratch file in the same directory,
//! reading matched blocks from the original, then renamed into place and
//! truncated to the advertised size. A failed or truncated stream therefore
//! never leaves a grown or half-patched file — the original survives and
//! the scratch is removed.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::delta::{
    apply_delta_from, copy_literal_runs, drain_tokens_from, read_token, Token,
};
use crate::header::{decode_header, parse_header_len, FileType, HeaderError, InodeRecord};
use crate::queue::{Chunk, RichQueue};

#[derive(Error, Debug)]
pub enum RestoreError {
    /// The stream ended in the middle of a frame.
    #[error("backup stream truncated mid-frame")]
    TruncatedStream,
    #[error(transparent)]
    Header(#[from] HeaderError),
    /// A frame names a path that would escape the restore root.
    #[error("frame path escapes the restore root: {0:?}")]
    UnsafePath(String),
    #[error("restore I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for RestoreError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => RestoreError::TruncatedStream,
            io::ErrorKind::InvalidData => {
                RestoreError::Header(HeaderError::Decode(e.to_string()))
            }
            _ => RestoreError::Io(e),
        }
    }
}

// ── Stream reader ────────────────────────────────────────────────────────────

/// Blocking `Read` over the pipeline queue. Frame boundaries never align
/// with queue chunk boundaries except by coincidence, so all framing is
/// done here on a flat byte view.
pub struct StreamReader<'a> {
    queue: &'a RichQueue,
    buf:   Vec<u8>,
    pos:   usize,
    eof:   bool,
}

impl<'a> StreamReader<'a> {
    pub fn new(queue: &'a RichQueue) -> Self {
        Self {
            queue,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// Block until at least one byte is buffered or the stream ends.
    /// Returns false at end of stream.
    fn fill(&mut self) -> bool {
        while self.pos == self.buf.len() {
            if self.eof {
                return false;
            }
            match self.queue.get() {
                Chunk::Data(data) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.buf = data;
                    self.pos = 0;
                }
                Chunk::Wait => continue,
                Chunk::Eof => {
                    self.eof = true;
                    return false;
                }
            }
        }
        true
    }

    fn next_byte(&mut self) -> Option<u8> {
        if !self.fill() {
            return None;
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Some(byte)
    }

    /// True when the stream is cleanly exhausted (only meaningful between
    /// frames).
    pub fn at_end(&mut self) -> bool {
        !self.fill()
    }
}

impl Read for StreamReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || !self.fill() {
            return Ok(0);
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

// ── Applier ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreStats {
    pub frames:      u64,
    pub created:     u64,
    pub removed:     u64,
    pub node_errors: u64,
}

pub struct Applier<'a> {
    restore_root: &'a Path,
    dry_run:      bool,
    stats:        RestoreStats,
}

impl<'a> Applier<'a> {
    pub fn new(restore_root: &'a Path, dry_run: bool) -> Self {
        Self {
            restore_root,
            dry_run,
            stats: RestoreStats::default(),
        }
    }

    /// Consume the whole stream, applying every frame.
    pub fn apply_stream(mut self, reader: &mut StreamReader<'_>) -> Result<RestoreStats, RestoreError> {
        loop {
            let header_len = match self.read_header_len(reader)? {
                Some(len) => len,
                None => break, // clean EOF between frames
            };
            let mut header = vec![0u8; header_len];
            reader
                .read_exact(&mut header)
                .map_err(|_| RestoreError::TruncatedStream)?;
            let (rel_path, record) = decode_header(&header)?;
            self.stats.frames += 1;
            self.apply_frame(reader, &rel_path, &record)?;
        }
        info!(
            frames = self.stats.frames,
            created = self.stats.created,
            removed = self.stats.removed,
            node_errors = self.stats.node_errors,
            "restore stream applied"
        );
        Ok(self.stats)
    }

    fn read_header_len(
        &self,
        reader: &mut StreamReader<'_>,
    ) -> Result<Option<usize>, RestoreError> {
        let mut digits = Vec::with_capacity(8);
        loop {
            match reader.next_byte() {
                None if digits.is_empty() => return Ok(None),
                None => return Err(RestoreError::TruncatedStream),
                Some(0) => break,
                Some(b) => {
                    digits.push(b);
                    if digits.len() > 20 {
                        return Err(HeaderError::Decode(
                            "unterminated header length prefix".into(),
                        )
                        .into());
                    }
                }
            }
        }
        Ok(Some(parse_header_len(&digits)?))
    }

    fn target_path(&self, rel_path: &str) -> Result<PathBuf, RestoreError> {
        let rel = Path::new(rel_path);
        let safe = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if rel_path.is_empty() || !safe {
            return Err(RestoreError::UnsafePath(rel_path.to_owned()));
        }
        Ok(self.restore_root.join(rel))
    }

    fn apply_frame(
        &mut self,
        reader: &mut StreamReader<'_>,
        rel_path: &str,
        record: &InodeRecord,
    ) -> Result<(), RestoreError> {
        let target = self.target_path(rel_path)?;

        if record.deleted {
            self.remove_node(&target);
            return Ok(());
        }

        match record.ftype {
            FileType::Directory => self.make_dir(&target, record),
            FileType::Regular | FileType::Unknown => {
                self.make_reg_file(reader, &target, record)?;
            }
            FileType::Symlink => self.make_symlink(&target, record),
            FileType::CharDevice | FileType::BlockDevice => self.make_device(&target, record),
            FileType::Fifo => self.make_fifo(&target, record),
            FileType::Socket => debug!(path = rel_path, "socket frame skipped"),
        }
        Ok(())
    }

    fn node_error(&mut self, target: &Path, what: &str, e: &io::Error) {
        warn!(path = %target.display(), error = %e, "{what} failed, continuing");
        self.stats.node_errors += 1;
    }

    fn remove_node(&mut self, target: &Path) {
        if self.dry_run || fs::symlink_metadata(target).is_err() {
            return;
        }
        let result = if target.is_dir() {
            fs::remove_dir_all(target)
        } else {
            fs::remove_file(target)
        };
        match result {
            Ok(()) => {
                self.stats.removed += 1;
                debug!(path = %target.display(), "tombstone applied");
            }
            Err(e) => self.node_error(target, "tombstone removal", &e),
        }
    }

    fn make_dir(&mut self, target: &Path, record: &InodeRecord) {
        if self.dry_run {
            return;
        }
        if let Err(e) = fs::create_dir_all(target) {
            self.node_error(target, "mkdir", &e);
            return;
        }
        let perms = fs::Permissions::from_mode(record.mode & 0o7777);
        if let Err(e) = fs::set_permissions(target, perms) {
            self.node_error(target, "chmod", &e);
        }
        self.set_inode(target, record);
        self.stats.created += 1;
    }

    fn make_symlink(&mut self, target: &Path, record: &InodeRecord) {
        if self.dry_run {
            return;
        }
        // symlink(2) refuses to overwrite; replace any stale node.
        if fs::symlink_metadata(target).is_ok() {
            let _ = fs::remove_file(target);
        }
        if let Err(e) = std::os::unix::fs::symlink(&record.lname, target) {
            self.node_error(target, "symlink", &e);
            return;
        }
        let (uid, gid) = resolve_owner(record);
        if let Err(e) = std::os::unix::fs::lchown(target, Some(uid), Some(gid)) {
            warn!(path = %target.display(), error = %e, "lchown failed, continuing");
        }
        self.stats.created += 1;
    }

    fn make_device(&mut self, target: &Path, record: &InodeRecord) {
        if self.dry_run {
            return;
        }
        if fs::symlink_metadata(target).is_ok() {
            let _ = fs::remove_file(target);
        }
        let kind = if record.ftype == FileType::BlockDevice {
            nix::sys::stat::SFlag::S_IFBLK
        } else {
            nix::sys::stat::SFlag::S_IFCHR
        };
        let perm = nix::sys::stat::Mode::from_bits_truncate(record.mode & 0o7777);
        let dev = nix::sys::stat::makedev(record.devmajor, record.devminor);
        match nix::sys::stat::mknod(target, kind, perm, dev) {
            Ok(()) => {
                self.set_inode(target, record);
                self.stats.created += 1;
            }
            Err(e) => self.node_error(target, "mknod", &io::Error::from(e)),
        }
    }

    fn make_fifo(&mut self, target: &Path, record: &InodeRecord) {
        if self.dry_run {
            return;
        }
        if fs::symlink_metadata(target).is_ok() {
            let _ = fs::remove_file(target);
        }
        let perm = nix::sys::stat::Mode::from_bits_truncate(record.mode & 0o7777);
        match nix::unistd::mkfifo(target, perm) {
            Ok(()) => {
                self.set_inode(target, record);
                self.stats.created += 1;
            }
            Err(e) => self.node_error(target, "mkfifo", &io::Error::from(e)),
        }
    }

    // ── Regular files ────────────────────────────────────────────────────────

    fn make_reg_file(
        &mut self,
        reader: &mut StreamReader<'_>,
        target: &Path,
        record: &InodeRecord,
    ) -> Result<(), RestoreError> {
        if record.level_id == 0 {
            self.make_reg_file_full(reader, target, record)
        } else {
            self.make_reg_file_patch(reader, target, record)
        }
    }

    /// Level 0: the payload is the whole file as literal runs.
    fn make_reg_file_full(
        &mut self,
        reader: &mut StreamReader<'_>,
        target: &Path,
        record: &InodeRecord,
    ) -> Result<(), RestoreError> {
        if self.dry_run {
            copy_literal_runs(reader, &mut io::sink(), record.size)?;
            return Ok(());
        }
        match fs::File::create(target) {
            Ok(mut file) => {
                copy_literal_runs(reader, &mut file, record.size)?;
                file.flush().map_err(RestoreError::Io)?;
                drop(file);
                self.finish_reg_file(target, record);
                self.stats.created += 1;
            }
            Err(e) => {
                self.node_error(target, "create", &e);
                // Stay frame-aligned even though the bytes have nowhere to go.
                copy_literal_runs(reader, &mut io::sink(), record.size)?;
            }
        }
        Ok(())
    }

    /// Level ≥ 1: the payload is a terminated token stream. A bare
    /// terminator is a metadata-only refresh — content stays untouched
    /// unless the advertised size is zero.
    fn make_reg_file_patch(
        &mut self,
        reader: &mut StreamReader<'_>,
        target: &Path,
        record: &InodeRecord,
    ) -> Result<(), RestoreError> {
        let first = read_token(reader)?;

        if first == Token::End {
            if self.dry_run {
                return Ok(());
            }
            if record.size == 0 {
                match fs::File::create(target) {
                    Ok(_) => {
                        self.finish_reg_file(target, record);
                        self.stats.created += 1;
                    }
                    Err(e) => self.node_error(target, "create", &e),
                }
            } else {
                self.set_inode(target, record);
            }
            return Ok(());
        }

        if self.dry_run {
            drain_tokens_from(first, reader)?;
            return Ok(());
        }

        let mut basis = fs::File::open(target).ok();
        let scratch = scratch_path(target);
        let scratch_file = match fs::File::create(&scratch) {
            Ok(f) => f,
            Err(e) => {
                self.node_error(target, "create scratch", &e);
                drain_tokens_from(first, reader)?;
                return Ok(());
            }
        };

        let mut out = io::BufWriter::new(scratch_file);
        let applied = apply_delta_from(first, reader, basis.as_mut(), &mut out)
            .and_then(|outcome| out.flush().map(|()| outcome));
        drop(basis);

        match applied {
            Ok(outcome) => {
                let truncate = out
                    .into_inner()
                    .map_err(|e| e.into_error())
                    .and_then(|f| f.set_len(record.size));
                if let Err(e) = truncate.and_then(|()| fs::rename(&scratch, target)) {
                    self.node_error(target, "commit patched file", &e);
                    let _ = fs::remove_file(&scratch);
                    return Ok(());
                }
                debug!(
                    path = %target.display(),
                    tokens = outcome.tokens,
                    bytes = outcome.bytes_out,
                    "patch applied"
                );
                self.finish_reg_file(target, record);
                self.stats.created += 1;
                Ok(())
            }
            Err(e) => {
                // The stream itself is bad (or the basis vanished): remove
                // the scratch so nothing half-patched survives, then fail.
                let _ = fs::remove_file(&scratch);
                Err(e.into())
            }
        }
    }

    fn finish_reg_file(&mut self, target: &Path, record: &InodeRecord) {
        let perms = fs::Permissions::from_mode(record.mode & 0o7777);
        if let Err(e) = fs::set_permissions(target, perms) {
            self.node_error(target, "chmod", &e);
        }
        self.set_inode(target, record);
    }

    /// Ownership and times. Failures are demoted to warnings so an
    /// unprivileged restore completes.
    fn set_inode(&self, target: &Path, record: &InodeRecord) {
        let (uid, gid) = resolve_owner(record);
        if let Err(e) = std::os::unix::fs::chown(target, Some(uid), Some(gid)) {
            warn!(path = %target.display(), error = %e, "chown failed, continuing");
        }
        let mtime = FileTime::from_unix_time(record.mtime, 0);
        if let Err(e) = filetime::set_file_times(target, mtime, mtime) {
            warn!(path = %target.display(), error = %e, "utime failed, continuing");
        }
    }
}

/// Prefer the recorded names over the numeric ids so a restore onto a host
/// with different id assignments lands on the right accounts; fall back to
/// the numeric ids when the names are unknown here.
fn resolve_owner(record: &InodeRecord) -> (u32, u32) {
    let uid = nix::unistd::User::from_name(&record.uname)
        .ok()
        .flatten()
        .map_or(record.uid, |u| u.uid.as_raw());
    let gid = nix::unistd::Group::from_name(&record.gname)
        .ok()
        .flatten()
        .map_or(record.gid, |g| g.gid.as_raw());
    (uid, gid)
}

fn scratch_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map_or_else(|| "unnamed".to_owned(), |n| n.to_string_lossy().into_owned());
    target.with_file_name(format!(".{name}.icebox-partial"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsafe_paths_rejected() {
        let applier = Applier::new(Path::new("/tmp/r"), true);
        assert!(applier.target_path("ok/file").is_ok());
        assert!(applier.target_path("../escape").is_err());
        assert!(applier.target_path("a/../../b").is_err());
        assert!(applier.target_path("/absolute").is_err());
        assert!(applier.target_path("").is_err());
    }

    #[test]
    fn scratch_path_stays_in_dir() {
        let p = scratch_path(Path::new("/x/y/file.txt"));
        assert_eq!(p.parent(), Some(Path::new("/x/y")));
        assert!(p.file_name().unwrap().to_str().unwrap().starts_with('.'));
    }
}
