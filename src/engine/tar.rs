//! Tar-mode engine — a thin driver over an external tar-compatible
//! archiver, bound to the same queue, encryption, and segment plumbing as
//! the rsync engine.
//!
//! The archiver is exec'd directly with an argv list — never through a
//! shell — so exclude patterns and paths cannot be mangled by quoting.
//! Compression is delegated to the archiver's own flag surface; the
//! engine-side pipeline applies encryption only, so the stream is never
//! compressed twice. Incremental state is the archiver's listed-incremental
//! snapshot file, uploaded as the generation's manifest.
//!
//! Restore supervision polls at 1-second granularity instead of joining the
//! writer outright; that is what keeps cancellation and archiver-failure
//! detection responsive. Any bytes on the stderr capture queue fail the
//! restore.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::Compression;
use crate::crypto::KEY_LEN;
use crate::engine::{
    feed_restore_queue, BackupEngine, BackupPipeline, EngineError, EngineMeta,
    DEFAULT_MAX_SEGMENT_SIZE,
};
use crate::queue::{Chunk, QueueError, RichQueue, ERROR_CAPACITY};
use crate::storage::StorageSink;

pub const TAR_ENGINE_NAME: &str = "tar";

/// Chunk size for reading archiver stdout.
const STDOUT_CHUNK: usize = 256 * 1024;

/// Stderr is read in tiny chunks so the first diagnostic line surfaces
/// quickly on the capture queue.
const STDERR_CHUNK: usize = 64;

/// Supervisor poll granularity.
const SUPERVISOR_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TarConfig {
    /// Path of the archiver binary.
    pub archiver_path:    PathBuf,
    pub compression:      Compression,
    pub dereference:      bool,
    pub exclude:          Vec<String>,
    pub encrypt_key_file: Option<PathBuf>,
    pub max_segment_size: usize,
    pub dry_run:          bool,
}

impl Default for TarConfig {
    fn default() -> Self {
        Self {
            archiver_path:    PathBuf::from("tar"),
            compression:      Compression::default(),
            dereference:      false,
            exclude:          Vec::new(),
            encrypt_key_file: None,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            dry_run:          false,
        }
    }
}

pub struct TarEngine {
    config:  TarConfig,
    storage: Arc<dyn StorageSink>,
}

impl TarEngine {
    pub fn new(config: TarConfig, storage: Arc<dyn StorageSink>) -> Result<Self, EngineError> {
        if config.max_segment_size == 0 {
            return Err(EngineError::Config("max_segment_size must be positive".into()));
        }
        Ok(Self { config, storage })
    }

    fn load_key(&self) -> Result<Option<[u8; KEY_LEN]>, EngineError> {
        self.config
            .encrypt_key_file
            .as_deref()
            .map(crate::crypto::load_key)
            .transpose()
            .map_err(EngineError::from)
    }

    fn compression_flag(&self) -> Option<&'static str> {
        match self.config.compression {
            Compression::None => None,
            Compression::Gzip => Some("--gzip"),
            Compression::Bzip2 => Some("--bzip2"),
            Compression::Xz => Some("--xz"),
        }
    }

    fn snapshot_path(backup_id: &str) -> PathBuf {
        std::env::temp_dir().join(format!("icebox-{backup_id}-{}.snar", std::process::id()))
    }

    fn backup_command(&self, source_root: &Path, snapshot: &Path) -> Command {
        let mut cmd = Command::new(&self.config.archiver_path);
        cmd.arg("--create")
            .arg("--file")
            .arg("-")
            .arg("--directory")
            .arg(source_root)
            .arg("--listed-incremental")
            .arg(snapshot);
        if let Some(flag) = self.compression_flag() {
            cmd.arg(flag);
        }
        if self.config.dereference {
            cmd.arg("--dereference");
        }
        for pattern in &self.config.exclude {
            cmd.arg("--exclude").arg(pattern);
        }
        cmd.arg(".");
        cmd
    }

    fn restore_command(&self, target_root: &Path) -> Command {
        let mut cmd = Command::new(&self.config.archiver_path);
        if self.config.dry_run {
            // Listing decodes and validates the whole archive without
            // touching the target tree.
            cmd.arg("--list").arg("--file").arg("-");
        } else {
            cmd.arg("--extract")
                .arg("--file")
                .arg("-")
                .arg("--incremental")
                .arg("--directory")
                .arg(target_root);
        }
        if let Some(flag) = self.compression_flag() {
            cmd.arg(flag);
        }
        cmd
    }
}

/// Read a pipe into a queue until EOF, then finish the queue. Shared by the
/// stdout reader at backup and the stderr capture at restore.
fn pipe_reader<R: Read>(mut pipe: R, queue: &RichQueue, chunk_size: usize) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if queue.put(buf[..n].to_vec()).is_err() {
                    return; // force-stopped; nothing left to deliver
                }
            }
            Err(e) => {
                warn!(error = %e, "archiver pipe read failed");
                break;
            }
        }
    }
    debug!("archiver pipe reader finished");
    queue.finish();
}

fn stderr_excerpt(chunks: Vec<Vec<u8>>) -> String {
    let joined: Vec<u8> = chunks.into_iter().flatten().collect();
    let text = String::from_utf8_lossy(&joined);
    text.chars().take(2048).collect()
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl BackupEngine for TarEngine {
    fn metadata(&self) -> EngineMeta {
        EngineMeta {
            engine_name: TAR_ENGINE_NAME.to_owned(),
            compression: self.config.compression.name().to_owned(),
            encryption:  self.config.encrypt_key_file.is_some(),
        }
    }

    fn backup(
        &self,
        backup_id: &str,
        source_root: &Path,
        prev_manifest: Option<&[u8]>,
    ) -> Result<Vec<u8>, EngineError> {
        let key = self.load_key()?;
        let snapshot = Self::snapshot_path(backup_id);
        match prev_manifest {
            Some(bytes) => fs::write(&snapshot, bytes)?,
            None => {
                let _ = fs::remove_file(&snapshot);
            }
        }

        let mut cmd = self.backup_command(source_root, &snapshot);
        info!(backup_id, command = ?cmd, "tar backup started");
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::ExternalArchiver(format!("cannot exec archiver: {e}")))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let queue = Arc::new(RichQueue::new());
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || pipe_reader(stdout, &queue, STDOUT_CHUNK))
        };
        let stderr_collector = thread::spawn(move || {
            let mut collected = Vec::new();
            let _ = stderr.read_to_end(&mut collected);
            collected
        });

        // Tar owns compression here; the pipeline applies encryption only.
        let mut pipeline = BackupPipeline::new(
            Compression::None,
            key.as_ref(),
            self.storage.as_ref(),
            backup_id,
            self.config.max_segment_size,
        )?;

        if let Err(e) = pipeline.consume(&queue) {
            queue.force_stop();
            kill_and_reap(&mut child);
            let _ = reader.join();
            let _ = stderr_collector.join();
            let _ = fs::remove_file(&snapshot);
            return Err(e);
        }
        let _ = reader.join();

        let status = child.wait()?;
        let stderr_bytes = stderr_collector.join().unwrap_or_default();
        if !status.success() {
            let _ = fs::remove_file(&snapshot);
            return Err(EngineError::ExternalArchiver(format!(
                "archiver exited with {status}: {}",
                stderr_excerpt(vec![stderr_bytes])
            )));
        }

        let total = pipeline.finish()?;
        let manifest = fs::read(&snapshot)
            .map_err(|e| EngineError::ExternalArchiver(format!("snapshot file unreadable: {e}")))?;
        let _ = fs::remove_file(&snapshot);
        info!(backup_id, bytes = total, "tar backup finished");
        Ok(manifest)
    }

    fn restore(&self, backup_id: &str, target_root: &Path) -> Result<(), EngineError> {
        let key = self.load_key()?;
        let mut cmd = self.restore_command(target_root);
        info!(backup_id, command = ?cmd, "tar restore started");
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::ExternalArchiver(format!("cannot exec archiver: {e}")))?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let queue = Arc::new(RichQueue::new());
        let error_queue = Arc::new(RichQueue::with_capacity(ERROR_CAPACITY));

        let producer = {
            let queue = Arc::clone(&queue);
            let storage = Arc::clone(&self.storage);
            let backup_id = backup_id.to_owned();
            thread::spawn(move || {
                // Decryption only — the archiver decompresses via its flag.
                feed_restore_queue(storage.as_ref(), &backup_id, Compression::None, key, &queue)
            })
        };

        let writer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || -> Result<(), QueueError> {
                loop {
                    match queue.get() {
                        Chunk::Data(chunk) => {
                            if stdin.write_all(&chunk).is_err() {
                                // Archiver hung up; its status/stderr tell
                                // the real story.
                                return Err(QueueError::Cancelled);
                            }
                        }
                        Chunk::Wait => continue,
                        Chunk::Eof => return Ok(()), // stdin drops, archiver sees EOF
                    }
                }
            })
        };

        let stderr_reader = {
            let error_queue = Arc::clone(&error_queue);
            thread::spawn(move || pipe_reader(stderr, &error_queue, STDERR_CHUNK))
        };

        // Supervisor: poll rather than join, so a failing archiver aborts
        // the restore within a second.
        loop {
            let child_running = child.try_wait()?.is_none();
            if !writer.is_finished() && child_running && error_queue.empty() {
                thread::sleep(SUPERVISOR_POLL);
                continue;
            }
            break;
        }

        if !error_queue.empty() {
            let excerpt = stderr_excerpt(error_queue.drain());
            queue.force_stop();
            kill_and_reap(&mut child);
            let _ = writer.join();
            let produced = producer.join();
            let _ = stderr_reader.join();
            // A failed producer (storage, decryption) is the root cause;
            // the archiver stderr is just its symptom.
            if let Ok(Err(e)) = produced {
                if !matches!(e, EngineError::Cancelled) {
                    return Err(e);
                }
            }
            warn!(backup_id, "archiver wrote to stderr during restore");
            return Err(EngineError::ExternalArchiver(excerpt));
        }

        let writer_result = writer
            .join()
            .map_err(|_| EngineError::Internal("stdin writer panicked".into()))?;
        let status = child.wait()?;
        let _ = stderr_reader.join();
        let produced = producer
            .join()
            .map_err(|_| EngineError::Internal("restore producer panicked".into()))?;

        if !status.success() {
            return Err(EngineError::ExternalArchiver(format!(
                "archiver exited with {status}: {}",
                stderr_excerpt(error_queue.drain())
            )));
        }
        // Even with a clean exit, anything on stderr means the restore
        // cannot be trusted.
        if !error_queue.empty() {
            return Err(EngineError::ExternalArchiver(stderr_excerpt(
                error_queue.drain(),
            )));
        }
        produced?;
        // A writer that bailed out while the stream still had data means
        // the archive was not fully consumed.
        if writer_result.is_err() {
            return Err(EngineError::ExternalArchiver(
                "archiver closed its input before the stream completed".into(),
            ));
        }
        info!(backup_id, "tar restore finished");
        Ok(())
    }

    fn post_backup(&self, backup_id: &str, manifest: &[u8]) -> Result<(), EngineError> {
        self.storage.write_meta(backup_id, manifest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(config: TarConfig) -> TarEngine {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(crate::storage::LocalStorage::new(dir.path()).unwrap());
        TarEngine::new(config, storage).unwrap()
    }

    fn argv(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn backup_command_shape() {
        let e = engine(TarConfig {
            compression: Compression::Gzip,
            dereference: true,
            exclude: vec!["*.log".into()],
            ..TarConfig::default()
        });
        let cmd = e.backup_command(Path::new("/src"), Path::new("/tmp/s.snar"));
        let args = argv(&cmd);
        assert!(args.contains(&"--create".to_owned()));
        assert!(args.contains(&"--listed-incremental".to_owned()));
        assert!(args.contains(&"--gzip".to_owned()));
        assert!(args.contains(&"--dereference".to_owned()));
        assert!(args.contains(&"*.log".to_owned()));
        assert_eq!(args.last().map(String::as_str), Some("."));
    }

    #[test]
    fn restore_command_dry_run_lists() {
        let e = engine(TarConfig {
            dry_run: true,
            compression: Compression::None,
            ..TarConfig::default()
        });
        let args = argv(&e.restore_command(Path::new("/t")));
        assert!(args.contains(&"--list".to_owned()));
        assert!(!args.contains(&"--extract".to_owned()));
    }

    #[test]
    fn metadata_names_engine() {
        let e = engine(TarConfig::default());
        assert_eq!(e.metadata().engine_name, "tar");
    }
}
