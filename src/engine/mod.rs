//! Engine facade and pipeline wiring.
//!
//! Both engines implement [`BackupEngine`]; the rsync engine here is the
//! in-crate incremental implementation, `tar.rs` drives an external
//! archiver over the same queue and segment plumbing.
//!
//! Backup pipeline:
//!
//! ```text
//! walker ──frames──▶ RichQueue ──▶ consumer: compress ∘ encrypt
//!                                           └─▶ segmenter ─▶ storage
//! ```
//!
//! Restore reverses it: storage → de-segmenter → decrypt → decompress →
//! RichQueue → applier. Each invocation runs exactly one producer and one
//! consumer thread rendezvousing on a single queue; `force_stop` on that
//! queue is the only cancellation primitive.

pub mod tar;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use glob::Pattern;
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{make_compressor, make_decompressor, CodecError, Compression, StreamCodec};
use crate::crypto::{generate_nonce, load_key, Crypter, CryptoError, KEY_LEN, NONCE_LEN};
use crate::meta::FsMeta;
use crate::queue::{Chunk, QueueError, RichQueue};
use crate::restore::{Applier, RestoreError, RestoreStats, StreamReader};
use crate::storage::{StorageError, StorageSink};
use crate::walker::{WalkError, Walker};

/// Default segment size handed to the storage sink: 32 MiB.
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 32 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("manifest encode/decode failed: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The external archiver wrote to stderr or exited nonzero.
    #[error("external archiver failed: {0}")]
    ExternalArchiver(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal engine error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<QueueError> for EngineError {
    fn from(_: QueueError) -> Self {
        EngineError::Cancelled
    }
}

/// Answer to `metadata()`, common to both engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMeta {
    pub engine_name: String,
    pub compression: String,
    pub encryption:  bool,
}

/// The contract shared by the rsync and tar engines.
pub trait BackupEngine {
    fn metadata(&self) -> EngineMeta;
    /// Capture `source_root` into segments on the storage sink, returning
    /// the serialized manifest of the new generation.
    fn backup(
        &self,
        backup_id: &str,
        source_root: &Path,
        prev_manifest: Option<&[u8]>,
    ) -> Result<Vec<u8>, EngineError>;
    /// Rebuild one captured generation into `target_root`.
    fn restore(&self, backup_id: &str, target_root: &Path) -> Result<(), EngineError>;
    /// Persist the manifest next to the generation's segments.
    fn post_backup(&self, backup_id: &str, manifest: &[u8]) -> Result<(), EngineError>;
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Symlinks {
    #[default]
    Preserve,
    Dereference,
}

#[derive(Debug, Clone)]
pub struct RsyncConfig {
    pub compression:      Compression,
    /// Path to the symmetric key file; absence disables encryption.
    pub encrypt_key_file: Option<PathBuf>,
    pub symlinks:         Symlinks,
    /// Glob patterns applied relative to the source root.
    pub exclude:          Vec<String>,
    pub max_segment_size: usize,
    /// Restore side only: decode and validate without touching the
    /// filesystem.
    pub dry_run:          bool,
}

impl Default for RsyncConfig {
    fn default() -> Self {
        Self {
            compression:      Compression::default(),
            encrypt_key_file: None,
            symlinks:         Symlinks::default(),
            exclude:          Vec::new(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            dry_run:          false,
        }
    }
}

// ── Segmenter ────────────────────────────────────────────────────────────────

/// Slices the transformed stream into fixed-max-size segments and hands
/// them to the storage sink in sequence order.
struct Segmenter<'a> {
    storage:   &'a dyn StorageSink,
    backup_id: &'a str,
    max:       usize,
    buf:       Vec<u8>,
    seq:       u64,
    total:     u64,
}

impl<'a> Segmenter<'a> {
    fn new(storage: &'a dyn StorageSink, backup_id: &'a str, max: usize) -> Self {
        Self {
            storage,
            backup_id,
            max: max.max(1),
            buf: Vec::new(),
            seq: 0,
            total: 0,
        }
    }

    fn push(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.max {
            let segment: Vec<u8> = self.buf.drain(..self.max).collect();
            self.write(&segment)?;
        }
        Ok(())
    }

    fn write(&mut self, segment: &[u8]) -> Result<(), StorageError> {
        self.storage.write_segment(self.backup_id, self.seq, segment)?;
        self.seq += 1;
        self.total += segment.len() as u64;
        Ok(())
    }

    /// Flush the final partial segment. An empty stream still writes one
    /// empty segment so the generation is visible in storage.
    fn finish(mut self) -> Result<u64, StorageError> {
        if !self.buf.is_empty() || self.seq == 0 {
            let segment = std::mem::take(&mut self.buf);
            self.write(&segment)?;
        }
        Ok(self.total)
    }
}

// ── Backup-side pipeline ─────────────────────────────────────────────────────

/// `(maybe compress) ∘ (maybe encrypt)` plus segmentation, owned by the
/// consumer thread exclusively.
pub(crate) struct BackupPipeline<'a> {
    compressor: Box<dyn StreamCodec>,
    crypter:    Option<Crypter>,
    segmenter:  Segmenter<'a>,
}

impl<'a> BackupPipeline<'a> {
    /// When a key is present the stream starts with the fresh nonce, ahead
    /// of any ciphertext.
    pub(crate) fn new(
        compression: Compression,
        key: Option<&[u8; KEY_LEN]>,
        storage: &'a dyn StorageSink,
        backup_id: &'a str,
        max_segment_size: usize,
    ) -> Result<Self, EngineError> {
        let mut segmenter = Segmenter::new(storage, backup_id, max_segment_size);
        let crypter = match key {
            Some(key) => {
                let nonce = generate_nonce();
                segmenter.push(&nonce)?;
                Some(Crypter::new(key, &nonce))
            }
            None => None,
        };
        Ok(Self {
            compressor: make_compressor(compression),
            crypter,
            segmenter,
        })
    }

    pub(crate) fn push(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let compressed = self.compressor.process(data)?;
        self.emit(compressed)
    }

    fn emit(&mut self, data: Vec<u8>) -> Result<(), EngineError> {
        if data.is_empty() {
            return Ok(());
        }
        let wire = match &mut self.crypter {
            Some(c) => c.process(&data),
            None => data,
        };
        self.segmenter.push(&wire)?;
        Ok(())
    }

    /// Flush compressor trailer and the final segment; returns total bytes
    /// written to storage.
    pub(crate) fn finish(mut self) -> Result<u64, EngineError> {
        let tail = self.compressor.flush()?;
        self.emit(tail)?;
        Ok(self.segmenter.finish()?)
    }

    /// Drain the queue into the pipeline until EOF. Does not finish the
    /// pipeline — the caller settles the producer's fate first.
    pub(crate) fn consume(&mut self, queue: &RichQueue) -> Result<(), EngineError> {
        loop {
            match queue.get() {
                Chunk::Data(chunk) => self.push(&chunk)?,
                Chunk::Wait => continue,
                Chunk::Eof => return Ok(()),
            }
        }
    }
}

// ── Restore-side producer ────────────────────────────────────────────────────

/// Read segments, strip the nonce, decrypt, decompress, and feed the queue.
/// Runs on the producer thread of a restore.
pub(crate) fn feed_restore_queue(
    storage: &dyn StorageSink,
    backup_id: &str,
    compression: Compression,
    key: Option<[u8; KEY_LEN]>,
    queue: &RichQueue,
) -> Result<(), EngineError> {
    let result = (|| -> Result<(), EngineError> {
        let mut decompressor = make_decompressor(compression);
        let mut crypter: Option<Crypter> = None;
        let mut nonce = Vec::with_capacity(NONCE_LEN);

        for segment in storage.read_segments(backup_id)? {
            let segment = segment?;
            let mut data = segment.as_slice();

            if key.is_some() && crypter.is_none() {
                let want = NONCE_LEN - nonce.len();
                let take = want.min(data.len());
                nonce.extend_from_slice(&data[..take]);
                data = &data[take..];
                if nonce.len() == NONCE_LEN {
                    let nonce_arr: [u8; NONCE_LEN] =
                        nonce.as_slice().try_into().expect("nonce length checked");
                    crypter = Some(Crypter::new(&key.expect("key checked"), &nonce_arr));
                }
                if data.is_empty() {
                    continue;
                }
            }

            let plain = match &mut crypter {
                Some(c) => c.process(data),
                None => data.to_vec(),
            };
            let out = decompressor.process(&plain)?;
            if !out.is_empty() {
                queue.put(out)?;
            }
        }

        if key.is_some() && crypter.is_none() {
            return Err(CryptoError::MissingNonce.into());
        }

        let tail = decompressor.flush()?;
        if !tail.is_empty() {
            queue.put(tail)?;
        }
        Ok(())
    })();

    // Unblock the consumer on every exit path.
    match &result {
        Ok(()) => queue.finish(),
        Err(_) => queue.force_stop(),
    }
    result
}

// ── Rsync engine ─────────────────────────────────────────────────────────────

pub const RSYNC_ENGINE_NAME: &str = "rsync";

pub struct RsyncEngine {
    config:   RsyncConfig,
    storage:  Arc<dyn StorageSink>,
    excludes: Vec<Pattern>,
}

impl RsyncEngine {
    pub fn new(config: RsyncConfig, storage: Arc<dyn StorageSink>) -> Result<Self, EngineError> {
        let excludes = config
            .exclude
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| EngineError::Config(format!("bad exclude pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if config.max_segment_size == 0 {
            return Err(EngineError::Config("max_segment_size must be positive".into()));
        }
        Ok(Self {
            config,
            storage,
            excludes,
        })
    }

    fn load_key(&self) -> Result<Option<[u8; KEY_LEN]>, EngineError> {
        self.config
            .encrypt_key_file
            .as_deref()
            .map(load_key)
            .transpose()
            .map_err(EngineError::from)
    }

    /// Run one backup generation and return the sealed manifest.
    pub fn backup_tree(
        &self,
        backup_id: &str,
        source_root: &Path,
        prev_meta: Option<FsMeta>,
    ) -> Result<FsMeta, EngineError> {
        let key = self.load_key()?;
        let queue = Arc::new(RichQueue::new());
        info!(backup_id, source = %source_root.display(), "rsync backup started");

        let producer = {
            let queue = Arc::clone(&queue);
            let root = source_root.to_owned();
            let excludes = self.excludes.clone();
            let dereference = self.config.symlinks == Symlinks::Dereference;
            thread::spawn(move || {
                Walker::new(
                    RSYNC_ENGINE_NAME,
                    &root,
                    &excludes,
                    dereference,
                    prev_meta.as_ref(),
                    &queue,
                )
                .run()
            })
        };

        let mut pipeline = BackupPipeline::new(
            self.config.compression,
            key.as_ref(),
            self.storage.as_ref(),
            backup_id,
            self.config.max_segment_size,
        )?;

        if let Err(e) = pipeline.consume(&queue) {
            queue.force_stop();
            let _ = producer.join();
            return Err(e);
        }

        let mut meta = match producer.join() {
            Ok(Ok(meta)) => meta,
            Ok(Err(walk_err)) => return Err(walk_err.into()),
            Err(_) => return Err(EngineError::Internal("walker thread panicked".into())),
        };

        let compressed = pipeline.finish()?;
        meta.meta.backup_size_compressed = compressed;
        meta.meta.compression = self.config.compression.name().to_owned();
        meta.meta.encryption = key.is_some();
        info!(
            backup_id,
            level = meta.meta.level_id,
            bytes_on_disk = meta.meta.backup_size_on_disk,
            bytes_compressed = compressed,
            "rsync backup finished"
        );
        Ok(meta)
    }

    /// Rebuild one generation into `target_root`.
    pub fn restore_tree(
        &self,
        backup_id: &str,
        target_root: &Path,
    ) -> Result<RestoreStats, EngineError> {
        let manifest = FsMeta::from_bytes(&self.storage.read_meta(backup_id)?)?;
        let key = self.load_key()?;
        if manifest.meta.encryption && key.is_none() {
            return Err(EngineError::Config(format!(
                "backup {backup_id} is encrypted but no key file is configured"
            )));
        }
        // The manifest knows how the stream was written; the configured
        // codec is only a fallback for pre-upgrade manifests.
        let compression = Compression::from_name(&manifest.meta.compression)
            .unwrap_or(self.config.compression);
        let queue = Arc::new(RichQueue::new());
        info!(
            backup_id,
            level = manifest.meta.level_id,
            target = %target_root.display(),
            dry_run = self.config.dry_run,
            "rsync restore started"
        );

        let producer = {
            let queue = Arc::clone(&queue);
            let storage = Arc::clone(&self.storage);
            let backup_id = backup_id.to_owned();
            thread::spawn(move || {
                feed_restore_queue(storage.as_ref(), &backup_id, compression, key, &queue)
            })
        };

        let mut reader = StreamReader::new(&queue);
        let applied = Applier::new(target_root, self.config.dry_run).apply_stream(&mut reader);

        let produced = match producer.join() {
            Ok(r) => r,
            Err(_) => return Err(EngineError::Internal("restore producer panicked".into())),
        };

        match (produced, applied) {
            // The producer's diagnosis wins: a force-stopped applier only
            // sees a truncated stream.
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e.into()),
            (Ok(()), Ok(stats)) => {
                debug!(backup_id, frames = stats.frames, "rsync restore finished");
                Ok(stats)
            }
        }
    }
}

impl BackupEngine for RsyncEngine {
    fn metadata(&self) -> EngineMeta {
        EngineMeta {
            engine_name: RSYNC_ENGINE_NAME.to_owned(),
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
        let prev_meta = prev_manifest.map(FsMeta::from_bytes).transpose()?;
        let meta = self.backup_tree(backup_id, source_root, prev_meta)?;
        Ok(meta.to_bytes()?)
    }

    fn restore(&self, backup_id: &str, target_root: &Path) -> Result<(), EngineError> {
        self.restore_tree(backup_id, target_root).map(|_| ())
    }

    fn post_backup(&self, backup_id: &str, manifest: &[u8]) -> Result<(), EngineError> {
        self.storage.write_meta(backup_id, manifest)?;
        Ok(())
    }
}
