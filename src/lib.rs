//! # icebox — incremental filesystem backup engine
//!
//! Stream-format guarantees (frozen in v1):
//! - Every entry travels as one frame: an ASCII `header_len` prefix, 19
//!   NUL-delimited header fields, then a type- and level-dependent payload
//! - Numeric header fields are decimal ASCII; `level_id` and `deleted` are
//!   four zero-padded digits — never negotiated
//! - Level-0 regular payloads are literal runs totaling exactly `size`
//!   bytes; level ≥ 1 payloads are delta token streams ending in the
//!   zero-length literal terminator; the `0xFF` tag is reserved for match
//!   tokens
//! - Block signatures are a 32-bit rolling sum plus 16 bytes of BLAKE3 per
//!   4096-byte block
//! - Compression and encryption wrap the whole framed concatenation, then
//!   the stream is sliced into fixed-max-size segments; there is no outer
//!   envelope
//! - The manifest serializes key-sorted: the same generation always yields
//!   byte-identical manifest objects

pub mod checksum;
pub mod codec;
pub mod crypto;
pub mod delta;
pub mod engine;
pub mod header;
pub mod meta;
pub mod queue;
pub mod restore;
pub mod storage;
pub mod walker;

// Flat re-exports for the most common types.
pub use checksum::{blockchecksums, BlockSignature, RSYNC_BLOCK_SIZE};
pub use codec::{Compression, StreamCodec};
pub use engine::tar::{TarConfig, TarEngine, TAR_ENGINE_NAME};
pub use engine::{
    BackupEngine, EngineError, EngineMeta, RsyncConfig, RsyncEngine, Symlinks,
    DEFAULT_MAX_SEGMENT_SIZE, RSYNC_ENGINE_NAME,
};
pub use header::{FileType, InodeRecord};
pub use meta::{FileEntry, FsMeta};
pub use queue::RichQueue;
pub use storage::{LocalStorage, StorageSink};
