//! Stream encryption: ChaCha20 keystream over the compressed backup stream.
//!
//! Layout: `[ nonce (12 B) | keystream-encrypted bytes ]` — the random nonce
//! leads the stream, before segmentation, so the restore side recovers it
//! from the first bytes of the first segment.
//!
//! The key is whatever the configured key file contains, normalized to
//! exactly 32 bytes with BLAKE3. A keystream cipher (rather than an AEAD)
//! is required here: the pipeline transforms the stream chunk-at-a-time and
//! slices it into segments afterwards, so the transform must be
//! length-preserving with no per-message framing. Stream integrity is
//! carried by the framing and per-block strong digests underneath.

use std::io::Read;
use std::path::Path;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Byte length of the nonce leading an encrypted stream.
pub const NONCE_LEN: usize = 12;

/// Byte length of the symmetric key.
pub const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("cannot read encryption key file {path}: {source}")]
    KeyFile {
        path:   String,
        source: std::io::Error,
    },
    #[error("encryption key file {0} is empty")]
    EmptyKey(String),
    #[error("encrypted stream shorter than its {NONCE_LEN}-byte nonce")]
    MissingNonce,
}

/// Load key material from `path` and normalize it to [`KEY_LEN`] bytes.
pub fn load_key(path: &Path) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut raw = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut raw))
        .map_err(|source| CryptoError::KeyFile {
            path: path.display().to_string(),
            source,
        })?;
    if raw.is_empty() {
        return Err(CryptoError::EmptyKey(path.display().to_string()));
    }
    Ok(*blake3::hash(&raw).as_bytes())
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// One direction of the keystream transform. Encryption and decryption are
/// the same operation; the distinction is only who holds which end of the
/// stream.
pub struct Crypter {
    cipher: ChaCha20,
}

impl Crypter {
    pub fn new(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Self {
        Self {
            cipher: ChaCha20::new(&(*key).into(), &(*nonce).into()),
        }
    }

    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.cipher.apply_keystream(&mut out);
        out
    }
}
