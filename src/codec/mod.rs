//! Compression codecs: none, gzip, bzip2, xz.
//!
//! The pipeline treats compression as a byte-in/byte-out transform over the
//! whole framed stream: the consumer feeds queue chunks through
//! [`StreamCodec::process`] and calls [`StreamCodec::flush`] exactly once at
//! end of stream to emit trailer bytes. Decompressors use the same shape in
//! reverse; their `flush` additionally validates that the underlying stream
//! is complete, so a truncated upload surfaces as [`CodecError::Truncated`]
//! instead of silently short output.
//!
//! All three real codecs are driven through their `write::*Encoder` /
//! `write::*Decoder` adapters over a `Vec<u8>`, drained after every chunk.

use std::io::{self, Write};

use thiserror::Error;

// ── Compression selector ─────────────────────────────────────────────────────

/// Stream codec selected by engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Gzip,
    Bzip2,
    Xz,
    None,
}

impl Compression {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Compression::None),
            "gzip" => Some(Compression::Gzip),
            "bzip2" => Some(Compression::Bzip2),
            "xz" => Some(Compression::Xz),
            _ => None,
        }
    }

    /// Name used in engine metadata and diagnostics (never parsed back).
    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    /// The compressed stream ended before its trailer; the upload was cut
    /// short or corrupted.
    #[error("compressed stream is truncated")]
    Truncated,
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Decompression(e.to_string())
        }
    }
}

// ── Codec trait ──────────────────────────────────────────────────────────────

/// One direction of a streaming byte transform.
pub trait StreamCodec: Send {
    /// Transform one chunk; may return fewer or more bytes than it was fed.
    fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    /// Finalize the stream, returning trailer bytes. Must be called exactly
    /// once; `process` after `flush` is an error.
    fn flush(&mut self) -> Result<Vec<u8>, CodecError>;
}

/// Compressor for the backup side of the pipeline.
pub fn make_compressor(compression: Compression) -> Box<dyn StreamCodec> {
    match compression {
        Compression::None => Box::new(Passthrough),
        Compression::Gzip => Box::new(GzipCompressor::new()),
        Compression::Bzip2 => Box::new(Bzip2Compressor::new()),
        Compression::Xz => Box::new(XzCompressor::new()),
    }
}

/// Decompressor for the restore side of the pipeline.
pub fn make_decompressor(compression: Compression) -> Box<dyn StreamCodec> {
    match compression {
        Compression::None => Box::new(Passthrough),
        Compression::Gzip => Box::new(GzipDecompressor::new()),
        Compression::Bzip2 => Box::new(Bzip2Decompressor::new()),
        Compression::Xz => Box::new(XzDecompressor::new()),
    }
}

fn finished() -> CodecError {
    CodecError::Compression("codec used after flush".into())
}

// ── none ─────────────────────────────────────────────────────────────────────

struct Passthrough;

impl StreamCodec for Passthrough {
    fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn flush(&mut self) -> Result<Vec<u8>, CodecError> {
        Ok(Vec::new())
    }
}

// ── gzip ─────────────────────────────────────────────────────────────────────

struct GzipCompressor {
    inner: Option<flate2::write::GzEncoder<Vec<u8>>>,
}

impl GzipCompressor {
    fn new() -> Self {
        Self {
            inner: Some(flate2::write::GzEncoder::new(
                Vec::new(),
                flate2::Compression::default(),
            )),
        }
    }
}

impl StreamCodec for GzipCompressor {
    fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let enc = self.inner.as_mut().ok_or_else(finished)?;
        enc.write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(std::mem::take(enc.get_mut()))
    }
    fn flush(&mut self) -> Result<Vec<u8>, CodecError> {
        let enc = self.inner.take().ok_or_else(finished)?;
        enc.finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    }
}

struct GzipDecompressor {
    inner: Option<flate2::write::GzDecoder<Vec<u8>>>,
}

impl GzipDecompressor {
    fn new() -> Self {
        Self {
            inner: Some(flate2::write::GzDecoder::new(Vec::new())),
        }
    }
}

impl StreamCodec for GzipDecompressor {
    fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let dec = self.inner.as_mut().ok_or_else(finished)?;
        dec.write_all(data)?;
        Ok(std::mem::take(dec.get_mut()))
    }
    fn flush(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut dec = self.inner.take().ok_or_else(finished)?;
        dec.try_finish().map_err(|_| CodecError::Truncated)?;
        dec.finish().map_err(|_| CodecError::Truncated)
    }
}

// ── bzip2 ────────────────────────────────────────────────────────────────────

struct Bzip2Compressor {
    inner: Option<bzip2::write::BzEncoder<Vec<u8>>>,
}

impl Bzip2Compressor {
    fn new() -> Self {
        Self {
            inner: Some(bzip2::write::BzEncoder::new(
                Vec::new(),
                bzip2::Compression::default(),
            )),
        }
    }
}

impl StreamCodec for Bzip2Compressor {
    fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let enc = self.inner.as_mut().ok_or_else(finished)?;
        enc.write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(std::mem::take(enc.get_mut()))
    }
    fn flush(&mut self) -> Result<Vec<u8>, CodecError> {
        let enc = self.inner.take().ok_or_else(finished)?;
        enc.finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    }
}

struct Bzip2Decompressor {
    inner: Option<bzip2::write::BzDecoder<Vec<u8>>>,
}

impl Bzip2Decompressor {
    fn new() -> Self {
        Self {
            inner: Some(bzip2::write::BzDecoder::new(Vec::new())),
        }
    }
}

impl StreamCodec for Bzip2Decompressor {
    fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let dec = self.inner.as_mut().ok_or_else(finished)?;
        dec.write_all(data)?;
        Ok(std::mem::take(dec.get_mut()))
    }
    fn flush(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut dec = self.inner.take().ok_or_else(finished)?;
        dec.finish().map_err(|_| CodecError::Truncated)
    }
}

// ── xz ───────────────────────────────────────────────────────────────────────

/// xz preset used for backups; 6 is the liblzma default trade-off.
const XZ_PRESET: u32 = 6;

struct XzCompressor {
    inner: Option<xz2::write::XzEncoder<Vec<u8>>>,
}

impl XzCompressor {
    fn new() -> Self {
        Self {
            inner: Some(xz2::write::XzEncoder::new(Vec::new(), XZ_PRESET)),
        }
    }
}

impl StreamCodec for XzCompressor {
    fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let enc = self.inner.as_mut().ok_or_else(finished)?;
        enc.write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(std::mem::take(enc.get_mut()))
    }
    fn flush(&mut self) -> Result<Vec<u8>, CodecError> {
        let enc = self.inner.take().ok_or_else(finished)?;
        enc.finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    }
}

struct XzDecompressor {
    inner: Option<xz2::write::XzDecoder<Vec<u8>>>,
}

impl XzDecompressor {
    fn new() -> Self {
        Self {
            inner: Some(xz2::write::XzDecoder::new(Vec::new())),
        }
    }
}

impl StreamCodec for XzDecompressor {
    fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let dec = self.inner.as_mut().ok_or_else(finished)?;
        dec.write_all(data)?;
        Ok(std::mem::take(dec.get_mut()))
    }
    fn flush(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut dec = self.inner.take().ok_or_else(finished)?;
        dec.finish().map_err(|_| CodecError::Truncated)
    }
}
