//! Delta token stream — framing, generation, and application.
//!
//! # Token framing
//!
//! ```text
//! match token    0xFF  [block_index: u32 LE]
//! literal run    [len: LEB128 varint]  [len bytes]
//! terminator     0x00                  (zero-length literal run)
//! ```
//!
//! The tag byte `0xFF` is reserved for match tokens, so a literal run whose
//! varint length would begin with `0xFF` is split one byte short; decoders
//! accept arbitrary splits. Runs are coalesced up to [`MAX_LITERAL_RUN`]
//! to amortize framing overhead.
//!
//! # Payload shapes
//!
//! - Level 0 regular files: literal runs totaling exactly `size` bytes, no
//!   terminator (the decoder stops at `size`).
//! - Level ≥ 1 regular files: a token stream terminated by the zero-length
//!   literal. A bare terminator is a metadata-only refresh.
//!
//! Generation slides a [`RollingSum`] window byte-by-byte over the new
//! file; a weak hit is confirmed against the strong digest before a match
//! token is emitted and the window advances by one whole block. Residual
//! window bytes at EOF are flushed as literals.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::checksum::{read_up_to, strong_checksum, BlockSignature, RollingSum, RSYNC_BLOCK_SIZE};

/// Tag byte introducing a match token.
pub const MATCH_TAG: u8 = 0xFF;

/// Coalescing cap for literal runs.
pub const MAX_LITERAL_RUN: usize = 64 * 1024;

/// Counters reported by the generator, logged per file.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeltaStats {
    pub literal_bytes:  u64,
    pub matched_blocks: u64,
}

/// One decoded token of a level ≥ 1 payload.
#[derive(Debug, PartialEq, Eq)]
pub enum Token {
    Match(u32),
    Literal(Vec<u8>),
    End,
}

fn corrupt(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_owned())
}

// ── Varint ───────────────────────────────────────────────────────────────────

pub fn write_varint<W: Write>(w: &mut W, mut value: u64) -> io::Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return w.write_all(&[byte]);
        }
        w.write_all(&[byte | 0x80])?;
    }
}

/// Continue a varint whose first byte has already been read.
fn finish_varint<R: Read>(r: &mut R, first: u8) -> io::Result<u64> {
    let mut value = u64::from(first & 0x7f);
    if first & 0x80 == 0 {
        return Ok(value);
    }
    let mut shift = 7;
    loop {
        if shift > 63 {
            return Err(corrupt("varint overflows 64 bits"));
        }
        let byte = r.read_u8()?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn read_varint<R: Read>(r: &mut R) -> io::Result<u64> {
    let first = r.read_u8()?;
    finish_varint(r, first)
}

// ── Token writing ────────────────────────────────────────────────────────────

/// Largest run length not exceeding `want` whose varint does not begin with
/// the reserved match tag.
fn safe_run_len(want: usize) -> usize {
    let want = want.min(MAX_LITERAL_RUN);
    // The first varint byte is 0xFF iff the value exceeds 7 bits and its
    // low 7 bits are all ones.
    if want > 0x7f && want & 0x7f == 0x7f {
        want - 1
    } else {
        want
    }
}

pub fn write_literal_run<W: Write>(w: &mut W, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        let n = safe_run_len(bytes.len());
        write_varint(w, n as u64)?;
        w.write_all(&bytes[..n])?;
        bytes = &bytes[n..];
    }
    Ok(())
}

pub fn write_match<W: Write>(w: &mut W, index: u32) -> io::Result<()> {
    w.write_all(&[MATCH_TAG])?;
    w.write_u32::<LittleEndian>(index)
}

pub fn write_terminator<W: Write>(w: &mut W) -> io::Result<()> {
    write_varint(w, 0)
}

// ── Token reading ────────────────────────────────────────────────────────────

/// Read the next token of a level ≥ 1 payload.
pub fn read_token<R: Read>(r: &mut R) -> io::Result<Token> {
    let tag = r.read_u8()?;
    if tag == MATCH_TAG {
        let index = r.read_u32::<LittleEndian>()?;
        return Ok(Token::Match(index));
    }
    let len = finish_varint(r, tag)? as usize;
    if len == 0 {
        return Ok(Token::End);
    }
    if len > MAX_LITERAL_RUN {
        return Err(corrupt("literal run exceeds coalescing cap"));
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    Ok(Token::Literal(bytes))
}

/// Copy a level-0 payload (literal runs totaling exactly `size` bytes) from
/// the stream into `out`.
pub fn copy_literal_runs<R: Read, W: Write>(r: &mut R, out: &mut W, size: u64) -> io::Result<()> {
    let mut remaining = size;
    let mut buf = vec![0u8; MAX_LITERAL_RUN];
    while remaining > 0 {
        let tag = r.read_u8()?;
        if tag == MATCH_TAG {
            return Err(corrupt("match token in a full-content payload"));
        }
        let len = finish_varint(r, tag)?;
        if len == 0 || len > remaining || len as usize > MAX_LITERAL_RUN {
            return Err(corrupt("literal run inconsistent with advertised size"));
        }
        let chunk = &mut buf[..len as usize];
        r.read_exact(chunk)?;
        out.write_all(chunk)?;
        remaining -= len;
    }
    Ok(())
}

// ── Full-content emission ────────────────────────────────────────────────────

/// Emit exactly `size` bytes of `reader` as literal runs. Zero-pads if the
/// file shrank between stat and read, so the frame always carries the
/// advertised byte count.
pub fn emit_full<R: Read, W: Write>(reader: &mut R, size: u64, out: &mut W) -> io::Result<u64> {
    let mut remaining = size;
    let mut buf = vec![0u8; MAX_LITERAL_RUN];
    while remaining > 0 {
        let want = remaining.min(MAX_LITERAL_RUN as u64) as usize;
        let filled = read_up_to(reader, &mut buf[..want])?;
        if filled < want {
            buf[filled..want].fill(0);
        }
        write_literal_run(out, &buf[..want])?;
        remaining -= want as u64;
    }
    Ok(size)
}

// ── Delta generation ─────────────────────────────────────────────────────────

struct ByteSource<R: Read> {
    inner: R,
    buf:   Vec<u8>,
    pos:   usize,
    len:   usize,
}

impl<R: Read> ByteSource<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; 64 * 1024],
            pos: 0,
            len: 0,
        }
    }

    fn next(&mut self) -> io::Result<Option<u8>> {
        if self.pos == self.len {
            self.len = read_up_to(&mut self.inner, &mut self.buf)?;
            self.pos = 0;
            if self.len == 0 {
                return Ok(None);
            }
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(Some(byte))
    }
}

/// Pending literal bytes, flushed as coalesced runs.
struct LiteralBuffer {
    pending: Vec<u8>,
}

impl LiteralBuffer {
    fn new() -> Self {
        Self {
            pending: Vec::with_capacity(MAX_LITERAL_RUN),
        }
    }

    fn push<W: Write>(&mut self, byte: u8, out: &mut W, stats: &mut DeltaStats) -> io::Result<()> {
        self.pending.push(byte);
        if self.pending.len() >= MAX_LITERAL_RUN {
            self.flush(out, stats)?;
        }
        Ok(())
    }

    fn extend<W: Write>(
        &mut self,
        bytes: impl Iterator<Item = u8>,
        out: &mut W,
        stats: &mut DeltaStats,
    ) -> io::Result<()> {
        for byte in bytes {
            self.push(byte, out, stats)?;
        }
        Ok(())
    }

    fn flush<W: Write>(&mut self, out: &mut W, stats: &mut DeltaStats) -> io::Result<()> {
        if !self.pending.is_empty() {
            stats.literal_bytes += self.pending.len() as u64;
            write_literal_run(out, &self.pending)?;
            self.pending.clear();
        }
        Ok(())
    }
}

/// Generate a terminated token stream for `reader` against the previous
/// generation's signature list.
pub fn generate_delta<R: Read, W: Write>(
    reader: R,
    old_sigs: &[BlockSignature],
    out: &mut W,
) -> io::Result<DeltaStats> {
    let mut table: HashMap<u32, Vec<u32>> = HashMap::with_capacity(old_sigs.len());
    for (index, sig) in old_sigs.iter().enumerate() {
        table.entry(sig.weak).or_default().push(index as u32);
    }

    let mut src = ByteSource::new(reader);
    let mut stats = DeltaStats::default();
    let mut lit = LiteralBuffer::new();
    let mut window: VecDeque<u8> = VecDeque::with_capacity(RSYNC_BLOCK_SIZE);

    let refill = |src: &mut ByteSource<R>, window: &mut VecDeque<u8>| -> io::Result<()> {
        while window.len() < RSYNC_BLOCK_SIZE {
            match src.next()? {
                Some(b) => window.push_back(b),
                None => break,
            }
        }
        Ok(())
    };

    refill(&mut src, &mut window)?;
    if window.len() < RSYNC_BLOCK_SIZE {
        lit.extend(window.drain(..), out, &mut stats)?;
        lit.flush(out, &mut stats)?;
        return write_terminator(out).map(|()| stats);
    }

    let mut sum = RollingSum::of_block(window.make_contiguous());
    loop {
        let matched = table.get(&sum.value()).and_then(|candidates| {
            let strong = strong_checksum(window.make_contiguous());
            candidates
                .iter()
                .copied()
                .find(|&idx| old_sigs[idx as usize].strong == strong)
        });

        if let Some(index) = matched {
            lit.flush(out, &mut stats)?;
            write_match(out, index)?;
            stats.matched_blocks += 1;
            window.clear();
            refill(&mut src, &mut window)?;
            if window.is_empty() {
                break;
            }
            if window.len() < RSYNC_BLOCK_SIZE {
                lit.extend(window.drain(..), out, &mut stats)?;
                break;
            }
            sum = RollingSum::of_block(window.make_contiguous());
            continue;
        }

        let outgoing = window.pop_front().unwrap();
        lit.push(outgoing, out, &mut stats)?;
        match src.next()? {
            Some(incoming) => {
                window.push_back(incoming);
                sum.roll(outgoing, incoming);
            }
            None => {
                lit.extend(window.drain(..), out, &mut stats)?;
                break;
            }
        }
    }

    lit.flush(out, &mut stats)?;
    write_terminator(out)?;
    Ok(stats)
}

// ── Delta application ────────────────────────────────────────────────────────

/// Result of applying one token stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyOutcome {
    /// Tokens applied, terminator excluded. Zero means the frame was a
    /// metadata-only refresh.
    pub tokens:    u64,
    pub bytes_out: u64,
}

/// Apply a terminated token stream, writing the reconstructed content to
/// `out`. Match tokens read block `index * RSYNC_BLOCK_SIZE` from `basis`
/// (the previous content of the file); a match token without a basis means
/// the stream is corrupt.
pub fn apply_delta<R, S, W>(
    tokens: &mut R,
    basis: Option<&mut S>,
    out: &mut W,
) -> io::Result<ApplyOutcome>
where
    R: Read,
    S: Read + Seek,
    W: Write,
{
    let first = read_token(tokens)?;
    apply_delta_from(first, tokens, basis, out)
}

/// [`apply_delta`] continuation when the caller already consumed the first
/// token (the restore applier peeks it to recognize metadata-only frames).
pub fn apply_delta_from<R, S, W>(
    first: Token,
    tokens: &mut R,
    mut basis: Option<&mut S>,
    out: &mut W,
) -> io::Result<ApplyOutcome>
where
    R: Read,
    S: Read + Seek,
    W: Write,
{
    let mut outcome = ApplyOutcome::default();
    let mut block = vec![0u8; RSYNC_BLOCK_SIZE];
    let mut token = first;
    loop {
        match token {
            Token::End => return Ok(outcome),
            Token::Literal(bytes) => {
                out.write_all(&bytes)?;
                outcome.tokens += 1;
                outcome.bytes_out += bytes.len() as u64;
            }
            Token::Match(index) => {
                let basis = basis
                    .as_deref_mut()
                    .ok_or_else(|| corrupt("match token but no basis file"))?;
                let offset = u64::from(index) * RSYNC_BLOCK_SIZE as u64;
                basis.seek(SeekFrom::Start(offset))?;
                let filled = read_up_to(basis, &mut block)?;
                if filled == 0 {
                    return Err(corrupt("match token beyond end of basis file"));
                }
                out.write_all(&block[..filled])?;
                outcome.tokens += 1;
                outcome.bytes_out += filled as u64;
            }
        }
        token = read_token(tokens)?;
    }
}

/// Consume and discard a terminated token stream, keeping the reader
/// frame-aligned when the content cannot (or must not) be materialized.
pub fn drain_tokens<R: Read>(tokens: &mut R) -> io::Result<ApplyOutcome> {
    let first = read_token(tokens)?;
    drain_tokens_from(first, tokens)
}

/// [`drain_tokens`] continuation after the first token was already read.
pub fn drain_tokens_from<R: Read>(first: Token, tokens: &mut R) -> io::Result<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();
    let mut token = first;
    loop {
        match token {
            Token::End => return Ok(outcome),
            Token::Literal(bytes) => {
                outcome.tokens += 1;
                outcome.bytes_out += bytes.len() as u64;
            }
            Token::Match(_) => outcome.tokens += 1,
        }
        token = read_token(tokens)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::blockchecksums;
    use std::io::Cursor;

    fn delta_roundtrip(old: &[u8], new: &[u8]) -> (Vec<u8>, DeltaStats) {
        let sigs = blockchecksums(old).unwrap();
        let mut stream = Vec::new();
        let stats = generate_delta(new, &sigs, &mut stream).unwrap();

        let mut basis = Cursor::new(old.to_vec());
        let mut rebuilt = Vec::new();
        apply_delta(&mut Cursor::new(stream), Some(&mut basis), &mut rebuilt).unwrap();
        (rebuilt, stats)
    }

    #[test]
    fn identical_content_is_all_matches() {
        let data: Vec<u8> = (0..3 * RSYNC_BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        let (rebuilt, stats) = delta_roundtrip(&data, &data);
        assert_eq!(rebuilt, data);
        assert_eq!(stats.matched_blocks, 3);
        assert_eq!(stats.literal_bytes, 0);
    }

    #[test]
    fn small_edit_stays_small() {
        let old: Vec<u8> = (0..8 * RSYNC_BLOCK_SIZE).map(|i| (i % 239) as u8).collect();
        let mut new = old.clone();
        new[5 * RSYNC_BLOCK_SIZE + 17] ^= 0xA5;

        let (rebuilt, stats) = delta_roundtrip(&old, &new);
        assert_eq!(rebuilt, new);
        assert_eq!(stats.matched_blocks, 7);
        assert!(stats.literal_bytes <= RSYNC_BLOCK_SIZE as u64);
    }

    #[test]
    fn insertion_shifts_alignment() {
        let old: Vec<u8> = (0..4 * RSYNC_BLOCK_SIZE).map(|i| (i % 163) as u8).collect();
        let mut new = Vec::with_capacity(old.len() + 3);
        new.extend_from_slice(&old[..100]);
        new.extend_from_slice(b"+++");
        new.extend_from_slice(&old[100..]);

        let (rebuilt, stats) = delta_roundtrip(&old, &new);
        assert_eq!(rebuilt, new);
        // Alignment recovers after the insertion point.
        assert!(stats.matched_blocks >= 3);
    }

    #[test]
    fn empty_and_tiny_files() {
        let (rebuilt, _) = delta_roundtrip(b"", b"");
        assert!(rebuilt.is_empty());
        let (rebuilt, stats) = delta_roundtrip(b"old", b"new content");
        assert_eq!(rebuilt, b"new content");
        assert_eq!(stats.matched_blocks, 0);
    }

    #[test]
    fn truncated_token_stream_detected() {
        let sigs = blockchecksums(&b"x".repeat(RSYNC_BLOCK_SIZE)[..]).unwrap();
        let mut stream = Vec::new();
        generate_delta(&b"y".repeat(RSYNC_BLOCK_SIZE)[..], &sigs, &mut stream).unwrap();
        stream.truncate(stream.len() - 1); // lose the terminator

        let mut basis = Cursor::new(b"x".repeat(RSYNC_BLOCK_SIZE));
        let mut rebuilt = Vec::new();
        let err = apply_delta(&mut Cursor::new(stream), Some(&mut basis), &mut rebuilt)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn match_without_basis_rejected() {
        let mut stream = Vec::new();
        write_match(&mut stream, 0).unwrap();
        write_terminator(&mut stream).unwrap();
        let mut rebuilt = Vec::new();
        let err = apply_delta::<_, Cursor<Vec<u8>>, _>(
            &mut Cursor::new(stream),
            None,
            &mut rebuilt,
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn literal_runs_never_start_with_match_tag() {
        // 255 is exactly the length whose varint would begin with 0xFF.
        let bytes = vec![0xABu8; 255];
        let mut out = Vec::new();
        write_literal_run(&mut out, &bytes).unwrap();
        assert_ne!(out[0], MATCH_TAG);

        let mut r = Cursor::new(out);
        let mut collected = Vec::new();
        loop {
            match read_token(&mut r) {
                Ok(Token::Literal(b)) => collected.extend(b),
                Ok(Token::End) | Err(_) => break,
                Ok(Token::Match(_)) => panic!("unexpected match token"),
            }
        }
        assert_eq!(collected, bytes);
    }

    #[test]
    fn level0_runs_roundtrip() {
        let data: Vec<u8> = (0..150_000).map(|i| (i % 71) as u8).collect();
        let mut stream = Vec::new();
        emit_full(&mut &data[..], data.len() as u64, &mut stream).unwrap();

        let mut out = Vec::new();
        copy_literal_runs(&mut Cursor::new(stream), &mut out, data.len() as u64).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn level0_shrunk_source_zero_padded() {
        let data = b"short";
        let mut stream = Vec::new();
        emit_full(&mut &data[..], 10, &mut stream).unwrap();
        let mut out = Vec::new();
        copy_literal_runs(&mut Cursor::new(stream), &mut out, 10).unwrap();
        assert_eq!(&out[..5], data);
        assert_eq!(&out[5..], &[0u8; 5]);
    }
}
