//! Per-entry stream frame header — length-prefixed, NUL-delimited.
//!
//! # On-wire layout (one frame per filesystem entry)
//!
//! ```text
//! [header_len:ASCII-int]\0
//! [path]\0[data_version]\0[mode]\0[uid]\0[gid]\0[size]\0
//! [mtime]\0[ctime]\0[uname]\0[gname]\0
//! [ftype]\0[lname]\0[inumber]\0[nlink]\0[devminor]\0[devmajor]\0
//! [rsync_block_size]\0[level_id]\0[deleted]
//! <payload bytes>
//! ```
//!
//! `header_len` counts every byte after its own terminating NUL up to the
//! start of the payload. All numeric fields are decimal ASCII. `level_id`
//! and `deleted` are four zero-padded ASCII digits; `deleted` is `0000` for
//! a live entry and `1111` for a tombstone. Fields never contain NUL: a
//! path (or link target, or resolved name) carrying one is rejected at
//! encode time rather than silently corrupting the frame.
//!
//! Payload presence and shape depend on `ftype`, `size`, and `level_id`;
//! see `delta.rs`. Non-regular entries and tombstones carry no payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `data_version` stamped into every frame of the v1 stream format.
pub const DATA_VERSION: u32 = 1;

/// Number of NUL-separated fields between the length prefix and the payload.
pub const HEADER_FIELDS: usize = 19;

/// Upper bound accepted for `header_len`; anything larger is treated as
/// stream corruption before any allocation happens.
pub const MAX_HEADER_LEN: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum HeaderError {
    /// A field that travels on the wire contains a NUL byte.
    #[error("invalid path or name (embedded NUL): {0:?}")]
    InvalidPath(String),
    /// The byte stream does not parse as a frame header.
    #[error("header decode failed: {0}")]
    Decode(String),
}

// ── File type ────────────────────────────────────────────────────────────────

/// Single-letter entry type carried in the `ftype` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    #[serde(rename = "r")]
    Regular,
    #[serde(rename = "d")]
    Directory,
    #[serde(rename = "l")]
    Symlink,
    #[serde(rename = "c")]
    CharDevice,
    #[serde(rename = "b")]
    BlockDevice,
    #[serde(rename = "p")]
    Fifo,
    #[serde(rename = "s")]
    Socket,
    #[serde(rename = "u")]
    Unknown,
}

impl FileType {
    pub fn as_char(self) -> char {
        match self {
            FileType::Regular => 'r',
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::CharDevice => 'c',
            FileType::BlockDevice => 'b',
            FileType::Fifo => 'p',
            FileType::Socket => 's',
            FileType::Unknown => 'u',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'r' => Some(FileType::Regular),
            'd' => Some(FileType::Directory),
            'l' => Some(FileType::Symlink),
            'c' => Some(FileType::CharDevice),
            'b' => Some(FileType::BlockDevice),
            'p' => Some(FileType::Fifo),
            's' => Some(FileType::Socket),
            'u' => Some(FileType::Unknown),
            _ => None,
        }
    }

    /// Regular-file payload handling also covers entries captured as
    /// `Unknown` by an older generation.
    pub fn is_reg_file(self) -> bool {
        matches!(self, FileType::Regular | FileType::Unknown)
    }
}

// ── Inode record ─────────────────────────────────────────────────────────────

/// Metadata of one filesystem entry as captured at backup time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub inumber:  u64,
    pub nlink:    u64,
    pub mode:     u32,
    pub uid:      u32,
    pub gid:      u32,
    pub size:     u64,
    pub devmajor: u64,
    pub devminor: u64,
    pub mtime:    i64,
    pub ctime:    i64,
    /// Resolved owner name; numeric string when lookup failed.
    pub uname:    String,
    /// Resolved group name; numeric string when lookup failed.
    pub gname:    String,
    pub ftype:    FileType,
    /// Symlink target; empty for every other type.
    pub lname:    String,
    pub rsync_block_size: u32,
    /// Generation within the backup series (`0` is the base full backup).
    pub level_id: u32,
    /// Tombstone marker: the path existed in an earlier generation and is
    /// gone from disk now.
    pub deleted:  bool,
}

// ── Encode ───────────────────────────────────────────────────────────────────

fn check_field(value: &str) -> Result<(), HeaderError> {
    if value.as_bytes().contains(&0) {
        return Err(HeaderError::InvalidPath(value.to_owned()));
    }
    Ok(())
}

/// Encode the full frame header (length prefix included) for one entry.
pub fn encode_header(path: &str, rec: &InodeRecord) -> Result<Vec<u8>, HeaderError> {
    check_field(path)?;
    check_field(&rec.lname)?;
    check_field(&rec.uname)?;
    check_field(&rec.gname)?;

    let body = format!(
        "{path}\0{dv}\0{mode}\0{uid}\0{gid}\0{size}\0{mtime}\0{ctime}\0\
         {uname}\0{gname}\0{ftype}\0{lname}\0{inumber}\0{nlink}\0\
         {devminor}\0{devmajor}\0{bs}\0{level:04}\0{deleted}",
        path = path,
        dv = DATA_VERSION,
        mode = rec.mode,
        uid = rec.uid,
        gid = rec.gid,
        size = rec.size,
        mtime = rec.mtime,
        ctime = rec.ctime,
        uname = rec.uname,
        gname = rec.gname,
        ftype = rec.ftype.as_char(),
        lname = rec.lname,
        inumber = rec.inumber,
        nlink = rec.nlink,
        devminor = rec.devminor,
        devmajor = rec.devmajor,
        bs = rec.rsync_block_size,
        level = rec.level_id,
        deleted = if rec.deleted { "1111" } else { "0000" },
    );

    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(body.len().to_string().as_bytes());
    out.push(0);
    out.extend_from_slice(body.as_bytes());
    Ok(out)
}

// ── Decode ───────────────────────────────────────────────────────────────────

/// Parse the ASCII length prefix. `digits` is everything read before the
/// first NUL.
pub fn parse_header_len(digits: &[u8]) -> Result<usize, HeaderError> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| HeaderError::Decode("header length is not ASCII".into()))?;
    let len: usize = text
        .parse()
        .map_err(|_| HeaderError::Decode(format!("bad header length {text:?}")))?;
    if len == 0 || len > MAX_HEADER_LEN {
        return Err(HeaderError::Decode(format!(
            "header length {len} outside 1..={MAX_HEADER_LEN}"
        )));
    }
    Ok(len)
}

fn parse_num<T: std::str::FromStr>(field: &str, name: &str) -> Result<T, HeaderError> {
    field
        .parse()
        .map_err(|_| HeaderError::Decode(format!("bad {name} field {field:?}")))
}

/// Decode exactly `header_len` header bytes into the entry path and its
/// [`InodeRecord`]. Rejects a wrong field count, a non-numeric numeric
/// field, an unknown `ftype`, and any `deleted` value other than the two
/// defined ones.
pub fn decode_header(buf: &[u8]) -> Result<(String, InodeRecord), HeaderError> {
    let text = std::str::from_utf8(buf)
        .map_err(|_| HeaderError::Decode("header is not valid UTF-8".into()))?;
    let fields: Vec<&str> = text.split('\0').collect();
    if fields.len() != HEADER_FIELDS {
        return Err(HeaderError::Decode(format!(
            "expected {HEADER_FIELDS} header fields, found {}",
            fields.len()
        )));
    }

    let data_version: u32 = parse_num(fields[1], "data_version")?;
    if data_version != DATA_VERSION {
        return Err(HeaderError::Decode(format!(
            "unsupported data_version {data_version} (this build handles {DATA_VERSION})"
        )));
    }

    let ftype_field = fields[10];
    let mut ftype_chars = ftype_field.chars();
    let ftype = match (ftype_chars.next(), ftype_chars.next()) {
        (Some(c), None) => FileType::from_char(c)
            .ok_or_else(|| HeaderError::Decode(format!("unknown ftype {c:?}")))?,
        _ => return Err(HeaderError::Decode(format!("bad ftype field {ftype_field:?}"))),
    };

    let deleted = match fields[18] {
        "0000" => false,
        "1111" => true,
        other => {
            return Err(HeaderError::Decode(format!("bad deleted field {other:?}")));
        }
    };

    let rec = InodeRecord {
        mode:     parse_num(fields[2], "mode")?,
        uid:      parse_num(fields[3], "uid")?,
        gid:      parse_num(fields[4], "gid")?,
        size:     parse_num(fields[5], "size")?,
        mtime:    parse_num(fields[6], "mtime")?,
        ctime:    parse_num(fields[7], "ctime")?,
        uname:    fields[8].to_owned(),
        gname:    fields[9].to_owned(),
        ftype,
        lname:    fields[11].to_owned(),
        inumber:  parse_num(fields[12], "inumber")?,
        nlink:    parse_num(fields[13], "nlink")?,
        devminor: parse_num(fields[14], "devminor")?,
        devmajor: parse_num(fields[15], "devmajor")?,
        rsync_block_size: parse_num(fields[16], "rsync_block_size")?,
        level_id: parse_num(fields[17], "level_id")?,
        deleted,
    };

    Ok((fields[0].to_owned(), rec))
}
