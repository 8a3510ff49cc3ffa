//! Image container format — header, chunk frames, index, tail locator.
//!
//! # On-disk layout
//!
//! ```text
//! Header   : magic "IMG1" | version u32 | sector_size u32 | chunk_size u32
//!            | device_length u64 (v2+) | fs_tag_len u32 + fs_tag bytes (v3)
//! ChunkFrame (repeated): chunk_index u32 | device_offset u64
//!            | uncompressed_len u32 | compressed_len u32 | digest [u8; 32]
//!            | compressed bytes...
//! Index    : magic "IDX1" | entry_count u32
//!            | entries: device_offset u64 | file_offset u64
//!                        | uncompressed_len u32 | compressed_len u32
//! Tail     : magic "TAIL" | index_start u64          (always the last 12 bytes)
//! ```
//!
//! All multi-byte integers are little-endian. Frame header size is fixed at
//! 52 bytes; index entries are fixed at 24 bytes. Mirrors the teacher's
//! build-a-buffer-then-slice style (`superblock.rs`, `block.rs`) rather than
//! relying on `#[repr(C)]` struct layout, which is not portable across hosts.

use crate::error::{ImageError, Result};
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom, Write};

pub const MAGIC: &[u8; 4] = b"IMG1";
pub const CURRENT_VERSION: u32 = 3;
pub const MIN_VERSION: u32 = 1;

pub const INDEX_MAGIC: &[u8; 4] = b"IDX1";
pub const TAIL_MAGIC: &[u8; 4] = b"TAIL";

pub const FRAME_HEADER_SIZE: usize = 52;
pub const INDEX_ENTRY_SIZE: usize = 24;
pub const TAIL_SIZE: usize = 12;

/// Reject an `fs_tag` longer than this many bytes as `BadHeader`.
pub const MAX_FS_TAG_LEN: usize = 65_536;

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Header {
    pub version: u32,
    pub sector_size: u32,
    pub chunk_size: u32,
    /// `None` only for a v1 header; callers must derive device length from
    /// the last index entry in that case.
    pub device_length: Option<u64>,
    /// `None` for v1/v2 headers.
    pub fs_tag: Option<String>,
}

/// Write a v3 header. Called exactly once, at the start of a fresh container.
pub fn write_header<W: Write>(
    mut w: W,
    sector_size: u32,
    chunk_size: u32,
    device_length: u64,
    fs_tag: &str,
) -> Result<()> {
    if fs_tag.len() > MAX_FS_TAG_LEN {
        return Err(ImageError::BadHeader(format!(
            "fs_tag length {} exceeds maximum {}",
            fs_tag.len(),
            MAX_FS_TAG_LEN
        )));
    }

    let mut buf = Vec::with_capacity(28 + fs_tag.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
    buf.extend_from_slice(&sector_size.to_le_bytes());
    buf.extend_from_slice(&chunk_size.to_le_bytes());
    buf.extend_from_slice(&device_length.to_le_bytes());
    buf.extend_from_slice(&(fs_tag.len() as u32).to_le_bytes());
    buf.extend_from_slice(fs_tag.as_bytes());

    w.write_all(&buf)?;
    Ok(())
}

/// Read and validate a header of any supported version (1, 2, or 3).
pub fn read_header<R: Read>(mut r: R) -> Result<Header> {
    let mut fixed = [0u8; 16];
    r.read_exact(&mut fixed).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ImageError::BadMagic
        } else {
            ImageError::Io(e)
        }
    })?;

    if &fixed[0..4] != MAGIC {
        return Err(ImageError::BadMagic);
    }
    let version = u32::from_le_bytes(fixed[4..8].try_into().unwrap());
    if version < MIN_VERSION || version > CURRENT_VERSION {
        return Err(ImageError::UnsupportedVersion(version));
    }
    let sector_size = u32::from_le_bytes(fixed[8..12].try_into().unwrap());
    let chunk_size = u32::from_le_bytes(fixed[12..16].try_into().unwrap());

    let device_length = if version >= 2 {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        Some(u64::from_le_bytes(buf))
    } else {
        None
    };

    let fs_tag = if version >= 3 {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FS_TAG_LEN {
            return Err(ImageError::BadHeader(format!(
                "fs_tag length {len} exceeds maximum {MAX_FS_TAG_LEN}"
            )));
        }
        let mut tag_buf = vec![0u8; len];
        r.read_exact(&mut tag_buf)?;
        Some(String::from_utf8(tag_buf).map_err(|e| ImageError::BadHeader(e.to_string()))?)
    } else {
        None
    };

    Ok(Header {
        version,
        sector_size,
        chunk_size,
        device_length,
        fs_tag,
    })
}

// ── Chunk frame ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub chunk_index: u32,
    pub device_offset: u64,
    pub uncompressed_len: u32,
    pub compressed_len: u32,
    pub digest: [u8; 32],
}

/// Compute the SHA-256 digest of uncompressed chunk data.
pub fn digest_of(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Write one frame: 52-byte header followed by `compressed` bytes.
pub fn write_frame<W: Write>(
    mut w: W,
    chunk_index: u32,
    device_offset: u64,
    uncompressed_len: u32,
    digest: [u8; 32],
    compressed: &[u8],
) -> Result<()> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + compressed.len());
    buf.extend_from_slice(&chunk_index.to_le_bytes());
    buf.extend_from_slice(&device_offset.to_le_bytes());
    buf.extend_from_slice(&uncompressed_len.to_le_bytes());
    buf.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    buf.extend_from_slice(&digest);
    debug_assert_eq!(buf.len(), FRAME_HEADER_SIZE);
    buf.extend_from_slice(compressed);

    w.write_all(&buf)?;
    Ok(())
}

/// Read a 52-byte frame header at the reader's current position. Does not
/// read the payload. `chunk_size` bounds incompressible-chunk slack: lengths
/// exceeding `chunk_size * 2` are treated as corruption.
pub fn read_frame_header<R: Read>(mut r: R, chunk_size: u32) -> Result<FrameHeader> {
    let mut buf = [0u8; FRAME_HEADER_SIZE];
    r.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ImageError::TruncatedFrame {
                offset: 0,
                reason: "frame header truncated".into(),
            }
        } else {
            ImageError::Io(e)
        }
    })?;

    let chunk_index = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let device_offset = u64::from_le_bytes(buf[4..12].try_into().unwrap());
    let uncompressed_len = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    let compressed_len = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    let digest: [u8; 32] = buf[20..52].try_into().unwrap();

    let limit = (chunk_size as u64) * 2;
    if uncompressed_len as u64 > limit || compressed_len as u64 > limit {
        return Err(ImageError::TruncatedFrame {
            offset: device_offset,
            reason: format!(
                "declared lengths ({uncompressed_len}, {compressed_len}) exceed 2x chunk size ({chunk_size})"
            ),
        });
    }

    Ok(FrameHeader {
        chunk_index,
        device_offset,
        uncompressed_len,
        compressed_len,
        digest,
    })
}

// ── Index ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub device_offset: u64,
    pub file_offset: u64,
    pub uncompressed_len: u32,
    pub compressed_len: u32,
}

/// Write `IDX1` + count + entries at the writer's current position.
/// Returns the absolute offset the `IDX1` magic started at (the locator).
pub fn write_footer<W: Write + Seek>(mut w: W, entries: &[IndexEntry]) -> Result<u64> {
    let index_start = w.stream_position()?;

    let mut buf = Vec::with_capacity(8 + entries.len() * INDEX_ENTRY_SIZE);
    buf.extend_from_slice(INDEX_MAGIC);
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for e in entries {
        buf.extend_from_slice(&e.device_offset.to_le_bytes());
        buf.extend_from_slice(&e.file_offset.to_le_bytes());
        buf.extend_from_slice(&e.uncompressed_len.to_le_bytes());
        buf.extend_from_slice(&e.compressed_len.to_le_bytes());
    }
    w.write_all(&buf)?;

    let mut tail = Vec::with_capacity(TAIL_SIZE);
    tail.extend_from_slice(TAIL_MAGIC);
    tail.extend_from_slice(&index_start.to_le_bytes());
    w.write_all(&tail)?;
    w.flush()?;

    Ok(index_start)
}

/// Seek to end-12, validate `TAIL`, return the index start offset.
pub fn read_locator<R: Read + Seek>(mut r: R) -> Result<u64> {
    let end = r.seek(SeekFrom::End(0))?;
    if end < TAIL_SIZE as u64 {
        return Err(ImageError::MissingTail);
    }
    r.seek(SeekFrom::Start(end - TAIL_SIZE as u64))?;
    let mut buf = [0u8; TAIL_SIZE];
    r.read_exact(&mut buf)?;
    if &buf[0..4] != TAIL_MAGIC {
        return Err(ImageError::MissingTail);
    }
    Ok(u64::from_le_bytes(buf[4..12].try_into().unwrap()))
}

/// Validate `IDX1` at `locator`, read the entry count, read all entries.
pub fn read_index<R: Read + Seek>(mut r: R, locator: u64) -> Result<Vec<IndexEntry>> {
    r.seek(SeekFrom::Start(locator))?;
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| ImageError::BadIndex("truncated before IDX1 magic".into()))?;
    if &magic != INDEX_MAGIC {
        return Err(ImageError::BadIndex("IDX1 magic not found at locator".into()));
    }
    let mut count_buf = [0u8; 4];
    r.read_exact(&mut count_buf)
        .map_err(|_| ImageError::BadIndex("truncated entry count".into()))?;
    let count = u32::from_le_bytes(count_buf) as usize;

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        r.read_exact(&mut buf)
            .map_err(|_| ImageError::BadIndex(format!("truncated entry {i}")))?;
        entries.push(IndexEntry {
            device_offset: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            file_offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            uncompressed_len: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            compressed_len: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        });
    }
    Ok(entries)
}
