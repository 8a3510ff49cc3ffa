//! Error taxonomy shared by every component of the image container and
//! capture pipeline. One enum, one `#[error(...)]` message per kind — the
//! same shape the teacher uses for `SuperblockError`/`CodecError`.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("header magic missing or unrecognised — not an image container")]
    BadMagic,

    #[error("unsupported container version {0}")]
    UnsupportedVersion(u32),

    #[error("malformed header: {0}")]
    BadHeader(String),

    #[error("last 12 bytes are not a valid TAIL locator")]
    MissingTail,

    #[error("index block is missing or truncated: {0}")]
    BadIndex(String),

    #[error("frame at file offset {offset} is truncated: {reason}")]
    TruncatedFrame { offset: u64, reason: String },

    #[error("chunk {chunk_index}: decompressed length {actual} != expected {expected}")]
    LengthMismatch {
        chunk_index: u32,
        expected: u32,
        actual: u32,
    },

    #[error("chunk {chunk_index}: SHA-256 digest mismatch")]
    DigestMismatch { chunk_index: u32 },

    #[error("chunk {chunk_index}: decode failed: {reason}")]
    DecodeError { chunk_index: u32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ImageError>;
