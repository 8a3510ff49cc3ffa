//! # devimage — block device image container and capture pipeline
//!
//! Format guarantees (v3):
//! - All numeric fields are little-endian; never negotiated
//! - Every chunk frame carries a fixed 52-byte header and a SHA-256 digest
//!   of its uncompressed payload
//! - Compression is zstd at a fixed level; no per-chunk codec negotiation
//! - The index is a trailing, positional table; the last 12 bytes of a
//!   cleanly-closed container are always `TAIL`+locator
//! - OS-specific device access is never performed by this crate directly —
//!   callers supply a [`BlockReader`]

pub mod block_reader;
pub mod compressor;
pub mod config;
pub mod container;
pub mod error;
pub mod pipeline;
pub mod reader;
pub mod verify;

// Flat re-exports for the most common types.
pub use block_reader::{BlockReader, FileBlockReader, RangeCallback};
pub use config::{CaptureConfig, ReaderConfig};
pub use container::{Header, IndexEntry};
pub use error::{ImageError, Result};
pub use pipeline::Writer;
pub use reader::Reader;
pub use verify::{VerifyFailure, VerifyFailureKind};
