//! The contract the capture pipeline consumes from the OS/device layer.
//!
//! The core never opens a raw device or walks a filesystem's allocation
//! bitmap itself — it is handed an implementation of [`BlockReader`] by a
//! thin, out-of-scope client, exactly as the teacher's container core never
//! knew how `archive.rs`'s caller found its input files.

use crate::error::Result;

/// Callback invoked once per maximal allocated run, in ascending,
/// non-overlapping order: `(offset_bytes, length_bytes)`.
pub type RangeCallback<'a> = dyn FnMut(u64, u64) + 'a;

pub trait BlockReader: Send + Sync {
    /// Device byte length.
    fn total_size(&self) -> u64;

    /// Minimum alignment unit; reads should request multiples of this where
    /// possible.
    fn sector_size(&self) -> u32;

    /// Position the next `read` at `offset`. Implementations backed by a
    /// plain file may ignore this and rely on `read`'s own offset.
    fn seek(&self, offset: u64) -> Result<()>;

    /// Positional read. May return fewer than `count` bytes at EOF.
    /// `count` is guaranteed `<= chunk_size` by the caller.
    fn read(&self, buf: &mut [u8], offset: u64, count: usize) -> Result<usize>;

    /// Same contract as `read`, for readers that distinguish blocking vs.
    /// non-blocking paths. The default forwards to `read`.
    fn read_async(&self, buf: &mut [u8], offset: u64, count: usize) -> Result<usize> {
        self.read(buf, offset, count)
    }

    /// If the backing filesystem exposes an allocation map, invoke
    /// `callback(offset, length)` for each maximal allocated run in
    /// ascending order and return `Some(total_bytes_emitted)`. Return `None`
    /// if allocation-range enumeration is not supported.
    fn try_enumerate_allocated_ranges(&self, callback: &mut RangeCallback) -> Option<u64> {
        let _ = callback;
        None
    }
}

/// A plain regular-file `BlockReader`, used by tests and the CLI binary as a
/// stand-in "disk" — the way the teacher's integration test drives its
/// archive writer against a `NamedTempFile` instead of a real device.
///
/// `try_enumerate_allocated_ranges` always returns `None`: this adapter makes
/// no claim about sparse-file allocation, it is a minimal concrete
/// implementation, not the OS-specific collaborator the core excludes.
pub struct FileBlockReader {
    file: std::sync::Mutex<std::fs::File>,
    total_size: u64,
    sector_size: u32,
}

impl FileBlockReader {
    pub fn open(path: impl AsRef<std::path::Path>, sector_size: u32) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let total_size = file.metadata()?.len();
        Ok(Self {
            file: std::sync::Mutex::new(file),
            total_size,
            sector_size,
        })
    }
}

impl BlockReader for FileBlockReader {
    fn total_size(&self) -> u64 {
        self.total_size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn seek(&self, offset: u64) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        let mut f = self.file.lock().unwrap();
        f.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read(&self, buf: &mut [u8], offset: u64, count: usize) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        let f = self.file.lock().unwrap();
        // Short reads at EOF are legal; clamp `count` against total_size first.
        let available = self.total_size.saturating_sub(offset).min(count as u64) as usize;
        if available == 0 {
            return Ok(0);
        }
        let mut read_total = 0;
        while read_total < available {
            let n = f.read_at(&mut buf[read_total..available], offset + read_total as u64)?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        Ok(read_total)
    }
}
