//! Random-access reader: parses header + index once at open, then serves
//! `read(device_offset, buf, count)` via binary search plus an LRU cache of
//! decompressed chunks.
//!
//! The binary-search-over-a-sorted-index-with-an-LRU-decompressed-cache shape
//! is grounded in `flyingcircusio-backy-extract`'s restore path, generalized
//! here from a content-hash cache key to a chunk-index key because this
//! format's index is positional rather than content-addressed.

use crate::container::{self, IndexEntry};
use crate::error::{ImageError, Result};
use crate::verify::{self, VerifyFailure, VerifyFailureKind, VerifyProgressFn};
use lru::LruCache;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::sync::Mutex;

pub const DEFAULT_CACHE_CAPACITY: usize = 4;

struct CacheState {
    cache: LruCache<u32, Vec<u8>>,
}

pub struct Reader {
    file: Mutex<File>,
    sector_size: u32,
    chunk_size: u32,
    device_length: u64,
    entries: Vec<IndexEntry>,
    cache: Mutex<CacheState>,
}

impl Reader {
    /// Open, parse header + index, and hold the file open for chunk loads.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::open_with_cache_capacity(path, DEFAULT_CACHE_CAPACITY)
    }

    pub fn open_with_cache_capacity(
        path: impl AsRef<std::path::Path>,
        cache_capacity: usize,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        let header = container::read_header(&mut file)?;
        let locator = container::read_locator(&mut file)?;
        let entries = container::read_index(&mut file, locator)?;

        let device_length = header.device_length.unwrap_or_else(|| {
            entries
                .last()
                .map(|e| e.device_offset + e.uncompressed_len as u64)
                .unwrap_or(0)
        });

        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        Ok(Self {
            file: Mutex::new(file),
            sector_size: header.sector_size,
            chunk_size: header.chunk_size,
            device_length,
            entries,
            cache: Mutex::new(CacheState {
                cache: LruCache::new(capacity),
            }),
        })
    }

    pub fn device_length(&self) -> u64 {
        self.device_length
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Binary search for the entry containing `offset`, if any.
    fn find_containing(&self, offset: u64) -> Option<usize> {
        match self
            .entries
            .binary_search_by(|e| e.device_offset.cmp(&offset))
        {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => {
                let candidate = i - 1;
                let e = &self.entries[candidate];
                if offset < e.device_offset + e.uncompressed_len as u64 {
                    Some(candidate)
                } else {
                    None
                }
            }
        }
    }

    /// Index of the first entry whose `device_offset > offset`, or
    /// `entries.len()` if none.
    fn find_next_after(&self, offset: u64) -> usize {
        match self
            .entries
            .binary_search_by(|e| e.device_offset.cmp(&offset))
        {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Zero-fill `buf`, then copy live bytes wherever the index covers
    /// `[device_offset, device_offset+count)`.
    pub fn read(&self, device_offset: u64, buf: &mut [u8], count: usize) -> Result<usize> {
        let count = count.min(buf.len());
        buf[..count].fill(0);

        if device_offset >= self.device_length {
            return Ok(0);
        }

        let mut remaining = count.min((self.device_length - device_offset) as usize);
        let effective = remaining;
        let mut cursor = device_offset;
        let mut written = 0usize;

        while remaining > 0 {
            match self.find_containing(cursor) {
                Some(idx) => {
                    let e = self.entries[idx];
                    let within = (cursor - e.device_offset) as usize;
                    let avail = e.uncompressed_len as usize - within;
                    let take = remaining.min(avail);

                    let chunk = self.load_chunk(idx, &e)?;
                    buf[written..written + take].copy_from_slice(&chunk[within..within + take]);

                    cursor += take as u64;
                    written += take;
                    remaining -= take;
                }
                None => {
                    let next_idx = self.find_next_after(cursor);
                    let gap_end = if next_idx < self.entries.len() {
                        self.entries[next_idx].device_offset
                    } else {
                        self.device_length
                    };
                    let gap = (gap_end - cursor) as usize;
                    let skip = remaining.min(gap);
                    cursor += skip as u64;
                    written += skip;
                    remaining -= skip;
                    if skip == 0 {
                        // No entry and no gap room left; avoid looping forever.
                        break;
                    }
                }
            }
        }

        Ok(effective)
    }

    fn load_chunk(&self, idx: usize, e: &IndexEntry) -> Result<Vec<u8>> {
        {
            let mut state = self.cache.lock().unwrap();
            if let Some(hit) = state.cache.get(&(idx as u32)) {
                return Ok(hit.clone());
            }
        }

        let compressed = {
            let mut file = self.file.lock().unwrap();
            let header_offset = e.file_offset.saturating_sub(container::FRAME_HEADER_SIZE as u64);
            file.seek(SeekFrom::Start(header_offset))?;
            let header = container::read_frame_header(&mut *file, self.chunk_size)?;
            let mut buf = vec![0u8; header.compressed_len as usize];
            let mut read_total = 0;
            while read_total < buf.len() {
                let n = file.read(&mut buf[read_total..])?;
                if n == 0 {
                    return Err(ImageError::TruncatedFrame {
                        offset: e.file_offset,
                        reason: "payload shorter than CompressedLength".into(),
                    });
                }
                read_total += n;
            }
            buf
        };

        let decompressed = zstd::decode_all(&compressed[..]).map_err(|err| ImageError::DecodeError {
            chunk_index: idx as u32,
            reason: err.to_string(),
        })?;

        if decompressed.len() != e.uncompressed_len as usize {
            return Err(ImageError::LengthMismatch {
                chunk_index: idx as u32,
                expected: e.uncompressed_len,
                actual: decompressed.len() as u32,
            });
        }

        let mut state = self.cache.lock().unwrap();
        state.cache.put(idx as u32, decompressed.clone());
        Ok(decompressed)
    }

    /// Fetch one frame's stored digest and raw compressed payload, for the
    /// verifier. Reads the 52-byte header immediately preceding
    /// `e.file_offset`, bounds-checking its declared lengths against
    /// `chunk_size`, then the payload bytes it declares.
    pub(crate) fn fetch_raw_frame(&self, e: &IndexEntry) -> std::result::Result<([u8; 32], Vec<u8>), VerifyFailureKind> {
        let mut file = self.file.lock().unwrap();
        let header_offset = e.file_offset.saturating_sub(container::FRAME_HEADER_SIZE as u64);
        if file.seek(SeekFrom::Start(header_offset)).is_err() {
            return Err(VerifyFailureKind::TruncatedFrame);
        }
        let header = container::read_frame_header(&mut *file, self.chunk_size)
            .map_err(|_| VerifyFailureKind::TruncatedFrame)?;

        let mut compressed = vec![0u8; header.compressed_len as usize];
        if file.read_exact(&mut compressed).is_err() {
            return Err(VerifyFailureKind::TruncatedFrame);
        }
        Ok((header.digest, compressed))
    }

    /// Verify every frame in file order, using a bounded work queue and a
    /// worker pool. First failure cancels outstanding work and is returned.
    pub fn verify_full(&self, progress: &mut VerifyProgressFn, parallelism: usize) -> Option<VerifyFailure> {
        verify::verify_full(self, progress, parallelism)
    }

    /// Verify a stride-sampled subset: {0, N-1} plus every `s`-th index,
    /// where `s` depends on N.
    pub fn verify_quick(&self, progress: &mut VerifyProgressFn, parallelism: usize) -> Option<VerifyFailure> {
        verify::verify_quick(self, progress, parallelism)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_reader::FileBlockReader;
    use crate::pipeline::Writer;
    use proptest::prop_assert_eq;
    use std::io::Write as _;

    fn build_sample() -> (tempfile::NamedTempFile, Vec<u8>) {
        let device_bytes: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
        let mut device = tempfile::NamedTempFile::new().unwrap();
        device.write_all(&device_bytes).unwrap();
        device.flush().unwrap();

        let reader = FileBlockReader::open(device.path(), 512).unwrap();
        let out = tempfile::NamedTempFile::new().unwrap();
        let mut w = Writer::new(out.path(), 512, 4 * 1024 * 1024, 10 * 1024 * 1024, "").unwrap();
        w.write_from(&reader, 0, None, 0, &mut |_, _| {}, 2, 2).unwrap();
        w.close().unwrap();

        (out, device_bytes)
    }

    #[test]
    fn read_matches_source_bit_for_bit() {
        let (out, device_bytes) = build_sample();
        let reader = Reader::open(out.path()).unwrap();

        let mut buf = vec![0u8; 1000];
        let n = reader.read(5_000_000, &mut buf, 1000).unwrap();
        assert_eq!(n, 1000);
        assert_eq!(&buf[..], &device_bytes[5_000_000..5_001_000]);
    }

    #[test]
    fn read_past_eof_is_short_and_zero() {
        let (out, _) = build_sample();
        let reader = Reader::open(out.path()).unwrap();

        let mut buf = vec![0xffu8; 100];
        let n = reader.read(10 * 1024 * 1024 - 10, &mut buf, 100).unwrap();
        assert_eq!(n, 10);
        assert!(buf[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_fill_over_gap() {
        let device_bytes: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 200) as u8).collect();
        let mut device = tempfile::NamedTempFile::new().unwrap();
        device.write_all(&device_bytes).unwrap();
        device.flush().unwrap();
        let file_reader = FileBlockReader::open(device.path(), 512).unwrap();

        struct RangedReader(FileBlockReader);
        impl crate::block_reader::BlockReader for RangedReader {
            fn total_size(&self) -> u64 { self.0.total_size() }
            fn sector_size(&self) -> u32 { self.0.sector_size() }
            fn seek(&self, o: u64) -> Result<()> { self.0.seek(o) }
            fn read(&self, buf: &mut [u8], o: u64, c: usize) -> Result<usize> { self.0.read(buf, o, c) }
            fn try_enumerate_allocated_ranges(&self, cb: &mut crate::block_reader::RangeCallback) -> Option<u64> {
                cb(0, 1024 * 1024);
                cb(8 * 1024 * 1024, 2 * 1024 * 1024);
                Some(3 * 1024 * 1024)
            }
        }
        let ranged = RangedReader(file_reader);

        let out = tempfile::NamedTempFile::new().unwrap();
        let mut w = Writer::new(out.path(), 512, 1024 * 1024, 10 * 1024 * 1024, "").unwrap();
        w.write_allocated_only(&ranged, 0, &mut |_, _| {}, 1, 1).unwrap();
        w.close().unwrap();

        let reader = Reader::open(out.path()).unwrap();
        let mut buf = vec![0xffu8; 12_582_912];
        let n = reader.read(0, &mut buf, 12_582_912).unwrap();
        assert_eq!(n, 12_582_912);
        assert_eq!(&buf[0..1_048_576], &device_bytes[0..1_048_576]);
        assert!(buf[1_048_576..8_388_608].iter().all(|&b| b == 0));
        assert_eq!(&buf[8_388_608..10_485_760], &device_bytes[8_388_608..10_485_760]);
        assert!(buf[10_485_760..12_582_912].iter().all(|&b| b == 0));
    }

    #[test]
    fn verify_full_detects_flipped_byte() {
        let (out, _) = build_sample();
        {
            let reader = Reader::open(out.path()).unwrap();
            assert!(reader.verify_full(&mut |_, _| {}, 2).is_none());
        }

        let mut bytes = std::fs::read(out.path()).unwrap();
        // Flip a byte inside the first frame's compressed payload.
        let first_payload_start = container::FRAME_HEADER_SIZE + 3;
        bytes[first_payload_start] ^= 0xff;
        std::fs::write(out.path(), &bytes).unwrap();

        let reader = Reader::open(out.path()).unwrap();
        let failure = reader.verify_full(&mut |_, _| {}, 2);
        assert!(failure.is_some());
        assert_eq!(failure.unwrap().chunk_index, 0);
    }

    #[test]
    fn concurrent_random_access_matches_source() {
        let (out, device_bytes) = build_sample();
        let reader = std::sync::Arc::new(Reader::open_with_cache_capacity(out.path(), 4).unwrap());

        let mut handles = Vec::new();
        for t in 0..8 {
            let reader = std::sync::Arc::clone(&reader);
            let device_bytes = device_bytes.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..125 {
                    let offset = ((t * 125 + i) * 7919) % (10 * 1024 * 1024 - 128);
                    let mut buf = vec![0u8; 64];
                    let n = reader.read(offset as u64, &mut buf, 64).unwrap();
                    assert_eq!(n, 64);
                    assert_eq!(&buf[..], &device_bytes[offset..offset + 64]);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(8))]
        #[test]
        fn read_matches_source_for_arbitrary_offset_and_count(
            offset in 0u64..(10 * 1024 * 1024),
            count in 1usize..65536,
        ) {
            let (out, device_bytes) = build_sample();
            let reader = Reader::open(out.path()).unwrap();

            let mut buf = vec![0u8; count];
            let n = reader.read(offset, &mut buf, count).unwrap();

            let expected_n = count.min((device_bytes.len() as u64 - offset).max(0) as usize);
            prop_assert_eq!(n, expected_n);
            prop_assert_eq!(&buf[..n], &device_bytes[offset as usize..offset as usize + n]);
        }
    }
}
