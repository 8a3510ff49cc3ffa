//! Capture pipeline: read -> hash+compress (parallel) -> ordered write.
//!
//! Shape follows `flyingcircusio-backy-extract`'s reader/worker-pool/writer
//! thread split (one producer, N compressors, one serializing writer) with
//! the teacher's "build the index as you go, patch the trailer on close"
//! approach from `io_stream/mod.rs::SixCyWriter`.

use crate::block_reader::BlockReader;
use crate::compressor::{InputItem, Pool};
use crate::container::{self, IndexEntry};
use crate::error::{ImageError, Result};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Called after each frame is emitted with `(chunks_written, bytes_written)`.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

/// Polled by the control monitor once per second; returns the desired
/// worker count.
pub type DesiredParallelFn = dyn Fn() -> usize + Send + Sync;

pub struct Writer {
    file: File,
    sector_size: u32,
    chunk_size: u32,
    device_length: u64,
    entries: Vec<IndexEntry>,
    /// Byte offset the next frame will be written at.
    write_cursor: u64,
}

impl Writer {
    /// Create a brand-new container at `path`, writing the v3 header
    /// immediately.
    pub fn new(
        path: impl AsRef<Path>,
        sector_size: u32,
        chunk_size: u32,
        device_length: u64,
        fs_tag: &str,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .read(true)
            .open(path)?;
        container::write_header(&mut file, sector_size, chunk_size, device_length, fs_tag)?;
        let write_cursor = file.stream_position()?;
        Ok(Self {
            file,
            sector_size,
            chunk_size,
            device_length,
            entries: Vec::new(),
            write_cursor,
        })
    }

    /// Reopen an existing, cleanly-closed container for resume: parse its
    /// header and index, truncate away the old index+tail, and position the
    /// write cursor at the old index's start.
    pub fn open_for_resume(path: impl AsRef<Path>) -> Result<(Self, u64, u32)> {
        let path = path.as_ref();
        let mut ro = File::open(path)?;
        let header = container::read_header(&mut ro)?;
        let locator = container::read_locator(&mut ro)?;
        let entries = container::read_index(&mut ro, locator)?;
        drop(ro);

        let (next_offset, next_index) = match entries.last() {
            Some(last) => (
                last.device_offset + last.uncompressed_len as u64,
                entries.len() as u32,
            ),
            None => (0, 0),
        };

        let mut file = OpenOptions::new().write(true).read(true).open(path)?;
        file.set_len(locator)?;
        file.seek(SeekFrom::Start(locator))?;

        let device_length = header.device_length.unwrap_or_else(|| {
            entries
                .last()
                .map(|e| e.device_offset + e.uncompressed_len as u64)
                .unwrap_or(0)
        });

        let writer = Self {
            file,
            sector_size: header.sector_size,
            chunk_size: header.chunk_size,
            device_length,
            entries,
            write_cursor: locator,
        };
        Ok((writer, next_offset, next_index))
    }

    /// Compute `(next_device_offset, next_chunk_index)` without mutating
    /// anything, per the consumer API's `compute_resume_point`.
    pub fn compute_resume_point(path: impl AsRef<Path>) -> Result<(u64, u32)> {
        let mut f = File::open(path)?;
        let locator = container::read_locator(&mut f)?;
        let entries = container::read_index(&mut f, locator)?;
        match entries.last() {
            Some(last) => Ok((
                last.device_offset + last.uncompressed_len as u64,
                entries.len() as u32,
            )),
            None => Ok((0, 0)),
        }
    }

    /// Full-range capture: tile `[start_offset, min(device_size, start_offset+max_bytes))`
    /// into `chunk_size`-aligned chunks, starting chunk indices at
    /// `start_chunk_index`.
    pub fn write_from(
        &mut self,
        reader: &dyn BlockReader,
        start_offset: u64,
        max_bytes: Option<u64>,
        start_chunk_index: u32,
        progress: &mut ProgressFn,
        desired_parallel: usize,
        pipeline_depth: usize,
    ) -> Result<(u64, u64)> {
        let device_size = reader.total_size();
        let end = match max_bytes {
            Some(mb) => device_size.min(start_offset.saturating_add(mb)),
            None => device_size,
        };
        if start_offset >= end {
            return Ok((0, start_offset));
        }

        let chunk_size = self.chunk_size as u64;
        let mut ranges = Vec::new();
        let mut off = start_offset;
        while off < end {
            let len = chunk_size.min(end - off);
            ranges.push((off, len));
            off += len;
        }

        self.run_pipeline(reader, ranges, start_chunk_index, progress, desired_parallel, pipeline_depth)
    }

    /// Allocated-only capture: chunk each enumerated allocated range
    /// independently, never straddling a range boundary. Falls back to
    /// `write_from` (documented limitation) when the reader can't enumerate.
    pub fn write_allocated_only(
        &mut self,
        reader: &dyn BlockReader,
        start_chunk_index: u32,
        progress: &mut ProgressFn,
        desired_parallel: usize,
        pipeline_depth: usize,
    ) -> Result<(u64, u64)> {
        let chunk_size = self.chunk_size as u64;
        let mut ranges = Vec::new();
        let found = reader.try_enumerate_allocated_ranges(&mut |offset, length| {
            let mut pos = offset;
            let end = offset + length;
            while pos < end {
                let len = chunk_size.min(end - pos);
                ranges.push((pos, len));
                pos += len;
            }
        });

        if found.is_none() {
            return self.write_from(reader, 0, None, start_chunk_index, progress, desired_parallel, pipeline_depth);
        }

        self.run_pipeline(reader, ranges, start_chunk_index, progress, desired_parallel, pipeline_depth)
    }

    fn run_pipeline(
        &mut self,
        reader: &dyn BlockReader,
        ranges: Vec<(u64, u64)>,
        start_chunk_index: u32,
        progress: &mut ProgressFn,
        desired_parallel: usize,
        pipeline_depth: usize,
    ) -> Result<(u64, u64)> {
        if ranges.is_empty() {
            return Ok((0, 0));
        }

        let workers = desired_parallel.max(1);
        let depth = pipeline_depth.max(1);
        let queue_capacity = (workers * depth).max(2);

        let mut pool = Pool::new(queue_capacity, workers);
        let input_tx = pool.sender();
        let output_rx = pool.receiver();

        let error: Arc<Mutex<Option<ImageError>>> = Arc::new(Mutex::new(None));
        let cancelled = Arc::new(AtomicBool::new(false));

        // Producer thread: reads the device and feeds the compressor pool.
        let producer_error = Arc::clone(&error);
        let producer_cancelled = Arc::clone(&cancelled);
        let total_chunks = ranges.len() as u32;
        let items_sent = Arc::new(AtomicU32::new(0));
        let producer_done = Arc::new(AtomicBool::new(false));
        let writer_items_sent = Arc::clone(&items_sent);
        let writer_producer_done = Arc::clone(&producer_done);

        let producer = std::thread::scope(|scope| -> Result<()> {
            let producer_handle = scope.spawn(move || {
                for (i, (offset, len)) in ranges.iter().enumerate() {
                    if producer_cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let mut buf = vec![0u8; *len as usize];
                    let n = match reader.read(&mut buf, *offset, *len as usize) {
                        Ok(n) => n,
                        Err(e) => {
                            *producer_error.lock().unwrap() = Some(e);
                            producer_cancelled.store(true, Ordering::SeqCst);
                            break;
                        }
                    };
                    buf.truncate(n);
                    let item = InputItem {
                        chunk_index: start_chunk_index + i as u32,
                        device_offset: *offset,
                        data: buf,
                    };
                    if input_tx.send(item).is_err() {
                        break;
                    }
                    items_sent.fetch_add(1, Ordering::SeqCst);
                }
                producer_done.store(true, Ordering::SeqCst);
                // Dropping input_tx here closes the queue once the scope ends.
            });

            // Writer: consumes compressed output, reorders, emits frames.
            let mut next_index = start_chunk_index;
            let mut pending: BTreeMap<u32, crate::compressor::OutputItem> = BTreeMap::new();
            let mut received = 0u32;
            let mut chunks_written = 0u64;
            let mut bytes_written = 0u64;
            let mut last_offset = self.device_length;

            loop {
                if received >= total_chunks {
                    break;
                }
                match output_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(item) => {
                        received += 1;
                        pending.insert(item.chunk_index, item);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        // If the producer has finished and every item it sent
                        // has already been accounted for, no more output is
                        // coming (e.g. the producer hit an I/O error early).
                        if writer_producer_done.load(Ordering::SeqCst)
                            && received >= writer_items_sent.load(Ordering::SeqCst)
                        {
                            break;
                        }
                        continue;
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }

                while let Some(item) = pending.remove(&next_index) {
                    let file_offset = self.write_cursor + container::FRAME_HEADER_SIZE as u64;
                    container::write_frame(
                        &mut self.file,
                        item.chunk_index,
                        item.device_offset,
                        item.uncompressed_len,
                        item.digest,
                        &item.compressed,
                    )
                    .map_err(|e| {
                        cancelled.store(true, Ordering::SeqCst);
                        e
                    })?;
                    self.write_cursor = file_offset + item.compressed.len() as u64;

                    self.entries.push(IndexEntry {
                        device_offset: item.device_offset,
                        file_offset,
                        uncompressed_len: item.uncompressed_len,
                        compressed_len: item.compressed.len() as u32,
                    });

                    chunks_written += 1;
                    bytes_written += item.uncompressed_len as u64;
                    last_offset = item.device_offset + item.uncompressed_len as u64;
                    next_index += 1;

                    progress(chunks_written, bytes_written);
                    log::debug!(
                        "wrote chunk {} at device offset {} ({} bytes compressed)",
                        item.chunk_index,
                        item.device_offset,
                        item.compressed.len()
                    );
                }
            }

            producer_handle.join().expect("producer thread panicked");
            pool.shutdown();

            self.device_length = self.device_length.max(last_offset);

            if let Some(e) = error.lock().unwrap().take() {
                return Err(e);
            }
            Ok(())
        });

        producer?;
        let last = self.entries.last().map(|e| e.device_offset + e.uncompressed_len as u64).unwrap_or(0);
        Ok((self.entries.len() as u64, last))
    }

    /// Write `IDX1`+count+entries, then `TAIL`+locator. Flush to disk.
    pub fn close(mut self) -> Result<()> {
        let mut buffered = BufWriter::new(&mut self.file);
        buffered.seek(SeekFrom::Start(self.write_cursor))?;
        container::write_footer(&mut buffered, &self.entries)?;
        buffered.flush()?;
        Ok(())
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_reader::FileBlockReader;
    use std::io::Write as _;

    fn make_device(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(bytes).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn full_capture_tiles_device_into_chunks() {
        let device_bytes = vec![42u8; 10 * 1024 * 1024];
        let device = make_device(&device_bytes);
        let reader = FileBlockReader::open(device.path(), 512).unwrap();

        let out = tempfile::NamedTempFile::new().unwrap();
        let mut writer = Writer::new(out.path(), 512, 4 * 1024 * 1024, 10 * 1024 * 1024, "").unwrap();
        let (chunks, last) = writer
            .write_from(&reader, 0, None, 0, &mut |_, _| {}, 2, 2)
            .unwrap();
        assert_eq!(chunks, 3);
        assert_eq!(last, 10 * 1024 * 1024);

        let expected_offsets = [0u64, 4 * 1024 * 1024, 8 * 1024 * 1024];
        let expected_lens = [4 * 1024 * 1024u32, 4 * 1024 * 1024, 2 * 1024 * 1024];
        for (i, e) in writer.entries().iter().enumerate() {
            assert_eq!(e.device_offset, expected_offsets[i]);
            assert_eq!(e.uncompressed_len, expected_lens[i]);
        }
        writer.close().unwrap();
    }

    #[test]
    fn resume_after_partial_capture_matches_uninterrupted() {
        let device_bytes: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let device = make_device(&device_bytes);
        let reader = FileBlockReader::open(device.path(), 512).unwrap();

        // Clean capture in one shot.
        let baseline = tempfile::NamedTempFile::new().unwrap();
        let mut w = Writer::new(baseline.path(), 512, 4 * 1024 * 1024, 10 * 1024 * 1024, "").unwrap();
        w.write_from(&reader, 0, None, 0, &mut |_, _| {}, 1, 1).unwrap();
        w.close().unwrap();

        // Interrupted: write just 1 chunk, close cleanly (simulating a
        // deliberate checkpoint rather than a crash).
        let resumable = tempfile::NamedTempFile::new().unwrap();
        let mut w1 = Writer::new(resumable.path(), 512, 4 * 1024 * 1024, 10 * 1024 * 1024, "").unwrap();
        w1.write_from(&reader, 0, Some(4 * 1024 * 1024), 0, &mut |_, _| {}, 1, 1).unwrap();
        w1.close().unwrap();

        let (next_offset, next_index) = Writer::compute_resume_point(resumable.path()).unwrap();
        assert_eq!(next_offset, 4 * 1024 * 1024);
        assert_eq!(next_index, 1);

        let (mut w2, next_offset2, next_index2) = Writer::open_for_resume(resumable.path()).unwrap();
        assert_eq!(next_offset2, next_offset);
        assert_eq!(next_index2, next_index);
        w2.write_from(&reader, next_offset2, None, next_index2, &mut |_, _| {}, 1, 1).unwrap();
        w2.close().unwrap();

        let baseline_bytes = std::fs::read(baseline.path()).unwrap();
        let resumed_bytes = std::fs::read(resumable.path()).unwrap();
        assert_eq!(baseline_bytes, resumed_bytes);
    }

    #[test]
    fn missing_tail_on_uncleanly_closed_file() {
        let device_bytes = vec![1u8; 1024 * 1024];
        let device = make_device(&device_bytes);
        let reader = FileBlockReader::open(device.path(), 512).unwrap();

        let out = tempfile::NamedTempFile::new().unwrap();
        let mut w = Writer::new(out.path(), 512, 512 * 1024, 1024 * 1024, "").unwrap();
        w.write_from(&reader, 0, Some(512 * 1024), 0, &mut |_, _| {}, 1, 1).unwrap();
        // Deliberately drop without calling close(): no index/tail written.
        drop(w);

        let result = Writer::compute_resume_point(out.path());
        assert!(matches!(result, Err(ImageError::MissingTail)));
    }

    #[test]
    fn allocated_only_respects_range_boundaries() {
        let device_bytes: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 200) as u8).collect();
        let device = make_device(&device_bytes);
        let reader = FileBlockReader::open(device.path(), 512).unwrap();

        struct RangedReader(FileBlockReader);
        impl BlockReader for RangedReader {
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
        let ranged = RangedReader(reader);

        let out = tempfile::NamedTempFile::new().unwrap();
        let mut w = Writer::new(out.path(), 512, 1024 * 1024, 10 * 1024 * 1024, "").unwrap();
        let (chunks, _) = w
            .write_allocated_only(&ranged, 0, &mut |_, _| {}, 1, 1)
            .unwrap();
        assert_eq!(chunks, 3);
        assert_eq!(w.entries()[0].device_offset, 0);
        assert_eq!(w.entries()[1].device_offset, 8 * 1024 * 1024);
        assert_eq!(w.entries()[2].device_offset, 9 * 1024 * 1024);
        w.close().unwrap();
    }
}
