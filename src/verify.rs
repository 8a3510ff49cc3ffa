//! Full and quick (sampled) integrity verification.
//!
//! Both modes share one predicate (decompress, check length, check digest)
//! and drain a bounded work queue with a configurable worker pool, mirroring
//! the teacher's `recovery/scanner.rs` progress-callback/health-enum shape —
//! generalized here from "scan every block with no index" to "verify every
//! entry the index already names".

use crate::container::{self, IndexEntry};
use crate::reader::Reader;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// `(bytes_processed, total_bytes)` summed over compressed payload sizes of
/// the sample set.
pub type VerifyProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailureKind {
    LengthMismatch,
    DigestMismatch,
    DecodeError,
    TruncatedFrame,
}

#[derive(Debug, Clone, Copy)]
pub struct VerifyFailure {
    pub chunk_index: u32,
    pub kind: VerifyFailureKind,
}

struct WorkItem {
    chunk_index: u32,
    entry: IndexEntry,
}

fn check_one(reader: &Reader, item: &WorkItem) -> Result<(), VerifyFailureKind> {
    let (digest, compressed) = reader.fetch_raw_frame(&item.entry)?;
    let decompressed = zstd::decode_all(&compressed[..]).map_err(|_| VerifyFailureKind::DecodeError)?;
    if decompressed.len() != item.entry.uncompressed_len as usize {
        return Err(VerifyFailureKind::LengthMismatch);
    }
    if container::digest_of(&decompressed) != digest {
        return Err(VerifyFailureKind::DigestMismatch);
    }
    Ok(())
}

/// Drive `items` through `parallelism` workers against `reader`, reporting
/// progress as compressed bytes processed. Returns the first failure
/// observed, cancelling remaining work cooperatively.
fn run(reader: &Reader, items: Vec<WorkItem>, progress: &mut VerifyProgressFn, parallelism: usize) -> Option<VerifyFailure> {
    if items.is_empty() {
        return None;
    }
    let total_bytes: u64 = items.iter().map(|i| i.entry.compressed_len as u64).sum();
    let parallelism = parallelism.max(1).min(items.len());

    let (work_tx, work_rx) = bounded::<WorkItem>(items.len().min(256).max(2));
    let (result_tx, result_rx) = bounded::<(u32, u64, Result<(), VerifyFailureKind>)>(items.len().min(256).max(2));
    let cancelled = Arc::new(AtomicBool::new(false));

    std::thread::scope(|scope| {
        for _ in 0..parallelism {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let cancelled = Arc::clone(&cancelled);
            scope.spawn(move || {
                while let Ok(item) = work_rx.recv() {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let bytes = item.entry.compressed_len as u64;
                    let outcome = check_one(reader, &item);
                    let is_err = outcome.is_err();
                    if result_tx.send((item.chunk_index, bytes, outcome)).is_err() {
                        break;
                    }
                    if is_err {
                        cancelled.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        let feeder_cancelled = Arc::clone(&cancelled);
        scope.spawn(move || {
            for item in items {
                if feeder_cancelled.load(Ordering::SeqCst) {
                    break;
                }
                if work_tx.send(item).is_err() {
                    break;
                }
            }
        });

        let failure: Mutex<Option<VerifyFailure>> = Mutex::new(None);
        let mut processed_bytes = 0u64;
        while let Ok((chunk_index, bytes, outcome)) = result_rx.recv() {
            processed_bytes += bytes;
            progress(processed_bytes, total_bytes);
            if let Err(kind) = outcome {
                *failure.lock().unwrap() = Some(VerifyFailure { chunk_index, kind });
                break;
            }
        }
        failure.into_inner().unwrap()
    })
}

/// Verify every frame in file order.
pub fn verify_full(reader: &Reader, progress: &mut VerifyProgressFn, parallelism: usize) -> Option<VerifyFailure> {
    let items = reader
        .entries()
        .iter()
        .enumerate()
        .map(|(i, e)| WorkItem { chunk_index: i as u32, entry: *e })
        .collect();
    run(reader, items, progress, parallelism)
}

/// Verify a stride-sampled subset: `{0, N-1}` plus every `s`-th index, where
/// `s` is 10 for N<=200, 25 for N<=1000, else 50.
pub fn verify_quick(reader: &Reader, progress: &mut VerifyProgressFn, parallelism: usize) -> Option<VerifyFailure> {
    let entries = reader.entries();
    let n = entries.len();
    if n == 0 {
        return None;
    }
    let stride = if n <= 200 {
        10
    } else if n <= 1000 {
        25
    } else {
        50
    };

    let mut sample_indices: Vec<usize> = vec![0, n - 1];
    let mut s = stride;
    while s <= n.saturating_sub(2) {
        sample_indices.push(s);
        s += stride;
    }
    sample_indices.sort_unstable();
    sample_indices.dedup();

    let items = sample_indices
        .into_iter()
        .map(|i| WorkItem { chunk_index: i as u32, entry: entries[i] })
        .collect();
    run(reader, items, progress, parallelism)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_reader::FileBlockReader;
    use crate::pipeline::Writer;
    use std::io::Write as _;

    fn build_sample(n_chunks: usize) -> tempfile::NamedTempFile {
        let chunk_size = 64 * 1024;
        let device_bytes: Vec<u8> = (0..(n_chunks * chunk_size) as u32).map(|i| (i % 250) as u8).collect();
        let mut device = tempfile::NamedTempFile::new().unwrap();
        device.write_all(&device_bytes).unwrap();
        device.flush().unwrap();

        let reader = FileBlockReader::open(device.path(), 512).unwrap();
        let out = tempfile::NamedTempFile::new().unwrap();
        let mut w = Writer::new(out.path(), 512, chunk_size as u32, device_bytes.len() as u64, "").unwrap();
        w.write_from(&reader, 0, None, 0, &mut |_, _| {}, 2, 2).unwrap();
        w.close().unwrap();
        out
    }

    #[test]
    fn verify_full_passes_on_untouched_container() {
        let out = build_sample(20);
        let reader = Reader::open(out.path()).unwrap();
        assert!(verify_full(&reader, &mut |_, _| {}, 4).is_none());
    }

    #[test]
    fn verify_quick_samples_first_and_last() {
        let out = build_sample(300);
        let reader = Reader::open(out.path()).unwrap();
        let mut seen = 0;
        assert!(verify_quick(&reader, &mut |_, _| seen += 1, 4).is_none());
        assert!(seen > 0);
    }

    #[test]
    fn verify_quick_catches_corruption_of_first_chunk() {
        let out = build_sample(50);
        let mut bytes = std::fs::read(out.path()).unwrap();
        let payload_start = container::FRAME_HEADER_SIZE + 1;
        bytes[payload_start] ^= 0xff;
        std::fs::write(out.path(), &bytes).unwrap();

        let reader = Reader::open(out.path()).unwrap();
        let failure = verify_quick(&reader, &mut |_, _| {}, 4);
        assert!(failure.is_some());
        assert_eq!(failure.unwrap().chunk_index, 0);
    }
}
