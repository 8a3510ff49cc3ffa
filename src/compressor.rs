//! Dynamically-sized worker pool that hashes and compresses chunks.
//!
//! Mirrors the producer/worker/channel shape the pack uses for its own
//! parallel compression stages (`flyingcircusio-backy-extract`'s decompress
//! workers, the teacher's `perf.rs::compress_chunks_parallel`), but workers
//! here are long-lived and their count can change mid-run via [`Pool::set_degree`]
//! instead of being spawned once per batch.

use crate::container::digest_of;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub const COMPRESSION_LEVEL: i32 = 3;

pub struct InputItem {
    pub chunk_index: u32,
    pub device_offset: u64,
    pub data: Vec<u8>,
}

pub struct OutputItem {
    pub chunk_index: u32,
    pub device_offset: u64,
    pub uncompressed_len: u32,
    pub digest: [u8; 32],
    pub compressed: Vec<u8>,
}

/// A pool of workers draining `input` into `output`. Workers retire
/// cooperatively: `set_degree` below current count arms retire tokens that a
/// worker consumes only between items, never mid-item.
pub struct Pool {
    input_tx: Sender<InputItem>,
    output_rx: Receiver<OutputItem>,
    retire_tokens: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
    input_rx: Receiver<InputItem>,
    output_tx: Sender<OutputItem>,
}

impl Pool {
    /// Build a pool with bounded queues of the given capacity and `initial`
    /// workers already running.
    pub fn new(queue_capacity: usize, initial: usize) -> Self {
        let (input_tx, input_rx) = crossbeam_channel::bounded(queue_capacity);
        let (output_tx, output_rx) = crossbeam_channel::bounded(queue_capacity);
        let mut pool = Self {
            input_tx,
            output_rx,
            retire_tokens: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            handles: Vec::new(),
            input_rx,
            output_tx,
        };
        pool.set_degree(initial.max(1));
        pool
    }

    pub fn sender(&self) -> Sender<InputItem> {
        self.input_tx.clone()
    }

    pub fn receiver(&self) -> Receiver<OutputItem> {
        self.output_rx.clone()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Grow to `d` active workers by spawning, or shrink by arming `k`
    /// retire-after-next-item tokens. Never kills a worker mid-item.
    pub fn set_degree(&mut self, d: usize) {
        let d = d.max(1);
        let current = self.active.load(Ordering::SeqCst);
        if d > current {
            for _ in current..d {
                self.spawn_worker();
            }
        } else if d < current {
            self.retire_tokens.fetch_add(current - d, Ordering::SeqCst);
        }
    }

    fn spawn_worker(&mut self) {
        let input_rx = self.input_rx.clone();
        let output_tx = self.output_tx.clone();
        let retire_tokens = Arc::clone(&self.retire_tokens);
        let active = Arc::clone(&self.active);
        active.fetch_add(1, Ordering::SeqCst);

        let handle = std::thread::spawn(move || {
            loop {
                // Consume a retire token only at an item boundary.
                if retire_tokens
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                        if t > 0 { Some(t - 1) } else { None }
                    })
                    .is_ok()
                {
                    break;
                }

                match input_rx.recv() {
                    Ok(item) => {
                        let digest = digest_of(&item.data);
                        let compressed = zstd::encode_all(&item.data[..], COMPRESSION_LEVEL)
                            .expect("zstd encode never fails on an in-memory buffer");
                        let out = OutputItem {
                            chunk_index: item.chunk_index,
                            device_offset: item.device_offset,
                            uncompressed_len: item.data.len() as u32,
                            digest,
                            compressed,
                        };
                        if output_tx.send(out).is_err() {
                            break;
                        }
                    }
                    Err(_) => break, // input closed and drained
                }
            }
            active.fetch_sub(1, Ordering::SeqCst);
        });
        self.handles.push(handle);
    }

    /// Close the input queue; block until all workers have drained it and
    /// exited, then close the output queue.
    pub fn shutdown(mut self) {
        drop(self.input_tx);
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
        drop(self.output_tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_compresses_and_preserves_digest() {
        let mut pool = Pool::new(8, 2);
        let tx = pool.sender();
        let rx = pool.receiver();

        for i in 0..10u32 {
            tx.send(InputItem {
                chunk_index: i,
                device_offset: (i as u64) * 100,
                data: vec![i as u8; 1000],
            })
            .unwrap();
        }
        drop(tx);

        let mut results = Vec::new();
        for _ in 0..10 {
            results.push(rx.recv().unwrap());
        }
        pool.shutdown();

        results.sort_by_key(|r| r.chunk_index);
        for (i, r) in results.iter().enumerate() {
            let expected_digest = digest_of(&vec![i as u8; 1000]);
            assert_eq!(r.digest, expected_digest);
            assert_eq!(r.uncompressed_len, 1000);
            let decompressed = zstd::decode_all(&r.compressed[..]).unwrap();
            assert_eq!(decompressed, vec![i as u8; 1000]);
        }
    }

    #[test]
    fn set_degree_grows_and_shrinks() {
        let mut pool = Pool::new(8, 1);
        assert_eq!(pool.active_count(), 1);
        pool.set_degree(4);
        // Give newly spawned threads a moment to register.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(pool.active_count(), 4);

        let tx = pool.sender();
        pool.set_degree(1);
        // Push enough items through for 3 workers to retire cooperatively.
        for i in 0..20u32 {
            tx.send(InputItem { chunk_index: i, device_offset: 0, data: vec![0u8; 10] }).unwrap();
        }
        let rx = pool.receiver();
        for _ in 0..20 {
            rx.recv().unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(pool.active_count(), 1);

        drop(tx);
        pool.shutdown();
    }
}
