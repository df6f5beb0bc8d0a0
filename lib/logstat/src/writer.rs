use crate::io::{encode_frame, ensure_dir, open_writer};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel as channel;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// Spill writers shared by all map tasks of a stage.
// Strategy: one dedicated IO thread per partition (file). Senders are bounded for backpressure.
pub struct WriterPool {
    senders: Vec<channel::Sender<WriterMsg>>,
    metrics: Arc<Vec<PartitionCounters>>,
}

enum WriterMsg {
    Data(Vec<u8>),
    Close,
}

pub struct WriterJoiner {
    handles: Vec<thread::JoinHandle<Result<()>>>,
}

impl WriterJoiner {
    /// Waits for every IO thread and reports the first failure.
    pub fn join_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for h in self.handles.drain(..) {
            let outcome = match h.join() {
                Ok(res) => res,
                Err(_) => Err(anyhow!("spill writer thread panicked")),
            };
            if let Err(e) = outcome {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Spill file holding every map output record routed to `partition`.
pub fn spill_path(base_dir: &Path, partition: usize) -> PathBuf {
    base_dir.join(format!("part{:05}.spill", partition))
}

impl WriterPool {
    pub fn new(
        base_dir: &Path,
        num_partitions: usize,
        flush_bytes: usize,
        flush_interval: Duration,
        queue_cap: usize,
    ) -> Result<(Self, WriterJoiner)> {
        ensure_dir(base_dir)?;
        let mut senders = Vec::with_capacity(num_partitions);
        let mut handles = Vec::with_capacity(num_partitions);
        let metrics: Arc<Vec<PartitionCounters>> =
            Arc::new((0..num_partitions).map(|_| PartitionCounters::default()).collect());
        for part in 0..num_partitions {
            let (tx, rx) = channel::bounded::<WriterMsg>(queue_cap.max(1));
            let path = spill_path(base_dir, part);
            let metrics = Arc::clone(&metrics);
            let handle = thread::Builder::new()
                .name(format!("spill-writer-{}", part))
                .spawn(move || -> Result<()> {
                    let counters = &metrics[part];
                    let mut writer = open_writer(&path)?;
                    let mut buf: Vec<u8> = Vec::with_capacity(flush_bytes.min(1 << 20));
                    let mut last_flush = Instant::now();
                    let write_out = |buf: &mut Vec<u8>, writer: &mut std::io::BufWriter<std::fs::File>| -> Result<()> {
                        if !buf.is_empty() {
                            writer.write_all(buf).with_context(|| format!("write {}", path.display()))?;
                            counters.bytes_written.fetch_add(buf.len() as u64, Ordering::Relaxed);
                            counters.write_calls.fetch_add(1, Ordering::Relaxed);
                            buf.clear();
                        }
                        writer.flush().with_context(|| format!("flush {}", path.display()))
                    };
                    loop {
                        // We aim to batch writes up to flush_bytes or flush_interval.
                        let timeout = flush_interval.saturating_sub(last_flush.elapsed());
                        match rx.recv_timeout(timeout) {
                            Ok(WriterMsg::Data(bytes)) => {
                                counters.queue_len.fetch_sub(1, Ordering::Relaxed);
                                buf.extend_from_slice(&bytes);
                            }
                            Ok(WriterMsg::Close) | Err(channel::RecvTimeoutError::Disconnected) => {
                                return write_out(&mut buf, &mut writer);
                            }
                            Err(channel::RecvTimeoutError::Timeout) => {}
                        }
                        let due_to_size = buf.len() >= flush_bytes;
                        let due_to_timer = !due_to_size && last_flush.elapsed() >= flush_interval;
                        if due_to_size || due_to_timer {
                            write_out(&mut buf, &mut writer)?;
                            if due_to_size {
                                counters.flush_by_size.fetch_add(1, Ordering::Relaxed);
                            } else {
                                counters.flush_by_timer.fetch_add(1, Ordering::Relaxed);
                            }
                            last_flush = Instant::now();
                        }
                    }
                })
                .context("spawn spill writer")?;
            senders.push(tx);
            handles.push(handle);
        }
        Ok((Self { senders, metrics }, WriterJoiner { handles }))
    }

    // Callers pass a Vec<u8> chunk of whole frames; the IO thread owns batching and flush policy.
    pub fn write_chunk(&self, partition: usize, bytes: Vec<u8>) -> Result<()> {
        let counters = &self.metrics[partition];
        counters.enq_count.fetch_add(1, Ordering::Relaxed);
        counters.enq_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        let q = counters.queue_len.fetch_add(1, Ordering::Relaxed) + 1;
        counters.max_queue_len.fetch_max(q, Ordering::Relaxed);
        self.senders[partition]
            .send(WriterMsg::Data(bytes))
            .map_err(|_| anyhow!("spill writer for partition {} has stopped", partition))
    }

    pub fn close_all(&self) {
        for tx in &self.senders {
            let _ = tx.send(WriterMsg::Close);
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.senders.len()
    }

    pub fn make_thread_writer(&self, local_batch_bytes: usize) -> ThreadWriter<'_> {
        ThreadWriter::new(self, local_batch_bytes)
    }
}

/// Per-task front of the pool: encodes frames into per-partition buffers and
/// hands them over in batches.
pub struct ThreadWriter<'a> {
    pool: &'a WriterPool,
    local_buffers: Vec<Vec<u8>>,
    batch_bytes: usize,
    records: u64,
    flushes: u64,
    bytes_sent: u64,
}

impl<'a> ThreadWriter<'a> {
    fn new(pool: &'a WriterPool, batch_bytes: usize) -> Self {
        let local_buffers = (0..pool.num_partitions()).map(|_| Vec::new()).collect();
        Self { pool, local_buffers, batch_bytes, records: 0, flushes: 0, bytes_sent: 0 }
    }

    pub fn emit<K: Serialize, V: Serialize>(&mut self, partition: usize, key: &K, value: &V) -> Result<()> {
        let buf = &mut self.local_buffers[partition];
        encode_frame(buf, key, value)?;
        self.records += 1;
        if buf.len() >= self.batch_bytes {
            self.flush_partition(partition)?;
        }
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<()> {
        for p in 0..self.local_buffers.len() {
            if !self.local_buffers[p].is_empty() {
                self.flush_partition(p)?;
            }
        }
        Ok(())
    }

    fn flush_partition(&mut self, partition: usize) -> Result<()> {
        let chunk = std::mem::take(&mut self.local_buffers[partition]);
        self.bytes_sent += chunk.len() as u64;
        self.flushes += 1;
        self.pool.write_chunk(partition, chunk)
    }

    pub fn num_partitions(&self) -> usize {
        self.local_buffers.len()
    }

    /// (records, flushes, bytes sent)
    pub fn stats(&self) -> (u64, u64, u64) {
        (self.records, self.flushes, self.bytes_sent)
    }
}

#[derive(Default)]
struct PartitionCounters {
    queue_len: AtomicUsize,
    max_queue_len: AtomicUsize,
    enq_count: AtomicU64,
    enq_bytes: AtomicU64,
    flush_by_size: AtomicU64,
    flush_by_timer: AtomicU64,
    bytes_written: AtomicU64,
    write_calls: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct WriterPartitionMetrics {
    pub partition: usize,
    pub max_queue_len: usize,
    pub enq_count: u64,
    pub enq_bytes: u64,
    pub flush_by_size: u64,
    pub flush_by_timer: u64,
    pub bytes_written: u64,
    pub write_calls: u64,
}

impl WriterPool {
    pub fn metrics_snapshot(&self) -> Vec<WriterPartitionMetrics> {
        self.metrics
            .iter()
            .enumerate()
            .map(|(partition, c)| WriterPartitionMetrics {
                partition,
                max_queue_len: c.max_queue_len.load(Ordering::Relaxed),
                enq_count: c.enq_count.load(Ordering::Relaxed),
                enq_bytes: c.enq_bytes.load(Ordering::Relaxed),
                flush_by_size: c.flush_by_size.load(Ordering::Relaxed),
                flush_by_timer: c.flush_by_timer.load(Ordering::Relaxed),
                bytes_written: c.bytes_written.load(Ordering::Relaxed),
                write_calls: c.write_calls.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FrameReader;

    #[test]
    fn frames_land_in_their_partition_file() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, mut joiner) = WriterPool::new(dir.path(), 2, 1024, Duration::from_millis(10), 4).unwrap();
        {
            let mut w = pool.make_thread_writer(16);
            for i in 0..10u64 {
                w.emit((i % 2) as usize, &format!("k{}", i), &i).unwrap();
            }
            w.flush_all().unwrap();
            assert_eq!(w.stats().0, 10);
        }
        pool.close_all();
        joiner.join_all().unwrap();

        for part in 0..2u64 {
            let bytes = std::fs::read(spill_path(dir.path(), part as usize)).unwrap();
            let values: Vec<u64> = FrameReader::new(&bytes)
                .map(|f| bincode::deserialize::<u64>(f.unwrap().value).unwrap())
                .collect();
            assert_eq!(values.len(), 5);
            assert!(values.iter().all(|v| v % 2 == part));
        }
        let written: u64 = pool.metrics_snapshot().iter().map(|m| m.bytes_written).sum();
        assert!(written > 0);
    }
}
