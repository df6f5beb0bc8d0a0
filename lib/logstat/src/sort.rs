use crate::io::FrameReader;
use crate::key::ShuffleService;
use crate::stats::SortOutcome;
use anyhow::{Context, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// Maps a file read-only. Zero-length files map to `None`.
pub fn map_file(path: &Path) -> Result<Option<Mmap>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file.metadata().with_context(|| format!("stat {}", path.display()))?.len();
    if len == 0 {
        return Ok(None);
    }
    // SAFETY: spill files are private to this run and are not modified while mapped.
    let map = unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {}", path.display()))?;
    Ok(Some(map))
}

/// Sorts one partition's spill file into `out_path` by the shuffle's total key order.
///
/// Frames are copied byte for byte; only the keys are decoded, to compare them.
/// The sort is stable, so records with equal full keys keep their spill order.
pub fn sort_partition<K, S>(input_path: &Path, out_path: &Path, shuffle: &S) -> Result<SortOutcome>
where
    K: DeserializeOwned + Send,
    S: ShuffleService<K>,
{
    let start = Instant::now();
    let map = map_file(input_path)?;
    let bytes: &[u8] = map.as_deref().unwrap_or(&[]);

    // Record index: (decoded key, frame start, frame end)
    let mut records: Vec<(K, usize, usize)> = Vec::new();
    for frame in FrameReader::new(bytes) {
        let frame = frame.with_context(|| format!("read {}", input_path.display()))?;
        let key: K = bincode::deserialize(frame.key)
            .with_context(|| format!("decode key at offset {} of {}", frame.start, input_path.display()))?;
        records.push((key, frame.start, frame.end));
    }
    let io_read_ms = start.elapsed().as_millis() as u64;

    let sort_only_start = Instant::now();
    records.par_sort_by(|a, b| shuffle.compare_total(&a.0, &b.0));
    let sort_only_ms = sort_only_start.elapsed().as_millis() as u64;

    let io_write_start = Instant::now();
    let file = File::create(out_path).with_context(|| format!("create {}", out_path.display()))?;
    let mut w = BufWriter::with_capacity(8 * 1024 * 1024, file);
    for (_, s, e) in &records {
        w.write_all(&bytes[*s..*e]).with_context(|| format!("write {}", out_path.display()))?;
    }
    w.flush().with_context(|| format!("flush {}", out_path.display()))?;
    let io_write_ms = io_write_start.elapsed().as_millis() as u64;

    Ok(SortOutcome {
        lines_in: records.len() as u64,
        bytes_in: bytes.len() as u64,
        sort_only_ms,
        io_read_ms,
        io_write_ms,
        wall_ms: start.elapsed().as_millis() as u64,
    })
}
