use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Size of the `[klen u32][vlen u32]` header in front of every spill frame.
pub const FRAME_HEADER_LEN: usize = 8;

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path.as_ref()).with_context(|| format!("create_dir_all {}", path.as_ref().display()))
}

/// Removes a directory tree if it exists and recreates it empty.
pub fn reset_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        fs::remove_dir_all(path).with_context(|| format!("remove_dir_all {}", path.display()))?;
    }
    ensure_dir(path)
}

/// Lists data files under `path` (or `path` itself when it is a file).
///
/// Names starting with `_` or `.` are bookkeeping (`_SUCCESS`, editor swap files)
/// and are skipped, so a finished stage directory can be fed straight into the next stage.
pub fn list_files_recursive(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if !path.exists() {
        bail!("input path does not exist: {}", path.display());
    }
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", path.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let hidden = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('_') || n.starts_with('.'))
            .unwrap_or(false);
        if !hidden {
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(files)
}

/// Raw lines of a file without their `\n` or `\r\n` ending.
///
/// Lines are bytes: decoding is left to the caller so that one undecodable
/// line does not end the file. Only I/O failures come back as errors.
pub fn read_raw_lines(path: impl AsRef<Path>) -> Result<impl Iterator<Item = Result<Vec<u8>>>> {
    let file = File::open(path.as_ref()).with_context(|| format!("open {}", path.as_ref().display()))?;
    let reader = BufReader::new(file);
    Ok(reader.split(b'\n').map(|line| -> Result<Vec<u8>> {
        let mut line = line?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }))
}

pub fn open_writer(path: impl AsRef<Path>) -> Result<BufWriter<File>> {
    if let Some(parent) = path.as_ref().parent() {
        ensure_dir(parent)?;
    }
    let file = File::create(path.as_ref()).with_context(|| format!("create {}", path.as_ref().display()))?;
    Ok(BufWriter::new(file))
}

/// Appends one `[klen][vlen][key][value]` frame to `buf`.
pub fn encode_frame<K: Serialize, V: Serialize>(buf: &mut Vec<u8>, key: &K, value: &V) -> Result<()> {
    let key_bytes = bincode::serialize(key).context("encode spill key")?;
    let val_bytes = bincode::serialize(value).context("encode spill value")?;
    let klen = u32::try_from(key_bytes.len()).context("spill key too large")?;
    let vlen = u32::try_from(val_bytes.len()).context("spill value too large")?;
    buf.extend_from_slice(&klen.to_le_bytes());
    buf.extend_from_slice(&vlen.to_le_bytes());
    buf.extend_from_slice(&key_bytes);
    buf.extend_from_slice(&val_bytes);
    Ok(())
}

/// One frame located inside a spill buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    /// Offset of the frame header.
    pub start: usize,
    /// Offset just past the frame.
    pub end: usize,
}

/// Reads the frame starting at `off`. `Ok(None)` at a clean end of buffer.
pub fn read_frame(bytes: &[u8], off: usize) -> Result<Option<Frame<'_>>> {
    if off >= bytes.len() {
        return Ok(None);
    }
    if bytes.len() - off < FRAME_HEADER_LEN {
        bail!("truncated spill frame header at offset {}", off);
    }
    let klen = u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]) as usize;
    let vlen = u32::from_le_bytes([bytes[off + 4], bytes[off + 5], bytes[off + 6], bytes[off + 7]]) as usize;
    let key_start = off + FRAME_HEADER_LEN;
    let end = key_start + klen + vlen;
    if end > bytes.len() {
        bail!("truncated spill frame at offset {} ({} bytes missing)", off, end - bytes.len());
    }
    Ok(Some(Frame {
        key: &bytes[key_start..key_start + klen],
        value: &bytes[key_start + klen..end],
        start: off,
        end,
    }))
}

/// Iterates every frame of a spill buffer in file order.
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    off: usize,
    failed: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, off: 0, failed: false }
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match read_frame(self.bytes, self.off) {
            Ok(Some(frame)) => {
                self.off = frame.end;
                Some(Ok(frame))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
