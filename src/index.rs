//! Index entry format and the indexer
//!
//! The indexer turns a canonical record store into `(key, offset, length)`
//! entries. Input is partitioned across workers by disjoint, newline-aligned
//! byte ranges of a memory-mapped store; each worker owns one unsorted shard
//! file, so shard writes never contend.

use crate::bloom::BloomFilter;
use crate::record::{encode_key, KeyField, Record, KEY_WIDTH};

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// On-disk width of one index entry: 16-byte key + u64 offset + u32 length.
pub const ENTRY_WIDTH: usize = KEY_WIDTH + 8 + 4;

/// Structurally invalid index files, distinguished from plain I/O errors so
/// callers can report the cause precisely.
#[derive(Debug, thiserror::Error)]
pub enum IndexFileError {
    #[error("index file {path:?} is {size} bytes, not a multiple of the {width}-byte entry width")]
    Misaligned {
        path: PathBuf,
        size: u64,
        width: usize,
    },
}

/// One fixed-width index entry referencing a record line in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: [u8; KEY_WIDTH],
    pub offset: u64,
    pub length: u32,
}

impl IndexEntry {
    pub fn encode(&self, buf: &mut [u8; ENTRY_WIDTH]) {
        buf[..KEY_WIDTH].copy_from_slice(&self.key);
        LittleEndian::write_u64(&mut buf[KEY_WIDTH..KEY_WIDTH + 8], self.offset);
        LittleEndian::write_u32(&mut buf[KEY_WIDTH + 8..], self.length);
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut key = [0u8; KEY_WIDTH];
        key.copy_from_slice(&buf[..KEY_WIDTH]);
        Self {
            key,
            offset: LittleEndian::read_u64(&buf[KEY_WIDTH..KEY_WIDTH + 8]),
            length: LittleEndian::read_u32(&buf[KEY_WIDTH + 8..ENTRY_WIDTH]),
        }
    }
}

/// Counters shared across indexer workers.
#[derive(Debug, Default)]
pub struct IndexStats {
    pub lines: AtomicU64,
    pub indexed: AtomicU64,
    pub malformed: AtomicU64,
    pub duplicates: AtomicU64,
}

impl IndexStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A buffered writer owning one shard file.
pub struct ShardWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    entries: u64,
}

impl ShardWriter {
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create shard file {:?}", path))?;
        Ok(Self {
            writer: BufWriter::with_capacity(1 << 20, file),
            path,
            entries: 0,
        })
    }

    pub fn push(&mut self, entry: &IndexEntry) -> Result<()> {
        let mut buf = [0u8; ENTRY_WIDTH];
        entry.encode(&mut buf);
        self.writer
            .write_all(&buf)
            .with_context(|| format!("failed to write shard file {:?}", self.path))?;
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Flush and close, returning the shard path and entry count.
    pub fn finish(mut self) -> Result<(PathBuf, u64)> {
        self.writer
            .flush()
            .with_context(|| format!("failed to flush shard file {:?}", self.path))?;
        Ok((self.path, self.entries))
    }
}

/// Builds unsorted index shards from a canonical record store.
pub struct Indexer {
    key: KeyField,
    workers: usize,
    temp_dir: PathBuf,
    filter: Option<Arc<BloomFilter>>,
}

impl Indexer {
    pub fn new(key: KeyField, workers: usize, temp_dir: PathBuf) -> Result<Self> {
        if workers == 0 {
            anyhow::bail!("index worker count must be positive");
        }
        Ok(Self {
            key,
            workers,
            temp_dir,
            filter: None,
        })
    }

    /// Attach a bloom filter; records whose key it reports as already seen
    /// are dropped (counted, not fatal).
    pub fn with_filter(mut self, filter: Arc<BloomFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Index the store, returning the shard paths in worker order.
    pub fn index_store(&self, store: &Path, stats: &IndexStats) -> Result<Vec<PathBuf>> {
        let file = File::open(store)
            .with_context(|| format!("failed to open record store {:?}", store))?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }
            .with_context(|| format!("failed to mmap record store {:?}", store))?;

        let ranges = partition_lines(&mmap, self.workers);
        let mut shards: Vec<Option<PathBuf>> = vec![None; ranges.len()];

        std::thread::scope(|s| -> Result<()> {
            let mut handles = Vec::with_capacity(ranges.len());
            for (worker, range) in ranges.iter().enumerate() {
                let data = &mmap[range.clone()];
                let base = range.start as u64;
                let shard_path = self
                    .temp_dir
                    .join(format!("{}-shard-{:02}.idx", self.key.name(), worker));
                handles.push((
                    worker,
                    s.spawn(move || self.index_slice(data, base, shard_path, stats)),
                ));
            }
            for (worker, handle) in handles {
                match handle.join() {
                    Ok(result) => {
                        let path = result
                            .with_context(|| format!("index worker {} failed", worker))?;
                        shards[worker] = Some(path);
                    }
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            Ok(())
        })?;

        Ok(shards.into_iter().flatten().collect())
    }

    /// Index one byte range of the store into its own shard file.
    fn index_slice(
        &self,
        data: &[u8],
        base: u64,
        shard_path: PathBuf,
        stats: &IndexStats,
    ) -> Result<PathBuf> {
        let mut shard = ShardWriter::create(shard_path)?;
        for (offset, line) in LineSlices::new(data, base) {
            if line.is_empty() {
                continue;
            }
            stats.lines.fetch_add(1, Ordering::Relaxed);

            let text = match std::str::from_utf8(line) {
                Ok(t) => t,
                Err(_) => {
                    stats.malformed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let record = match Record::from_line(text) {
                Ok(r) => r,
                Err(err) => {
                    log::debug!("skipping malformed record at offset {}: {}", offset, err);
                    stats.malformed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let key = encode_key(record.field(self.key));
            if let Some(filter) = &self.filter {
                if filter.add(&key) {
                    stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            shard.push(&IndexEntry {
                key,
                offset,
                length: line.len() as u32,
            })?;
            stats.indexed.fetch_add(1, Ordering::Relaxed);
        }
        let (path, _) = shard.finish()?;
        Ok(path)
    }
}

/// Split `data` into at most `workers` disjoint ranges whose boundaries sit
/// just after a newline, so no line straddles two workers.
fn partition_lines(data: &[u8], workers: usize) -> Vec<std::ops::Range<usize>> {
    if data.is_empty() {
        return vec![0..0];
    }
    let target = data.len().div_ceil(workers);
    let mut ranges = Vec::with_capacity(workers);
    let mut start = 0usize;
    while start < data.len() {
        let mut end = (start + target).min(data.len());
        if end < data.len() {
            // Extend forward to the next newline boundary.
            match memchr::memchr(b'\n', &data[end..]) {
                Some(i) => end += i + 1,
                None => end = data.len(),
            }
        }
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Iterator over `(absolute_offset, line_without_newline)` in a byte slice.
struct LineSlices<'a> {
    data: &'a [u8],
    base: u64,
    pos: usize,
}

impl<'a> LineSlices<'a> {
    fn new(data: &'a [u8], base: u64) -> Self {
        Self { data, base, pos: 0 }
    }
}

impl<'a> Iterator for LineSlices<'a> {
    type Item = (u64, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        let rest = &self.data[start..];
        let (line, advance) = match memchr::memchr(b'\n', rest) {
            Some(i) => (&rest[..i], i + 1),
            None => (rest, rest.len()),
        };
        self.pos += advance;
        Some((self.base + start as u64, line))
    }
}

/// Validate that an index file's size is a whole number of entries and
/// return the entry count.
pub fn entry_count(path: &Path) -> Result<u64> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("failed to stat index file {:?}", path))?
        .len();
    if size % ENTRY_WIDTH as u64 != 0 {
        return Err(IndexFileError::Misaligned {
            path: path.to_path_buf(),
            size,
            width: ENTRY_WIDTH,
        }
        .into());
    }
    Ok(size / ENTRY_WIDTH as u64)
}
