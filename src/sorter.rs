//! External merge sort for index files
//!
//! Produces one key-ordered index file from arbitrarily large unsorted shard
//! input under an advisory memory ceiling:
//!
//! 1. entries are read into chunks sized by the ceiling,
//! 2. each chunk is stable-sorted in memory (parallelized across the sort
//!    worker pool) and written to a temp run,
//! 3. runs are k-way merged through a min-heap; when the run count exceeds
//!    the open-file limit, batches are merged into larger runs over
//!    multiple passes until one ordered output remains.
//!
//! Ties on equal keys always resolve to the run created earlier, so entries
//! sharing a key keep their original encounter order and identical input
//! yields byte-identical output.
//!
//! The memory ceiling is advisory, not exact: per-entry bookkeeping and
//! filesystem buffering mean peak usage can exceed the configured bound by
//! a bounded margin.

use crate::index::{IndexEntry, ENTRY_WIDTH};

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Default cap on runs merged in one pass, chosen well under typical
/// open-file limits.
pub const DEFAULT_FAN_IN: usize = 64;

/// Estimated in-memory cost of one buffered entry: the entry itself plus
/// fixed bookkeeping slack. Deliberately rough; see the module docs on the
/// advisory ceiling.
const PER_ENTRY_COST: usize = std::mem::size_of::<IndexEntry>() + 16;

/// Verification failures indicate a logic or I/O corruption bug, never a
/// recoverable condition.
#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("sorted output out of order at entry {index}")]
    OutOfOrder { index: u64 },
    #[error("sorted output holds {found} entries, input held {expected}")]
    CountMismatch { expected: u64, found: u64 },
}

/// Sorter configuration, validated at construction.
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Advisory ceiling on buffered entry memory, in bytes.
    pub max_memory: u64,
    /// Worker threads for in-memory chunk sorting.
    pub workers: usize,
    /// Directory for temp runs.
    pub temp_dir: PathBuf,
    /// Re-scan the final output for order and count.
    pub verify: bool,
    /// Delete temp runs after each pass.
    pub cleanup: bool,
    /// Maximum runs merged per pass.
    pub fan_in: usize,
}

/// What a sort did, for run summaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct SortSummary {
    pub entries: u64,
    pub chunks: usize,
    pub merge_passes: usize,
}

pub struct ExternalSorter {
    config: SortConfig,
    pool: rayon::ThreadPool,
    run_counter: u64,
}

impl ExternalSorter {
    pub fn new(config: SortConfig) -> Result<Self> {
        if config.max_memory == 0 {
            anyhow::bail!("sort memory ceiling must be positive");
        }
        if config.workers == 0 {
            anyhow::bail!("sort worker count must be positive");
        }
        if config.fan_in < 2 {
            anyhow::bail!("merge fan-in must be at least 2");
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()
            .context("failed to build sort worker pool")?;
        Ok(Self {
            config,
            pool,
            run_counter: 0,
        })
    }

    /// Sort the concatenation of `inputs` (in the given order) into `output`.
    pub fn sort(&mut self, inputs: &[PathBuf], output: &Path) -> Result<SortSummary> {
        let mut summary = SortSummary::default();

        let runs = self.write_sorted_runs(inputs, &mut summary)?;
        log::debug!(
            "{} entries in {} sorted runs, merging with fan-in {}",
            summary.entries,
            runs.len(),
            self.config.fan_in
        );

        self.merge_all(runs, output, &mut summary)?;

        if self.config.verify {
            verify_sorted(output, summary.entries)?;
        }
        Ok(summary)
    }

    /// Chunk phase: read entries up to the memory ceiling, stable-sort each
    /// chunk across the worker pool, write it as a temp run. Runs are
    /// numbered in creation order; that order carries input order for the
    /// stability guarantee.
    fn write_sorted_runs(
        &mut self,
        inputs: &[PathBuf],
        summary: &mut SortSummary,
    ) -> Result<Vec<PathBuf>> {
        let chunk_capacity = ((self.config.max_memory as usize) / PER_ENTRY_COST).max(16);
        let mut runs = Vec::new();
        let mut chunk: Vec<IndexEntry> = Vec::with_capacity(chunk_capacity);

        for input in inputs {
            let file = File::open(input)
                .with_context(|| format!("failed to open index input {:?}", input))?;
            let mut reader = BufReader::with_capacity(1 << 20, file);
            while let Some(entry) = read_entry(&mut reader)
                .with_context(|| format!("failed to read index input {:?}", input))?
            {
                chunk.push(entry);
                summary.entries += 1;
                if chunk.len() >= chunk_capacity {
                    runs.push(self.flush_chunk(&mut chunk)?);
                    summary.chunks += 1;
                }
            }
        }
        if !chunk.is_empty() {
            runs.push(self.flush_chunk(&mut chunk)?);
            summary.chunks += 1;
        }
        Ok(runs)
    }

    fn flush_chunk(&mut self, chunk: &mut Vec<IndexEntry>) -> Result<PathBuf> {
        // par_sort_by is a stable sort; equal keys keep input order.
        self.pool
            .install(|| chunk.par_sort_by(|a, b| a.key.cmp(&b.key)));

        let (path, file) = self.create_run_file()?;
        let mut writer = BufWriter::with_capacity(1 << 20, file);
        let mut buf = [0u8; ENTRY_WIDTH];
        for entry in chunk.iter() {
            entry.encode(&mut buf);
            writer
                .write_all(&buf)
                .with_context(|| format!("failed to write run file {:?}", path))?;
        }
        writer.flush()?;
        chunk.clear();
        Ok(path)
    }

    /// Create a uniquely named run file. A name collision (stale file from
    /// another process in a shared temp dir) is retried with the next name.
    fn create_run_file(&mut self) -> Result<(PathBuf, File)> {
        loop {
            let path = self.config.temp_dir.join(format!(
                "leakdex-{}-run-{:06}.tmp",
                std::process::id(),
                self.run_counter
            ));
            self.run_counter += 1;
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    log::debug!("run file {:?} exists, retrying with next name", path);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create run file {:?}", path));
                }
            }
        }
    }

    /// Merge phase: repeatedly merge batches of up to `fan_in` runs, in run
    /// order, until everything fits one final merge into `output`.
    fn merge_all(
        &mut self,
        mut runs: Vec<PathBuf>,
        output: &Path,
        summary: &mut SortSummary,
    ) -> Result<()> {
        if runs.is_empty() {
            // No entries at all still yields a (valid, empty) sorted file.
            File::create(output)
                .with_context(|| format!("failed to create sorted output {:?}", output))?;
            return Ok(());
        }

        while runs.len() > self.config.fan_in {
            summary.merge_passes += 1;
            let mut next = Vec::with_capacity(runs.len().div_ceil(self.config.fan_in));
            for batch in runs.chunks(self.config.fan_in) {
                let (path, file) = self.create_run_file()?;
                let mut writer = BufWriter::with_capacity(1 << 20, file);
                merge_runs(batch, &mut writer)?;
                writer.flush()?;
                next.push(path);
            }
            if self.config.cleanup {
                remove_runs(&runs);
            }
            runs = next;
        }

        summary.merge_passes += 1;
        let file = File::create(output)
            .with_context(|| format!("failed to create sorted output {:?}", output))?;
        let mut writer = BufWriter::with_capacity(1 << 20, file);
        merge_runs(&runs, &mut writer)?;
        writer.flush()?;
        if self.config.cleanup {
            remove_runs(&runs);
        }
        Ok(())
    }
}

/// Heap entry for the k-way merge: only the key and the source run index,
/// never record payloads, so merge memory is governed by fan-in alone.
struct HeapEntry {
    key: [u8; crate::record::KEY_WIDTH],
    run: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.run == other.run
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the smallest key pops first.
        // Equal keys resolve to the earlier run, which preserves encounter
        // order across the merge.
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.run.cmp(&self.run))
    }
}

struct RunReader {
    reader: BufReader<File>,
    path: PathBuf,
    pending: Option<IndexEntry>,
}

impl RunReader {
    fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open run file {:?}", path))?;
        let mut run = Self {
            reader: BufReader::with_capacity(1 << 18, file),
            path: path.to_path_buf(),
            pending: None,
        };
        run.advance()?;
        Ok(run)
    }

    fn advance(&mut self) -> Result<()> {
        self.pending = read_entry(&mut self.reader)
            .with_context(|| format!("failed to read run file {:?}", self.path))?;
        Ok(())
    }
}

/// K-way merge of `batch` (ordered by run sequence) into `writer`.
fn merge_runs<W: Write>(batch: &[PathBuf], writer: &mut W) -> Result<u64> {
    let mut readers = Vec::with_capacity(batch.len());
    let mut heap = BinaryHeap::with_capacity(batch.len());
    for (i, path) in batch.iter().enumerate() {
        let run = RunReader::open(path)?;
        if let Some(entry) = &run.pending {
            heap.push(HeapEntry {
                key: entry.key,
                run: i,
            });
        }
        readers.push(run);
    }

    let mut written = 0u64;
    let mut buf = [0u8; ENTRY_WIDTH];
    while let Some(top) = heap.pop() {
        let run = &mut readers[top.run];
        let entry = run
            .pending
            .take()
            .context("merge heap referenced an exhausted run")?;
        entry.encode(&mut buf);
        writer.write_all(&buf).context("failed to write merge output")?;
        written += 1;

        run.advance()?;
        if let Some(next) = &run.pending {
            heap.push(HeapEntry {
                key: next.key,
                run: top.run,
            });
        }
    }
    Ok(written)
}

fn remove_runs(runs: &[PathBuf]) {
    for run in runs {
        if let Err(err) = std::fs::remove_file(run) {
            log::warn!("failed to remove temp run {:?}: {}", run, err);
        }
    }
}

/// Read one entry, `None` on a clean EOF, error on a torn entry.
fn read_entry<R: Read>(reader: &mut R) -> Result<Option<IndexEntry>> {
    let mut buf = [0u8; ENTRY_WIDTH];
    let mut filled = 0;
    while filled < ENTRY_WIDTH {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            anyhow::bail!("index file truncated mid entry ({} of {} bytes)", filled, ENTRY_WIDTH);
        }
        filled += n;
    }
    Ok(Some(IndexEntry::decode(&buf)))
}

/// Re-scan `output` asserting non-decreasing key order and the expected
/// entry count.
fn verify_sorted(output: &Path, expected: u64) -> Result<()> {
    let file = File::open(output)
        .with_context(|| format!("failed to open sorted output {:?}", output))?;
    let mut reader = BufReader::with_capacity(1 << 20, file);
    let mut count = 0u64;
    let mut prev: Option<[u8; crate::record::KEY_WIDTH]> = None;
    while let Some(entry) = read_entry(&mut reader)? {
        if let Some(prev_key) = prev {
            if entry.key < prev_key {
                return Err(SortError::OutOfOrder { index: count }.into());
            }
        }
        prev = Some(entry.key);
        count += 1;
    }
    if count != expected {
        return Err(SortError::CountMismatch {
            expected,
            found: count,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{encode_key, KEY_WIDTH};
    use tempfile::TempDir;

    fn entry(key: &str, offset: u64, length: u32) -> IndexEntry {
        IndexEntry {
            key: encode_key(key),
            offset,
            length,
        }
    }

    fn write_index(path: &Path, entries: &[IndexEntry]) {
        let mut bytes = Vec::with_capacity(entries.len() * ENTRY_WIDTH);
        let mut buf = [0u8; ENTRY_WIDTH];
        for e in entries {
            e.encode(&mut buf);
            bytes.extend_from_slice(&buf);
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn read_index(path: &Path) -> Vec<IndexEntry> {
        let bytes = std::fs::read(path).unwrap();
        assert_eq!(bytes.len() % ENTRY_WIDTH, 0);
        bytes.chunks(ENTRY_WIDTH).map(IndexEntry::decode).collect()
    }

    fn config(dir: &Path, max_memory: u64, fan_in: usize) -> SortConfig {
        SortConfig {
            max_memory,
            workers: 2,
            temp_dir: dir.to_path_buf(),
            verify: true,
            cleanup: true,
            fan_in,
        }
    }

    #[test]
    fn test_stable_sort_concrete_scenario() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.idx");
        let output = dir.path().join("out.idx");
        write_index(&input, &[entry("b", 2, 5), entry("a", 1, 4), entry("b", 3, 4)]);

        let mut sorter = ExternalSorter::new(config(dir.path(), 1 << 20, 64)).unwrap();
        let summary = sorter.sort(&[input], &output).unwrap();
        assert_eq!(summary.entries, 3);

        let sorted = read_index(&output);
        assert_eq!(sorted[0].key, encode_key("a"));
        assert_eq!(sorted[1], entry("b", 2, 5), "earlier b must come first");
        assert_eq!(sorted[2], entry("b", 3, 4));
    }

    #[test]
    fn test_sort_is_lossless_and_ordered_under_tiny_ceiling() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.idx");
        let output = dir.path().join("out.idx");

        // Pseudo-random but deterministic key order.
        let entries: Vec<IndexEntry> = (0..5000u64)
            .map(|i| entry(&format!("k{:05}", (i * 7919) % 5000), i, 1))
            .collect();
        write_index(&input, &entries);

        // Ceiling far below input size forces many chunks, and fan-in 4
        // forces multiple merge passes.
        let mut sorter = ExternalSorter::new(config(dir.path(), 16 * 1024, 4)).unwrap();
        let summary = sorter.sort(&[input], &output).unwrap();

        assert_eq!(summary.entries, 5000);
        assert!(summary.chunks > 1, "ceiling must force multiple chunks");
        assert!(summary.merge_passes > 1, "fan-in must force multiple passes");

        let sorted = read_index(&output);
        assert_eq!(sorted.len(), 5000);
        for pair in sorted.windows(2) {
            assert!(pair[0].key <= pair[1].key);
        }
    }

    #[test]
    fn test_repeat_runs_byte_identical() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.idx");
        let entries: Vec<IndexEntry> = (0..2000u64)
            .map(|i| entry(&format!("dup{}", i % 50), i, (i % 100) as u32))
            .collect();
        write_index(&input, &entries);

        let out_a = dir.path().join("a.idx");
        let out_b = dir.path().join("b.idx");
        ExternalSorter::new(config(dir.path(), 8 * 1024, 4))
            .unwrap()
            .sort(&[input.clone()], &out_a)
            .unwrap();
        ExternalSorter::new(config(dir.path(), 8 * 1024, 4))
            .unwrap()
            .sort(&[input], &out_b)
            .unwrap();

        assert_eq!(std::fs::read(&out_a).unwrap(), std::fs::read(&out_b).unwrap());
    }

    #[test]
    fn test_multiple_shard_inputs_concatenate_in_order() {
        let dir = TempDir::new().unwrap();
        let shard_a = dir.path().join("a-shard.idx");
        let shard_b = dir.path().join("b-shard.idx");
        let output = dir.path().join("out.idx");
        write_index(&shard_a, &[entry("x", 1, 1), entry("m", 2, 1)]);
        write_index(&shard_b, &[entry("x", 3, 1), entry("a", 4, 1)]);

        let mut sorter = ExternalSorter::new(config(dir.path(), 1 << 20, 64)).unwrap();
        let summary = sorter.sort(&[shard_a, shard_b], &output).unwrap();
        assert_eq!(summary.entries, 4);

        let sorted = read_index(&output);
        assert_eq!(sorted[0], entry("a", 4, 1));
        assert_eq!(sorted[1], entry("m", 2, 1));
        // shard_a preceded shard_b in the input, so its "x" wins the tie.
        assert_eq!(sorted[2], entry("x", 1, 1));
        assert_eq!(sorted[3], entry("x", 3, 1));
    }

    #[test]
    fn test_empty_input_yields_empty_sorted_file() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.idx");
        let output = dir.path().join("out.idx");
        write_index(&input, &[]);

        let mut sorter = ExternalSorter::new(config(dir.path(), 1 << 20, 64)).unwrap();
        let summary = sorter.sort(&[input], &output).unwrap();
        assert_eq!(summary.entries, 0);
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 0);
    }

    #[test]
    fn test_cleanup_removes_runs() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.idx");
        let output = dir.path().join("out.idx");
        let entries: Vec<IndexEntry> =
            (0..1000u64).map(|i| entry(&format!("k{}", i), i, 1)).collect();
        write_index(&input, &entries);

        let mut sorter = ExternalSorter::new(config(dir.path(), 4 * 1024, 4)).unwrap();
        sorter.sort(&[input], &output).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp runs must be cleaned up");
    }

    #[test]
    fn test_no_cleanup_retains_runs() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.idx");
        let output = dir.path().join("out.idx");
        let entries: Vec<IndexEntry> =
            (0..1000u64).map(|i| entry(&format!("k{}", i), i, 1)).collect();
        write_index(&input, &entries);

        let mut cfg = config(dir.path(), 4 * 1024, 64);
        cfg.cleanup = false;
        let mut sorter = ExternalSorter::new(cfg).unwrap();
        sorter.sort(&[input], &output).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(!leftovers.is_empty(), "runs must be retained");
    }

    #[test]
    fn test_truncated_input_is_fatal() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.idx");
        let output = dir.path().join("out.idx");
        std::fs::write(&input, vec![0u8; ENTRY_WIDTH + 5]).unwrap();

        let mut sorter = ExternalSorter::new(config(dir.path(), 1 << 20, 64)).unwrap();
        assert!(sorter.sort(&[input], &output).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(ExternalSorter::new(config(dir.path(), 0, 64)).is_err());
        let mut cfg = config(dir.path(), 1024, 64);
        cfg.workers = 0;
        assert!(ExternalSorter::new(cfg).is_err());
        let cfg = config(dir.path(), 1024, 1);
        assert!(ExternalSorter::new(cfg).is_err());
    }

    #[test]
    fn test_verify_detects_out_of_order() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.idx");
        write_index(&bad, &[entry("b", 0, 1), entry("a", 1, 1)]);
        let err = verify_sorted(&bad, 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SortError>(),
            Some(SortError::OutOfOrder { index: 1 })
        ));
    }

    #[test]
    fn test_verify_detects_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.idx");
        write_index(&path, &[entry("a", 0, 1)]);
        let err = verify_sorted(&path, 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SortError>(),
            Some(SortError::CountMismatch {
                expected: 2,
                found: 1
            })
        ));
    }
}
