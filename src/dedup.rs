//! Bloom-filtered record deduplication
//!
//! Streams a canonical record store through the bloom filter and writes the
//! surviving lines to a new store. The raw line is the dedup key, so two
//! records are duplicates only when the whole credential matches. A bounded
//! worker pool probes the filter; a single writer thread owns the output
//! file and assigns each surviving line its byte offset, which downstream
//! index stages consume as the line lands on disk.
//!
//! With more than one worker the output order of unique lines is not
//! deterministic; the default of one bloom worker keeps runs reproducible.

use crate::bloom::BloomFilter;
use crate::pool::run_stage;
use crate::status::CurationStats;

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// Queue depth between the reader, the bloom workers, and the writer.
const QUEUE_DEPTH: usize = 4096;

/// Deduplicate `input` into `output`. `on_unique` runs on the writer thread
/// for every surviving line with the line's byte offset in the output store.
pub fn run_dedup(
    input: &Path,
    output: &Path,
    append: bool,
    filter: Arc<BloomFilter>,
    workers: usize,
    stats: &CurationStats,
    mut on_unique: impl FnMut(u64, &str) -> Result<()> + Send,
) -> Result<()> {
    if workers == 0 {
        anyhow::bail!("bloom worker count must be positive");
    }

    let out_file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(output)
        .with_context(|| format!("failed to open deduped store {:?}", output))?;
    let mut offset = if append { out_file.metadata()?.len() } else { 0 };
    let mut writer = BufWriter::with_capacity(1 << 20, out_file);

    let in_file =
        File::open(input).with_context(|| format!("failed to open record store {:?}", input))?;
    let mut reader = BufReader::with_capacity(1 << 20, in_file);

    let (unique_tx, unique_rx) = bounded::<String>(QUEUE_DEPTH);

    let writer_result = std::thread::scope(|s| -> Result<()> {
        let writer_handle = s.spawn(move || -> Result<()> {
            while let Ok(line) = unique_rx.recv() {
                writer
                    .write_all(line.as_bytes())
                    .and_then(|_| writer.write_all(b"\n"))
                    .with_context(|| format!("failed to write deduped store {:?}", output))?;
                on_unique(offset, &line)?;
                offset += line.len() as u64 + 1;
            }
            writer.flush()?;
            Ok(())
        });

        let stage_result = run_stage(
            workers,
            QUEUE_DEPTH,
            |tx| {
                let mut line = String::new();
                loop {
                    line.clear();
                    let n = reader
                        .read_line(&mut line)
                        .with_context(|| format!("failed to read record store {:?}", input))?;
                    if n == 0 {
                        return Ok(());
                    }
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if trimmed.is_empty() {
                        continue;
                    }
                    stats.add_line();
                    stats.add_bytes(n as u64);
                    if tx.send(trimmed.to_string()).is_err() {
                        return Ok(());
                    }
                }
            },
            |line: String| {
                if filter.add(line.as_bytes()) {
                    stats.add_duplicate();
                } else {
                    stats.add_unique();
                    unique_tx
                        .send(line)
                        .context("dedup writer exited early")?;
                }
                Ok(())
            },
        );
        drop(unique_tx);

        let writer_result = match writer_handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        // A writer failure is the root cause of any worker send error.
        writer_result.and(stage_result)
    });

    writer_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn dedup_lines(input_lines: &[&str], workers: usize) -> (Vec<String>, u64, u64) {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.json");
        let output = dir.path().join("out.json");
        std::fs::write(&input, input_lines.join("\n") + "\n").unwrap();

        let filter = Arc::new(BloomFilter::new(1 << 16, 4).unwrap());
        let stats = CurationStats::new();
        run_dedup(&input, &output, false, filter, workers, &stats, |_, _| Ok(())).unwrap();

        let out: Vec<String> = std::fs::read_to_string(&output)
            .unwrap()
            .lines()
            .map(|s| s.to_string())
            .collect();
        (
            out,
            stats.unique.load(Ordering::Relaxed),
            stats.duplicates.load(Ordering::Relaxed),
        )
    }

    #[test]
    fn test_exact_duplicates_dropped() {
        let (out, unique, dups) = dedup_lines(
            &[
                r#"{"email":"a@b.com","user":"a","domain":"b.com","password":"x"}"#,
                r#"{"email":"a@b.com","user":"a","domain":"b.com","password":"x"}"#,
                r#"{"email":"a@b.com","user":"a","domain":"b.com","password":"y"}"#,
            ],
            1,
        );
        assert_eq!(out.len(), 2, "same email with different password survives");
        assert_eq!(unique, 2);
        assert_eq!(dups, 1);
    }

    #[test]
    fn test_single_worker_preserves_order() {
        let (out, _, _) = dedup_lines(&["line-b", "line-a", "line-b", "line-c"], 1);
        assert_eq!(out, vec!["line-b", "line-a", "line-c"]);
    }

    #[test]
    fn test_multi_worker_same_unique_set() {
        let lines: Vec<String> = (0..500).map(|i| format!("line-{}", i % 100)).collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let (mut out, unique, dups) = dedup_lines(&refs, 4);
        out.sort();
        out.dedup();
        assert_eq!(out.len(), 100);
        assert_eq!(unique, 100);
        assert_eq!(dups, 400);
    }

    #[test]
    fn test_on_unique_offsets_resolve() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.json");
        let output = dir.path().join("out.json");
        std::fs::write(&input, "alpha\nbeta\ngamma\n").unwrap();

        let located: Mutex<Vec<(u64, String)>> = Mutex::new(Vec::new());
        let filter = Arc::new(BloomFilter::new(1 << 12, 4).unwrap());
        run_dedup(
            &input,
            &output,
            false,
            filter,
            1,
            &CurationStats::new(),
            |offset, line| {
                located.lock().unwrap().push((offset, line.to_string()));
                Ok(())
            },
        )
        .unwrap();

        let raw = std::fs::read(&output).unwrap();
        for (offset, line) in located.into_inner().unwrap() {
            let start = offset as usize;
            assert_eq!(&raw[start..start + line.len()], line.as_bytes());
        }
    }

    #[test]
    fn test_append_offsets_follow_existing_content() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.json");
        let output = dir.path().join("out.json");
        std::fs::write(&input, "fresh\n").unwrap();
        std::fs::write(&output, "existing\n").unwrap();

        let offsets: Mutex<Vec<u64>> = Mutex::new(Vec::new());
        let filter = Arc::new(BloomFilter::new(1 << 12, 4).unwrap());
        run_dedup(
            &input,
            &output,
            true,
            filter,
            1,
            &CurationStats::new(),
            |offset, _| {
                offsets.lock().unwrap().push(offset);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(offsets.into_inner().unwrap(), vec![9]);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "existing\nfresh\n");
    }
}
