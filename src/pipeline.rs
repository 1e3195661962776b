//! Pipeline orchestrator
//!
//! Drives Normalize -> Dedup -> Index -> Sort as one run from a declarative
//! JSON configuration, each stage with its own worker-pool size. Records
//! stream from the dedup writer straight into the per-key index stages over
//! bounded channels, so the dataset never lands on disk between those
//! stages; sorting starts once a key's shards are complete.
//!
//! A fatal error in any stage halts everything downstream and reports which
//! stage failed. Stages write new files rather than mutating their inputs,
//! so artifacts committed by earlier stages stay usable for a retry.

use crate::bloom::BloomFilter;
use crate::dedup::run_dedup;
use crate::index::{IndexEntry, IndexStats, ShardWriter};
use crate::normalize::{DumpFormat, Normalizer};
use crate::record::{encode_key, KeyField, Record};
use crate::sorter::{ExternalSorter, SortConfig, DEFAULT_FAN_IN};
use crate::status::CurationStats;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Queue depth from the dedup writer into each key's index stage.
const INDEX_QUEUE_DEPTH: usize = 4096;

fn default_keys() -> Vec<KeyField> {
    vec![KeyField::User, KeyField::Email]
}

fn default_bloom_workers() -> usize {
    1
}

fn default_cpu_workers() -> usize {
    num_cpus::get()
}

fn default_filter_size_gb() -> f64 {
    8.0
}

fn default_filter_hashes() -> u32 {
    14
}

fn default_max_memory_mb() -> u64 {
    1024
}

fn default_true() -> bool {
    true
}

/// Optional normalize stage of an auto run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeConfig {
    pub target: PathBuf,
    pub format: DumpFormat,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub skip_prefix: Option<String>,
    #[serde(default)]
    pub skip_suffix: Option<String>,
}

/// Bloom-dedup stage parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomConfig {
    #[serde(default = "default_bloom_workers")]
    pub workers: usize,
    #[serde(default = "default_filter_size_gb")]
    pub filter_size_gb: f64,
    #[serde(default = "default_filter_hashes")]
    pub filter_hashes: u32,
    #[serde(default)]
    pub filter_load: Option<PathBuf>,
    #[serde(default)]
    pub filter_save: Option<PathBuf>,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            workers: default_bloom_workers(),
            filter_size_gb: default_filter_size_gb(),
            filter_hashes: default_filter_hashes(),
            filter_load: None,
            filter_save: None,
        }
    }
}

/// One explicit, validated configuration object per auto invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoConfig {
    /// Normalized record store, or the store the normalize stage writes.
    pub input: PathBuf,
    /// Directory receiving the deduped store and sorted indexes.
    pub output_dir: PathBuf,
    #[serde(default)]
    pub normalize: Option<NormalizeConfig>,
    #[serde(default = "default_keys")]
    pub keys: Vec<KeyField>,
    #[serde(default)]
    pub bloom: BloomConfig,
    #[serde(default = "default_cpu_workers")]
    pub index_workers: usize,
    #[serde(default = "default_cpu_workers")]
    pub sort_workers: usize,
    /// Advisory sort memory ceiling in MB.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub cleanup: bool,
    #[serde(default)]
    pub verify: bool,
}

impl AutoConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// A template configuration with every field at its default, for
    /// `--generate`.
    pub fn template() -> Self {
        Self {
            input: PathBuf::from("leaks.json"),
            output_dir: PathBuf::from("curated"),
            normalize: None,
            keys: default_keys(),
            bloom: BloomConfig::default(),
            index_workers: default_cpu_workers(),
            sort_workers: default_cpu_workers(),
            max_memory_mb: default_max_memory_mb(),
            temp_dir: None,
            cleanup: true,
            verify: false,
        }
    }

    /// Reject bad parameters at construction time, not at first use.
    pub fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            anyhow::bail!("at least one index key is required");
        }
        if self.bloom.workers == 0 {
            anyhow::bail!("bloom worker count must be positive");
        }
        if self.index_workers == 0 {
            anyhow::bail!("index worker count must be positive");
        }
        if self.sort_workers == 0 {
            anyhow::bail!("sort worker count must be positive");
        }
        if self.max_memory_mb == 0 {
            anyhow::bail!("sort memory ceiling must be positive");
        }
        if !(self.bloom.filter_size_gb > 0.0) || !self.bloom.filter_size_gb.is_finite() {
            anyhow::bail!("bloom filter size must be positive");
        }
        if self.bloom.filter_hashes == 0 {
            anyhow::bail!("bloom filter hash count must be positive");
        }
        Ok(())
    }

    fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.clone())
    }
}

/// What a finished auto run produced.
#[derive(Debug)]
pub struct PipelineSummary {
    /// The deduped canonical store all indexes reference.
    pub store: PathBuf,
    pub indexes: Vec<(KeyField, PathBuf)>,
    pub unique: u64,
    pub duplicates: u64,
}

/// A surviving record line with its location in the deduped store.
struct Located {
    offset: u64,
    length: u32,
    line: String,
}

/// Run the full pipeline described by `config`.
pub fn run_pipeline(config: &AutoConfig, stats: &CurationStats) -> Result<PipelineSummary> {
    config.validate()?;
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("failed to create output dir {:?}", config.output_dir))?;
    let temp_dir = config.temp_dir();
    std::fs::create_dir_all(&temp_dir)
        .with_context(|| format!("failed to create temp dir {:?}", temp_dir))?;

    // Stage: normalize (optional).
    let store_in = match &config.normalize {
        Some(norm) => {
            let normalized = config.output_dir.join("normalized.json");
            let mut normalizer = Normalizer::new(
                norm.format,
                &normalized,
                false,
                norm.skip_prefix.clone(),
                norm.skip_suffix.clone(),
            )
            .context("normalize stage failed")?;
            normalizer
                .run(&norm.target, norm.recursive, &CurationStats::new())
                .context("normalize stage failed")?;
            drop(normalizer);
            normalized
        }
        None => config.input.clone(),
    };

    // Stage: dedup, streaming into the per-key index stages.
    let filter = match &config.bloom.filter_load {
        Some(path) => Arc::new(
            BloomFilter::load(
                path,
                BloomFilter::bits_for_size_gb(config.bloom.filter_size_gb),
                config.bloom.filter_hashes,
            )
            .context("dedup stage failed loading the bloom filter")?,
        ),
        None => Arc::new(
            BloomFilter::with_size_gb(config.bloom.filter_size_gb, config.bloom.filter_hashes)
                .context("dedup stage failed")?,
        ),
    };

    let store_out = config.output_dir.join("clean.json");
    let key_stats: Vec<IndexStats> = config.keys.iter().map(|_| IndexStats::new()).collect();
    let mut shards_per_key: Vec<Vec<PathBuf>> = vec![Vec::new(); config.keys.len()];

    std::thread::scope(|s| -> Result<()> {
        let mut senders = Vec::with_capacity(config.keys.len());
        let mut handles = Vec::new();
        for (ki, key) in config.keys.iter().enumerate() {
            let (tx, rx) = bounded::<Located>(INDEX_QUEUE_DEPTH);
            senders.push(tx);
            for worker in 0..config.index_workers {
                let rx: Receiver<Located> = rx.clone();
                let shard_path = temp_dir.join(format!("{}-shard-{:02}.idx", key.name(), worker));
                let stats = &key_stats[ki];
                let key = *key;
                handles.push((ki, s.spawn(move || index_worker(key, rx, shard_path, stats))));
            }
        }

        let dedup_result = run_dedup(
            &store_in,
            &store_out,
            false,
            Arc::clone(&filter),
            config.bloom.workers,
            stats,
            |offset, line| {
                let length = line.len() as u32;
                for tx in &senders {
                    tx.send(Located {
                        offset,
                        length,
                        line: line.to_string(),
                    })
                    .context("index stage exited early")?;
                }
                Ok(())
            },
        )
        .context("dedup stage failed");
        drop(senders);

        let mut index_result: Result<()> = Ok(());
        for (ki, handle) in handles {
            match handle.join() {
                Ok(Ok(shard)) => shards_per_key[ki].push(shard),
                Ok(Err(err)) => {
                    if index_result.is_ok() {
                        index_result = Err(err.context(format!(
                            "index stage ({}) failed",
                            config.keys[ki].name()
                        )));
                    }
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        dedup_result.and(index_result)
    })?;

    if let Some(path) = &config.bloom.filter_save {
        filter
            .save(path)
            .context("dedup stage failed saving the bloom filter")?;
    }

    // Stage: sort, one ordered index per key.
    let mut indexes = Vec::with_capacity(config.keys.len());
    for (ki, key) in config.keys.iter().enumerate() {
        log::info!(
            "{}: {} entries indexed, {} malformed",
            key.name(),
            key_stats[ki].indexed.load(Ordering::Relaxed),
            key_stats[ki].malformed.load(Ordering::Relaxed)
        );
        let output = config.output_dir.join(format!("{}.idx", key.name()));
        let mut sorter = ExternalSorter::new(SortConfig {
            max_memory: config.max_memory_mb * 1024 * 1024,
            workers: config.sort_workers,
            temp_dir: temp_dir.clone(),
            verify: config.verify,
            cleanup: config.cleanup,
            fan_in: DEFAULT_FAN_IN,
        })
        .with_context(|| format!("sort stage ({}) failed", key.name()))?;
        let summary = sorter
            .sort(&shards_per_key[ki], &output)
            .with_context(|| format!("sort stage ({}) failed", key.name()))?;
        log::info!(
            "sorted {} entries into {:?} ({} chunks, {} merge passes)",
            summary.entries,
            output,
            summary.chunks,
            summary.merge_passes
        );
        if config.cleanup {
            for shard in &shards_per_key[ki] {
                if let Err(err) = std::fs::remove_file(shard) {
                    log::warn!("failed to remove shard {:?}: {}", shard, err);
                }
            }
        }
        indexes.push((*key, output));
    }

    Ok(PipelineSummary {
        store: store_out,
        indexes,
        unique: stats.unique.load(Ordering::Relaxed),
        duplicates: stats.duplicates.load(Ordering::Relaxed),
    })
}

/// One index-stage worker: drain located records into an owned shard.
fn index_worker(
    key: KeyField,
    rx: Receiver<Located>,
    shard_path: PathBuf,
    stats: &IndexStats,
) -> Result<PathBuf> {
    let mut shard = ShardWriter::create(shard_path)?;
    while let Ok(item) = rx.recv() {
        match Record::from_line(&item.line) {
            Ok(record) => {
                shard.push(&IndexEntry {
                    key: encode_key(record.field(key)),
                    offset: item.offset,
                    length: item.length,
                })?;
                stats.indexed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                log::debug!("skipping malformed record at offset {}: {}", item.offset, err);
                stats.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    let (path, _) = shard.finish()?;
    Ok(path)
}
