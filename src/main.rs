//! leakdex - credential-leak corpus curator
//!
//! Main entry point for the command-line application.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use leakdex::bloom::BloomFilter;
use leakdex::cli::{AutoArgs, BloomArgs, Cli, Command, IndexArgs, NormalizeArgs, SearchArgs, SortArgs};
use leakdex::dedup::run_dedup;
use leakdex::index::{entry_count, IndexStats, Indexer};
use leakdex::normalize::Normalizer;
use leakdex::pipeline::{self, AutoConfig, BloomConfig};
use leakdex::search::Searcher;
use leakdex::sorter::{ExternalSorter, SortConfig, DEFAULT_FAN_IN};
use leakdex::status::{self, format_number, CurationStats};

fn main() {
    let cli = Cli::parse();

    // Set up logging
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    } else if !cli.quiet {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    if let Err(e) = run(cli) {
        status::print_warn(&format!("{}", e));

        // Print chain of errors
        let mut source = e.source();
        while let Some(err) = source {
            status::print_warn(&format!("  Caused by: {}", err));
            source = err.source();
        }

        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Command::Normalize(args)) => cmd_normalize(args, cli.quiet),
        Some(Command::Bloom(args)) => cmd_bloom(args, cli.quiet),
        Some(Command::Index(args)) => cmd_index(args, cli.quiet),
        Some(Command::Sort(args)) => cmd_sort(args, cli.quiet),
        Some(Command::Search(args)) => cmd_search(args, cli.verbose),
        Some(Command::Auto(args)) => cmd_auto(args, cli.quiet),
        // No subcommand: the root invocation runs the pipeline.
        None => cmd_auto(cli.auto, cli.quiet),
    }
}

fn cmd_normalize(args: NormalizeArgs, quiet: bool) -> anyhow::Result<()> {
    let stats = CurationStats::new();
    let mut normalizer = Normalizer::new(
        args.format,
        &args.output,
        args.append,
        args.skip_prefix,
        args.skip_suffix,
    )?;
    if !quiet {
        status::print_info(&format!(
            "Normalizing {:?} into {:?}",
            args.target, args.output
        ));
    }
    normalizer.run(&args.target, args.recursive, &stats)?;
    if !quiet {
        stats.print_summary();
    }
    Ok(())
}

fn cmd_bloom(args: BloomArgs, quiet: bool) -> anyhow::Result<()> {
    let filter = match &args.filter_load {
        Some(path) => {
            if !quiet {
                status::print_info(&format!("Loading bloom filter from {:?}", path));
            }
            Arc::new(BloomFilter::load(
                path,
                BloomFilter::bits_for_size_gb(args.filter_size),
                args.filter_hashes,
            )?)
        }
        None => Arc::new(BloomFilter::with_size_gb(
            args.filter_size,
            args.filter_hashes,
        )?),
    };
    if !quiet {
        status::print_info(&format!(
            "Deduplicating {:?} with a {} filter ({} hashes), {} worker(s)",
            args.json,
            bytesize::ByteSize(filter.memory_usage() as u64),
            filter.hashes(),
            args.workers
        ));
    }

    let stats = CurationStats::new();
    let progress = if quiet {
        None
    } else {
        let total = std::fs::metadata(&args.json).map(|m| m.len()).unwrap_or(0);
        Some(status::create_bytes_progress_bar(total, "deduplicating"))
    };
    run_dedup(
        &args.json,
        &args.output,
        args.append,
        Arc::clone(&filter),
        args.workers,
        &stats,
        |_, _| {
            if let Some(pb) = &progress {
                pb.set_position(stats.bytes.load(std::sync::atomic::Ordering::Relaxed));
            }
            Ok(())
        },
    )?;
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    if let Some(path) = &args.filter_save {
        filter.save(path)?;
        if !quiet {
            status::print_info(&format!(
                "Saved bloom filter ({} keys) to {:?}",
                format_number(filter.inserted()),
                path
            ));
        }
    }
    if !quiet {
        stats.print_summary();
        status::print_success(&format!("Deduplicated store written to {:?}", args.output));
    }
    Ok(())
}

fn cmd_index(args: IndexArgs, quiet: bool) -> anyhow::Result<()> {
    let temp_dir = resolve_temp(&args.temp, &args.output);
    let stats = IndexStats::new();
    let indexer = Indexer::new(args.key, args.workers, temp_dir)?;
    if !quiet {
        status::print_info(&format!(
            "Indexing {:?} by {} with {} worker(s)",
            args.json,
            args.key.name(),
            args.workers
        ));
    }
    let shards = indexer.index_store(&args.json, &stats)?;
    concat_shards(&shards, &args.output)?;
    if !args.no_cleanup {
        for shard in &shards {
            if let Err(err) = std::fs::remove_file(shard) {
                log::warn!("failed to remove shard {:?}: {}", shard, err);
            }
        }
    }
    if !quiet {
        use std::sync::atomic::Ordering;
        status::print_success(&format!(
            "Indexed {} entries into {:?} ({} malformed skipped)",
            format_number(stats.indexed.load(Ordering::Relaxed)),
            args.output,
            format_number(stats.malformed.load(Ordering::Relaxed))
        ));
    }
    Ok(())
}

/// Stitch per-worker shards into one unsorted index file.
fn concat_shards(shards: &[PathBuf], output: &Path) -> anyhow::Result<()> {
    use anyhow::Context;
    let mut out = std::io::BufWriter::new(
        std::fs::File::create(output)
            .with_context(|| format!("failed to create index file {:?}", output))?,
    );
    for shard in shards {
        let mut reader = std::fs::File::open(shard)
            .with_context(|| format!("failed to open shard {:?}", shard))?;
        std::io::copy(&mut reader, &mut out)
            .with_context(|| format!("failed to append shard {:?}", shard))?;
    }
    use std::io::Write;
    out.flush()?;
    Ok(())
}

fn cmd_sort(args: SortArgs, quiet: bool) -> anyhow::Result<()> {
    let temp_dir = resolve_temp(&args.temp, &args.output);
    let mut sorter = ExternalSorter::new(SortConfig {
        max_memory: args.max_memory * 1024 * 1024,
        workers: args.workers,
        temp_dir,
        verify: args.check,
        cleanup: !args.no_cleanup,
        fan_in: DEFAULT_FAN_IN,
    })?;
    if !quiet {
        let total: u64 = args
            .index
            .iter()
            .map(|p| entry_count(p).unwrap_or(0))
            .sum();
        status::print_info(&format!(
            "Sorting {} entries from {} file(s) under a {} MB ceiling",
            format_number(total),
            args.index.len(),
            args.max_memory
        ));
    }
    let spinner = (!quiet).then(|| status::create_spinner("sorting"));
    let summary = sorter.sort(&args.index, &args.output)?;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    if !quiet {
        status::print_success(&format!(
            "Sorted {} entries into {:?} ({} chunks, {} merge passes)",
            format_number(summary.entries),
            args.output,
            summary.chunks,
            summary.merge_passes
        ));
    }
    Ok(())
}

fn cmd_search(args: SearchArgs, verbose: bool) -> anyhow::Result<()> {
    let mut searcher = Searcher::open(&args.index, &args.json, args.key)?;
    let (hits, stats) = searcher.find(&args.value)?;
    if hits.is_empty() {
        status::print_info(&format!("No records match {:?}", args.value));
    }
    for hit in &hits {
        println!("{}", serde_json::to_string(&hit.record)?);
    }
    if verbose {
        status::print_debug(&format!(
            "{} hit(s), {} comparison(s), {} seek(s)",
            hits.len(),
            stats.comparisons,
            stats.seeks
        ));
    }
    Ok(())
}

fn cmd_auto(args: AutoArgs, quiet: bool) -> anyhow::Result<()> {
    if args.generate {
        println!("{}", serde_json::to_string_pretty(&AutoConfig::template())?);
        return Ok(());
    }

    let config = match &args.conf {
        Some(path) => AutoConfig::load(path)?,
        None => config_from_flags(&args)?,
    };

    let stats = CurationStats::new();
    let summary = pipeline::run_pipeline(&config, &stats)?;
    if !quiet {
        stats.print_summary();
        for (key, path) in &summary.indexes {
            status::print_info(&format!("{} index: {:?}", key.name(), path));
        }
        status::print_success(&format!(
            "Curated {} unique records into {:?} ({} duplicates dropped)",
            format_number(summary.unique),
            summary.store,
            format_number(summary.duplicates)
        ));
    }
    Ok(())
}

fn config_from_flags(args: &AutoArgs) -> anyhow::Result<AutoConfig> {
    let (Some(input), Some(output_dir)) = (args.json.clone(), args.output.clone()) else {
        anyhow::bail!("auto requires --json and --output when no config file is given");
    };
    let config = AutoConfig {
        input,
        output_dir,
        normalize: None,
        keys: args.keys.clone(),
        bloom: BloomConfig {
            workers: args.workers_bloom,
            filter_size_gb: args.filter_size,
            filter_hashes: args.filter_hashes,
            filter_load: args.filter_load.clone(),
            filter_save: args.filter_save.clone(),
        },
        index_workers: args.workers_index,
        sort_workers: args.workers_sort,
        max_memory_mb: args.max_memory,
        temp_dir: args.temp.clone(),
        cleanup: !args.no_cleanup,
        verify: args.check,
    };
    config.validate()?;
    Ok(config)
}

/// Temp files default to living next to the output.
fn resolve_temp(temp: &Option<PathBuf>, output: &Path) -> PathBuf {
    match temp {
        Some(dir) => dir.clone(),
        None => output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    }
}
