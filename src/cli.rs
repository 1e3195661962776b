//! Command-line interface definition for leakdex
//!
//! Provides argument parsing for the curation subcommands.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::normalize::DumpFormat;
use crate::record::KeyField;

/// Credential-leak corpus curator
///
/// Normalize raw dumps, deduplicate at scale, index by key, sort under a
/// memory ceiling, and search the result by exact key lookup.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "leakdex",
    version,
    about = "Credential-leak corpus curator",
    long_about = r#"
Curate massive plaintext credential-leak corpora into a deduplicated,
indexed, searchable dataset.

EXAMPLES:
    # Normalize a directory of colon-separated dumps
    leakdex normalize -t dumps/ -f colon-newline -o leaks.json -r

    # Deduplicate via an 8GB bloom filter
    leakdex bloom -j leaks.json -o clean.json

    # Build and sort an email index
    leakdex index -j clean.json -o email-unsorted.idx -k email
    leakdex sort -i email-unsorted.idx -o email.idx

    # Search it
    leakdex search -i email.idx -j clean.json -k email -v alice@example.com

    # Or run the whole pipeline from a config file
    leakdex auto -g > leakdex.json
    leakdex auto -c leakdex.json
"#
)]
pub struct Cli {
    /// Quiet mode - minimal output
    #[arg(short, long, global = true, default_value_t = false)]
    pub quiet: bool,

    /// Verbose mode - detailed logging
    #[arg(long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Invoked with no subcommand, the root runs the full pipeline.
    #[command(flatten)]
    pub auto: AutoArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Normalize raw credential dumps into canonical JSON-lines records
    Normalize(NormalizeArgs),
    /// Deduplicate a record stream via a bloom filter
    Bloom(BloomArgs),
    /// Index a record store by key into unsorted shard files
    Index(IndexArgs),
    /// Externally sort index shards under a memory ceiling
    Sort(SortArgs),
    /// Search a sorted index by exact key value
    Search(SearchArgs),
    /// Run normalize -> dedup -> index -> sort as one pipeline
    Auto(AutoArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NormalizeArgs {
    /// Input dump file or directory
    #[arg(short, long, value_name = "PATH")]
    pub target: PathBuf,

    /// Dump line format
    #[arg(short, long, value_enum)]
    pub format: DumpFormat,

    /// Output record store
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Recurse into subdirectories
    #[arg(short, long, default_value_t = false)]
    pub recursive: bool,

    /// Skip files whose name starts with this prefix
    #[arg(long, value_name = "PREFIX")]
    pub skip_prefix: Option<String>,

    /// Skip files whose name ends with this suffix
    #[arg(long, value_name = "SUFFIX")]
    pub skip_suffix: Option<String>,

    /// Append to the output instead of truncating it
    #[arg(short, long, default_value_t = false)]
    pub append: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BloomArgs {
    /// Input record store (JSON lines)
    #[arg(short, long, value_name = "FILE")]
    pub json: PathBuf,

    /// Output deduplicated record store
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Append to the output instead of truncating it
    #[arg(short, long, default_value_t = false)]
    pub append: bool,

    /// Number of bloom workers (more than 1 makes output order nondeterministic)
    #[arg(short, long, value_name = "NUM", default_value_t = 1)]
    pub workers: usize,

    /// Bloom filter size in GB
    #[arg(short = 's', long, value_name = "GB", default_value_t = 8.0)]
    pub filter_size: f64,

    /// Number of bloom filter hash probes
    #[arg(short = 'f', long, value_name = "NUM", default_value_t = 14)]
    pub filter_hashes: u32,

    /// Load a previously saved bloom filter
    #[arg(short = 'L', long, value_name = "FILE")]
    pub filter_load: Option<PathBuf>,

    /// Save the bloom filter when done
    #[arg(short = 'S', long, value_name = "FILE")]
    pub filter_save: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct IndexArgs {
    /// Input record store (JSON lines)
    #[arg(short, long, value_name = "FILE")]
    pub json: PathBuf,

    /// Output index file
    #[arg(short, long, value_name = "FILE", default_value = "leakdex.idx")]
    pub output: PathBuf,

    /// Number of index workers
    #[arg(short, long, value_name = "NUM", default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Record field to index by
    #[arg(short, long, value_enum, default_value_t = KeyField::Email)]
    pub key: KeyField,

    /// Directory for temporary shard and run files (default: output's directory)
    #[arg(short = 'T', long, value_name = "DIR")]
    pub temp: Option<PathBuf>,

    /// Keep temporary files after the run
    #[arg(short = 'N', long, default_value_t = false)]
    pub no_cleanup: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SortArgs {
    /// Unsorted index file(s)
    #[arg(short, long, value_name = "FILE", required = true, num_args = 1..)]
    pub index: Vec<PathBuf>,

    /// Output sorted index file
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Number of sort workers
    #[arg(short, long, value_name = "NUM", default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Advisory memory ceiling in MB
    #[arg(short, long, value_name = "MB", default_value_t = 1024)]
    pub max_memory: u64,

    /// Directory for temporary run files (default: output's directory)
    #[arg(short = 'T', long, value_name = "DIR")]
    pub temp: Option<PathBuf>,

    /// Keep temporary run files after the merge
    #[arg(short = 'N', long, default_value_t = false)]
    pub no_cleanup: bool,

    /// Verify key order and entry count after sorting
    #[arg(short, long, default_value_t = false)]
    pub check: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Sorted index file
    #[arg(short, long, value_name = "FILE")]
    pub index: PathBuf,

    /// Record store the index references
    #[arg(short, long, value_name = "FILE")]
    pub json: PathBuf,

    /// Value to search for
    #[arg(short, long, value_name = "VALUE")]
    pub value: String,

    /// Record field the index was built on
    #[arg(short, long, value_enum, default_value_t = KeyField::Email)]
    pub key: KeyField,
}

/// Flags mirror the configuration file; `--conf` takes precedence over
/// the individual flags when both are given.
#[derive(Args, Debug, Clone)]
pub struct AutoArgs {
    /// Pipeline configuration file
    #[arg(short, long, value_name = "FILE")]
    pub conf: Option<PathBuf>,

    /// Print a template configuration and exit
    #[arg(short, long, default_value_t = false)]
    pub generate: bool,

    /// Input record store (JSON lines)
    #[arg(short, long, value_name = "FILE")]
    pub json: Option<PathBuf>,

    /// Output directory for the deduped store and sorted indexes
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Record fields to index by
    #[arg(short, long, value_enum, value_delimiter = ',', default_values_t = [KeyField::User, KeyField::Email])]
    pub keys: Vec<KeyField>,

    /// Number of bloom workers
    #[arg(long, value_name = "NUM", default_value_t = 1)]
    pub workers_bloom: usize,

    /// Number of index workers per key
    #[arg(long, value_name = "NUM", default_value_t = num_cpus::get())]
    pub workers_index: usize,

    /// Number of sort workers
    #[arg(long, value_name = "NUM", default_value_t = num_cpus::get())]
    pub workers_sort: usize,

    /// Bloom filter size in GB
    #[arg(short = 's', long, value_name = "GB", default_value_t = 8.0)]
    pub filter_size: f64,

    /// Number of bloom filter hash probes
    #[arg(short = 'f', long, value_name = "NUM", default_value_t = 14)]
    pub filter_hashes: u32,

    /// Load a previously saved bloom filter
    #[arg(short = 'L', long, value_name = "FILE")]
    pub filter_load: Option<PathBuf>,

    /// Save the bloom filter when done
    #[arg(short = 'S', long, value_name = "FILE")]
    pub filter_save: Option<PathBuf>,

    /// Advisory sort memory ceiling in MB
    #[arg(short, long, value_name = "MB", default_value_t = 1024)]
    pub max_memory: u64,

    /// Directory for temporary shard and run files (default: output dir)
    #[arg(short = 'T', long, value_name = "DIR")]
    pub temp: Option<PathBuf>,

    /// Keep temporary files after the run
    #[arg(short = 'N', long, default_value_t = false)]
    pub no_cleanup: bool,

    /// Verify key order and entry count after each sort
    #[arg(long, default_value_t = false)]
    pub check: bool,
}
