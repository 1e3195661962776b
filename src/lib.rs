//! # leakdex
//!
//! Curates massive plaintext credential-leak corpora into a deduplicated,
//! indexed, searchable dataset.
//!
//! ## Features
//!
//! - **Normalization**: raw dumps in several line formats become canonical
//!   JSON-lines records
//! - **Deduplication**: a fixed-size concurrent bloom filter drops repeat
//!   credentials at near-unbounded scale
//! - **Indexing**: parallel workers emit fixed-width (key, offset, length)
//!   entries over a memory-mapped record store
//! - **External sorting**: index shards are sorted under an advisory memory
//!   ceiling via chunked runs and multi-way merges
//! - **Search**: exact key lookup by binary search over the sorted index
//!
//! ## Usage
//!
//! ```bash
//! # Normalize, dedup, index, sort in one run
//! leakdex auto -j leaks.json -o curated/
//!
//! # Search the result
//! leakdex search -i curated/email.idx -j curated/clean.json -v alice@example.com
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use leakdex::record::KeyField;
//! use leakdex::search::Searcher;
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut searcher = Searcher::open(
//!     Path::new("curated/email.idx"),
//!     Path::new("curated/clean.json"),
//!     KeyField::Email,
//! )?;
//! let (hits, _stats) = searcher.find("alice@example.com")?;
//! for hit in hits {
//!     println!("{}", hit.record.password);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod cli;
pub mod dedup;
pub mod index;
pub mod normalize;
pub mod pipeline;
pub mod pool;
pub mod record;
pub mod search;
pub mod sorter;
pub mod status;

pub use bloom::BloomFilter;
pub use index::{IndexEntry, Indexer, ENTRY_WIDTH};
pub use record::{KeyField, Record, KEY_WIDTH};
pub use search::Searcher;
pub use sorter::ExternalSorter;
