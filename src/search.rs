//! Exact-key lookup against a sorted index file
//!
//! Binary search over the memory-mapped index locates one entry with the
//! queried key in `O(log N)` comparisons, then a contiguous scan left and
//! right collects the whole equal-key run (equal keys are adjacent in a
//! sorted file). Each hit's offset/length resolves to a record line in the
//! store; because keys are fixed-width truncations, every resolved record
//! is re-checked against the query so results stay exact.

use crate::index::{IndexEntry, IndexFileError, ENTRY_WIDTH};
use crate::record::{encode_key, KeyField, Record, KEY_WIDTH};

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A resolved match: the record plus where its line lives in the store.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: Record,
    pub offset: u64,
    pub length: u32,
}

/// Diagnostic counters for one lookup, reported in verbose mode. They never
/// change result content.
#[derive(Debug, Default, Clone, Copy)]
pub struct SearchStats {
    pub comparisons: u64,
    pub seeks: u64,
}

#[derive(Debug)]
pub struct Searcher {
    index: memmap2::Mmap,
    entries: u64,
    store: File,
    store_path: PathBuf,
    key: KeyField,
}

impl Searcher {
    /// Open a sorted index and its record store. Fails up front on a
    /// structurally invalid index (size not a multiple of the entry width).
    pub fn open(index_path: &Path, store_path: &Path, key: KeyField) -> Result<Self> {
        let index_file = File::open(index_path)
            .with_context(|| format!("failed to open index file {:?}", index_path))?;
        let size = index_file.metadata()?.len();
        if size % ENTRY_WIDTH as u64 != 0 {
            return Err(IndexFileError::Misaligned {
                path: index_path.to_path_buf(),
                size,
                width: ENTRY_WIDTH,
            }
            .into());
        }
        let index = unsafe { memmap2::Mmap::map(&index_file) }
            .with_context(|| format!("failed to mmap index file {:?}", index_path))?;
        let store = File::open(store_path)
            .with_context(|| format!("failed to open record store {:?}", store_path))?;
        Ok(Self {
            index,
            entries: size / ENTRY_WIDTH as u64,
            store,
            store_path: store_path.to_path_buf(),
            key,
        })
    }

    /// Number of entries in the index.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    fn entry_at(&self, i: u64) -> IndexEntry {
        let start = i as usize * ENTRY_WIDTH;
        IndexEntry::decode(&self.index[start..start + ENTRY_WIDTH])
    }

    /// Find every record whose key field equals `value`. An absent key is
    /// an empty result, not an error.
    pub fn find(&mut self, value: &str) -> Result<(Vec<SearchHit>, SearchStats)> {
        let mut stats = SearchStats::default();
        let target = encode_key(value);

        let Some(hit) = self.binary_search(&target, &mut stats) else {
            return Ok((Vec::new(), stats));
        };

        // Expand to the boundaries of the equal-key run.
        let mut lo = hit;
        while lo > 0 && self.entry_at(lo - 1).key == target {
            stats.comparisons += 1;
            lo -= 1;
        }
        let mut hi = hit;
        while hi + 1 < self.entries && self.entry_at(hi + 1).key == target {
            stats.comparisons += 1;
            hi += 1;
        }

        let wanted = value.to_lowercase();
        let mut hits = Vec::new();
        for i in lo..=hi {
            let entry = self.entry_at(i);
            let record = self.resolve(&entry, &mut stats)?;
            // Truncated 16-byte keys can collide; keep only true matches.
            if record.field(self.key).to_lowercase() == wanted {
                hits.push(SearchHit {
                    record,
                    offset: entry.offset,
                    length: entry.length,
                });
            }
        }
        Ok((hits, stats))
    }

    /// Locate any one entry with `target`, or `None`.
    fn binary_search(&self, target: &[u8; KEY_WIDTH], stats: &mut SearchStats) -> Option<u64> {
        let mut lo = 0u64;
        let mut hi = self.entries;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            stats.comparisons += 1;
            match self.entry_at(mid).key.cmp(target) {
                std::cmp::Ordering::Equal => return Some(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }

    /// Seek and read the referenced record line from the store.
    fn resolve(&mut self, entry: &IndexEntry, stats: &mut SearchStats) -> Result<Record> {
        stats.seeks += 1;
        self.store
            .seek(SeekFrom::Start(entry.offset))
            .with_context(|| format!("failed to seek record store {:?}", self.store_path))?;
        let mut buf = vec![0u8; entry.length as usize];
        self.store
            .read_exact(&mut buf)
            .with_context(|| format!("failed to read record store {:?}", self.store_path))?;
        let text = std::str::from_utf8(&buf).with_context(|| {
            format!(
                "record at offset {} in {:?} is not valid UTF-8",
                entry.offset, self.store_path
            )
        })?;
        Record::from_line(text).with_context(|| {
            format!(
                "record at offset {} in {:?} is not valid JSON",
                entry.offset, self.store_path
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexStats, Indexer};
    use crate::sorter::{ExternalSorter, SortConfig};
    use std::io::Write as _;
    use tempfile::TempDir;

    fn record_line(email: &str, password: &str) -> String {
        let (user, domain) = email.split_once('@').unwrap();
        format!(
            r#"{{"email":"{}","user":"{}","domain":"{}","password":"{}"}}"#,
            email, user, domain, password
        )
    }

    /// Build a store plus sorted email index from the given credentials.
    fn build_fixture(dir: &Path, creds: &[(&str, &str)]) -> (PathBuf, PathBuf) {
        let store = dir.join("store.json");
        let mut file = File::create(&store).unwrap();
        for (email, password) in creds {
            writeln!(file, "{}", record_line(email, password)).unwrap();
        }

        let indexer = Indexer::new(KeyField::Email, 1, dir.to_path_buf()).unwrap();
        let shards = indexer.index_store(&store, &IndexStats::new()).unwrap();

        let sorted = dir.join("email.idx");
        let mut sorter = ExternalSorter::new(SortConfig {
            max_memory: 1 << 20,
            workers: 1,
            temp_dir: dir.to_path_buf(),
            verify: true,
            cleanup: true,
            fan_in: 64,
        })
        .unwrap();
        sorter.sort(&shards, &sorted).unwrap();
        (sorted, store)
    }

    #[test]
    fn test_search_finds_all_matches() {
        let dir = TempDir::new().unwrap();
        let (index, store) = build_fixture(
            dir.path(),
            &[
                ("alice@example.com", "pw1"),
                ("bob@example.com", "pw2"),
                ("alice@example.com", "pw3"),
                ("carol@other.net", "pw4"),
            ],
        );

        let mut searcher = Searcher::open(&index, &store, KeyField::Email).unwrap();
        let (hits, stats) = searcher.find("alice@example.com").unwrap();
        assert_eq!(hits.len(), 2);
        let mut passwords: Vec<_> = hits.iter().map(|h| h.record.password.clone()).collect();
        passwords.sort();
        assert_eq!(passwords, vec!["pw1", "pw3"]);
        assert!(stats.comparisons > 0);
        assert_eq!(stats.seeks, 2);
    }

    #[test]
    fn test_search_absent_key_empty_not_error() {
        let dir = TempDir::new().unwrap();
        let (index, store) = build_fixture(dir.path(), &[("alice@example.com", "pw1")]);
        let mut searcher = Searcher::open(&index, &store, KeyField::Email).unwrap();
        let (hits, _) = searcher.find("nobody@nowhere.org").unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_search_is_case_insensitive_on_keys() {
        let dir = TempDir::new().unwrap();
        let (index, store) = build_fixture(dir.path(), &[("alice@example.com", "pw1")]);
        let mut searcher = Searcher::open(&index, &store, KeyField::Email).unwrap();
        let (hits, _) = searcher.find("Alice@Example.COM").unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_truncation_collision_filtered_out() {
        // Both addresses share a 16-byte prefix, so their encoded keys
        // collide; search must still return only the asked-for one.
        let dir = TempDir::new().unwrap();
        let (index, store) = build_fixture(
            dir.path(),
            &[
                ("shared-prefix-aa@one.com", "pw1"),
                ("shared-prefix-aa@two.com", "pw2"),
            ],
        );
        let mut searcher = Searcher::open(&index, &store, KeyField::Email).unwrap();
        let (hits, _) = searcher.find("shared-prefix-aa@one.com").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.password, "pw1");
    }

    #[test]
    fn test_misaligned_index_is_explicit_error() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("bad.idx");
        let store = dir.path().join("store.json");
        std::fs::write(&index, vec![0u8; ENTRY_WIDTH + 1]).unwrap();
        std::fs::write(&store, b"").unwrap();

        let err = Searcher::open(&index, &store, KeyField::Email).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexFileError>(),
            Some(IndexFileError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_search_by_domain_key() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("store.json");
        let mut file = File::create(&store).unwrap();
        for (email, password) in [
            ("alice@example.com", "pw1"),
            ("bob@example.com", "pw2"),
            ("carol@other.net", "pw3"),
        ] {
            writeln!(file, "{}", record_line(email, password)).unwrap();
        }
        let indexer = Indexer::new(KeyField::Domain, 1, dir.path().to_path_buf()).unwrap();
        let shards = indexer.index_store(&store, &IndexStats::new()).unwrap();
        let sorted = dir.path().join("domain.idx");
        ExternalSorter::new(SortConfig {
            max_memory: 1 << 20,
            workers: 1,
            temp_dir: dir.path().to_path_buf(),
            verify: true,
            cleanup: true,
            fan_in: 64,
        })
        .unwrap()
        .sort(&shards, &sorted)
        .unwrap();

        let mut searcher = Searcher::open(&sorted, &store, KeyField::Domain).unwrap();
        let (hits, _) = searcher.find("example.com").unwrap();
        assert_eq!(hits.len(), 2);
    }
}
