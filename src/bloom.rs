//! Bloom filter engine
//!
//! Approximate set membership over keys too numerous to hold exactly in
//! memory. No false negatives; the false-positive rate for `n` inserted
//! items is roughly `(1 - e^(-k*n/S))^k` for `S` bits and `k` hashes, and
//! is controlled by the operator through the filter size and hash count.
//!
//! The bit array is a vector of `AtomicU64` words, so concurrent `add`
//! calls synchronize per word (`fetch_or`) rather than behind one global
//! lock and throughput scales with the worker count.

use ahash::RandomState;
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::hash::{BuildHasher, Hash, Hasher};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic identifying a persisted filter file (ASCII "LDXB").
const BLOOM_MAGIC: u32 = 0x4c44_5842;

/// Persisted filter format version.
const BLOOM_VERSION: u32 = 1;

/// Fixed seeds for the two base hashes. A persisted filter is only valid
/// if later processes derive the same bit positions, so the hasher state
/// must not be randomized per process.
const SEED_H1: [u64; 4] = [0x9e37_79b9, 0x7f4a_7c15, 0xf39c_c060, 0x5ced_1b52];
const SEED_H2: [u64; 4] = [0x2545_f491, 0x4f6c_dd1d, 0x8a5c_f5ee, 0x3042_7b4d];

/// Errors a caller may want to match on when loading a persisted filter.
#[derive(Debug, thiserror::Error)]
pub enum BloomError {
    #[error("not a bloom filter file (bad magic {0:#x})")]
    BadMagic(u32),
    #[error("unsupported bloom filter version {0}")]
    BadVersion(u32),
    #[error("filter was saved with {saved_bits} bits / {saved_hashes} hashes, requested {want_bits} / {want_hashes}")]
    ConfigMismatch {
        saved_bits: u64,
        saved_hashes: u32,
        want_bits: u64,
        want_hashes: u32,
    },
}

/// A fixed-size probabilistic membership filter.
#[derive(Debug)]
pub struct BloomFilter {
    words: Vec<AtomicU64>,
    bits: u64,
    hashes: u32,
    inserted: AtomicU64,
    h1: RandomState,
    h2: RandomState,
}

impl BloomFilter {
    /// Allocate a zeroed filter of `bits` bits with `hashes` probes.
    pub fn new(bits: u64, hashes: u32) -> Result<Self> {
        if bits == 0 {
            anyhow::bail!("bloom filter size must be positive");
        }
        if hashes == 0 {
            anyhow::bail!("bloom filter hash count must be positive");
        }
        let num_words = (bits as usize).div_ceil(64);
        let words = (0..num_words).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            words,
            bits,
            hashes,
            inserted: AtomicU64::new(0),
            h1: RandomState::with_seeds(SEED_H1[0], SEED_H1[1], SEED_H1[2], SEED_H1[3]),
            h2: RandomState::with_seeds(SEED_H2[0], SEED_H2[1], SEED_H2[2], SEED_H2[3]),
        })
    }

    /// Allocate a filter sized in gigabytes of bit-array memory.
    pub fn with_size_gb(size_gb: f64, hashes: u32) -> Result<Self> {
        if !(size_gb > 0.0) || !size_gb.is_finite() {
            anyhow::bail!("bloom filter size must be positive");
        }
        Self::new((size_gb * 8.0 * 1024.0 * 1024.0 * 1024.0) as u64, hashes)
    }

    /// Bit length a persisted filter of this size carries, for `load`.
    pub fn bits_for_size_gb(size_gb: f64) -> u64 {
        (size_gb * 8.0 * 1024.0 * 1024.0 * 1024.0) as u64
    }

    /// Bit length of the filter.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Number of hash probes per key.
    pub fn hashes(&self) -> u32 {
        self.hashes
    }

    /// Approximate number of keys inserted so far. Under concurrent `add`
    /// two workers racing on the same new key may both count it, so this
    /// is an estimate, good enough for run summaries.
    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    /// Derive the probe positions for a key via double hashing:
    /// `pos_i = (h1 + i*h2) mod S`. The step is forced odd so a zero h2
    /// cannot collapse all probes onto one bit.
    fn positions(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let mut hasher = self.h1.build_hasher();
        key.hash(&mut hasher);
        let h1 = hasher.finish();

        let mut hasher = self.h2.build_hasher();
        key.hash(&mut hasher);
        let h2 = hasher.finish() | 1;

        let bits = self.bits;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bits)
    }

    fn get_bit(&self, pos: u64) -> bool {
        let word = (pos / 64) as usize;
        let mask = 1u64 << (pos % 64);
        (self.words[word].load(Ordering::Relaxed) & mask) != 0
    }

    /// Whether all probe bits for `key` are already set (probable prior
    /// membership). Never mutates the filter.
    pub fn test(&self, key: &[u8]) -> bool {
        self.positions(key).all(|pos| self.get_bit(pos))
    }

    /// Set the probe bits for `key` and report whether they were all set
    /// beforehand — i.e. the pre-update `test` result.
    pub fn add(&self, key: &[u8]) -> bool {
        let mut present = true;
        for pos in self.positions(key) {
            let word = (pos / 64) as usize;
            let mask = 1u64 << (pos % 64);
            let old = self.words[word].fetch_or(mask, Ordering::Relaxed);
            if old & mask == 0 {
                present = false;
            }
        }
        if !present {
            self.inserted.fetch_add(1, Ordering::Relaxed);
        }
        present
    }

    /// Persist the filter as `{header, raw bit array}`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create filter file {:?}", path))?;
        let mut w = BufWriter::new(file);
        w.write_u32::<LittleEndian>(BLOOM_MAGIC)?;
        w.write_u32::<LittleEndian>(BLOOM_VERSION)?;
        w.write_u64::<LittleEndian>(self.bits)?;
        w.write_u32::<LittleEndian>(self.hashes)?;
        w.write_u64::<LittleEndian>(self.inserted())?;
        let mut buf = [0u8; 8];
        for word in &self.words {
            buf.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
            w.write_all(&buf)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Load a persisted filter, refusing files whose stored geometry does
    /// not match the requested one — a filter of the wrong size or hash
    /// count would silently misclassify every key.
    pub fn load(path: &Path, want_bits: u64, want_hashes: u32) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open filter file {:?}", path))?;
        let mut r = BufReader::new(file);

        let magic = r.read_u32::<LittleEndian>()?;
        if magic != BLOOM_MAGIC {
            return Err(BloomError::BadMagic(magic).into());
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != BLOOM_VERSION {
            return Err(BloomError::BadVersion(version).into());
        }
        let bits = r.read_u64::<LittleEndian>()?;
        let hashes = r.read_u32::<LittleEndian>()?;
        let inserted = r.read_u64::<LittleEndian>()?;
        if bits != want_bits || hashes != want_hashes {
            return Err(BloomError::ConfigMismatch {
                saved_bits: bits,
                saved_hashes: hashes,
                want_bits,
                want_hashes,
            }
            .into());
        }

        let filter = Self::new(bits, hashes)?;
        filter.inserted.store(inserted, Ordering::Relaxed);
        let mut buf = [0u8; 8];
        for word in &filter.words {
            r.read_exact(&mut buf)
                .context("filter file truncated mid bit array")?;
            word.store(u64::from_le_bytes(buf), Ordering::Relaxed);
        }
        Ok(filter)
    }

    /// Memory held by the bit array, in bytes.
    pub fn memory_usage(&self) -> usize {
        self.words.len() * 8
    }
}
