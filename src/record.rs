//! Canonical record model and key encoding
//!
//! A record is one line of the canonical store: a JSON object with the
//! identity fields and the leaked password. Records are created by the
//! normalizer and never mutated afterwards.

use serde::{Deserialize, Serialize};

/// Fixed width of an encoded index key in bytes.
///
/// Keys longer than this are truncated; the search engine compensates by
/// comparing the resolved record's field against the query, so lookups
/// stay exact even when two values share a 16-byte prefix.
pub const KEY_WIDTH: usize = 16;

/// A canonical credential record, one per line of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub email: String,
    pub user: String,
    pub domain: String,
    #[serde(default)]
    pub password: String,
}

impl Record {
    /// Parse a record from one line of the canonical store.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// The value of the given key field.
    pub fn field(&self, key: KeyField) -> &str {
        match key {
            KeyField::Email => &self.email,
            KeyField::User => &self.user,
            KeyField::Domain => &self.domain,
        }
    }
}

/// The record field an index is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyField {
    Email,
    User,
    Domain,
}

impl KeyField {
    /// Short name used in output file names and status lines.
    pub fn name(&self) -> &'static str {
        match self {
            KeyField::Email => "email",
            KeyField::User => "user",
            KeyField::Domain => "domain",
        }
    }
}

impl std::fmt::Display for KeyField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Encode a field value as a fixed-width, bytewise-ordered key.
///
/// The value is lowercased, then truncated or zero-padded to [`KEY_WIDTH`]
/// bytes. Zero padding sorts shorter values before their extensions, which
/// keeps lexicographic order on the encoded keys.
pub fn encode_key(value: &str) -> [u8; KEY_WIDTH] {
    let mut key = [0u8; KEY_WIDTH];
    let lower = value.to_lowercase();
    let bytes = lower.as_bytes();
    let n = bytes.len().min(KEY_WIDTH);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}
