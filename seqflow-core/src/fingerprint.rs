//! Configuration fingerprints
//!
//! Every [`SequenceSource`](crate::source::SequenceSource) feeds its live
//! configuration into a [`Fingerprinter`]. Wrapping sources recurse into their
//! upstream first, so the resulting digest covers the whole chain in order.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deterministic digest of an upstream configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering of the digest
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental builder for a [`Fingerprint`]
///
/// Every entry is written as a tagged, length-prefixed record so that
/// `("ab", "c")` and `("a", "bc")` never collide.
pub struct Fingerprinter {
    hasher: Sha256,
}

impl Fingerprinter {
    /// Create an empty fingerprinter
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn write_tagged(&mut self, tag: u8, bytes: &[u8]) {
        self.hasher.update([tag]);
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    /// Open a named section, e.g. the name of a source or stage type
    pub fn section(&mut self, name: &str) -> &mut Self {
        self.write_tagged(b'S', name.as_bytes());
        self
    }

    /// Record a string value
    pub fn str(&mut self, key: &str, value: &str) -> &mut Self {
        self.write_tagged(b'k', key.as_bytes());
        self.write_tagged(b's', value.as_bytes());
        self
    }

    /// Record an integer value
    pub fn usize(&mut self, key: &str, value: usize) -> &mut Self {
        self.write_tagged(b'k', key.as_bytes());
        self.write_tagged(b'u', &(value as u64).to_le_bytes());
        self
    }

    /// Record an ordered list of integers
    pub fn usizes(&mut self, key: &str, values: &[usize]) -> &mut Self {
        self.write_tagged(b'k', key.as_bytes());
        self.hasher.update(b"l");
        self.hasher.update((values.len() as u64).to_le_bytes());
        for value in values {
            self.hasher.update((*value as u64).to_le_bytes());
        }
        self
    }

    /// Record floating point values by their exact bit patterns
    pub fn f64s(&mut self, key: &str, values: &[f64]) -> &mut Self {
        self.write_tagged(b'k', key.as_bytes());
        self.hasher.update(b"f");
        self.hasher.update((values.len() as u64).to_le_bytes());
        for value in values {
            self.hasher.update(value.to_bits().to_le_bytes());
        }
        self
    }

    /// Record the identity of a backing file: its path, size and modification time
    pub fn file(&mut self, path: &Path) -> &mut Self {
        self.write_tagged(b'p', path.to_string_lossy().as_bytes());
        match std::fs::metadata(path) {
            Ok(meta) => {
                self.hasher.update(meta.len().to_le_bytes());
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos());
                self.hasher.update(modified.to_le_bytes());
            }
            Err(_) => self.hasher.update(b"missing"),
        }
        self
    }

    /// Finish and return the digest
    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}
