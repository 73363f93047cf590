//! Storage unit layout and its bincode manifest
//!
//! A storage unit is a directory named after the fingerprint. It holds one
//! binary file per sequence and a `manifest.bin` written after all of them, so
//! a unit without a readable manifest is incomplete and gets rebuilt.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use seqflow_core::{Fingerprint, Result};

/// Name of the manifest inside a storage unit
pub const MANIFEST_FILE: &str = "manifest.bin";

/// Bumped whenever the layout changes
pub const FORMAT_VERSION: u32 = 1;

/// Description of a complete storage unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Layout version
    pub version: u32,

    /// Fingerprint the unit was built for
    pub fingerprint: Fingerprint,

    /// Columns per row
    pub dimension: usize,

    /// Rows per sequence
    pub lengths: Vec<usize>,

    /// Per-sequence data files, relative to the unit directory
    pub files: Vec<String>,
}

impl Manifest {
    /// Manifest for a unit with one file per sequence
    pub fn new(fingerprint: Fingerprint, dimension: usize, lengths: Vec<usize>) -> Self {
        let files = (0..lengths.len()).map(sequence_file_name).collect();
        Self {
            version: FORMAT_VERSION,
            fingerprint,
            dimension,
            lengths,
            files,
        }
    }

    /// Absolute paths of the data files
    pub fn paths(&self, dir: &Path) -> Vec<PathBuf> {
        self.files.iter().map(|f| dir.join(f)).collect()
    }

    /// Whether the unit matches what an upstream currently produces
    pub fn matches(&self, fingerprint: &Fingerprint, dimension: usize, lengths: &[usize]) -> bool {
        self.version == FORMAT_VERSION
            && self.fingerprint == *fingerprint
            && self.lengths == lengths
            && self.dimension == dimension
            && self.files.len() == lengths.len()
    }

    /// Read the manifest of a unit, `None` if there is none
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(Some(bincode::deserialize_from(reader)?))
    }

    /// Write the manifest through a temporary file renamed into place
    pub fn store(&self, dir: &Path) -> Result<()> {
        let tmp = temp_path(dir);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, self)?;
            writer.flush()?;
        }
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        Ok(())
    }
}

/// Data file name of one sequence
pub fn sequence_file_name(sequence: usize) -> String {
    format!("seq-{sequence:05}.sfb")
}

/// Unique name for a file that is renamed into place once complete
pub fn temp_path(dir: &Path) -> PathBuf {
    dir.join(format!(".{}.tmp", Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqflow_core::Fingerprinter;
    use tempfile::TempDir;

    fn fingerprint(tag: &str) -> Fingerprint {
        let mut fp = Fingerprinter::new();
        fp.section(tag);
        fp.finish()
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        assert!(Manifest::load(dir.path()).unwrap().is_none());

        let manifest = Manifest::new(fingerprint("a"), 3, vec![10, 0, 4]);
        manifest.store(dir.path()).unwrap();
        let loaded = Manifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.files[2], "seq-00002.sfb");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_matches() {
        let manifest = Manifest::new(fingerprint("a"), 3, vec![10, 4]);
        assert!(manifest.matches(&fingerprint("a"), 3, &[10, 4]));
        assert!(!manifest.matches(&fingerprint("b"), 3, &[10, 4]));
        assert!(!manifest.matches(&fingerprint("a"), 3, &[10, 5]));
        assert!(!manifest.matches(&fingerprint("a"), 2, &[10, 4]));

        let empty = Manifest::new(fingerprint("a"), 3, vec![0, 0]);
        assert!(!empty.matches(&fingerprint("a"), 0, &[0, 0]));
    }

    #[test]
    fn test_corrupt_manifest_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"\x01").unwrap();
        assert!(Manifest::load(dir.path()).is_err());
    }

    #[test]
    fn test_temp_paths_are_unique() {
        let dir = Path::new("/tmp");
        assert_ne!(temp_path(dir), temp_path(dir));
    }
}
