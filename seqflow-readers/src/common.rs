//! Options and helpers shared by the file readers

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use seqflow_core::{Error, Result, SeqflowConfig};

/// Options for file readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    /// Field delimiter for text files, `None` for any run of whitespace
    pub delimiter: Option<u8>,

    /// Lines starting with this byte are ignored
    pub comment: Option<u8>,

    /// Drop files that fail to open or parse instead of failing the batch
    pub drop_unreadable: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            comment: Some(b'#'),
            drop_unreadable: false,
        }
    }
}

impl ReaderOptions {
    /// Options following the reader policy of a configuration
    pub fn from_config(config: &SeqflowConfig) -> Self {
        Self {
            drop_unreadable: config.drop_unreadable_files,
            ..Self::default()
        }
    }

    /// Comma separated text
    pub fn comma_separated() -> Self {
        Self {
            delimiter: Some(b','),
            ..Self::default()
        }
    }
}

/// Whether an error means the file itself cannot be used
fn is_unreadable(err: &Error) -> bool {
    matches!(err, Error::Io(_) | Error::Format(_))
}

/// Open every path with `open`, honouring the drop policy
///
/// Returns the surviving paths with what `open` produced for them, in input order.
pub(crate) fn open_each<T, F>(paths: &[PathBuf], options: &ReaderOptions, mut open: F) -> Result<Vec<(PathBuf, T)>>
where
    F: FnMut(&Path) -> Result<T>,
{
    let mut opened = Vec::with_capacity(paths.len());
    for path in paths {
        match open(path) {
            Ok(value) => opened.push((path.clone(), value)),
            Err(err) if options.drop_unreadable && is_unreadable(&err) => {
                warn!(path = %path.display(), error = %err, "dropping unreadable file");
            }
            Err(err) => return Err(err),
        }
    }

    if opened.is_empty() && !paths.is_empty() {
        return Err(Error::Configuration(format!(
            "None of the {} files could be read",
            paths.len()
        )));
    }
    Ok(opened)
}

/// Check that all files agree on their dimension; files without rows are ignored
pub(crate) fn common_dimension(dims: &[Option<usize>]) -> Result<usize> {
    let mut expected = None;
    for (sequence, dim) in dims.iter().enumerate() {
        match (expected, *dim) {
            (None, Some(found)) => expected = Some(found),
            (Some(expected), Some(found)) if found != expected => {
                return Err(Error::DimensionMismatch {
                    sequence,
                    expected,
                    found,
                });
            }
            _ => {}
        }
    }
    Ok(expected.unwrap_or(0))
}
