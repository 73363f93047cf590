//! Uniform and explicit strides

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// How rows are subsampled during iteration
#[derive(Debug, Clone, PartialEq)]
pub enum Stride {
    /// Every k-th row after the skipped prefix
    Uniform(usize),

    /// An explicit ordered list of (sequence, row) pairs
    Selection(Arc<RandomAccessStride>),
}

impl Stride {
    /// Whether this is a uniform stride
    pub fn is_uniform(&self) -> bool {
        matches!(self, Stride::Uniform(_))
    }

    /// The uniform step, if any
    pub fn step(&self) -> Option<usize> {
        match self {
            Stride::Uniform(step) => Some(*step),
            Stride::Selection(_) => None,
        }
    }
}

impl Default for Stride {
    fn default() -> Self {
        Stride::Uniform(1)
    }
}

/// An explicit list of (sequence, row) pairs
///
/// Entries are grouped by sequence in ascending sequence order; inside a sequence
/// the given order is kept, duplicates included.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomAccessStride {
    /// The pairs as given
    entries: Vec<(usize, usize)>,

    /// Row indices per sequence, in the order given
    by_sequence: BTreeMap<usize, Vec<usize>>,
}

impl RandomAccessStride {
    /// Create a selection from (sequence, row) pairs
    pub fn new(entries: Vec<(usize, usize)>) -> Self {
        let mut by_sequence: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &(sequence, row) in &entries {
            by_sequence.entry(sequence).or_default().push(row);
        }
        Self {
            entries,
            by_sequence,
        }
    }

    /// The pairs as given
    pub fn entries(&self) -> &[(usize, usize)] {
        &self.entries
    }

    /// Number of selected rows
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is selected
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequences touched by the selection, ascending
    pub fn sequence_keys(&self) -> Vec<usize> {
        self.by_sequence.keys().copied().collect()
    }

    /// Selected rows of one sequence, empty if the sequence is not selected
    pub fn indices_for(&self, sequence: usize) -> &[usize] {
        self.by_sequence.get(&sequence).map(Vec::as_slice).unwrap_or_default()
    }

    /// Iterate over (sequence, rows) groups in ascending sequence order
    pub fn groups(&self) -> impl Iterator<Item = (usize, &[usize])> + '_ {
        self.by_sequence.iter().map(|(s, rows)| (*s, rows.as_slice()))
    }

    /// Whether entries are non-decreasing by sequence and, within a sequence, by row
    pub fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0] <= w[1])
    }

    /// Fail with [`Error::RandomAccessOrder`] unless the selection is sorted
    pub fn ensure_sorted(&self) -> Result<()> {
        if let Some(position) = self.entries.windows(2).position(|w| w[0] > w[1]) {
            let (a, b) = (self.entries[position], self.entries[position + 1]);
            return Err(Error::RandomAccessOrder(format!(
                "entry {} {:?} follows {:?}",
                position + 1,
                b,
                a
            )));
        }
        Ok(())
    }

    /// Check every entry against the sequence lengths of a source
    pub fn validate(&self, lengths: &[usize]) -> Result<()> {
        for (&sequence, rows) in &self.by_sequence {
            let Some(&length) = lengths.get(sequence) else {
                return Err(Error::SequenceOutOfRange {
                    sequence,
                    count: lengths.len(),
                });
            };
            if let Some(&index) = rows.iter().find(|&&r| r >= length) {
                return Err(Error::OutOfRange {
                    sequence,
                    index,
                    length,
                });
            }
        }
        Ok(())
    }
}

impl From<Vec<(usize, usize)>> for RandomAccessStride {
    fn from(entries: Vec<(usize, usize)>) -> Self {
        Self::new(entries)
    }
}
