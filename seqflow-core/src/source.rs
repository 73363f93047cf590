//! Sequence source and reader traits
//!
//! A [`SequenceSource`] describes an immutable set of independent sequences
//! sharing one dimension. Reading happens through a [`SequenceReader`] opened per
//! iterator or random-access request, so every consumer owns its own cursor and
//! file handles.

use crate::block::Block;
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::iterator::ChunkIteratorBuilder;
use crate::random_access::RandomAccess;

/// An ordered collection of variable-length sequences with a shared dimension
pub trait SequenceSource {
    /// Length in rows of every sequence, in source order
    fn lengths(&self) -> &[usize];

    /// Number of columns shared by all sequences
    fn dimension(&self) -> usize;

    /// Open a reader with its own cursor and handles
    fn open_reader(&self) -> Result<Box<dyn SequenceReader + '_>>;

    /// Feed the live configuration into a fingerprint
    ///
    /// Wrapping sources describe their upstream before themselves.
    fn describe(&self, fp: &mut Fingerprinter);

    /// Whether explicit row selections must be sorted for this source
    fn needs_sorted_random_access(&self) -> bool {
        false
    }

    /// Number of sequences
    fn sequence_count(&self) -> usize {
        self.lengths().len()
    }

    /// Length of one sequence, zero if it does not exist
    fn sequence_len(&self, sequence: usize) -> usize {
        self.lengths().get(sequence).copied().unwrap_or(0)
    }

    /// Total number of rows over all sequences
    fn total_rows(&self) -> usize {
        self.lengths().iter().sum()
    }

    /// Length of the longest sequence
    fn longest_sequence(&self) -> usize {
        self.lengths().iter().copied().max().unwrap_or(0)
    }

    /// Memory needed to hold one row of output
    fn bytes_per_row(&self) -> u64 {
        (self.dimension() * std::mem::size_of::<f64>()) as u64
    }

    /// Digest of the current configuration
    fn fingerprint(&self) -> Fingerprint {
        let mut fp = Fingerprinter::new();
        self.describe(&mut fp);
        fp.finish()
    }

    /// Start configuring a chunk iterator over this source
    fn iter_chunks(&self) -> ChunkIteratorBuilder<'_>
    where
        Self: Sized,
    {
        ChunkIteratorBuilder::new(self)
    }

    /// Random-access views over this source
    fn random_access(&self) -> RandomAccess<'_>
    where
        Self: Sized,
    {
        RandomAccess::new(self)
    }
}

/// A cursor over the rows of a [`SequenceSource`]
///
/// Readers that hold file handles keep at most one open at a time and release it
/// before switching to another sequence; dropping a reader releases everything.
pub trait SequenceReader {
    /// Read rows `start, start + stride, ...` below `end` of one sequence
    fn read_strided(&mut self, sequence: usize, start: usize, end: usize, stride: usize) -> Result<Block>;

    /// Read the given rows of one sequence in the given order
    ///
    /// The default groups requests into runs of consecutive rows, reading each
    /// run with [`SequenceReader::read_strided`] in ascending row order.
    fn read_indices(&mut self, sequence: usize, indices: &[usize]) -> Result<Block> {
        gather_sorted(indices, |start, end| self.read_strided(sequence, start, end, 1))
    }

    /// Release any held handles, keeping the reader usable
    fn release(&mut self) {}
}

impl<S: SequenceSource + ?Sized> SequenceSource for Box<S> {
    fn lengths(&self) -> &[usize] {
        (**self).lengths()
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn open_reader(&self) -> Result<Box<dyn SequenceReader + '_>> {
        (**self).open_reader()
    }

    fn describe(&self, fp: &mut Fingerprinter) {
        (**self).describe(fp);
    }

    fn needs_sorted_random_access(&self) -> bool {
        (**self).needs_sorted_random_access()
    }

    fn bytes_per_row(&self) -> u64 {
        (**self).bytes_per_row()
    }
}

/// Read arbitrary rows through a contiguous-range reader
///
/// Rows are fetched once each in ascending order, then arranged in the
/// requested order, duplicates included.
pub(crate) fn gather_sorted<F>(indices: &[usize], mut read_range: F) -> Result<Block>
where
    F: FnMut(usize, usize) -> Result<Block>,
{
    let mut unique: Vec<usize> = indices.to_vec();
    unique.sort_unstable();
    unique.dedup();

    let mut fetched: Option<Block> = None;
    let mut run_start = 0;
    while run_start < unique.len() {
        let mut run_end = run_start + 1;
        while run_end < unique.len() && unique[run_end] == unique[run_end - 1] + 1 {
            run_end += 1;
        }
        let run = read_range(unique[run_start], unique[run_end - 1] + 1)?;
        match fetched.as_mut() {
            Some(block) => block.append(&run)?,
            None => fetched = Some(run),
        }
        run_start = run_end;
    }

    let Some(fetched) = fetched else {
        return Err(Error::InvalidArgument("No rows requested".into()));
    };

    let order: Vec<usize> = indices
        .iter()
        .map(|index| unique.binary_search(index).unwrap_or_default())
        .collect();
    Ok(fetched.take_rows(&order))
}

/// Check that `sequence` exists in `source`
pub(crate) fn check_sequence(source: &dyn SequenceSource, sequence: usize) -> Result<()> {
    let count = source.sequence_count();
    if sequence >= count {
        return Err(Error::SequenceOutOfRange { sequence, count });
    }
    Ok(())
}
