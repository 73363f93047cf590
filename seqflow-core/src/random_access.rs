//! Random-access views over a sequence source
//!
//! Three addressing modes share one selection vocabulary, [`Axis`], applied to
//! the (sequence, row, column) axes:
//!
//! - cuboid: every selected sequence is cut to the length of the shortest one
//! - linear: rows address the concatenation of the selected sequences
//! - jagged: rows are resolved against each sequence on its own
//!
//! All indices are validated before the first row is read.

use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use tracing::debug;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::source::{SequenceReader, SequenceSource};
use crate::stride::RandomAccessStride;

/// A selection along one axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Axis {
    /// Everything
    All,

    /// `start, start + step, ...` below `end`, clamped to the axis length
    Slice {
        /// First index
        start: usize,
        /// Exclusive bound, `None` for the axis length
        end: Option<usize>,
        /// Step between indices
        step: usize,
    },

    /// A single index
    Index(usize),

    /// Explicit indices in the given order, duplicates allowed
    List(Vec<usize>),
}

impl Axis {
    /// Slice with a step
    pub fn stepped(start: usize, end: Option<usize>, step: usize) -> Self {
        Axis::Slice { start, end, step }
    }

    /// Resolve against an axis of `length`, reporting offending indices via `out_of_range`
    /// Columns selected out of `dimension`, `None` when all are kept in order
    pub fn resolve_columns(&self, dimension: usize) -> Result<Option<Vec<usize>>> {
        if *self == Axis::All {
            return Ok(None);
        }
        self.resolve(dimension, |column| Error::ColumnOutOfRange { column, dimension })
            .map(Some)
    }

    fn resolve<E>(&self, length: usize, out_of_range: E) -> Result<Vec<usize>>
    where
        E: Fn(usize) -> Error,
    {
        match self {
            Axis::All => Ok((0..length).collect()),
            Axis::Slice { step: 0, .. } => Err(Error::InvalidArgument("Slice step must be positive".into())),
            Axis::Slice { start, end, step } => {
                let end = end.unwrap_or(length).min(length);
                Ok((*start..end).step_by(*step).collect())
            }
            Axis::Index(index) if *index < length => Ok(vec![*index]),
            Axis::Index(index) => Err(out_of_range(*index)),
            Axis::List(indices) => match indices.iter().find(|&&i| i >= length) {
                Some(&index) => Err(out_of_range(index)),
                None => Ok(indices.clone()),
            },
        }
    }
}

impl From<RangeFull> for Axis {
    fn from(_: RangeFull) -> Self {
        Axis::All
    }
}

impl From<Range<usize>> for Axis {
    fn from(range: Range<usize>) -> Self {
        Axis::stepped(range.start, Some(range.end), 1)
    }
}

impl From<RangeTo<usize>> for Axis {
    fn from(range: RangeTo<usize>) -> Self {
        Axis::stepped(0, Some(range.end), 1)
    }
}

impl From<RangeFrom<usize>> for Axis {
    fn from(range: RangeFrom<usize>) -> Self {
        Axis::stepped(range.start, None, 1)
    }
}

impl From<usize> for Axis {
    fn from(index: usize) -> Self {
        Axis::Index(index)
    }
}

impl From<Vec<usize>> for Axis {
    fn from(indices: Vec<usize>) -> Self {
        Axis::List(indices)
    }
}

impl From<&[usize]> for Axis {
    fn from(indices: &[usize]) -> Self {
        Axis::List(indices.to_vec())
    }
}

/// Cuboid, linear and jagged accessors over one source
pub struct RandomAccess<'a> {
    source: &'a dyn SequenceSource,
}

impl<'a> RandomAccess<'a> {
    /// Views over `source`
    pub fn new(source: &'a dyn SequenceSource) -> Self {
        Self { source }
    }

    fn sequences(&self, axis: &Axis) -> Result<Vec<usize>> {
        let count = self.source.sequence_count();
        axis.resolve(count, |sequence| Error::SequenceOutOfRange { sequence, count })
    }

    fn columns(&self, axis: &Axis) -> Result<Option<Vec<usize>>> {
        axis.resolve_columns(self.source.dimension())
    }

    fn output_dim(&self, columns: Option<&Vec<usize>>) -> usize {
        columns.map_or(self.source.dimension(), Vec::len)
    }

    fn read(
        &self,
        reader: &mut dyn SequenceReader,
        sequence: usize,
        rows: &[usize],
        columns: Option<&Vec<usize>>,
    ) -> Result<Block> {
        if rows.is_empty() {
            return Ok(Block::empty(self.output_dim(columns)));
        }
        let block = reader.read_indices(sequence, rows)?;
        match columns {
            Some(columns) => block.select_columns(columns),
            None => Ok(block),
        }
    }

    /// Uniform-depth view: one block per selected sequence, all with the same row count
    ///
    /// Rows are resolved against the length of the shortest selected sequence.
    /// Longer sequences lose their trailing rows; an index reaching past the
    /// shortest sequence is a range error naming it.
    pub fn cuboid(
        &self,
        sequences: impl Into<Axis>,
        rows: impl Into<Axis>,
        columns: impl Into<Axis>,
    ) -> Result<Vec<Block>> {
        let sequences = self.sequences(&sequences.into())?;
        let columns = self.columns(&columns.into())?;

        let Some(shortest) = sequences.iter().copied().min_by_key(|&s| self.source.sequence_len(s)) else {
            return Ok(Vec::new());
        };
        let depth = self.source.sequence_len(shortest);
        let rows = rows.into().resolve(depth, |index| Error::OutOfRange {
            sequence: shortest,
            index,
            length: depth,
        })?;
        debug!(sequences = sequences.len(), depth, rows = rows.len(), "cuboid access");

        let mut reader = self.source.open_reader()?;
        sequences
            .iter()
            .map(|&s| self.read(reader.as_mut(), s, &rows, columns.as_ref()))
            .collect()
    }

    /// Rows of the concatenation of all sequences in source order
    pub fn linear(&self, rows: impl Into<Axis>, columns: impl Into<Axis>) -> Result<Block> {
        self.linear_sequences(Axis::All, rows, columns)
    }

    /// Rows of the concatenation of the selected sequences, in selection order
    ///
    /// Out-of-range indices are reported against the last selected sequence,
    /// relative to its start in the concatenation.
    pub fn linear_sequences(
        &self,
        sequences: impl Into<Axis>,
        rows: impl Into<Axis>,
        columns: impl Into<Axis>,
    ) -> Result<Block> {
        let sequences = self.sequences(&sequences.into())?;
        let columns = self.columns(&columns.into())?;
        let dim = self.output_dim(columns.as_ref());

        let mut starts = Vec::with_capacity(sequences.len());
        let mut total = 0;
        for &s in &sequences {
            starts.push(total);
            total += self.source.sequence_len(s);
        }

        let rows = rows.into().resolve(total, |index| match sequences.last() {
            Some(&sequence) => {
                let start = starts[starts.len() - 1];
                Error::OutOfRange {
                    sequence,
                    index: index - start,
                    length: total - start,
                }
            }
            None => Error::SequenceOutOfRange {
                sequence: 0,
                count: self.source.sequence_count(),
            },
        })?;
        if rows.is_empty() {
            return Ok(Block::empty(dim));
        }

        // consecutive rows landing in the same sequence are read together
        let mut runs: Vec<(usize, Vec<usize>)> = Vec::new();
        for global in rows {
            let position = starts.partition_point(|&start| start <= global) - 1;
            let local = global - starts[position];
            match runs.last_mut() {
                Some((p, locals)) if *p == position => locals.push(local),
                _ => runs.push((position, vec![local])),
            }
        }

        let mut reader = self.source.open_reader()?;
        let mut out = Block::empty(dim);
        for (position, locals) in runs {
            let block = self.read(reader.as_mut(), sequences[position], &locals, columns.as_ref())?;
            out.append(&block)?;
        }
        Ok(out)
    }

    /// Rows resolved against every selected sequence independently
    pub fn jagged(
        &self,
        sequences: impl Into<Axis>,
        rows: impl Into<Axis>,
        columns: impl Into<Axis>,
    ) -> Result<Vec<Block>> {
        let sequences = self.sequences(&sequences.into())?;
        let columns = self.columns(&columns.into())?;
        let rows = rows.into();

        let resolved = sequences
            .iter()
            .map(|&sequence| {
                let length = self.source.sequence_len(sequence);
                rows.resolve(length, |index| Error::OutOfRange { sequence, index, length })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut reader = self.source.open_reader()?;
        sequences
            .iter()
            .zip(&resolved)
            .map(|(&s, rows)| self.read(reader.as_mut(), s, rows, columns.as_ref()))
            .collect()
    }

    /// Rows picked by an explicit (sequence, row) selection
    ///
    /// Returns one block per source sequence; sequences without entries are
    /// empty. Sources that need sorted access reject unsorted selections
    /// before reading.
    pub fn selection(&self, selection: &RandomAccessStride, columns: impl Into<Axis>) -> Result<Vec<Block>> {
        if self.source.needs_sorted_random_access() {
            selection.ensure_sorted()?;
        }
        selection.validate(self.source.lengths())?;
        let columns = self.columns(&columns.into())?;
        let dim = self.output_dim(columns.as_ref());

        let mut out: Vec<Block> = (0..self.source.sequence_count()).map(|_| Block::empty(dim)).collect();
        let mut reader = self.source.open_reader()?;
        for (sequence, rows) in selection.groups() {
            out[sequence] = self.read(reader.as_mut(), sequence, rows, columns.as_ref())?;
        }
        Ok(out)
    }

    /// Row indices an explicit selection picks from one sequence
    pub fn indices_for_sequence<'s>(&self, selection: &'s RandomAccessStride, sequence: usize) -> &'s [usize] {
        selection.indices_for(sequence)
    }
}
