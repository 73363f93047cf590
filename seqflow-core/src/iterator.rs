//! Chunked, strided and lagged iteration over sequence sources
//!
//! A [`ChunkIterator`] is a pull-based cursor. Each call to
//! [`ChunkIterator::next_chunk`] returns at most `chunk_size` rows of a single
//! sequence (a whole sequence when the chunk size is 0). Chunks never span two
//! sequences.
//!
//! Chunk size, stride, skip and lag can be changed while iterating. Changes are
//! staged on a copy of the [`IteratorState`] and take effect when the next chunk
//! is produced; a staged skip is applied when the next sequence is entered, and
//! so is a switch to or from an explicit selection. A staged state that fails
//! validation stays staged and is reported again by every call until replaced.
//!
//! With `lag > 0` every chunk carries a second block read through an
//! independent reader, starting `lag` physical rows after the primary chunk in
//! the same sequence. Near the end of a sequence the lagged block is shorter
//! than the primary one, possibly empty.

use std::sync::Arc;

use tracing::debug;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::source::{SequenceReader, SequenceSource};
use crate::stride::{RandomAccessStride, Stride};

/// Chunk size used when none is configured
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Iteration settings
#[derive(Debug, Clone, PartialEq)]
pub struct IteratorState {
    /// Rows per chunk; 0 returns each sequence as one chunk
    pub chunk_size: usize,

    /// Uniform step or explicit (sequence, row) selection
    pub stride: Stride,

    /// Rows discarded at the start of each sequence
    pub skip: usize,

    /// Offset of the paired lagged stream; 0 disables it
    pub lag: usize,

    /// Whether chunks carry their sequence index
    pub return_sequence_index: bool,

    /// Whether explicit selections must be sorted
    pub require_sorted: bool,
}

impl Default for IteratorState {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            stride: Stride::default(),
            skip: 0,
            lag: 0,
            return_sequence_index: true,
            require_sorted: false,
        }
    }
}

impl IteratorState {
    /// Check these settings against a source without reading from it
    pub fn validate(&self, source: &dyn SequenceSource) -> Result<()> {
        match &self.stride {
            Stride::Uniform(0) => Err(Error::InvalidArgument("Stride must be positive".into())),
            Stride::Uniform(_) => Ok(()),
            Stride::Selection(selection) => {
                if self.lag > 0 {
                    return Err(Error::Configuration(
                        "Lagged iteration is not supported with an explicit stride".into(),
                    ));
                }
                if self.require_sorted || source.needs_sorted_random_access() {
                    selection.ensure_sorted()?;
                }
                selection.validate(source.lengths())
            }
        }
    }
}

/// One iteration step
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Sequence the rows belong to, present when sequence indices are requested
    pub sequence: Option<usize>,

    /// Output-row offset of the first row within its sequence
    pub offset: usize,

    /// The rows
    pub data: Block,

    /// The lagged rows, present when `lag > 0`
    pub lagged: Option<Block>,
}

impl Chunk {
    /// Number of primary rows
    pub fn rows(&self) -> usize {
        self.data.rows()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    /// Sequence being read
    sequence: usize,

    /// Next physical row (uniform stride)
    row: usize,

    /// Rows or selection entries already produced in this sequence
    emitted: usize,

    /// Whether `row` has been initialised for `sequence`
    entered: bool,
}

#[derive(Debug, Clone, Copy)]
struct Produced {
    sequence: usize,
    offset: usize,
    last_in_sequence: bool,
    last: bool,
}

/// Builder for a [`ChunkIterator`]
pub struct ChunkIteratorBuilder<'a> {
    source: &'a dyn SequenceSource,
    state: IteratorState,
}

impl<'a> ChunkIteratorBuilder<'a> {
    /// Start from default settings
    pub fn new(source: &'a dyn SequenceSource) -> Self {
        Self {
            source,
            state: IteratorState::default(),
        }
    }

    /// Replace all settings
    pub fn state(mut self, state: IteratorState) -> Self {
        self.state = state;
        self
    }

    /// Rows per chunk, 0 for whole sequences
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.state.chunk_size = chunk_size;
        self
    }

    /// Uniform stride
    pub fn stride(mut self, stride: usize) -> Self {
        self.state.stride = Stride::Uniform(stride);
        self
    }

    /// Explicit (sequence, row) selection
    pub fn selection(mut self, selection: impl Into<RandomAccessStride>) -> Self {
        self.state.stride = Stride::Selection(Arc::new(selection.into()));
        self
    }

    /// Rows skipped at the start of each sequence
    pub fn skip(mut self, skip: usize) -> Self {
        self.state.skip = skip;
        self
    }

    /// Offset of the lagged stream
    pub fn lag(mut self, lag: usize) -> Self {
        self.state.lag = lag;
        self
    }

    /// Whether chunks carry their sequence index
    pub fn return_sequence_index(mut self, enabled: bool) -> Self {
        self.state.return_sequence_index = enabled;
        self
    }

    /// Require explicit selections to be sorted
    pub fn require_sorted(mut self, required: bool) -> Self {
        self.state.require_sorted = required;
        self
    }

    /// Validate the settings and open the reader
    ///
    /// Validation happens before the source is touched, so ordering and range
    /// errors are reported without any I/O.
    pub fn build(self) -> Result<ChunkIterator<'a>> {
        self.state.validate(self.source)?;
        let reader = self.source.open_reader()?;
        Ok(ChunkIterator {
            source: self.source,
            reader,
            lagged_reader: None,
            state: self.state,
            staged: None,
            cursor: Cursor::default(),
            produced: None,
        })
    }
}

/// Pull-based cursor producing chunks from a [`SequenceSource`]
pub struct ChunkIterator<'a> {
    source: &'a dyn SequenceSource,
    reader: Box<dyn SequenceReader + 'a>,
    lagged_reader: Option<Box<dyn SequenceReader + 'a>>,
    state: IteratorState,
    staged: Option<IteratorState>,
    cursor: Cursor,
    produced: Option<Produced>,
}

impl<'a> ChunkIterator<'a> {
    /// Iterator with default settings
    pub fn new(source: &'a dyn SequenceSource) -> Result<Self> {
        ChunkIteratorBuilder::new(source).build()
    }

    /// Settings that the next chunk will use
    pub fn state(&self) -> &IteratorState {
        self.staged.as_ref().unwrap_or(&self.state)
    }

    fn stage(&mut self) -> &mut IteratorState {
        self.staged.get_or_insert_with(|| self.state.clone())
    }

    /// Rows per chunk
    pub fn chunk_size(&self) -> usize {
        self.state().chunk_size
    }

    /// Change the chunk size from the next chunk on
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.stage().chunk_size = chunk_size;
    }

    /// Current stride
    pub fn stride(&self) -> &Stride {
        &self.state().stride
    }

    /// Change the uniform stride from the next chunk on
    ///
    /// Replacing an explicit selection takes effect at the next sequence.
    pub fn set_stride(&mut self, stride: usize) -> Result<()> {
        if stride == 0 {
            return Err(Error::InvalidArgument("Stride must be positive".into()));
        }
        self.stage().stride = Stride::Uniform(stride);
        Ok(())
    }

    /// Switch to an explicit (sequence, row) selection, starting with the next sequence
    ///
    /// The selection is checked for order and range when it is applied, so an
    /// invalid one makes [`ChunkIterator::next_chunk`] fail until it is replaced.
    pub fn set_selection(&mut self, selection: impl Into<RandomAccessStride>) {
        self.stage().stride = Stride::Selection(Arc::new(selection.into()));
    }

    /// Rows skipped at the start of each sequence
    pub fn skip(&self) -> usize {
        self.state().skip
    }

    /// Change the skip, effective from the next sequence entered
    pub fn set_skip(&mut self, skip: usize) {
        self.stage().skip = skip;
    }

    /// Lag of the paired stream
    pub fn lag(&self) -> usize {
        self.state().lag
    }

    /// Change the lag from the next chunk on
    pub fn set_lag(&mut self, lag: usize) -> Result<()> {
        if lag > 0 && !self.state().stride.is_uniform() {
            return Err(Error::Configuration(
                "Lagged iteration is not supported with an explicit stride".into(),
            ));
        }
        self.stage().lag = lag;
        Ok(())
    }

    /// Whether chunks carry their sequence index
    pub fn return_sequence_index(&self) -> bool {
        self.state().return_sequence_index
    }

    /// Toggle sequence indices on produced chunks
    pub fn set_return_sequence_index(&mut self, enabled: bool) {
        self.stage().return_sequence_index = enabled;
    }

    /// Output-row offset of the last produced chunk within its sequence
    pub fn pos(&self) -> usize {
        self.produced.map_or(0, |p| p.offset)
    }

    /// Sequence of the last produced chunk
    pub fn current_sequence(&self) -> usize {
        self.produced.map_or(self.cursor.sequence, |p| p.sequence)
    }

    /// Whether the last produced chunk ended its sequence
    pub fn is_last_chunk_in_sequence(&self) -> bool {
        self.produced.is_some_and(|p| p.last_in_sequence)
    }

    /// Whether the last produced chunk was the final one
    pub fn is_last_chunk(&self) -> bool {
        self.produced.is_some_and(|p| p.last)
    }

    /// Rewind to the first row of the first sequence and release handles
    pub fn reset(&mut self) {
        self.reader.release();
        if let Some(reader) = self.lagged_reader.as_mut() {
            reader.release();
        }
        self.cursor = Cursor::default();
        self.produced = None;
    }

    /// Produce the next chunk, `None` once everything was returned
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if let Some(next) = &self.staged {
            next.validate(self.source)?;
        }
        if let Some(next) = self.staged.take() {
            let switches_sequence = next.stride != self.state.stride
                && !(next.stride.is_uniform() && self.state.stride.is_uniform());
            if switches_sequence && self.cursor.entered {
                self.advance_sequence();
            }
            self.state = next;
        }

        match &self.state.stride {
            Stride::Uniform(step) => {
                let step = *step;
                self.next_uniform(step)
            }
            Stride::Selection(selection) => {
                let selection = Arc::clone(selection);
                self.next_selected(&selection)
            }
        }
    }

    /// Drain the iterator into one block per sequence of the source
    ///
    /// Sequences that produce no rows yield empty blocks. Lagged blocks are
    /// dropped.
    pub fn collect_sequences(mut self) -> Result<Vec<Block>> {
        let dim = self.source.dimension();
        let mut sequences: Vec<Block> = (0..self.source.sequence_count())
            .map(|_| Block::empty(dim))
            .collect();

        while let Some(chunk) = self.next_chunk()? {
            sequences[self.current_sequence()].append(&chunk.data)?;
        }
        Ok(sequences)
    }

    fn advance_sequence(&mut self) {
        self.cursor.sequence += 1;
        self.cursor.entered = false;
    }

    fn emit(
        &mut self,
        sequence: usize,
        offset: usize,
        data: Block,
        lagged: Option<Block>,
        last_in_sequence: bool,
        last: bool,
    ) -> Chunk {
        self.produced = Some(Produced {
            sequence,
            offset,
            last_in_sequence,
            last,
        });
        Chunk {
            sequence: self.state.return_sequence_index.then_some(sequence),
            offset,
            data,
            lagged,
        }
    }

    fn next_uniform(&mut self, step: usize) -> Result<Option<Chunk>> {
        let count = self.source.sequence_count();
        loop {
            let sequence = self.cursor.sequence;
            if sequence >= count {
                return Ok(None);
            }

            let length = self.source.sequence_len(sequence);
            if !self.cursor.entered {
                self.cursor.row = self.state.skip;
                self.cursor.emitted = 0;
                self.cursor.entered = true;
                debug!(sequence, length, skip = self.state.skip, "entering sequence");
            }
            if self.cursor.row >= length {
                self.advance_sequence();
                continue;
            }

            let start = self.cursor.row;
            let remaining = (length - start).div_ceil(step);
            let rows = match self.state.chunk_size {
                0 => remaining,
                n => n.min(remaining),
            };
            let end = start + (rows - 1) * step + 1;

            let data = self.reader.read_strided(sequence, start, end, step)?;
            let lagged = match self.state.lag {
                0 => None,
                lag => Some(self.read_lagged(sequence, length, start + lag, rows, step)?),
            };

            let offset = self.cursor.emitted;
            self.cursor.row = start + rows * step;
            self.cursor.emitted += rows;

            let last_in_sequence = self.cursor.row >= length;
            if last_in_sequence {
                self.advance_sequence();
            }
            let skip = self.state.skip;
            let last = last_in_sequence
                && self.source.lengths()[sequence + 1..]
                    .iter()
                    .all(|&l| l <= skip);

            return Ok(Some(self.emit(sequence, offset, data, lagged, last_in_sequence, last)));
        }
    }

    fn read_lagged(
        &mut self,
        sequence: usize,
        length: usize,
        start: usize,
        max_rows: usize,
        step: usize,
    ) -> Result<Block> {
        if start >= length {
            return Ok(Block::empty(self.source.dimension()));
        }
        let rows = max_rows.min((length - start).div_ceil(step));

        let reader = match self.lagged_reader.take() {
            Some(reader) => reader,
            None => self.source.open_reader()?,
        };
        let reader = self.lagged_reader.insert(reader);
        reader.read_strided(sequence, start, start + (rows - 1) * step + 1, step)
    }

    fn next_selected(&mut self, selection: &RandomAccessStride) -> Result<Option<Chunk>> {
        let count = self.source.sequence_count();
        loop {
            let sequence = self.cursor.sequence;
            if sequence >= count {
                return Ok(None);
            }

            let selected = selection.indices_for(sequence);
            if !self.cursor.entered {
                self.cursor.emitted = 0;
                self.cursor.entered = true;
            }
            if self.cursor.emitted >= selected.len() {
                self.advance_sequence();
                continue;
            }

            let offset = self.cursor.emitted;
            let rows = match self.state.chunk_size {
                0 => selected.len() - offset,
                n => n.min(selected.len() - offset),
            };
            let data = self
                .reader
                .read_indices(sequence, &selected[offset..offset + rows])?;
            self.cursor.emitted += rows;

            let last_in_sequence = self.cursor.emitted >= selected.len();
            if last_in_sequence {
                self.advance_sequence();
            }
            let last = last_in_sequence && selection.groups().all(|(s, _)| s <= sequence);

            return Ok(Some(self.emit(sequence, offset, data, None, last_in_sequence, last)));
        }
    }
}

impl Iterator for ChunkIterator<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprinter;
    use crate::in_memory::InMemorySource;
    use proptest::prelude::*;
    use test_case::test_case;

    /// Row `r` of sequence `s` holds `[s * 1000 + r, -(s * 1000 + r)]`
    fn counting_source(lengths: &[usize]) -> InMemorySource {
        let blocks = lengths
            .iter()
            .enumerate()
            .map(|(s, &len)| {
                let data = (0..len)
                    .flat_map(|r| {
                        let v = (s * 1000 + r) as f64;
                        [v, -v]
                    })
                    .collect();
                Block::from_vec(data, 2).unwrap()
            })
            .collect();
        InMemorySource::new(blocks).unwrap()
    }

    fn row_id(row: &[f64]) -> usize {
        row[0] as usize % 1000
    }

    fn expected_rows(length: usize, skip: usize, step: usize) -> Vec<usize> {
        (skip..length).step_by(step).collect()
    }

    #[test_case(0 ; "whole sequences")]
    #[test_case(1 ; "single rows")]
    #[test_case(7 ; "uneven")]
    #[test_case(16 ; "sixteen")]
    #[test_case(1000 ; "larger than data")]
    fn test_chunks_reproduce_data(chunk_size: usize) {
        let source = counting_source(&[100, 3, 0, 20]);
        let output = source.iter_chunks().chunk_size(chunk_size).build().unwrap().collect_sequences().unwrap();
        assert_eq!(output, source.sequences());
    }

    #[test]
    fn test_chunks_never_span_sequences() {
        let source = counting_source(&[10, 10, 10]);
        let mut it = source.iter_chunks().chunk_size(4).build().unwrap();
        let mut sizes = Vec::new();
        while let Some(chunk) = it.next_chunk().unwrap() {
            sizes.push((chunk.sequence.unwrap(), chunk.rows()));
        }
        assert_eq!(
            sizes,
            vec![(0, 4), (0, 4), (0, 2), (1, 4), (1, 4), (1, 2), (2, 4), (2, 4), (2, 2)]
        );
    }

    #[test]
    fn test_current_sequence_and_pos() {
        let source = counting_source(&[100, 100, 100]);
        let mut it = source.iter_chunks().chunk_size(17).build().unwrap();
        let mut expected_sequence = None;
        let mut t = 0;
        while let Some(chunk) = it.next_chunk().unwrap() {
            if it.pos() == 0 {
                expected_sequence = Some(expected_sequence.map_or(0, |s| s + 1));
            }
            assert_eq!(chunk.sequence, expected_sequence);
            assert_eq!(it.current_sequence(), expected_sequence.unwrap());
            assert_eq!(it.pos(), t);
            assert_eq!(chunk.offset, t);
            t += chunk.rows();
            if it.is_last_chunk_in_sequence() {
                t = 0;
            }
        }
        assert_eq!(expected_sequence, Some(2));
    }

    #[test]
    fn test_chunk_size_changes_apply_to_next_chunk() {
        let source = counting_source(&[100, 100, 100]);
        let sizes: Vec<usize> = (1..17).collect();
        let mut i = 0;
        let mut it = source.iter_chunks().chunk_size(sizes[i]).build().unwrap();
        let mut seen = 0;
        while let Some(chunk) = it.next_chunk().unwrap() {
            if it.is_last_chunk_in_sequence() {
                assert!(chunk.rows() <= it.chunk_size());
            } else {
                assert_eq!(chunk.rows(), it.chunk_size());
            }
            seen += chunk.rows();
            i = (i + 1) % sizes.len();
            it.set_chunk_size(sizes[i]);
            assert_eq!(it.chunk_size(), sizes[i]);
        }
        assert_eq!(seen, 300);
    }

    #[test]
    fn test_stride_changes_apply_from_current_position() {
        let source = counting_source(&[40]);
        let mut it = source.iter_chunks().chunk_size(2).stride(1).build().unwrap();
        let first = it.next_chunk().unwrap().unwrap();
        assert_eq!(first.data.iter_rows().map(row_id).collect::<Vec<_>>(), vec![0, 1]);

        it.set_stride(5).unwrap();
        assert_eq!(it.stride(), &Stride::Uniform(5));
        let second = it.next_chunk().unwrap().unwrap();
        assert_eq!(second.data.iter_rows().map(row_id).collect::<Vec<_>>(), vec![2, 7]);

        assert!(it.set_stride(0).is_err());
    }

    #[test]
    fn test_last_chunk_flags() {
        let source = counting_source(&[5, 6, 7]);
        let mut it = source.iter_chunks().chunk_size(0).build().unwrap();
        let mut n = 0;
        while let Some(chunk) = it.next_chunk().unwrap() {
            assert!(it.is_last_chunk_in_sequence());
            assert_eq!(it.is_last_chunk(), chunk.sequence == Some(2));
            n += 1;
        }
        assert_eq!(n, 3);
    }

    #[test]
    fn test_last_chunk_ignores_trailing_empty_sequences() {
        let source = counting_source(&[5, 2, 0]);
        let mut it = source.iter_chunks().chunk_size(0).skip(3).build().unwrap();
        let chunk = it.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.rows(), 2);
        assert!(it.is_last_chunk());
        assert!(it.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_return_sequence_index_toggle() {
        let source = counting_source(&[3, 3]);
        let mut it = source.iter_chunks().chunk_size(0).build().unwrap();
        assert!(it.return_sequence_index());
        assert!(it.next_chunk().unwrap().unwrap().sequence.is_some());

        it.reset();
        it.set_return_sequence_index(false);
        assert!(!it.return_sequence_index());
        let chunks: Vec<Chunk> = it.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.sequence.is_none()));
        assert_eq!(&chunks[1].data, &source.sequences()[1]);
    }

    #[test]
    fn test_skip_change_applies_to_next_sequence() {
        let source = counting_source(&[10, 10, 10]);
        let mut it = source.iter_chunks().chunk_size(4).build().unwrap();
        let mut first_rows = Vec::new();
        while let Some(chunk) = it.next_chunk().unwrap() {
            if chunk.offset == 0 {
                first_rows.push(row_id(chunk.data.row(0)));
            }
            if chunk.sequence == Some(0) {
                it.set_skip(5);
            }
            if chunk.sequence == Some(1) {
                assert_eq!(ChunkIterator::skip(&it), 5);
            }
        }
        assert_eq!(first_rows, vec![0, 5, 5]);
    }

    #[test]
    fn test_lagged_chunks_are_offset_by_lag() {
        let source = counting_source(&[30, 12]);
        let lag = 5;
        let mut it = source.iter_chunks().chunk_size(4).stride(2).lag(lag).build().unwrap();
        while let Some(chunk) = it.next_chunk().unwrap() {
            let lagged = chunk.lagged.as_ref().unwrap();
            assert!(lagged.rows() <= chunk.rows());
            for (x, y) in chunk.data.iter_rows().zip(lagged.iter_rows()) {
                assert_eq!(row_id(y), row_id(x) + lag);
            }
        }
    }

    #[test]
    fn test_lagged_chunk_shorter_or_empty_near_end() {
        let source = counting_source(&[10]);
        let mut it = source.iter_chunks().chunk_size(4).lag(7).build().unwrap();
        let lengths: Vec<(usize, usize)> = std::iter::from_fn(|| it.next_chunk().unwrap())
            .map(|c| (c.rows(), c.lagged.unwrap().rows()))
            .collect();
        assert_eq!(lengths, vec![(4, 3), (4, 0), (2, 0)]);
    }

    #[test]
    fn test_lag_with_whole_sequences() {
        let source = counting_source(&[10, 4]);
        let mut it = source.iter_chunks().chunk_size(0).lag(6).build().unwrap();
        let first = it.next_chunk().unwrap().unwrap();
        assert_eq!(first.lagged.unwrap().iter_rows().map(row_id).collect::<Vec<_>>(), vec![6, 7, 8, 9]);
        let second = it.next_chunk().unwrap().unwrap();
        assert!(second.lagged.unwrap().is_empty());
    }

    #[test_case(0 ; "whole selection")]
    #[test_case(1 ; "one entry per chunk")]
    #[test_case(10 ; "larger than any group")]
    fn test_explicit_stride(chunk_size: usize) {
        let source = counting_source(&[100, 20, 20]);
        let selection = vec![(0, 1), (0, 3), (0, 3), (0, 5), (0, 6), (0, 7), (2, 1), (2, 1)];
        let output = source
            .iter_chunks()
            .chunk_size(chunk_size)
            .selection(selection)
            .build()
            .unwrap()
            .collect_sequences()
            .unwrap();
        assert_eq!(output[0].iter_rows().map(row_id).collect::<Vec<_>>(), vec![1, 3, 3, 5, 6, 7]);
        assert!(output[1].is_empty());
        assert_eq!(output[2].iter_rows().map(row_id).collect::<Vec<_>>(), vec![1, 1]);
    }

    #[test]
    fn test_explicit_stride_terminates_with_list() {
        let source = counting_source(&[100, 20, 20]);
        let mut it = source.iter_chunks().chunk_size(10).selection(vec![(2, 0)]).build().unwrap();
        let chunk = it.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.sequence, Some(2));
        assert_eq!(chunk.data.row(0), source.sequences()[2].row(0));
        assert!(it.is_last_chunk());
        assert!(it.next_chunk().unwrap().is_none());
    }

    /// A source that refuses to be read
    struct Unreadable(Vec<usize>);

    impl SequenceSource for Unreadable {
        fn lengths(&self) -> &[usize] {
            &self.0
        }

        fn dimension(&self) -> usize {
            1
        }

        fn open_reader(&self) -> Result<Box<dyn SequenceReader + '_>> {
            Err(Error::Io(std::io::Error::other("no I/O expected")))
        }

        fn describe(&self, fp: &mut Fingerprinter) {
            fp.section("unreadable");
        }

        fn needs_sorted_random_access(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_unsorted_selection_fails_before_io() {
        let source = Unreadable(vec![5, 5]);
        let across = source
            .iter_chunks()
            .selection(vec![(1, 1), (1, 2), (1, 3), (0, 0), (0, 1), (0, 2)])
            .build();
        assert!(matches!(across, Err(Error::RandomAccessOrder(_))));

        let within = source
            .iter_chunks()
            .selection(vec![(0, 0), (0, 1), (0, 2), (1, 1), (1, 4), (1, 3)])
            .build();
        assert!(matches!(within, Err(Error::RandomAccessOrder(_))));

        // sorted selections get past validation and only then hit the reader
        let sorted = source.iter_chunks().selection(vec![(0, 0), (1, 1)]).build();
        assert!(matches!(sorted, Err(Error::Io(_))));
    }

    #[test]
    fn test_unsorted_selection_allowed_unless_required() {
        let source = counting_source(&[5, 5]);
        let selection = vec![(1, 3), (0, 2), (1, 1)];
        let output = source.iter_chunks().selection(selection.clone()).build().unwrap().collect_sequences().unwrap();
        assert_eq!(output[1].iter_rows().map(row_id).collect::<Vec<_>>(), vec![3, 1]);

        let required = source.iter_chunks().selection(selection).require_sorted(true).build();
        assert!(matches!(required, Err(Error::RandomAccessOrder(_))));
    }

    #[test]
    fn test_selection_rejects_lag_and_out_of_range() {
        let source = counting_source(&[5]);
        assert!(source.iter_chunks().selection(vec![(0, 1)]).lag(1).build().is_err());
        assert!(matches!(
            source.iter_chunks().selection(vec![(0, 5)]).build(),
            Err(Error::OutOfRange { sequence: 0, index: 5, length: 5 })
        ));
    }

    #[test]
    fn test_reset_and_independent_iterators() {
        let source = counting_source(&[6, 6]);
        let mut a = source.iter_chunks().chunk_size(4).build().unwrap();
        let mut b = source.iter_chunks().chunk_size(4).build().unwrap();

        let first = a.next_chunk().unwrap().unwrap();
        a.next_chunk().unwrap();
        a.next_chunk().unwrap();
        assert_eq!(b.next_chunk().unwrap().unwrap(), first);

        a.reset();
        assert_eq!(a.next_chunk().unwrap().unwrap(), first);
        assert_eq!(a.current_sequence(), 0);
        assert_eq!(b.next_chunk().unwrap().unwrap().offset, 4);
    }

    #[test]
    fn test_switch_to_selection_starts_with_next_sequence() {
        let source = counting_source(&[10, 10, 10]);
        let mut it = source.iter_chunks().chunk_size(4).build().unwrap();
        let first = it.next_chunk().unwrap().unwrap();
        assert_eq!(first.data.iter_rows().map(row_id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        it.set_selection(vec![(1, 2), (1, 7), (2, 0)]);
        assert!(!it.stride().is_uniform());
        let rest: Vec<(usize, Vec<usize>)> = it
            .by_ref()
            .map(|c| {
                let c = c.unwrap();
                (c.sequence.unwrap(), c.data.iter_rows().map(row_id).collect())
            })
            .collect();
        assert_eq!(rest, vec![(1, vec![2, 7]), (2, vec![0])]);
        assert!(it.is_last_chunk());
    }

    #[test]
    fn test_switch_back_to_uniform_stride() {
        let source = counting_source(&[6, 6]);
        let mut it = source.iter_chunks().chunk_size(0).selection(vec![(0, 5), (1, 1)]).build().unwrap();
        assert_eq!(row_id(it.next_chunk().unwrap().unwrap().data.row(0)), 5);
        it.set_stride(2).unwrap();
        let second = it.next_chunk().unwrap().unwrap();
        assert_eq!(second.sequence, Some(1));
        assert_eq!(second.data.iter_rows().map(row_id).collect::<Vec<_>>(), vec![0, 2, 4]);
    }

    #[test]
    fn test_invalid_staged_selection_stays_staged() {
        let source = counting_source(&[5, 5]);
        let mut it = source.iter_chunks().chunk_size(2).require_sorted(true).build().unwrap();
        let first = it.next_chunk().unwrap().unwrap();

        it.set_selection(vec![(1, 3), (1, 9)]);
        assert!(matches!(it.next_chunk(), Err(Error::OutOfRange { sequence: 1, index: 9, .. })));
        assert!(it.next_chunk().is_err());
        assert!(!it.stride().is_uniform());
        assert_eq!(it.pos(), first.offset);

        it.set_selection(vec![(1, 4), (1, 3)]);
        assert!(matches!(it.next_chunk(), Err(Error::RandomAccessOrder(_))));

        it.set_selection(vec![(1, 3), (1, 4)]);
        let chunk = it.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.data.iter_rows().map(row_id).collect::<Vec<_>>(), vec![3, 4]);
    }

    /// In-memory source whose readers count their releases
    struct Tracked {
        inner: InMemorySource,
        releases: std::rc::Rc<std::cell::Cell<usize>>,
    }

    struct TrackedReader<'a> {
        inner: Box<dyn SequenceReader + 'a>,
        releases: std::rc::Rc<std::cell::Cell<usize>>,
    }

    impl SequenceReader for TrackedReader<'_> {
        fn read_strided(&mut self, sequence: usize, start: usize, end: usize, stride: usize) -> Result<Block> {
            self.inner.read_strided(sequence, start, end, stride)
        }

        fn release(&mut self) {
            self.releases.set(self.releases.get() + 1);
            self.inner.release();
        }
    }

    impl SequenceSource for Tracked {
        fn lengths(&self) -> &[usize] {
            self.inner.lengths()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn open_reader(&self) -> Result<Box<dyn SequenceReader + '_>> {
            Ok(Box::new(TrackedReader {
                inner: self.inner.open_reader()?,
                releases: std::rc::Rc::clone(&self.releases),
            }))
        }

        fn describe(&self, fp: &mut Fingerprinter) {
            self.inner.describe(fp);
        }
    }

    #[test]
    fn test_reset_releases_readers_and_rewinds() {
        let source = Tracked {
            inner: counting_source(&[12, 4]),
            releases: std::rc::Rc::default(),
        };
        let mut it = source.iter_chunks().chunk_size(5).lag(3).build().unwrap();
        let first = it.next_chunk().unwrap().unwrap();
        it.next_chunk().unwrap();
        assert_eq!(source.releases.get(), 0);

        it.reset();
        assert_eq!(source.releases.get(), 2);
        assert_eq!(it.next_chunk().unwrap().unwrap(), first);
        assert_eq!(it.pos(), 0);
    }

    fn lengths_strategy() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(0usize..60, 1..5)
    }

    proptest! {
        #[test]
        fn prop_chunks_reproduce_strided_data(
            lengths in lengths_strategy(),
            chunk_size in 0usize..25,
            step in 1usize..5,
            skip in 0usize..10,
        ) {
            let source = counting_source(&lengths);
            let output = source
                .iter_chunks()
                .chunk_size(chunk_size)
                .stride(step)
                .skip(skip)
                .build()
                .unwrap()
                .collect_sequences()
                .unwrap();
            for (s, &length) in lengths.iter().enumerate() {
                let rows: Vec<usize> = output[s].iter_rows().map(row_id).collect();
                prop_assert_eq!(rows, expected_rows(length, skip, step));
            }
        }

        #[test]
        fn prop_lagged_never_longer_and_offset(
            lengths in lengths_strategy(),
            chunk_size in 0usize..25,
            step in 1usize..5,
            lag in 1usize..30,
        ) {
            let source = counting_source(&lengths);
            let mut it = source
                .iter_chunks()
                .chunk_size(chunk_size)
                .stride(step)
                .lag(lag)
                .build()
                .unwrap();
            while let Some(chunk) = it.next_chunk().unwrap() {
                let lagged = chunk.lagged.unwrap();
                prop_assert!(lagged.rows() <= chunk.data.rows());
                let length = lengths[chunk.sequence.unwrap()];
                for (i, x) in chunk.data.iter_rows().enumerate() {
                    let target = row_id(x) + lag;
                    if target < length {
                        prop_assert_eq!(row_id(lagged.row(i)), target);
                    } else {
                        prop_assert!(i >= lagged.rows());
                    }
                }
            }
        }
    }
}
