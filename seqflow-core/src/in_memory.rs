//! Sequence source backed by blocks held in memory

use crate::block::Block;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprinter;
use crate::source::{check_sequence, SequenceReader, SequenceSource};

/// A set of sequences already resident in memory
#[derive(Debug, Clone)]
pub struct InMemorySource {
    /// One block per sequence
    sequences: Vec<Block>,

    /// Cached lengths of the sequences
    lengths: Vec<usize>,

    /// Shared dimension
    dim: usize,
}

impl InMemorySource {
    /// Create a source from one block per sequence
    ///
    /// All blocks must have the same dimension.
    pub fn new(sequences: Vec<Block>) -> Result<Self> {
        let dim = sequences.first().map_or(0, Block::dim);
        if let Some((sequence, block)) = sequences.iter().enumerate().find(|(_, b)| b.dim() != dim) {
            return Err(Error::DimensionMismatch {
                sequence,
                expected: dim,
                found: block.dim(),
            });
        }

        let lengths = sequences.iter().map(Block::rows).collect();
        Ok(Self {
            sequences,
            lengths,
            dim,
        })
    }

    /// Create a source from nested rows, one `Vec` of rows per sequence
    pub fn from_rows(sequences: &[Vec<Vec<f64>>]) -> Result<Self> {
        let blocks = sequences
            .iter()
            .map(|rows| Block::from_rows(rows))
            .collect::<Result<Vec<_>>>()?;
        Self::new(blocks)
    }

    /// The blocks of all sequences
    pub fn sequences(&self) -> &[Block] {
        &self.sequences
    }

    /// Consume the source and return its blocks
    pub fn into_sequences(self) -> Vec<Block> {
        self.sequences
    }
}

impl SequenceSource for InMemorySource {
    fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn open_reader(&self) -> Result<Box<dyn SequenceReader + '_>> {
        Ok(Box::new(InMemoryReader { source: self }))
    }

    fn describe(&self, fp: &mut Fingerprinter) {
        fp.section("in-memory")
            .usize("dimension", self.dim)
            .usizes("lengths", &self.lengths);
        for block in &self.sequences {
            fp.f64s("values", block.as_slice());
        }
    }
}

/// Reader over an [`InMemorySource`]
struct InMemoryReader<'a> {
    source: &'a InMemorySource,
}

impl SequenceReader for InMemoryReader<'_> {
    fn read_strided(&mut self, sequence: usize, start: usize, end: usize, stride: usize) -> Result<Block> {
        check_sequence(self.source, sequence)?;
        Ok(self.source.sequences[sequence].strided(start, end, stride))
    }

    fn read_indices(&mut self, sequence: usize, indices: &[usize]) -> Result<Block> {
        check_sequence(self.source, sequence)?;
        let block = &self.source.sequences[sequence];
        if let Some(&index) = indices.iter().find(|&&i| i >= block.rows()) {
            return Err(Error::OutOfRange {
                sequence,
                index,
                length: block.rows(),
            });
        }
        Ok(block.take_rows(indices))
    }
}
