//! Row-major blocks of numeric rows
//!
//! A [`Block`] is the unit every reader, iterator and cache in seqflow exchanges:
//! a contiguous run of rows that all share one dimension.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A dense row-major matrix of `f64` values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Row-major values, `rows * dim` long
    data: Vec<f64>,

    /// Number of rows
    rows: usize,

    /// Number of columns per row
    dim: usize,
}

impl Block {
    /// Create a block with no rows
    pub fn empty(dim: usize) -> Self {
        Self {
            data: Vec::new(),
            rows: 0,
            dim,
        }
    }

    /// Create an empty block with room for `rows` rows
    pub fn with_capacity(rows: usize, dim: usize) -> Self {
        Self {
            data: Vec::with_capacity(rows * dim),
            rows: 0,
            dim,
        }
    }

    /// Create a zero-filled block
    pub fn zeros(rows: usize, dim: usize) -> Self {
        Self {
            data: vec![0.0; rows * dim],
            rows,
            dim,
        }
    }

    /// Create a block from row-major values
    pub fn from_vec(data: Vec<f64>, dim: usize) -> Result<Self> {
        if dim == 0 {
            if !data.is_empty() {
                return Err(Error::InvalidArgument(
                    "Values given for a zero-dimensional block".into(),
                ));
            }
            return Ok(Self::empty(0));
        }

        if data.len() % dim != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} values do not form rows of dimension {}",
                data.len(),
                dim
            )));
        }

        Ok(Self {
            rows: data.len() / dim,
            data,
            dim,
        })
    }

    /// Create a block from a list of rows, which must all have the same length
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self> {
        let dim = rows.first().map_or(0, |r| r.as_ref().len());
        let mut block = Self::with_capacity(rows.len(), dim);
        for row in rows {
            block.push_row(row.as_ref())?;
        }
        Ok(block)
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Whether the block has no rows
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Row-major values
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Consume the block and return its row-major values
    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Borrow one row
    ///
    /// Panics if `index` is not below [`Block::rows`].
    pub fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }

    /// Iterate over rows
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> + '_ {
        (0..self.rows).map(move |i| self.row(i))
    }

    /// Size of the values in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
    }

    /// Append one row
    pub fn push_row(&mut self, row: &[f64]) -> Result<()> {
        if row.len() != self.dim {
            return Err(Error::DimensionMismatch {
                sequence: 0,
                expected: self.dim,
                found: row.len(),
            });
        }
        self.data.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    /// Append all rows of another block
    pub fn append(&mut self, other: &Block) -> Result<()> {
        if other.dim != self.dim {
            return Err(Error::DimensionMismatch {
                sequence: 0,
                expected: self.dim,
                found: other.dim,
            });
        }
        self.data.extend_from_slice(&other.data);
        self.rows += other.rows;
        Ok(())
    }

    /// Copy a contiguous range of rows
    pub fn slice_rows(&self, range: Range<usize>) -> Block {
        let end = range.end.min(self.rows);
        let start = range.start.min(end);
        Block {
            data: self.data[start * self.dim..end * self.dim].to_vec(),
            rows: end - start,
            dim: self.dim,
        }
    }

    /// Copy rows `start, start + step, ...` below `end`
    pub fn strided(&self, start: usize, end: usize, step: usize) -> Block {
        let end = end.min(self.rows);
        let step = step.max(1);
        let mut out = Block::with_capacity(end.saturating_sub(start).div_ceil(step), self.dim);
        for index in (start..end).step_by(step) {
            out.data.extend_from_slice(self.row(index));
            out.rows += 1;
        }
        out
    }

    /// Copy the given rows in the given order
    ///
    /// Panics if an index is not below [`Block::rows`]; callers validate first.
    pub fn take_rows(&self, indices: &[usize]) -> Block {
        let mut out = Block::with_capacity(indices.len(), self.dim);
        for &index in indices {
            out.data.extend_from_slice(self.row(index));
            out.rows += 1;
        }
        out
    }

    /// Keep only the given columns, in the given order
    pub fn select_columns(&self, columns: &[usize]) -> Result<Block> {
        if let Some(&column) = columns.iter().find(|&&c| c >= self.dim) {
            return Err(Error::ColumnOutOfRange {
                column,
                dimension: self.dim,
            });
        }

        let mut data = Vec::with_capacity(self.rows * columns.len());
        for row in self.iter_rows() {
            data.extend(columns.iter().map(|&c| row[c]));
        }

        Ok(Block {
            data,
            rows: self.rows,
            dim: columns.len(),
        })
    }

    /// Stack blocks vertically
    pub fn concat(dim: usize, blocks: &[Block]) -> Result<Block> {
        let rows = blocks.iter().map(Block::rows).sum();
        let mut out = Block::with_capacity(rows, dim);
        for block in blocks {
            out.append(block)?;
        }
        Ok(out)
    }
}
