//! Row-wise pipeline stages

use crate::block::Block;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprinter;

/// A row-wise transformation applied to every chunk of a sequence
///
/// Stages see chunks, never whole sequences, so `map` must treat each row
/// independently: splitting a sequence into different chunks must not change
/// the result.
pub trait Stage {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Output dimension for a given input dimension
    fn output_dimension(&self, input_dimension: usize) -> Result<usize>;

    /// Transform one chunk
    fn map(&self, chunk: &Block) -> Result<Block>;

    /// Memory the stage needs regardless of the chunk size
    fn constant_bytes(&self) -> u64 {
        0
    }

    /// Memory needed per output row
    fn bytes_per_row(&self, input_dimension: usize) -> Result<u64> {
        Ok((self.output_dimension(input_dimension)? * std::mem::size_of::<f64>()) as u64)
    }

    /// Feed the stage configuration into a fingerprint
    fn describe(&self, fp: &mut Fingerprinter);
}

/// Keeps a subset of columns, in the given order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSelection {
    columns: Vec<usize>,
}

impl ColumnSelection {
    /// Select `columns` from every row
    pub fn new(columns: Vec<usize>) -> Self {
        Self { columns }
    }

    /// The selected columns
    pub fn columns(&self) -> &[usize] {
        &self.columns
    }
}

impl Stage for ColumnSelection {
    fn name(&self) -> &str {
        "column-selection"
    }

    fn output_dimension(&self, input_dimension: usize) -> Result<usize> {
        if let Some(&column) = self.columns.iter().find(|&&c| c >= input_dimension) {
            return Err(Error::ColumnOutOfRange {
                column,
                dimension: input_dimension,
            });
        }
        Ok(self.columns.len())
    }

    fn map(&self, chunk: &Block) -> Result<Block> {
        chunk.select_columns(&self.columns)
    }

    fn describe(&self, fp: &mut Fingerprinter) {
        fp.section(self.name()).usizes("columns", &self.columns);
    }
}

/// Affine projection `(x - mean) * W` with `W` of shape input x output
#[derive(Debug, Clone, PartialEq)]
pub struct LinearProjection {
    /// Row-major weights, one row per input column
    weights: Block,

    /// Subtracted from every row before projecting
    mean: Vec<f64>,
}

impl LinearProjection {
    /// Projection through `weights` (input rows x output columns) without centering
    pub fn new(weights: Block) -> Self {
        let mean = vec![0.0; weights.rows()];
        Self { weights, mean }
    }

    /// Projection that subtracts `mean` first
    pub fn centered(weights: Block, mean: Vec<f64>) -> Result<Self> {
        if mean.len() != weights.rows() {
            return Err(Error::InvalidArgument(format!(
                "Mean has {} entries but weights expect {} input columns",
                mean.len(),
                weights.rows()
            )));
        }
        Ok(Self { weights, mean })
    }
}

impl Stage for LinearProjection {
    fn name(&self) -> &str {
        "linear-projection"
    }

    fn output_dimension(&self, input_dimension: usize) -> Result<usize> {
        if input_dimension != self.weights.rows() {
            return Err(Error::DimensionMismatch {
                sequence: 0,
                expected: self.weights.rows(),
                found: input_dimension,
            });
        }
        Ok(self.weights.dim())
    }

    fn map(&self, chunk: &Block) -> Result<Block> {
        let out_dim = self.output_dimension(chunk.dim())?;
        let mut out = Block::with_capacity(chunk.rows(), out_dim);
        let mut projected = vec![0.0; out_dim];
        for row in chunk.iter_rows() {
            projected.fill(0.0);
            for (i, (&x, &m)) in row.iter().zip(&self.mean).enumerate() {
                let centered = x - m;
                for (p, &w) in projected.iter_mut().zip(self.weights.row(i)) {
                    *p += centered * w;
                }
            }
            out.push_row(&projected)?;
        }
        Ok(out)
    }

    fn constant_bytes(&self) -> u64 {
        (self.weights.size_bytes() + self.mean.len() * std::mem::size_of::<f64>()) as u64
    }

    fn describe(&self, fp: &mut Fingerprinter) {
        fp.section(self.name())
            .usize("inputs", self.weights.rows())
            .usize("outputs", self.weights.dim())
            .f64s("weights", self.weights.as_slice())
            .f64s("mean", &self.mean);
    }
}
