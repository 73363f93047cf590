//! Memory budget planner
//!
//! Planning is the first of two phases: [`plan`] only decides on a shared
//! chunk size and on which stage outputs fit in memory entirely. Applying the
//! decision is left to the owner of the stages, see
//! [`Pipeline::apply_plan`](crate::pipeline::Pipeline::apply_plan).

use tracing::info;

use crate::error::{Error, Result};
use crate::memory::MemoryBudget;

/// Declared memory cost of one pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCost {
    /// Stage name, for logs
    pub name: String,

    /// Bytes needed regardless of the chunk size
    pub constant_bytes: u64,

    /// Bytes needed per row in flight
    pub bytes_per_row: u64,

    /// Rows the stage produces over all sequences
    pub total_rows: u64,
}

impl StageCost {
    /// Bytes needed to hold the full output of the stage
    pub fn full_output_bytes(&self) -> u64 {
        self.total_rows.saturating_mul(self.bytes_per_row)
    }
}

/// Result of the sizing phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPlan {
    /// Shared chunk size for every stage
    pub chunk_size: usize,

    /// Per stage, whether its full output is kept in memory
    pub materialize: Vec<bool>,

    /// Budget left after streaming and materialization
    pub free_bytes: u64,
}

impl MemoryPlan {
    /// Index of the last stage marked for materialization
    pub fn last_materialized(&self) -> Option<usize> {
        self.materialize.iter().rposition(|&m| m)
    }
}

/// Size a linear pipeline of stages against a budget
///
/// The constant costs are taken off the available budget and the rest is
/// divided by the summed per-row costs, capped at the longest sequence. Then,
/// walking from the last stage backwards, every stage whose full output still
/// fits the remaining budget is marked for materialization.
pub fn plan(stages: &[StageCost], longest_sequence: usize, budget: &MemoryBudget) -> Result<MemoryPlan> {
    let available = budget.available();
    let constant = stages.iter().fold(0u64, |acc, s| acc.saturating_add(s.constant_bytes));
    let per_row = stages.iter().fold(0u64, |acc, s| acc.saturating_add(s.bytes_per_row));

    let insufficient = || Error::InsufficientMemory {
        required: constant.saturating_add(per_row.max(1)),
        available,
    };
    if available <= constant {
        return Err(insufficient());
    }
    let remaining = available - constant;

    let cap = longest_sequence.max(1);
    let chunk_size = if per_row == 0 {
        cap
    } else {
        let candidate = remaining / per_row;
        if candidate == 0 {
            return Err(insufficient());
        }
        usize::try_from(candidate).map_or(cap, |c| c.min(cap))
    };

    let mut free = remaining - (chunk_size as u64).saturating_mul(per_row);
    let mut materialize = vec![false; stages.len()];
    for (index, stage) in stages.iter().enumerate().rev() {
        let needed = stage.full_output_bytes();
        if needed <= free {
            free -= needed;
            materialize[index] = true;
        }
    }

    info!(
        available,
        constant,
        per_row,
        chunk_size,
        materialized = ?stages
            .iter()
            .zip(&materialize)
            .filter(|(_, m)| **m)
            .map(|(s, _)| s.name.as_str())
            .collect::<Vec<_>>(),
        "planned pipeline memory"
    );

    Ok(MemoryPlan {
        chunk_size,
        materialize,
        free_bytes: free,
    })
}
