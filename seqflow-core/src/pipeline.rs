//! A source followed by row-wise stages
//!
//! A [`Pipeline`] is itself a [`SequenceSource`]: readers pull rows from the
//! source and push them through every stage. Memory planning runs in two
//! phases. [`Pipeline::plan`] sizes the pipeline against a budget without
//! touching data, and [`Pipeline::apply_plan`] fixes the chunk size and
//! materializes the chosen stage outputs. Readers opened afterwards resume from
//! the last materialized output.

use tracing::{debug, info};

use crate::block::Block;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprinter;
use crate::in_memory::InMemorySource;
use crate::iterator::{ChunkIteratorBuilder, DEFAULT_CHUNK_SIZE};
use crate::memory::MemoryBudget;
use crate::planner::{self, MemoryPlan, StageCost};
use crate::source::{SequenceReader, SequenceSource};
use crate::stage::Stage;

/// Source plus an ordered list of stages
pub struct Pipeline<S> {
    /// Where rows come from
    source: S,

    /// Applied in order
    stages: Vec<Box<dyn Stage>>,

    /// Dimension after each prefix of stages, `stages.len() + 1` entries
    dims: Vec<usize>,

    /// In-memory outputs per level, level 0 being the source itself
    materialized: Vec<Option<InMemorySource>>,

    /// Chunk size fixed by the last applied plan
    chunk_size: usize,
}

impl<S: SequenceSource> Pipeline<S> {
    /// Pipeline without stages
    pub fn new(source: S) -> Self {
        let dims = vec![source.dimension()];
        Self {
            source,
            stages: Vec::new(),
            dims,
            materialized: vec![None],
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// The upstream source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The stages, in order
    pub fn stages(&self) -> &[Box<dyn Stage>] {
        &self.stages
    }

    /// Chunk size fixed by the last applied plan
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunk iterator builder using the planned chunk size
    pub fn chunks(&self) -> ChunkIteratorBuilder<'_> {
        ChunkIteratorBuilder::new(self).chunk_size(self.chunk_size)
    }

    /// Append a stage, checking it accepts the current output dimension
    pub fn push_stage(&mut self, stage: impl Stage + 'static) -> Result<()> {
        self.push_boxed(Box::new(stage))
    }

    /// Append a boxed stage
    pub fn push_boxed(&mut self, stage: Box<dyn Stage>) -> Result<()> {
        let input = self.dimension();
        let output = stage.output_dimension(input)?;
        debug!(stage = stage.name(), input, output, "adding stage");
        self.stages.push(stage);
        self.dims.push(output);
        self.clear_materialized();
        Ok(())
    }

    /// Remove the last stage
    pub fn pop_stage(&mut self) -> Option<Box<dyn Stage>> {
        let stage = self.stages.pop()?;
        self.dims.pop();
        self.clear_materialized();
        Some(stage)
    }

    fn clear_materialized(&mut self) {
        self.materialized.clear();
        self.materialized.resize_with(self.stages.len() + 1, || None);
    }

    /// Levels currently held in memory; level 0 is the source output
    pub fn materialized_levels(&self) -> Vec<usize> {
        self.materialized
            .iter()
            .enumerate()
            .filter_map(|(level, m)| m.as_ref().map(|_| level))
            .collect()
    }

    /// Declared costs of the source (first entry) and of every stage
    pub fn stage_costs(&self) -> Result<Vec<StageCost>> {
        let total_rows = self.source.total_rows() as u64;
        let mut costs = Vec::with_capacity(self.stages.len() + 1);
        costs.push(StageCost {
            name: "source".into(),
            constant_bytes: 0,
            bytes_per_row: self.source.bytes_per_row(),
            total_rows,
        });
        for (stage, &input) in self.stages.iter().zip(&self.dims) {
            costs.push(StageCost {
                name: stage.name().to_string(),
                constant_bytes: stage.constant_bytes(),
                bytes_per_row: stage.bytes_per_row(input)?,
                total_rows,
            });
        }
        Ok(costs)
    }

    /// Sizing phase: shared chunk size and materialization choices
    pub fn plan(&self, budget: &MemoryBudget) -> Result<MemoryPlan> {
        planner::plan(&self.stage_costs()?, self.source.longest_sequence(), budget)
    }

    /// Materialization phase: adopt the chunk size and load the chosen outputs
    pub fn apply_plan(&mut self, plan: &MemoryPlan) -> Result<()> {
        let levels = self.stages.len() + 1;
        if plan.materialize.len() != levels {
            return Err(Error::InvalidArgument(format!(
                "Plan covers {} stages but the pipeline has {}",
                plan.materialize.len(),
                levels
            )));
        }

        self.clear_materialized();
        self.chunk_size = plan.chunk_size;
        for level in (0..levels).filter(|&l| plan.materialize[l]) {
            let output = self.collect_level(level)?;
            info!(
                level,
                rows = output.total_rows(),
                dimension = output.dimension(),
                "materialized stage output"
            );
            self.materialized[level] = Some(output);
        }
        Ok(())
    }

    /// Plan against `budget` and apply the result
    pub fn fit(&mut self, budget: &MemoryBudget) -> Result<MemoryPlan> {
        let plan = self.plan(budget)?;
        self.apply_plan(&plan)?;
        Ok(plan)
    }

    fn level_reader(&self, level: usize) -> Result<PipelineReader<'_>> {
        let base = self.materialized[..=level].iter().rposition(Option::is_some);
        let (inner, first_stage) = match base {
            Some(base) => match &self.materialized[base] {
                Some(memory) => (memory.open_reader()?, base),
                None => (self.source.open_reader()?, 0),
            },
            None => (self.source.open_reader()?, 0),
        };
        Ok(PipelineReader {
            inner,
            stages: &self.stages[first_stage..level],
        })
    }

    fn collect_level(&self, level: usize) -> Result<InMemorySource> {
        let mut reader = self.level_reader(level)?;
        let dim = self.dims[level];
        let mut sequences = Vec::with_capacity(self.source.sequence_count());
        for (sequence, &length) in self.source.lengths().iter().enumerate() {
            let step = if self.chunk_size == 0 { length.max(1) } else { self.chunk_size };
            let mut block = Block::with_capacity(length, dim);
            for start in (0..length).step_by(step) {
                let end = (start + step).min(length);
                block.append(&reader.read_strided(sequence, start, end, 1)?)?;
            }
            sequences.push(block);
        }
        InMemorySource::new(sequences)
    }
}

impl<S: SequenceSource> SequenceSource for Pipeline<S> {
    fn lengths(&self) -> &[usize] {
        self.source.lengths()
    }

    fn dimension(&self) -> usize {
        self.dims[self.dims.len() - 1]
    }

    fn open_reader(&self) -> Result<Box<dyn SequenceReader + '_>> {
        Ok(Box::new(self.level_reader(self.stages.len())?))
    }

    fn describe(&self, fp: &mut Fingerprinter) {
        self.source.describe(fp);
        fp.section("pipeline").usize("stages", self.stages.len());
        for stage in &self.stages {
            stage.describe(fp);
        }
    }

    fn needs_sorted_random_access(&self) -> bool {
        self.materialized.iter().all(Option::is_none) && self.source.needs_sorted_random_access()
    }
}

/// Reads from a base level and applies the remaining stages
struct PipelineReader<'a> {
    inner: Box<dyn SequenceReader + 'a>,
    stages: &'a [Box<dyn Stage>],
}

impl PipelineReader<'_> {
    fn apply(&self, mut block: Block) -> Result<Block> {
        for stage in self.stages {
            block = stage.map(&block)?;
        }
        Ok(block)
    }
}

impl SequenceReader for PipelineReader<'_> {
    fn read_strided(&mut self, sequence: usize, start: usize, end: usize, stride: usize) -> Result<Block> {
        let block = self.inner.read_strided(sequence, start, end, stride)?;
        self.apply(block)
    }

    fn read_indices(&mut self, sequence: usize, indices: &[usize]) -> Result<Block> {
        let block = self.inner.read_indices(sequence, indices)?;
        self.apply(block)
    }

    fn release(&mut self) {
        self.inner.release();
    }
}
