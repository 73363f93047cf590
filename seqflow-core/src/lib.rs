//! Core abstractions for iterating large multi-sequence datasets
//!
//! This crate defines sequence sources, the chunk iterator with its stride,
//! skip and lag handling, random-access views, the memory planner for
//! pipelines of row-wise stages, and the fingerprints that caches are keyed by.

#![warn(missing_docs)]

pub mod block;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod in_memory;
pub mod iterator;
pub mod memory;
pub mod pipeline;
pub mod planner;
pub mod random_access;
pub mod source;
pub mod stage;
pub mod stride;

// Re-export key types for convenience
pub use block::Block;
pub use config::SeqflowConfig;
pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use in_memory::InMemorySource;
pub use iterator::{Chunk, ChunkIterator, ChunkIteratorBuilder, IteratorState};
pub use memory::MemoryBudget;
pub use pipeline::Pipeline;
pub use planner::{MemoryPlan, StageCost};
pub use random_access::{Axis, RandomAccess};
pub use source::{SequenceReader, SequenceSource};
pub use stage::{ColumnSelection, LinearProjection, Stage};
pub use stride::{RandomAccessStride, Stride};
