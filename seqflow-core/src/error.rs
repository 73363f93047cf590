//! Error types for sequence iteration, random access and caching

use std::io;
use thiserror::Error;

/// Result type for seqflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for seqflow operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error while opening or reading a backing file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration of a source, pipeline or registry
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sequences of one set disagree on their dimension
    #[error("Dimension mismatch in sequence {sequence}: expected {expected} columns, found {found}")]
    DimensionMismatch {
        /// Offending sequence
        sequence: usize,
        /// Dimension of the first sequence
        expected: usize,
        /// Dimension of the offending sequence
        found: usize,
    },

    /// The memory budget cannot hold a single row of the pipeline
    #[error("Insufficient memory for this pipeline: requires {required} bytes, {available} bytes available")]
    InsufficientMemory {
        /// Bytes needed for constant costs plus one row
        required: u64,
        /// Bytes available after the safety reserve
        available: u64,
    },

    /// No reader is registered for a file extension
    #[error("Extension {0:?} is not registered")]
    UnregisteredFormat(String),

    /// A reader type or extension was registered twice
    #[error("Format {0} may be registered only once")]
    DuplicateFormat(String),

    /// An explicit stride violates the ordering the source requires
    #[error("Random access order violated: {0}")]
    RandomAccessOrder(String),

    /// Row index outside a sequence
    #[error("Index {index} out of range for sequence {sequence} of length {length}")]
    OutOfRange {
        /// Sequence the index was applied to
        sequence: usize,
        /// Offending row index
        index: usize,
        /// Length of that sequence
        length: usize,
    },

    /// Sequence index outside the set
    #[error("Sequence {sequence} out of range, source has {count} sequences")]
    SequenceOutOfRange {
        /// Offending sequence index
        sequence: usize,
        /// Number of sequences in the source
        count: usize,
    },

    /// Column index outside the dimension
    #[error("Column {column} out of range for dimension {dimension}")]
    ColumnOutOfRange {
        /// Offending column index
        column: usize,
        /// Dimension of the data
        dimension: usize,
    },

    /// Malformed file content
    #[error("Format error: {0}")]
    Format(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON configuration error
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error belongs to the configuration class (never retried)
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::DimensionMismatch { .. }
                | Error::InsufficientMemory { .. }
                | Error::UnregisteredFormat(_)
                | Error::DuplicateFormat(_)
        )
    }

    /// Whether this error is a range violation
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            Error::OutOfRange { .. } | Error::SequenceOutOfRange { .. } | Error::ColumnOutOfRange { .. }
        )
    }
}
