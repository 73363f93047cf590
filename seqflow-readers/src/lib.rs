//! File-backed sequence sources
//!
//! Every file is one sequence. Text files are parsed with the `csv` crate,
//! binary files are memory mapped. A [`FormatRegistry`] picks the format from
//! the common extension of a list of files.

#![warn(missing_docs)]

pub mod binary;
pub mod common;
pub mod registry;
pub mod text;

pub use binary::{shared_reader, write_block_file, BinarySource, BinaryWriter};
pub use common::ReaderOptions;
pub use registry::{BinaryFormat, FormatRegistry, SourceFormat, TextFormat};
pub use text::TextSource;
