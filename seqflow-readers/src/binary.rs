//! Memory-mapped binary matrix files (`.sfb`)
//!
//! Layout, all little endian:
//!
//! | offset | size          | content                   |
//! |--------|---------------|---------------------------|
//! | 0      | 8             | magic `SEQFLOW1`          |
//! | 8      | 8             | row count, u64            |
//! | 16     | 8             | dimension, u64            |
//! | 24     | rows * dim * 8| row-major f64 values      |

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use tracing::debug;

use seqflow_core::{Block, Error, Fingerprinter, Result, SequenceReader, SequenceSource};

use crate::common::{common_dimension, open_each, ReaderOptions};

/// File magic
pub const MAGIC: &[u8; 8] = b"SEQFLOW1";

/// Bytes before the first value
pub const HEADER_LEN: usize = 24;

const VALUE_LEN: usize = std::mem::size_of::<f64>();

/// Rows and dimension stored in a file header
pub fn read_header(path: &Path) -> Result<(usize, usize)> {
    let mut file = File::open(path)?;
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|_| Error::Format(format!("{}: truncated header", path.display())))?;
    if &header[..8] != MAGIC {
        return Err(Error::Format(format!("{}: not a seqflow binary file", path.display())));
    }

    let word = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&header[at..at + 8]);
        u64::from_le_bytes(bytes)
    };
    let to_usize = |v: u64| {
        usize::try_from(v).map_err(|_| Error::Format(format!("{}: header value {} too large", path.display(), v)))
    };
    let rows = to_usize(word(8))?;
    let dim = to_usize(word(16))?;

    let expected = rows
        .checked_mul(dim)
        .and_then(|n| n.checked_mul(VALUE_LEN))
        .and_then(|n| n.checked_add(HEADER_LEN))
        .ok_or_else(|| Error::Format(format!("{}: header overflows", path.display())))?;
    let actual = file.metadata()?.len();
    if actual != expected as u64 {
        return Err(Error::Format(format!(
            "{}: expected {} bytes for {} x {} values, found {}",
            path.display(),
            expected,
            rows,
            dim,
            actual
        )));
    }
    Ok((rows, dim))
}

/// Binary files read as sequences
#[derive(Debug, Clone)]
pub struct BinarySource {
    paths: Vec<PathBuf>,
    lengths: Vec<usize>,
    dim: usize,
}

impl BinarySource {
    /// Read the headers of `paths` and create a source over them
    pub fn open(paths: &[PathBuf], options: &ReaderOptions) -> Result<Self> {
        let headers = open_each(paths, options, read_header)?;
        let dims: Vec<Option<usize>> = headers
            .iter()
            .map(|(_, (rows, dim))| (*rows > 0).then_some(*dim))
            .collect();
        // without any rows the headers are the only record of the dimension
        let dim = if dims.iter().any(Option::is_some) {
            common_dimension(&dims)?
        } else {
            headers.first().map_or(0, |(_, (_, dim))| *dim)
        };

        let (paths, lengths) = headers.into_iter().map(|(path, (rows, _))| (path, rows)).unzip();
        Ok(Self { paths, lengths, dim })
    }

    /// Files backing the sequences
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl SequenceSource for BinarySource {
    fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn open_reader(&self) -> Result<Box<dyn SequenceReader + '_>> {
        Ok(Box::new(BinaryReader {
            source: self,
            current: None,
        }))
    }

    fn describe(&self, fp: &mut Fingerprinter) {
        fp.section("binary");
        for path in &self.paths {
            fp.file(path);
        }
    }
}

/// Reader that owns a shared handle to its source
pub fn shared_reader(source: Arc<BinarySource>) -> Box<dyn SequenceReader> {
    Box::new(BinaryReader {
        source,
        current: None,
    })
}

/// Reader holding at most one mapped file
struct BinaryReader<S> {
    source: S,
    current: Option<(usize, Mmap)>,
}

impl<S: Deref<Target = BinarySource>> BinaryReader<S> {
    fn mapped(&mut self, sequence: usize) -> Result<&Mmap> {
        let count = self.source.sequence_count();
        if sequence >= count {
            return Err(Error::SequenceOutOfRange { sequence, count });
        }
        if !matches!(&self.current, Some((s, _)) if *s == sequence) {
            self.release();
            let path = &self.source.paths[sequence];
            debug!(path = %path.display(), sequence, "mapping binary file");
            let file = File::open(path)?;
            #[allow(unsafe_code)]
            // the mapping is read-only and dropped before the file is reopened
            let mmap = unsafe { MmapOptions::new().map(&file)? };
            let needed = HEADER_LEN + self.source.sequence_len(sequence) * self.source.dim * VALUE_LEN;
            if mmap.len() < needed || mmap[..8] != MAGIC[..] {
                return Err(Error::Format(format!(
                    "{}: file changed since it was opened, {} bytes where {} are needed",
                    path.display(),
                    mmap.len(),
                    needed
                )));
            }
            self.current = Some((sequence, mmap));
        }
        match &self.current {
            Some((_, mmap)) => Ok(mmap),
            None => Err(Error::InvalidArgument("No mapped file".into())),
        }
    }
}

fn push_row(block: &mut Block, mmap: &[u8], row: usize, dim: usize) -> Result<()> {
    let start = HEADER_LEN + row * dim * VALUE_LEN;
    let values: Vec<f64> = mmap[start..start + dim * VALUE_LEN]
        .chunks_exact(VALUE_LEN)
        .map(|bytes| {
            let mut raw = [0u8; VALUE_LEN];
            raw.copy_from_slice(bytes);
            f64::from_le_bytes(raw)
        })
        .collect();
    block.push_row(&values)
}

impl<S: Deref<Target = BinarySource>> SequenceReader for BinaryReader<S> {
    fn read_strided(&mut self, sequence: usize, start: usize, end: usize, stride: usize) -> Result<Block> {
        let dim = self.source.dim;
        let end = end.min(self.source.sequence_len(sequence));
        let stride = stride.max(1);
        let mmap = self.mapped(sequence)?;

        let mut block = Block::with_capacity(end.saturating_sub(start).div_ceil(stride), dim);
        for row in (start..end).step_by(stride) {
            push_row(&mut block, mmap, row, dim)?;
        }
        Ok(block)
    }

    fn read_indices(&mut self, sequence: usize, indices: &[usize]) -> Result<Block> {
        let dim = self.source.dim;
        let length = self.source.sequence_len(sequence);
        if let Some(&index) = indices.iter().find(|&&i| i >= length) {
            return Err(Error::OutOfRange {
                sequence,
                index,
                length,
            });
        }
        let mmap = self.mapped(sequence)?;

        let mut block = Block::with_capacity(indices.len(), dim);
        for &row in indices {
            push_row(&mut block, mmap, row, dim)?;
        }
        Ok(block)
    }

    fn release(&mut self) {
        if let Some((sequence, _)) = self.current.take() {
            debug!(sequence, "unmapping binary file");
        }
    }
}

/// Streams rows into a binary file, fixing the row count on [`BinaryWriter::finish`]
pub struct BinaryWriter {
    path: PathBuf,
    out: BufWriter<File>,
    dim: usize,
    rows: u64,
}

impl BinaryWriter {
    /// Create or truncate `path`
    pub fn create(path: impl AsRef<Path>, dim: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(MAGIC)?;
        out.write_all(&0u64.to_le_bytes())?;
        out.write_all(&(dim as u64).to_le_bytes())?;
        Ok(Self { path, out, dim, rows: 0 })
    }

    /// Append one row
    pub fn write_row(&mut self, row: &[f64]) -> Result<()> {
        if row.len() != self.dim {
            return Err(Error::DimensionMismatch {
                sequence: 0,
                expected: self.dim,
                found: row.len(),
            });
        }
        for value in row {
            self.out.write_all(&value.to_le_bytes())?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Append every row of a block
    pub fn write_block(&mut self, block: &Block) -> Result<()> {
        for row in block.iter_rows() {
            self.write_row(row)?;
        }
        Ok(())
    }

    /// Write the row count, flush and sync
    pub fn finish(self) -> Result<PathBuf> {
        let Self { path, out, rows, .. } = self;
        let mut file = out.into_inner().map_err(|err| Error::Io(err.into_error()))?;
        file.seek(SeekFrom::Start(8))?;
        file.write_all(&rows.to_le_bytes())?;
        file.sync_all()?;
        Ok(path)
    }
}

/// Write one block as a complete binary file
pub fn write_block_file(path: impl AsRef<Path>, block: &Block) -> Result<PathBuf> {
    let mut writer = BinaryWriter::create(path, block.dim())?;
    writer.write_block(block)?;
    writer.finish()
}
