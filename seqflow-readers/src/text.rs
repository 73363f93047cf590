//! Delimited numeric text files, one sequence per file
//!
//! Every non-empty, non-comment line is a row of numbers. Fields are separated
//! by whitespace or by a configured delimiter. Files are scanned once when the
//! source is opened to learn their lengths and dimensions; reading streams
//! forward through the file and reopens it when asked to go backwards, so
//! explicit selections over text files must be sorted.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::debug;

use seqflow_core::{Block, Error, Fingerprinter, Result, SequenceReader, SequenceSource};

use crate::common::{common_dimension, open_each, ReaderOptions};

/// Text files read as sequences
#[derive(Debug, Clone)]
pub struct TextSource {
    paths: Vec<PathBuf>,
    lengths: Vec<usize>,
    dim: usize,
    options: ReaderOptions,
}

impl TextSource {
    /// Scan `paths` and create a source over them
    pub fn open(paths: &[PathBuf], options: &ReaderOptions) -> Result<Self> {
        let scanned = open_each(paths, options, |path| scan(path, options))?;
        let dims: Vec<Option<usize>> = scanned.iter().map(|(_, (_, dim))| *dim).collect();
        let dim = common_dimension(&dims)?;

        let (paths, lengths) = scanned.into_iter().map(|(path, (rows, _))| (path, rows)).unzip();
        Ok(Self {
            paths,
            lengths,
            dim,
            options: options.clone(),
        })
    }

    /// Files backing the sequences, after dropping unreadable ones
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl SequenceSource for TextSource {
    fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn open_reader(&self) -> Result<Box<dyn SequenceReader + '_>> {
        Ok(Box::new(TextReader {
            source: self,
            current: None,
        }))
    }

    fn describe(&self, fp: &mut Fingerprinter) {
        fp.section("text")
            .usize("delimiter", self.options.delimiter.map_or(0, usize::from))
            .usize("comment", self.options.comment.map_or(0, usize::from));
        for path in &self.paths {
            fp.file(path);
        }
    }

    fn needs_sorted_random_access(&self) -> bool {
        true
    }
}

/// Forward-only cursor over one text file
struct RowStream {
    path: PathBuf,
    reader: csv::Reader<File>,
    record: StringRecord,
    line: usize,
}

impl RowStream {
    fn open(path: &Path, options: &ReaderOptions) -> Result<Self> {
        let file = File::open(path)?;
        let reader = ReaderBuilder::new()
            .delimiter(options.delimiter.unwrap_or(b' '))
            .comment(options.comment)
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(file);
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            record: StringRecord::new(),
            line: 0,
        })
    }

    /// Next data row, skipping lines without values
    fn next_values(&mut self) -> Result<Option<Vec<f64>>> {
        loop {
            let more = self
                .reader
                .read_record(&mut self.record)
                .map_err(|err| Error::Format(format!("{}: {}", self.path.display(), err)))?;
            if !more {
                return Ok(None);
            }
            self.line = self.record.position().map_or(self.line + 1, |p| p.line() as usize);

            let mut values = Vec::with_capacity(self.record.len());
            for field in self.record.iter().flat_map(str::split_whitespace) {
                let value = field.parse::<f64>().map_err(|_| {
                    Error::Format(format!(
                        "{}: could not parse {:?} on line {}",
                        self.path.display(),
                        field,
                        self.line
                    ))
                })?;
                values.push(value);
            }
            if !values.is_empty() {
                return Ok(Some(values));
            }
        }
    }
}

/// Count rows and check that every row has the same width
fn scan(path: &Path, options: &ReaderOptions) -> Result<(usize, Option<usize>)> {
    let mut stream = RowStream::open(path, options)?;
    let mut rows = 0;
    let mut dim = None;
    while let Some(values) = stream.next_values()? {
        match dim {
            None => dim = Some(values.len()),
            Some(expected) if expected != values.len() => {
                return Err(Error::Format(format!(
                    "{}: line {} has {} columns, expected {}",
                    path.display(),
                    stream.line,
                    values.len(),
                    expected
                )));
            }
            Some(_) => {}
        }
        rows += 1;
    }
    debug!(path = %path.display(), rows, ?dim, "scanned text file");
    Ok((rows, dim))
}

/// Reader holding at most one open file
struct TextReader<'a> {
    source: &'a TextSource,
    current: Option<(usize, usize, RowStream)>,
}

impl TextReader<'_> {
    /// Stream positioned at or before `row` of `sequence`
    fn stream_at(&mut self, sequence: usize, row: usize) -> Result<&mut (usize, usize, RowStream)> {
        let reusable = matches!(&self.current, Some((s, next, _)) if *s == sequence && *next <= row);
        if !reusable {
            self.release();
            let path = &self.source.paths[sequence];
            debug!(path = %path.display(), sequence, "opening text file");
            let stream = RowStream::open(path, &self.source.options)?;
            return Ok(self.current.insert((sequence, 0, stream)));
        }
        match self.current.as_mut() {
            Some(current) => Ok(current),
            None => Err(Error::InvalidArgument("No open file".into())),
        }
    }
}

impl SequenceReader for TextReader<'_> {
    fn read_strided(&mut self, sequence: usize, start: usize, end: usize, stride: usize) -> Result<Block> {
        let length = self.source.sequence_len(sequence);
        if sequence >= self.source.sequence_count() {
            return Err(Error::SequenceOutOfRange {
                sequence,
                count: self.source.sequence_count(),
            });
        }
        let end = end.min(length);
        let stride = stride.max(1);
        let dim = self.source.dim;
        if start >= end {
            return Ok(Block::empty(dim));
        }

        let mut block = Block::with_capacity((end - start).div_ceil(stride), dim);
        let (_, next, stream) = self.stream_at(sequence, start)?;
        while *next < end {
            let row = *next;
            let values = stream.next_values()?.ok_or_else(|| {
                Error::Format(format!("{}: ended before row {}", stream.path.display(), row))
            })?;
            *next += 1;
            if row >= start && (row - start) % stride == 0 {
                block.push_row(&values)?;
            }
        }
        Ok(block)
    }

    fn release(&mut self) {
        if let Some((sequence, _, stream)) = self.current.take() {
            debug!(path = %stream.path.display(), sequence, "closing text file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn setup_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn rows(n: usize, dim: usize, offset: usize) -> String {
        (0..n)
            .map(|r| {
                (0..dim)
                    .map(|c| format!("{}", offset + r * 10 + c))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_lengths_and_dimension() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.dat", &format!("# header\n{}\n\n", rows(7, 3, 0)));
        let b = write(&dir, "b.dat", &rows(4, 3, 1000));
        let source = TextSource::open(&[a, b], &ReaderOptions::default()).unwrap();
        assert_eq!(source.lengths(), &[7, 4]);
        assert_eq!(source.dimension(), 3);
        assert!(source.needs_sorted_random_access());
    }

    #[test]
    fn test_whitespace_and_tabs() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "t.txt", "1.0\t2.0   3.0\n  4 5\t 6  \n");
        let source = TextSource::open(&[path], &ReaderOptions::default()).unwrap();
        let out = source.iter_chunks().build().unwrap().collect_sequences().unwrap();
        assert_eq!(out[0].as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_comma_separated() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "c.csv", "1, 2\n3 ,4\n");
        let source = TextSource::open(&[path], &ReaderOptions::comma_separated()).unwrap();
        let out = source.iter_chunks().build().unwrap().collect_sequences().unwrap();
        assert_eq!(out[0].as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_could_not_parse() {
        setup_logging();
        let dir = TempDir::new().unwrap();
        let good = write(&dir, "good.dat", &rows(3, 2, 0));
        let bad = write(&dir, "bad.dat", "1 2\nfoo bar\n");
        let err = TextSource::open(&[good.clone(), bad.clone()], &ReaderOptions::default()).unwrap_err();
        assert!(err.to_string().contains("could not parse"));

        let options = ReaderOptions {
            drop_unreadable: true,
            ..ReaderOptions::default()
        };
        let source = TextSource::open(&[good.clone(), bad], &options).unwrap();
        assert_eq!(source.paths(), &[good]);
    }

    #[test]
    fn test_dimension_mismatch_between_files() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.dat", &rows(3, 2, 0));
        let b = write(&dir, "b.dat", &rows(3, 3, 0));
        let err = TextSource::open(&[a, b], &ReaderOptions::default()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { sequence: 1, .. }));
    }

    #[test]
    fn test_strided_lagged_reading_matches_content() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.dat", &rows(25, 2, 0));
        let b = write(&dir, "b.dat", &rows(9, 2, 1000));
        let source = TextSource::open(&[a, b], &ReaderOptions::default()).unwrap();

        let mut it = source.iter_chunks().chunk_size(4).stride(3).lag(2).build().unwrap();
        while let Some(chunk) = it.next_chunk().unwrap() {
            let lagged = chunk.lagged.unwrap();
            for (x, y) in chunk.data.iter_rows().zip(lagged.iter_rows()) {
                assert_eq!(y[0], x[0] + 20.0);
            }
        }

        let out = source.iter_chunks().chunk_size(4).stride(3).build().unwrap().collect_sequences().unwrap();
        let firsts: Vec<f64> = out[1].iter_rows().map(|r| r[0]).collect();
        assert_eq!(firsts, vec![1000.0, 1030.0, 1060.0]);
    }

    #[test]
    fn test_reader_reopens_to_go_backwards() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.dat", &rows(10, 1, 0));
        let source = TextSource::open(&[a], &ReaderOptions::default()).unwrap();
        let mut reader = source.open_reader().unwrap();
        assert_eq!(reader.read_strided(0, 6, 8, 1).unwrap().as_slice(), &[60.0, 70.0]);
        assert_eq!(reader.read_strided(0, 1, 3, 1).unwrap().as_slice(), &[10.0, 20.0]);
        assert_eq!(reader.read_indices(0, &[9, 0, 9]).unwrap().as_slice(), &[90.0, 0.0, 90.0]);
    }

    #[test]
    fn test_iterator_reset_reopens_file_from_first_row() {
        setup_logging();
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.dat", &rows(9, 1, 0));
        let source = TextSource::open(&[a.clone()], &ReaderOptions::default()).unwrap();
        let mut it = source.iter_chunks().chunk_size(3).build().unwrap();
        it.next_chunk().unwrap();
        assert_eq!(it.next_chunk().unwrap().unwrap().data.as_slice(), &[30.0, 40.0, 50.0]);

        fs::write(&a, rows(9, 1, 5)).unwrap();
        it.reset();
        let chunk = it.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.offset, 0);
        assert_eq!(chunk.data.as_slice(), &[5.0, 15.0, 25.0]);
    }

    #[test]
    fn test_unsorted_selection_rejected() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.dat", &rows(10, 1, 0));
        let source = TextSource::open(&[a], &ReaderOptions::default()).unwrap();
        let result = source.iter_chunks().selection(vec![(0, 5), (0, 2)]).build();
        assert!(matches!(result, Err(Error::RandomAccessOrder(_))));
    }

    #[test]
    fn test_fingerprint_tracks_file_set() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.dat", &rows(3, 1, 0));
        let b = write(&dir, "b.dat", &rows(3, 1, 0));
        let options = ReaderOptions::default();
        let one = TextSource::open(&[a.clone()], &options).unwrap();
        let two = TextSource::open(&[a.clone(), b], &options).unwrap();
        assert_ne!(one.fingerprint(), two.fingerprint());
        assert_eq!(one.fingerprint(), TextSource::open(&[a], &options).unwrap().fingerprint());
    }
}
