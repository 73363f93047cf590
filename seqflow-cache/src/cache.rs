//! Fingerprinted disk cache around a sequence source
//!
//! The cache fingerprints its upstream before every lookup. A storage unit
//! built for that exact fingerprint serves all reads; otherwise the upstream
//! is driven once and its output persisted. Because the fingerprint is
//! recomputed from the live upstream configuration, a change upstream always
//! lands on a different storage unit, and reverting the change lands on the
//! previous one again.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::{debug, info, warn};

use seqflow_core::{
    Axis, Block, Fingerprint, Fingerprinter, IteratorState, Result, SeqflowConfig, SequenceReader, SequenceSource,
};
use seqflow_readers::{shared_reader, BinarySource, BinaryWriter, ReaderOptions};

use crate::manifest::{temp_path, Manifest};

/// Disk-backed memo of an upstream source's output
///
/// The cache is a [`SequenceSource`] producing exactly what its upstream
/// produces, so it can be iterated, strided, lagged or wrapped further.
pub struct Cache<S> {
    upstream: S,
    config: SeqflowConfig,
    hits: Cell<u64>,
    misses: Cell<u64>,
    /// Units already resolved in this session
    known: RefCell<HashMap<Fingerprint, Arc<BinarySource>>>,
    /// Pass shared by the readers currently open on each unit
    passes: RefCell<HashMap<Fingerprint, Weak<Pass>>>,
}

/// Sequences served so far during one pass over a unit
///
/// Readers open at the same time on the same unit belong to one pass, so a
/// lagged iteration counts every sequence once.
type Pass = RefCell<Vec<bool>>;

struct Resolved {
    fingerprint: Fingerprint,
    unit: Arc<BinarySource>,
    /// Built from the upstream by this lookup
    populated: bool,
}

impl<S: SequenceSource> Cache<S> {
    /// Wrap `upstream`, storing units under `config.cache_dir`
    pub fn new(upstream: S, config: SeqflowConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir)?;
        Ok(Self {
            upstream,
            config,
            hits: Cell::new(0),
            misses: Cell::new(0),
            known: RefCell::new(HashMap::new()),
            passes: RefCell::new(HashMap::new()),
        })
    }

    /// The wrapped source
    pub fn upstream(&self) -> &S {
        &self.upstream
    }

    /// Mutable access to the wrapped source; later lookups see the changes
    pub fn upstream_mut(&mut self) -> &mut S {
        &mut self.upstream
    }

    /// Consume the cache and return the wrapped source
    pub fn into_upstream(self) -> S {
        self.upstream
    }

    /// Settings of this cache
    pub fn config(&self) -> &SeqflowConfig {
        &self.config
    }

    /// Sequences served from existing storage so far
    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    /// Sequences computed from the upstream so far
    pub fn misses(&self) -> u64 {
        self.misses.get()
    }

    /// Name of the storage unit for the current upstream configuration
    pub fn current_storage_name(&self) -> String {
        self.storage_name(&self.upstream.fingerprint())
    }

    /// Directory of the storage unit for the current upstream configuration
    pub fn storage_path(&self) -> PathBuf {
        self.config.cache_dir.join(self.current_storage_name())
    }

    fn storage_name(&self, fingerprint: &Fingerprint) -> String {
        format!("{}{}", self.config.cache_prefix, fingerprint.to_hex())
    }

    /// The complete upstream output, one block per sequence
    pub fn get_output(&self) -> Result<Vec<Block>> {
        let state = IteratorState {
            chunk_size: self.config.default_chunk_size,
            ..IteratorState::default()
        };
        self.get_output_with(&state, Axis::All)
    }

    /// Upstream output iterated with `state`, restricted to `columns`
    ///
    /// The whole unit is computed on a miss regardless of the selection, so
    /// later lookups with other settings are hits.
    pub fn get_output_with(&self, state: &IteratorState, columns: impl Into<Axis>) -> Result<Vec<Block>> {
        let columns = columns.into().resolve_columns(self.upstream.dimension())?;
        let resolved = self.resolve()?;
        if !resolved.populated {
            self.record_hits(resolved.unit.sequence_count() as u64);
        }

        let output = resolved
            .unit
            .iter_chunks()
            .state(state.clone())
            .build()?
            .collect_sequences()?;
        match columns {
            Some(columns) => output.iter().map(|block| block.select_columns(&columns)).collect(),
            None => Ok(output),
        }
    }

    fn record_hits(&self, n: u64) {
        self.hits.set(self.hits.get() + n);
    }

    /// Storage unit for the current fingerprint
    fn resolve(&self) -> Result<Resolved> {
        let fingerprint = self.upstream.fingerprint();
        if let Some(unit) = self.known.borrow().get(&fingerprint) {
            debug!(name = %self.storage_name(&fingerprint), "cache unit known in session");
            return Ok(Resolved {
                fingerprint,
                unit: Arc::clone(unit),
                populated: false,
            });
        }

        let dir = self.config.cache_dir.join(self.storage_name(&fingerprint));
        let (unit, populated) = match self.load(&fingerprint, &dir) {
            Some(unit) => (unit, false),
            None => (self.populate(&fingerprint, &dir)?, true),
        };
        let unit = Arc::new(unit);
        self.known.borrow_mut().insert(fingerprint, Arc::clone(&unit));
        Ok(Resolved {
            fingerprint,
            unit,
            populated,
        })
    }

    /// Pass of the readers already open on this unit, or a new one
    fn join_pass(&self, resolved: &Resolved) -> Rc<Pass> {
        let mut passes = self.passes.borrow_mut();
        if let Some(pass) = passes.get(&resolved.fingerprint).and_then(Weak::upgrade) {
            return pass;
        }
        let pass = Rc::new(RefCell::new(vec![resolved.populated; resolved.unit.sequence_count()]));
        passes.insert(resolved.fingerprint, Rc::downgrade(&pass));
        pass
    }

    /// Open an existing unit if it is complete and matches the upstream
    fn load(&self, fingerprint: &Fingerprint, dir: &Path) -> Option<BinarySource> {
        let manifest = match Manifest::load(dir) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return None,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "ignoring unreadable cache manifest");
                return None;
            }
        };
        if !manifest.matches(fingerprint, self.upstream.dimension(), self.upstream.lengths()) {
            warn!(dir = %dir.display(), "cache manifest does not match upstream, rebuilding");
            return None;
        }

        match BinarySource::open(&manifest.paths(dir), &ReaderOptions::default()) {
            Ok(unit) if unit.lengths() == manifest.lengths.as_slice() && unit.dimension() == manifest.dimension => {
                debug!(dir = %dir.display(), "reusing cache unit");
                Some(unit)
            }
            Ok(_) => {
                warn!(dir = %dir.display(), "cache files disagree with manifest, rebuilding");
                None
            }
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "cache files unreadable, rebuilding");
                None
            }
        }
    }

    /// Drive the upstream once and persist every sequence
    ///
    /// A failed run removes the unit directory, leaving no partial files.
    fn populate(&self, fingerprint: &Fingerprint, dir: &Path) -> Result<BinarySource> {
        let count = self.upstream.sequence_count();
        let manifest = Manifest::new(*fingerprint, self.upstream.dimension(), self.upstream.lengths().to_vec());
        info!(dir = %dir.display(), sequences = count, "cache miss, computing upstream output");

        if let Err(err) = self.write_unit(&manifest, dir) {
            warn!(dir = %dir.display(), error = %err, "discarding partial cache unit");
            match fs::remove_dir_all(dir) {
                Err(cleanup) if cleanup.kind() != io::ErrorKind::NotFound => {
                    warn!(dir = %dir.display(), error = %cleanup, "failed to remove partial cache unit");
                }
                _ => {}
            }
            return Err(err);
        }

        self.misses.set(self.misses.get() + count as u64);
        BinarySource::open(&manifest.paths(dir), &ReaderOptions::default())
    }

    fn write_unit(&self, manifest: &Manifest, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let paths = manifest.paths(dir);
        let mut writer = SequenceWriter::new(dir, &paths, manifest.dimension);
        let mut chunks = self
            .upstream
            .iter_chunks()
            .chunk_size(self.config.default_chunk_size)
            .build()?;
        while let Some(chunk) = chunks.next_chunk()? {
            writer.write(chunks.current_sequence(), &chunk.data)?;
        }
        writer.finish()?;
        manifest.store(dir)
    }
}

/// Writes sequences in order, one open file at a time
struct SequenceWriter<'a> {
    dir: &'a Path,
    paths: &'a [PathBuf],
    dim: usize,
    /// Sequences below this index are complete
    next: usize,
    current: Option<(usize, PathBuf, BinaryWriter)>,
}

impl<'a> SequenceWriter<'a> {
    fn new(dir: &'a Path, paths: &'a [PathBuf], dim: usize) -> Self {
        Self {
            dir,
            paths,
            dim,
            next: 0,
            current: None,
        }
    }

    fn write(&mut self, sequence: usize, block: &Block) -> Result<()> {
        if !matches!(&self.current, Some((s, _, _)) if *s == sequence) {
            self.complete_until(sequence)?;
            let tmp = temp_path(self.dir);
            let writer = BinaryWriter::create(&tmp, self.dim)?;
            self.current = Some((sequence, tmp, writer));
        }
        match self.current.as_mut() {
            Some((_, _, writer)) => writer.write_block(block),
            None => Ok(()),
        }
    }

    /// Close the open file and write empty files for skipped sequences below `end`
    fn complete_until(&mut self, end: usize) -> Result<()> {
        if let Some((sequence, tmp, writer)) = self.current.take() {
            writer.finish()?;
            fs::rename(&tmp, &self.paths[sequence])?;
            self.next = sequence + 1;
        }
        while self.next < end {
            let tmp = temp_path(self.dir);
            BinaryWriter::create(&tmp, self.dim)?.finish()?;
            fs::rename(&tmp, &self.paths[self.next])?;
            self.next += 1;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.complete_until(self.paths.len())
    }
}

impl<S: SequenceSource> SequenceSource for Cache<S> {
    fn lengths(&self) -> &[usize] {
        self.upstream.lengths()
    }

    fn dimension(&self) -> usize {
        self.upstream.dimension()
    }

    /// Resolves the storage unit, computing it on a miss, and reads from it
    fn open_reader(&self) -> Result<Box<dyn SequenceReader + '_>> {
        let resolved = self.resolve()?;
        let pass = self.join_pass(&resolved);
        Ok(Box::new(CacheReader {
            inner: shared_reader(resolved.unit),
            pass,
            hits: &self.hits,
        }))
    }

    fn describe(&self, fp: &mut Fingerprinter) {
        self.upstream.describe(fp);
    }
}

/// Reads a storage unit, counting a hit per sequence on first touch in its pass
struct CacheReader<'a> {
    inner: Box<dyn SequenceReader>,
    pass: Rc<Pass>,
    hits: &'a Cell<u64>,
}

impl CacheReader<'_> {
    fn touch(&mut self, sequence: usize) {
        let mut served = self.pass.borrow_mut();
        if let Some(served) = served.get_mut(sequence) {
            if !*served {
                *served = true;
                self.hits.set(self.hits.get() + 1);
            }
        }
    }
}

impl SequenceReader for CacheReader<'_> {
    fn read_strided(&mut self, sequence: usize, start: usize, end: usize, stride: usize) -> Result<Block> {
        let block = self.inner.read_strided(sequence, start, end, stride)?;
        self.touch(sequence);
        Ok(block)
    }

    fn read_indices(&mut self, sequence: usize, indices: &[usize]) -> Result<Block> {
        let block = self.inner.read_indices(sequence, indices)?;
        self.touch(sequence);
        Ok(block)
    }

    fn release(&mut self) {
        self.inner.release();
    }
}
