//! Explicit registry resolving file lists to sources by extension

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use seqflow_core::{Error, Result, SequenceSource};

use crate::binary::BinarySource;
use crate::common::ReaderOptions;
use crate::text::TextSource;

/// A file format that can open a list of files as one source
pub trait SourceFormat: 'static {
    /// Name used in errors and logs
    fn name(&self) -> &str;

    /// Lowercase file extensions handled by this format, without the dot
    fn extensions(&self) -> &[&'static str];

    /// Open `paths` as one source, one sequence per file
    fn open(&self, paths: &[PathBuf], options: &ReaderOptions) -> Result<Box<dyn SequenceSource>>;
}

/// Delimited numeric text
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFormat;

impl SourceFormat for TextFormat {
    fn name(&self) -> &str {
        "text"
    }

    fn extensions(&self) -> &[&'static str] {
        &["dat", "txt", "csv"]
    }

    fn open(&self, paths: &[PathBuf], options: &ReaderOptions) -> Result<Box<dyn SequenceSource>> {
        let mut options = options.clone();
        if options.delimiter.is_none() && paths.iter().all(|p| extension(p).as_deref() == Some("csv")) {
            options.delimiter = Some(b',');
        }
        Ok(Box::new(TextSource::open(paths, &options)?))
    }
}

/// Memory-mapped binary matrices
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryFormat;

impl SourceFormat for BinaryFormat {
    fn name(&self) -> &str {
        "binary"
    }

    fn extensions(&self) -> &[&'static str] {
        &["sfb"]
    }

    fn open(&self, paths: &[PathBuf], options: &ReaderOptions) -> Result<Box<dyn SequenceSource>> {
        Ok(Box::new(BinarySource::open(paths, options)?))
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

/// Formats known to one part of an application
///
/// Every format type may be registered once, and every extension belongs to
/// a single format.
pub struct FormatRegistry {
    formats: Vec<Box<dyn SourceFormat>>,
    types: HashSet<TypeId>,
    by_extension: HashMap<String, usize>,
    options: ReaderOptions,
}

impl FormatRegistry {
    /// Empty registry
    pub fn new(options: ReaderOptions) -> Self {
        Self {
            formats: Vec::new(),
            types: HashSet::new(),
            by_extension: HashMap::new(),
            options,
        }
    }

    /// Registry with the text and binary formats
    pub fn with_defaults(options: ReaderOptions) -> Result<Self> {
        let mut registry = Self::new(options);
        registry.register::<TextFormat>()?;
        registry.register::<BinaryFormat>()?;
        Ok(registry)
    }

    /// Register a format by type
    pub fn register<F: SourceFormat + Default>(&mut self) -> Result<()> {
        self.register_format(F::default())
    }

    /// Register a format instance
    pub fn register_format<F: SourceFormat>(&mut self, format: F) -> Result<()> {
        if !self.types.insert(TypeId::of::<F>()) {
            return Err(Error::DuplicateFormat(format.name().to_string()));
        }
        if let Some(taken) = format.extensions().iter().find(|e| self.by_extension.contains_key(**e)) {
            self.types.remove(&TypeId::of::<F>());
            return Err(Error::DuplicateFormat(format!("{} (extension {:?})", format.name(), taken)));
        }

        let index = self.formats.len();
        for ext in format.extensions() {
            self.by_extension.insert((*ext).to_string(), index);
        }
        debug!(format = format.name(), extensions = ?format.extensions(), "registered format");
        self.formats.push(Box::new(format));
        Ok(())
    }

    /// Registered extensions, sorted
    pub fn extensions(&self) -> Vec<&str> {
        let mut extensions: Vec<&str> = self.by_extension.keys().map(String::as_str).collect();
        extensions.sort_unstable();
        extensions
    }

    /// Options passed to every format
    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    /// Open files sharing one extension as a single source
    pub fn open<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Box<dyn SequenceSource>> {
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let Some(first) = paths.first() else {
            return Err(Error::Configuration("No files given".into()));
        };

        if let Some(missing) = paths.iter().find(|p| !p.exists()) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", missing.display()),
            )));
        }

        let ext = extension(first).unwrap_or_default();
        if let Some(other) = paths.iter().find(|p| extension(p).unwrap_or_default() != ext) {
            return Err(Error::Configuration(format!(
                "Files must share one extension: {} and {}",
                first.display(),
                other.display()
            )));
        }

        let format = self
            .by_extension
            .get(&ext)
            .map(|&i| &self.formats[i])
            .ok_or_else(|| Error::UnregisteredFormat(ext.clone()))?;
        debug!(format = format.name(), files = paths.len(), "opening source");
        format.open(&paths, &self.options)
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new(ReaderOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::write_block_file;
    use seqflow_core::Block;
    use std::fs;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test]
    fn test_register_once_per_type() {
        let mut registry = FormatRegistry::with_defaults(ReaderOptions::default()).unwrap();
        assert!(matches!(registry.register::<TextFormat>(), Err(Error::DuplicateFormat(_))));
        assert_eq!(registry.extensions(), vec!["csv", "dat", "sfb", "txt"]);
    }

    #[test_case("run/a.dat", Some("dat"); "plain")]
    #[test_case("run/A.CSV", Some("csv"); "upper case")]
    #[test_case("run/traj.part.sfb", Some("sfb"); "last dot wins")]
    #[test_case("run/noext", None; "no extension")]
    fn test_extension(path: &str, expected: Option<&str>) {
        assert_eq!(extension(Path::new(path)).as_deref(), expected);
    }

    #[derive(Default)]
    struct OtherText;

    impl SourceFormat for OtherText {
        fn name(&self) -> &str {
            "other-text"
        }

        fn extensions(&self) -> &[&'static str] {
            &["txt"]
        }

        fn open(&self, paths: &[PathBuf], options: &ReaderOptions) -> Result<Box<dyn SequenceSource>> {
            TextFormat.open(paths, options)
        }
    }

    #[test]
    fn test_extension_claimed_once() {
        let mut registry = FormatRegistry::with_defaults(ReaderOptions::default()).unwrap();
        let err = registry.register::<OtherText>().unwrap_err();
        assert!(err.is_configuration());
        // a failed registration leaves the type free
        let mut empty = FormatRegistry::default();
        empty.register::<OtherText>().unwrap();
    }

    #[test]
    fn test_open_resolves_by_extension() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.csv");
        fs::write(&a, "1,2\n3,4\n5,6\n").unwrap();
        let b = write_block_file(dir.path().join("b.sfb"), &Block::zeros(4, 2)).unwrap();
        let registry = FormatRegistry::with_defaults(ReaderOptions::default()).unwrap();

        let text = registry.open(&[&a]).unwrap();
        assert_eq!((text.lengths(), text.dimension()), (&[3usize][..], 2));
        let binary = registry.open(&[&b]).unwrap();
        assert_eq!(binary.lengths(), &[4]);

        assert!(matches!(registry.open(&[&a, &b]), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_open_errors() {
        let dir = TempDir::new().unwrap();
        let registry = FormatRegistry::with_defaults(ReaderOptions::default()).unwrap();

        assert!(registry.open::<PathBuf>(&[]).is_err());
        assert!(matches!(
            registry.open(&[dir.path().join("missing.dat")]),
            Err(Error::Io(_))
        ));

        let unknown = dir.path().join("data.xyz");
        fs::write(&unknown, "1 2\n").unwrap();
        assert!(matches!(registry.open(&[&unknown]), Err(Error::UnregisteredFormat(ext)) if ext == "xyz"));
    }
}
