//! Per-file contexts handed to processing callbacks.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use super::output::{BatchOutput, OutputLease};
use crate::context::{AppContext, AppExtractContext};
use crate::error::{Error, Result};
use crate::io::{LocalFileReader, ReadAt};
use crate::pattern::Pattern;
use crate::vfs::{EntryStream, ZipIoContext, ZipIoEntry};

fn no_output() -> Error {
    Error::Io(std::io::Error::other("this context has no output"))
}

/// A member of an opened archive.
pub struct ZipEntryContext {
    archive: Arc<ZipIoContext>,
    entry: ZipIoEntry<'static>,
    output: Option<OutputLease>,
}

impl ZipEntryContext {
    pub fn new(archive: Arc<ZipIoContext>, entry: ZipIoEntry<'static>) -> Self {
        Self {
            archive,
            entry,
            output: None,
        }
    }

    pub(crate) fn with_output(mut self, output: Arc<BatchOutput>, prefix: String) -> Self {
        self.output = Some(OutputLease::new(output, prefix));
        self
    }

    pub fn archive(&self) -> &ZipIoContext {
        &self.archive
    }

    pub fn entry(&self) -> &ZipIoEntry<'static> {
        &self.entry
    }

    /// Return the output sink to the batch.
    pub fn finish(mut self) -> Result<()> {
        match self.output.as_mut() {
            Some(lease) => lease.release(),
            None => Ok(()),
        }
    }
}

impl AppContext for ZipEntryContext {
    fn working_file(&self) -> &str {
        self.entry.as_str()
    }

    fn stream(&self) -> Result<EntryStream<'_>> {
        self.archive
            .open_entry(self.entry.entry)
            .ok_or(Error::OutOfBounds {
                offset: self.entry.entry.offset,
                size: self.entry.entry.size,
            })
    }

    fn read_chunk(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let offset = offset.min(self.entry.entry.size);
        let size = size.min(self.entry.entry.size - offset);
        Ok(self.archive.get_chunk(self.entry.entry, offset, size)?.to_vec())
    }

    fn request_file(&self, path: &str) -> Option<EntryStream<'_>> {
        self.archive.request_file(path)
    }

    fn find_file(&self, root: &str, pattern: &str) -> Option<(String, EntryStream<'_>)> {
        let found = self
            .archive
            .find_all(pattern)
            .into_iter()
            .find(|e| e.name.starts_with(root))?;
        let stream = self.archive.open_entry(found.entry)?;
        Some((found.name.into_owned(), stream))
    }

    fn extract_context(&mut self) -> Result<&mut dyn AppExtractContext> {
        self.output.as_mut().ok_or_else(no_output)?.get()
    }
}

/// A loose file on disk.
///
/// Paths are resolved against `base`, the folder the file was found in or
/// the folder scanning started from.
pub struct FileContext {
    base: PathBuf,
    working_file: String,
    output: Option<OutputLease>,
}

impl FileContext {
    /// `path` is relative to `base`, `/` separated.
    pub fn new(base: impl Into<PathBuf>, path: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            working_file: path.into(),
            output: None,
        }
    }

    pub(crate) fn with_output(mut self, output: Arc<BatchOutput>, prefix: String) -> Self {
        self.output = Some(OutputLease::new(output, prefix));
        self
    }

    pub fn full_path(&self) -> PathBuf {
        self.base.join(&self.working_file)
    }

    pub fn finish(mut self) -> Result<()> {
        match self.output.as_mut() {
            Some(lease) => lease.release(),
            None => Ok(()),
        }
    }
}

/// `path` relative to `base`, with `/` separators.
pub(crate) fn relative_name(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

impl AppContext for FileContext {
    fn working_file(&self) -> &str {
        &self.working_file
    }

    fn stream(&self) -> Result<EntryStream<'_>> {
        Ok(EntryStream::from_file(File::open(self.full_path())?)?)
    }

    fn read_chunk(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let reader = LocalFileReader::new(&self.full_path())?;
        Ok(reader.read_chunk(offset, Some(size as usize))?)
    }

    fn request_file(&self, path: &str) -> Option<EntryStream<'_>> {
        let file = File::open(self.base.join(path)).ok()?;
        if !file.metadata().ok()?.is_file() {
            return None;
        }
        EntryStream::from_file(file).ok()
    }

    fn find_file(&self, root: &str, pattern: &str) -> Option<(String, EntryStream<'_>)> {
        let pattern = Pattern::parse(pattern)?;

        let name = WalkDir::new(self.base.join(root))
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| relative_name(&self.base, entry.path()))
            .find(|name| pattern.matches(name))?;

        let stream = self.request_file(&name)?;
        Some((name, stream))
    }

    fn extract_context(&mut self) -> Result<&mut dyn AppExtractContext> {
        self.output.as_mut().ok_or_else(no_output)?.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_all(mut stream: EntryStream<'_>) -> String {
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_file_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("models/hero")).unwrap();
        std::fs::write(dir.path().join("models/hero/hero.mdl"), b"mesh").unwrap();
        std::fs::write(dir.path().join("models/hero/hero.skel"), b"bones").unwrap();

        let mut ctx = FileContext::new(dir.path(), "models/hero/hero.mdl");
        assert_eq!(ctx.working_file(), "models/hero/hero.mdl");
        assert_eq!(read_all(ctx.stream().unwrap()), "mesh");
        assert_eq!(ctx.read_chunk(1, 10).unwrap(), b"esh");

        let sibling = ctx.request_file("models/hero/hero.skel").unwrap();
        assert_eq!(read_all(sibling), "bones");
        assert!(ctx.request_file("models/hero").is_none());

        let (name, stream) = ctx.find_file("models", "*.skel$").unwrap();
        assert_eq!(name, "models/hero/hero.skel");
        ctx.dispose_file(stream);
        assert!(ctx.find_file("models", "*.tex$").is_none());

        assert!(ctx.extract_context().is_err());
    }

    #[test]
    fn test_zip_entry_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        std::fs::write(
            &path,
            crate::zip::build_zip(&[("a/b/foo.txt", b"foo"), ("a/c/bar.txt", b"barbar")]),
        )
        .unwrap();

        let archive = Arc::new(ZipIoContext::open(&path).unwrap());
        let entry = archive.find("^a/c/");
        let ctx = archive.instance(entry);

        assert_eq!(ctx.working_file(), "a/c/bar.txt");
        assert_eq!(read_all(ctx.stream().unwrap()), "barbar");
        assert_eq!(ctx.read_chunk(3, 100).unwrap(), b"bar");
        assert_eq!(read_all(ctx.request_file("a/b/foo.txt").unwrap()), "foo");

        let (name, _) = ctx.find_file("a/b", "*.txt$").unwrap();
        assert_eq!(name, "a/b/foo.txt");
        assert!(ctx.find_file("z", "*.txt$").is_none());
        ctx.finish().unwrap();
    }

    #[test]
    fn test_relative_name() {
        let base = Path::new("/data/in");
        assert_eq!(
            relative_name(base, Path::new("/data/in/x/y.bin")).as_deref(),
            Some("x/y.bin")
        );
        assert_eq!(relative_name(base, base), None);
        assert_eq!(relative_name(base, Path::new("/other")), None);
    }
}
