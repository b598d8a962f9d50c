//! Read access to store-only archives.
//!
//! An archive is memory mapped once and indexed one of two ways, chosen when
//! it is opened:
//!
//! - through its paired `<archive>.cache`, when one exists and its header
//!   matches the checkup record inside the archive
//! - by parsing the central directory, otherwise
//!
//! Both serve the same lookups. Data is handed out as views into the
//! mapping, so only uncompressed, unencrypted members can be served.

mod entry;
mod stream;

pub use entry::{ZipEntry, ZipIoEntry, ZipIoEntryKind};
pub use stream::EntryStream;

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::batch::ZipEntryContext;
use crate::cache::{BASE_HEADER_SIZE, Cache, cache_path};
use crate::error::{Error, Result};
use crate::io::MappedFile;
use crate::pattern::{PathFilter, Pattern};
use crate::zip::{CompressionMethod, ZipFileEntry, ZipParser};

enum Index {
    /// Full central directory parse, keyed by path
    Directory(BTreeMap<String, ZipEntry>),
    Cached(Cache),
}

/// An opened archive.
pub struct ZipIoContext {
    mount: Arc<MappedFile>,
    index: Index,
    open_streams: AtomicUsize,
}

impl ZipIoContext {
    /// Open an archive, preferring its cache.
    ///
    /// Any problem with the cache (missing, corrupted, stale) falls back to
    /// parsing the central directory.
    pub fn open(path: &Path) -> Result<Self> {
        let mount = Arc::new(MappedFile::open(path)?);

        let cache_file = cache_path(path);
        match Self::load_cache(&mount, &cache_file) {
            Ok(cache) => {
                info!("Found zip cache: {}", cache_file.display());
                return Ok(Self::with_index(mount, Index::Cached(cache)));
            }
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No cache for {}", path.display());
            }
            Err(e) => warn!("Failed loading cache {}: {}", cache_file.display(), e),
        }

        let files = Self::parse(&mount, |_| true)?;
        Ok(Self::with_index(mount, Index::Directory(files)))
    }

    /// Parse the central directory, keeping only entries that pass both
    /// filters. Never uses a cache.
    pub fn open_filtered(
        path: &Path,
        path_filter: &PathFilter,
        module_filter: &PathFilter,
    ) -> Result<Self> {
        let mount = Arc::new(MappedFile::open(path)?);
        let files = Self::parse(&mount, |name| {
            path_filter.is_filtered(name) && module_filter.is_filtered(name)
        })?;
        Ok(Self::with_index(mount, Index::Directory(files)))
    }

    fn with_index(mount: Arc<MappedFile>, index: Index) -> Self {
        Self {
            mount,
            index,
            open_streams: AtomicUsize::new(0),
        }
    }

    fn load_cache(mount: &MappedFile, cache_file: &Path) -> Result<Cache> {
        let cache = Cache::load(cache_file)?;
        let checkup = mount.slice(cache.header().zip_checkup_offset, BASE_HEADER_SIZE as u64);

        if checkup != Some(cache.checkup_bytes()) {
            return Err(Error::CheckupMismatch);
        }

        Ok(cache)
    }

    fn parse<F>(mount: &Arc<MappedFile>, keep: F) -> Result<BTreeMap<String, ZipEntry>>
    where
        F: Fn(&str) -> bool,
    {
        debug!("Parsing central directory of {}", mount.path().display());

        let data = mount.as_bytes();
        let parser = ZipParser::new(mount.clone());
        let mut files = BTreeMap::new();

        parser.for_each_entry(|entry| {
            // Folders and empty files are never served
            if entry.compressed_size == 0 {
                return Ok(());
            }

            check_supported(&entry)?;

            if !keep(&entry.file_name) {
                return Ok(());
            }

            let offset = ZipParser::<MappedFile>::data_offset_in(data, entry.lfh_offset)?;
            if mount.slice(offset, entry.compressed_size).is_none() {
                return Err(Error::OutOfBounds {
                    offset,
                    size: entry.compressed_size,
                });
            }

            files.insert(
                entry.file_name,
                ZipEntry::new(offset, entry.compressed_size),
            );
            Ok(())
        })?;

        Ok(files)
    }

    pub fn path(&self) -> &Path {
        self.mount.path()
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.index, Index::Cached(_))
    }

    pub fn num_files(&self) -> usize {
        match &self.index {
            Index::Directory(files) => files.len(),
            Index::Cached(cache) => cache.num_files(),
        }
    }

    /// Exact lookup; a zero-size entry when absent.
    pub fn lookup(&self, path: &str) -> ZipEntry {
        match &self.index {
            Index::Directory(files) => files.get(path).copied().unwrap_or_default(),
            Index::Cached(cache) => cache.request_file(path),
        }
    }

    /// First path in sorted order matching `pattern`; empty when none does.
    pub fn find(&self, pattern: &str) -> ZipIoEntry<'_> {
        match &self.index {
            Index::Directory(files) => {
                let Some(pattern) = Pattern::parse(pattern) else {
                    return ZipIoEntry::default();
                };
                candidates(files, &pattern)
                    .find(|(name, _)| pattern.matches(name))
                    .map(|(name, entry)| ZipIoEntry::borrowed(*entry, name))
                    .unwrap_or_default()
            }
            Index::Cached(cache) => cache.find_file(pattern),
        }
    }

    /// Every path matching `pattern`, in sorted order.
    pub fn find_all(&self, pattern: &str) -> Vec<ZipIoEntry<'_>> {
        match &self.index {
            Index::Directory(files) => {
                let Some(pattern) = Pattern::parse(pattern) else {
                    return Vec::new();
                };
                candidates(files, &pattern)
                    .filter(|(name, _)| pattern.matches(name))
                    .map(|(name, entry)| ZipIoEntry::borrowed(*entry, name))
                    .collect()
            }
            Index::Cached(cache) => cache.find_files(pattern),
        }
    }

    pub fn iter(&self, kind: ZipIoEntryKind) -> Box<dyn Iterator<Item = ZipIoEntry<'_>> + '_> {
        match &self.index {
            Index::Directory(files) => Box::new(
                files
                    .iter()
                    .map(move |(name, entry)| ZipIoEntry::borrowed(*entry, name).with_kind(kind)),
            ),
            Index::Cached(cache) => Box::new(cache.iter(kind)),
        }
    }

    /// Stream the data of an entry, `None` for the not-found sentinel or a
    /// range outside the archive.
    pub fn open_entry(&self, entry: ZipEntry) -> Option<EntryStream<'_>> {
        if !entry.is_found() {
            return None;
        }

        let data = self.mount.slice(entry.offset, entry.size)?;
        Some(EntryStream::view(data, &self.open_streams))
    }

    pub fn request_file(&self, path: &str) -> Option<EntryStream<'_>> {
        self.open_entry(self.lookup(path))
    }

    pub fn find_file(&self, pattern: &str) -> Option<(ZipIoEntry<'_>, EntryStream<'_>)> {
        let found = self.find(pattern);
        let stream = self.open_entry(found.entry)?;
        Some((found, stream))
    }

    /// Release a stream obtained from this archive.
    pub fn dispose_file(&self, stream: EntryStream<'_>) {
        drop(stream);
    }

    /// Streams handed out and not yet released.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::Relaxed)
    }

    /// Borrow `size` bytes at `offset` into an entry without opening it.
    pub fn get_chunk(&self, entry: ZipEntry, offset: u64, size: u64) -> Result<&[u8]> {
        let out_of_bounds = Error::OutOfBounds { offset, size };

        let end = offset.checked_add(size).ok_or(Error::OutOfBounds { offset, size })?;
        if end > entry.size {
            return Err(out_of_bounds);
        }

        self.mount
            .slice(entry.offset + offset, size)
            .ok_or(out_of_bounds)
    }

    /// A per-file context for one member of this archive.
    pub fn instance(self: &Arc<Self>, entry: ZipIoEntry<'_>) -> ZipEntryContext {
        ZipEntryContext::new(self.clone(), entry.into_owned())
    }
}

/// Entries that can match `pattern`: everything, or only the run sharing
/// its anchored prefix.
fn candidates<'a>(
    files: &'a BTreeMap<String, ZipEntry>,
    pattern: &Pattern<'_>,
) -> Box<dyn Iterator<Item = (&'a String, &'a ZipEntry)> + 'a> {
    match pattern.anchored_prefix() {
        Some(prefix) => {
            let prefix = prefix.to_string();
            Box::new(
                files
                    .range(prefix.clone()..)
                    .take_while(move |(name, _)| name.starts_with(&prefix)),
            )
        }
        None => Box::new(files.iter()),
    }
}

fn check_supported(entry: &ZipFileEntry) -> Result<()> {
    if entry.is_encrypted() {
        return Err(Error::UnsupportedEntry {
            name: entry.file_name.clone(),
            reason: "encrypted",
        });
    }

    if entry.compression_method != CompressionMethod::Stored {
        return Err(Error::UnsupportedEntry {
            name: entry.file_name.clone(),
            reason: "compressed",
        });
    }

    if entry.file_name.is_empty() {
        return Err(Error::InvalidZip("entry without a path".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::{LocalFileHeader, write_directory_end};
    use std::io::Read;

    fn write_zip(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, crate::zip::build_zip(files)).unwrap();
        path
    }

    #[test]
    fn test_directory_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            "a.zip",
            &[("a/b/foo.txt", b"foo"), ("a/c/bar.txt", b"barbar"), ("empty", b"")],
        );

        let ctx = ZipIoContext::open(&path).unwrap();
        assert!(!ctx.is_cached());
        assert_eq!(ctx.num_files(), 2);
        assert_eq!(ctx.lookup("a/c/bar.txt").size, 6);
        assert!(!ctx.lookup("empty").is_found());
        assert!(ctx.request_file("missing").is_none());

        let mut stream = ctx.request_file("a/b/foo.txt").unwrap();
        assert_eq!(ctx.open_streams(), 1);
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert_eq!(text, "foo");
        ctx.dispose_file(stream);
        assert_eq!(ctx.open_streams(), 0);

        let (found, _stream) = ctx.find_file("*txt$").unwrap();
        assert_eq!(found.as_str(), "a/b/foo.txt");
        assert_eq!(ctx.find_all("*txt$").len(), 2);

        assert_eq!(ctx.find("^a/c/").as_str(), "a/c/bar.txt");
        assert_eq!(ctx.find("^a/*foo").as_str(), "a/b/foo.txt");
        assert_eq!(ctx.find_all("^a/").len(), 2);
        assert!(ctx.find_all("^a/d").is_empty());
        assert!(!ctx.find("^b").is_found());

        let entry = ctx.lookup("a/c/bar.txt");
        assert_eq!(ctx.get_chunk(entry, 3, 3).unwrap(), b"bar");
        assert!(matches!(
            ctx.get_chunk(entry, 4, 3),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_filtered_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            "a.zip",
            &[("x/keep.txt", b"1"), ("x/drop.bin", b"2"), ("y/keep.txt", b"3")],
        );

        let path_filter: PathFilter = ["^x/"].into_iter().collect();
        let module_filter: PathFilter = [".txt$"].into_iter().collect();
        let ctx = ZipIoContext::open_filtered(&path, &path_filter, &module_filter).unwrap();

        let names: Vec<_> = ctx
            .iter(ZipIoEntryKind::View)
            .map(|e| e.name.into_owned())
            .collect();
        assert_eq!(names, ["x/keep.txt"]);
    }

    #[test]
    fn test_huge_offset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.zip");

        let mut out = Vec::new();
        let mut lfh = LocalFileHeader::stored(1, 0, 0);
        lfh.set_data(0, 4);
        lfh.write_to(&mut out).unwrap();
        out.extend_from_slice(b"fdata");

        let mut entry = ZipFileEntry::stored("f".into(), 0, 4, 0, 0, 0);
        entry.lfh_offset = u64::MAX - 5;
        let cd_offset = out.len() as u64;
        entry.write_to(&mut out).unwrap();
        let cd_size = out.len() as u64 - cd_offset;
        let position = out.len() as u64;
        write_directory_end(&mut out, position, 1, cd_size, cd_offset).unwrap();
        std::fs::write(&path, out).unwrap();

        assert!(matches!(
            ZipIoContext::open(&path),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_compressed_entry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deflate.zip");

        let mut out = Vec::new();
        let mut lfh = LocalFileHeader::stored(1, 0, 0);
        lfh.compression_method = 8;
        lfh.set_data(0, 4);
        lfh.write_to(&mut out).unwrap();
        out.extend_from_slice(b"fdata");

        let mut entry = ZipFileEntry::stored("f".into(), 0, 4, 0, 0, 0);
        entry.compression_method = CompressionMethod::Deflate;
        let cd_offset = out.len() as u64;
        entry.write_to(&mut out).unwrap();
        let cd_size = out.len() as u64 - cd_offset;
        let position = out.len() as u64;
        write_directory_end(&mut out, position, 1, cd_size, cd_offset).unwrap();
        std::fs::write(&path, out).unwrap();

        assert!(matches!(
            ZipIoContext::open(&path),
            Err(Error::UnsupportedEntry { reason: "compressed", .. })
        ));
    }

    #[test]
    fn test_stale_cache_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), "a.zip", &[("f.txt", b"data")]);
        std::fs::write(cache_path(&path), b"SPCH garbage").unwrap();

        let ctx = ZipIoContext::open(&path).unwrap();
        assert!(!ctx.is_cached());
        assert!(ctx.lookup("f.txt").is_found());
    }
}
