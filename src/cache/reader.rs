use byteorder::{ByteOrder, NativeEndian};
use std::cmp::Ordering;
use std::path::Path;

use super::format::{self, *};
use crate::error::{Error, Result};
use crate::io::MappedFile;
use crate::pattern::Pattern;
use crate::vfs::{ZipEntry, ZipIoEntry, ZipIoEntryKind};

enum Backing {
    Mapped(MappedFile),
    Owned(Vec<u8>),
}

/// A loaded lookup cache.
///
/// Every access goes through bounds-checked accessors over the raw bytes.
/// A reference that leaves the buffer turns the lookup into a miss.
pub struct Cache {
    data: Backing,
    /// Bytes covered by the cache, the backing may be longer
    size: usize,
    header: CacheBaseHeader,
    root: usize,
    entries: usize,
}

impl Cache {
    /// Map a cache file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::mount(Backing::Mapped(MappedFile::open(path)?))
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::mount(Backing::Owned(data))
    }

    fn mount(data: Backing) -> Result<Self> {
        let bytes = match &data {
            Backing::Mapped(file) => file.as_bytes(),
            Backing::Owned(bytes) => bytes.as_slice(),
        };

        let header = CacheBaseHeader::from_bytes(bytes)?;
        if bytes.len() < HEADER_SIZE {
            return Err(Error::CorruptedCache("truncated header"));
        }

        let view = View(bytes);

        let cache_size = view
            .u32_at(format::header::CACHE_SIZE)
            .map(|s| s as usize)
            .filter(|&s| s >= HEADER_SIZE && s <= bytes.len())
            .ok_or(Error::CorruptedCache("cache size"))?;

        let view = View(&bytes[..cache_size]);

        let root = view
            .resolve(format::header::ROOT)
            .filter(|&root| root + NODE_FIXED_SIZE <= cache_size)
            .ok_or(Error::CorruptedCache("root node"))?;

        let entries = view
            .resolve(format::header::ENTRIES)
            .filter(|&entries| {
                (header.num_files as usize)
                    .checked_mul(ENTRY_SIZE)
                    .and_then(|len| entries.checked_add(len))
                    .is_some_and(|end| end <= cache_size)
            })
            .ok_or(Error::CorruptedCache("entries"))?;

        Ok(Self {
            data,
            size: cache_size,
            header,
            root,
            entries,
        })
    }

    fn view(&self) -> View<'_> {
        let bytes = match &self.data {
            Backing::Mapped(file) => file.as_bytes(),
            Backing::Owned(bytes) => bytes.as_slice(),
        };
        View(&bytes[..self.size])
    }

    pub fn header(&self) -> &CacheBaseHeader {
        &self.header
    }

    /// The serialized base header, as embedded in the paired archive.
    pub fn checkup_bytes(&self) -> &[u8] {
        &self.view().0[..BASE_HEADER_SIZE]
    }

    pub fn num_files(&self) -> usize {
        self.header.num_files as usize
    }

    fn entry_pos(&self, index: usize) -> usize {
        self.entries + index * ENTRY_SIZE
    }

    fn entry_at(&self, index: usize) -> Option<ZipIoEntry<'_>> {
        if index >= self.num_files() {
            return None;
        }

        let view = self.view();
        let pos = self.entry_pos(index);
        let path = std::str::from_utf8(view.path_at(pos)?).ok()?;
        let entry = ZipEntry::new(
            view.u64_at(pos + format::entry::OFFSET)?,
            view.u64_at(pos + format::entry::SIZE)?,
        );

        Some(ZipIoEntry::borrowed(entry, path))
    }

    fn entry_path(&self, index: usize) -> Option<&[u8]> {
        self.view().path_at(self.entry_pos(index))
    }

    /// Exact lookup by path.
    ///
    /// Returns a zero-size entry when the path is absent, deeper than any
    /// stored path, or the cache is damaged along the way.
    pub fn request_file(&self, path: &str) -> ZipEntry {
        self.lookup(path).unwrap_or_default()
    }

    fn lookup(&self, path: &str) -> Option<ZipEntry> {
        let parts: Vec<&str> = split_path(path).collect();
        if parts.is_empty() || parts.len() > self.header.num_levels as usize {
            return None;
        }

        let view = self.view();
        let (file_name, folders) = parts.split_last()?;
        let mut node = self.root;

        for folder in folders {
            let num_children = view.u32_at(node + format::node::NUM_CHILDREN)? as usize;
            node = binary_search(num_children, folder.as_bytes(), |i| {
                let child = view.resolve(node + format::node::REFS + 4 * i)?;
                let name = view.name_at(child, format::node::NAME, format::node::NAME_SIZE)?;
                Some((child, name))
            })?;
        }

        let num_children = view.u32_at(node + format::node::NUM_CHILDREN)? as usize;
        let num_finals = view.u32_at(node + format::node::NUM_FINALS)? as usize;
        let finals = node + format::node::REFS + 4 * num_children;

        let entry = binary_search(num_finals, file_name.as_bytes(), |i| {
            let entry = view.resolve(finals + 4 * i)?;
            let name = view.name_at(entry, format::entry::NAME, format::entry::NAME_SIZE)?;
            Some((entry, name))
        })?;

        Some(ZipEntry::new(
            view.u64_at(entry + format::entry::OFFSET)?,
            view.u64_at(entry + format::entry::SIZE)?,
        ))
    }

    /// Walk entries matching `pattern` in sorted order until `cb` returns false.
    fn scan<'s, F>(&'s self, pattern: &str, mut cb: F)
    where
        F: FnMut(ZipIoEntry<'s>) -> bool,
    {
        let Some(pattern) = Pattern::parse(pattern) else {
            return;
        };

        let (begin, prefix) = match pattern.anchored_prefix() {
            Some(prefix) => (self.lower_bound(prefix.as_bytes()), Some(prefix)),
            None => (0, None),
        };

        for index in begin..self.num_files() {
            let Some(entry) = self.entry_at(index) else {
                continue;
            };

            if let Some(prefix) = prefix
                && !entry.name.starts_with(prefix)
            {
                break;
            }

            if pattern.matches(&entry.name) && !cb(entry) {
                break;
            }
        }
    }

    /// First entry whose path is not less than `key`.
    fn lower_bound(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.num_files());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.entry_path(mid) {
                Some(path) if path < key => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }

    /// First path in sorted order matching `pattern`.
    ///
    /// Patterns are matched against full paths; see
    /// [`Pattern`](crate::pattern::Pattern) for the syntax. Unanchored
    /// patterns scan every entry. There is no ranking: when several paths
    /// match, the lexicographically smallest wins. A malformed pattern or no
    /// match returns an empty entry.
    pub fn find_file(&self, pattern: &str) -> ZipIoEntry<'_> {
        let mut found = ZipIoEntry::default();
        self.scan(pattern, |entry| {
            found = entry;
            false
        });
        found
    }

    /// Every path matching `pattern`, in sorted order.
    pub fn find_files(&self, pattern: &str) -> Vec<ZipIoEntry<'_>> {
        let mut found = Vec::new();
        self.scan(pattern, |entry| {
            found.push(entry);
            true
        });
        found
    }

    /// All entries in sorted order.
    pub fn iter(&self, kind: ZipIoEntryKind) -> impl Iterator<Item = ZipIoEntry<'_>> + '_ {
        (0..self.num_files())
            .filter_map(|index| self.entry_at(index))
            .map(move |entry| entry.with_kind(kind))
    }
}

fn binary_search<'a, F>(count: usize, key: &[u8], at: F) -> Option<usize>
where
    F: Fn(usize) -> Option<(usize, &'a [u8])>,
{
    let (mut lo, mut hi) = (0, count);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let (pos, name) = at(mid)?;
        match name.cmp(key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Some(pos),
        }
    }
    None
}

/// Checked reads over the cache bytes.
#[derive(Clone, Copy)]
struct View<'a>(&'a [u8]);

impl<'a> View<'a> {
    fn get(&self, pos: usize, len: usize) -> Option<&'a [u8]> {
        self.0.get(pos..pos.checked_add(len)?)
    }

    fn u16_at(&self, pos: usize) -> Option<u16> {
        self.get(pos, 2).map(NativeEndian::read_u16)
    }

    fn u32_at(&self, pos: usize) -> Option<u32> {
        self.get(pos, 4).map(NativeEndian::read_u32)
    }

    fn i32_at(&self, pos: usize) -> Option<i32> {
        self.get(pos, 4).map(NativeEndian::read_i32)
    }

    fn u64_at(&self, pos: usize) -> Option<u64> {
        self.get(pos, 8).map(NativeEndian::read_u64)
    }

    /// Follow the reference stored at `pos`.
    fn resolve(&self, pos: usize) -> Option<usize> {
        let delta = self.i32_at(pos)? as i64;
        let target = usize::try_from(pos as i64 + delta).ok()?;
        (target < self.0.len()).then_some(target)
    }

    /// A name field: inline when short, otherwise referenced.
    fn name_at(&self, record: usize, field: usize, size_field: usize) -> Option<&'a [u8]> {
        let size = self.u16_at(record + size_field)? as usize;
        let pos = record + field;

        if size <= INLINE_NAME_SIZE {
            self.get(pos, size)
        } else {
            self.get(self.resolve(pos)?, size)
        }
    }

    /// The full path of an entry record, always referenced.
    fn path_at(&self, record: usize) -> Option<&'a [u8]> {
        let size = self.u16_at(record + format::entry::PATH_SIZE)? as usize;
        self.get(self.resolve(record + format::entry::PATH)?, size)
    }
}
