use super::ReadAt;
use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Read-only memory mapping of a whole file.
///
/// The mapping is shared between worker threads as plain memory; nothing
/// writes through it. Empty files cannot be mapped on every platform, so they
/// are represented without a mapping.
pub struct MappedFile {
    map: Option<Mmap>,
    path: PathBuf,
}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();

        let map = if len == 0 {
            None
        } else {
            // SAFETY: the file is opened read-only and inputs are not expected
            // to change while a batch runs; every read is bounds-checked
            // against the mapped length.
            Some(unsafe { Mmap::map(&file)? })
        };

        Ok(Self {
            map,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> u64 {
        self.as_bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Borrow `size` bytes at `offset`, or `None` if the range leaves the file.
    pub fn slice(&self, offset: u64, size: u64) -> Option<&[u8]> {
        let end = offset.checked_add(size)?;
        if end > self.len() {
            return None;
        }
        Some(&self.as_bytes()[offset as usize..end as usize])
    }
}

impl ReadAt for MappedFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.as_bytes();
        if offset >= data.len() as u64 {
            return Ok(0);
        }

        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.len()
    }
}
