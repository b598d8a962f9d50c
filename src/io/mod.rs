//! Random-access input sources and directory scanning.

mod local;
mod mapped;
mod scanner;

pub use local::LocalFileReader;
pub use mapped::MappedFile;
pub use scanner::{DirectoryScanner, ScanCallback};

use std::io;

/// Trait for random access reading from a data source
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Read up to `size` bytes starting at `begin`, clamped to the end of the
    /// source. `None` reads everything from `begin`.
    fn read_chunk(&self, begin: u64, size: Option<usize>) -> io::Result<Vec<u8>> {
        let available = self.size().saturating_sub(begin);
        let len = match size {
            Some(size) => (size as u64).min(available),
            None => available,
        } as usize;

        let mut buf = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            let n = self.read_at(begin + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                buf.truncate(filled);
                break;
            }
            filled += n;
        }

        Ok(buf)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }

        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}
