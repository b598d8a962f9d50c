//! Output sinks: store-only archive writers, the merger that joins
//! per-worker archives into one, and a plain folder writer.

mod extract;
mod folder;
mod merger;
mod pack;

pub use extract::{FileCallback, ZipExtractContext};
pub use folder::IoExtractContext;
pub use merger::{SubArchive, ZipMerger};
pub use pack::ZipPackContext;

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::info;

use crate::cache::{CacheGenerator, MAX_LEVELS, split_path};
use crate::error::{Error, Result};

/// Size of the blocks records are copied in while merging.
pub const MERGE_BLOCK_SIZE: usize = 0x80000;

/// Canonical form of an output path: `/` separated, without empty or `.`
/// components.
pub fn normalize_path(path: &str) -> Result<String> {
    let components: Vec<&str> = split_path(path).collect();

    if components.is_empty() || components.len() > MAX_LEVELS {
        return Err(Error::InvalidPath(path.to_string()));
    }

    let normalized = components.join("/");
    if normalized.len() > u16::MAX as usize {
        return Err(Error::InvalidPath(path.to_string()));
    }

    Ok(normalized)
}

/// Copy exactly `len` bytes from `src` to `dst`.
pub(crate) fn copy_blocks<R, W>(src: &mut R, dst: &mut W, len: u64) -> io::Result<()>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; MERGE_BLOCK_SIZE.min(len as usize)];
    let mut remaining = len;

    while remaining > 0 {
        let block = remaining.min(MERGE_BLOCK_SIZE as u64) as usize;
        src.read_exact(&mut buffer[..block])?;
        dst.write_all(&buffer[..block])?;
        remaining -= block as u64;
    }

    Ok(())
}

/// Write the cache for a finished archive and patch the archive's checkup
/// record with the header that was written.
pub(crate) fn write_paired_cache<W: Write + Seek>(
    cache: CacheGenerator,
    cache_file: &Path,
    records: &mut W,
    checkup_offset: u64,
) -> Result<()> {
    info!("Generating cache: {}", cache_file.display());

    let mut out = BufWriter::new(File::create(cache_file)?);
    let header = cache.wait_and_write(&mut out)?;
    out.flush()?;

    records.seek(SeekFrom::Start(checkup_offset))?;
    records.write_all(&header.to_bytes())?;
    records.seek(SeekFrom::End(0))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a\\b/./c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_path("/lead//x").unwrap(), "lead/x");
        assert!(matches!(normalize_path("./"), Err(Error::InvalidPath(_))));

        let deep = vec!["d"; MAX_LEVELS + 1].join("/");
        assert!(normalize_path(&deep).is_err());
    }

    #[test]
    fn test_copy_blocks_exact() {
        let data: Vec<u8> = (0..MERGE_BLOCK_SIZE * 2 + 7).map(|i| i as u8).collect();
        let mut src = io::Cursor::new(&data);
        let mut dst = Vec::new();

        copy_blocks(&mut src, &mut dst, data.len() as u64 - 3).unwrap();
        assert_eq!(dst, data[..data.len() - 3]);

        let mut short = io::Cursor::new(&data[..10]);
        assert!(copy_blocks(&mut short, &mut Vec::new(), 11).is_err());
    }
}
