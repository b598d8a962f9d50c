use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::debug;

use super::{copy_blocks, write_paired_cache};
use crate::cache::{BASE_HEADER_SIZE, CacheGenerator};
use crate::error::{Error, Result};
use crate::zip::{CHECKUP_EXTRA_ID, LFH_SIZE, ZipFileEntry, write_directory_end};

/// A finished per-worker archive without its central directory.
///
/// Local header offsets in `entries` are relative to the start of
/// `records`, and the data of each entry follows its name directly.
pub struct SubArchive<R> {
    records: R,
    size: u64,
    entries: Vec<ZipFileEntry>,
}

impl<R: Read> SubArchive<R> {
    /// `records` must yield at least `size` bytes.
    pub fn new(records: R, size: u64, entries: Vec<ZipFileEntry>) -> Self {
        Self {
            records,
            size,
            entries,
        }
    }

    pub fn entries(&self) -> &[ZipFileEntry] {
        &self.entries
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Joins sub-archives into one archive, in the order they are merged.
///
/// Records are appended to the output as they arrive. Central directory
/// entries are rebased and spooled to a temporary file until
/// [`finish_merge`](Self::finish_merge). The most recent entry is held back,
/// since the last one written carries the checkup record.
pub struct ZipMerger<W: Write + Seek> {
    records: W,
    position: u64,
    entries: BufWriter<File>,
    entries_size: u64,
    num_entries: u64,
    last: Option<ZipFileEntry>,
    cache: Option<(CacheGenerator, PathBuf)>,
}

impl<W: Write + Seek> ZipMerger<W> {
    pub fn new(records: W) -> Result<Self> {
        Ok(Self {
            records,
            position: 0,
            entries: BufWriter::new(tempfile::tempfile()?),
            entries_size: 0,
            num_entries: 0,
            last: None,
            cache: None,
        })
    }

    /// Also build the cache for the merged archive, written to `cache_file`.
    pub fn with_cache(records: W, cache_file: PathBuf) -> Result<Self> {
        let mut merger = Self::new(records)?;
        merger.cache = Some((CacheGenerator::new(), cache_file));
        Ok(merger)
    }

    /// Bytes of records merged so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Append one sub-archive.
    ///
    /// Entries whose rebased local header offset no longer fits 32 bits get
    /// a ZIP64 offset field when the directory is written.
    pub fn merge<R: Read>(&mut self, sub: SubArchive<R>) -> Result<()> {
        let SubArchive {
            mut records,
            size,
            entries,
        } = sub;
        let base = self.position;

        debug!("Merging {} entries at {}", entries.len(), base);

        for mut entry in entries {
            entry.lfh_offset += base;

            if let Some((cache, _)) = &mut self.cache {
                if entry.compressed_size > 0 {
                    let data_offset =
                        entry.lfh_offset + LFH_SIZE as u64 + entry.file_name.len() as u64;
                    cache.add_file(&entry.file_name, data_offset, entry.compressed_size)?;
                }
                cache.update_crc(entry.crc32);
            }

            if let Some(previous) = self.last.replace(entry) {
                previous.write_to(&mut self.entries)?;
                self.entries_size += previous.encoded_len() as u64;
            }
            self.num_entries += 1;
        }

        copy_blocks(&mut records, &mut self.records, size)?;
        self.position += size;
        Ok(())
    }

    /// Append the central directory and end records, then write the cache.
    /// Returns the output.
    pub fn finish_merge(mut self) -> Result<W> {
        let cd_offset = self.position;

        let mut entries = self
            .entries
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        entries.seek(SeekFrom::Start(0))?;
        copy_blocks(&mut entries, &mut self.records, self.entries_size)?;
        self.position += self.entries_size;

        let mut cache = self.cache.take();
        let mut checkup_offset = 0;

        match self.last.take() {
            Some(mut last) => {
                if cache.is_some() {
                    checkup_offset =
                        self.position + (last.raw_extra_position() + last.extra.len() + 4) as u64;
                    last.push_extra(CHECKUP_EXTRA_ID, &[0; BASE_HEADER_SIZE]);
                }
                last.write_to(&mut self.records)?;
                self.position += last.encoded_len() as u64;
            }
            None if cache.is_some() => {
                debug!("Nothing merged, no cache written");
                cache = None;
            }
            None => {}
        }

        let mut end = Vec::new();
        write_directory_end(
            &mut end,
            self.position,
            self.num_entries,
            self.position - cd_offset,
            cd_offset,
        )?;
        self.records.write_all(&end)?;
        self.position += end.len() as u64;

        if let Some((mut cache, cache_file)) = cache {
            cache.set_zip_size(self.position);
            cache.set_checkup_offset(checkup_offset);
            write_paired_cache(cache, &cache_file, &mut self.records, checkup_offset)?;
        }

        self.records.flush()?;
        Ok(self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::cache_path;
    use crate::context::AppExtractContext;
    use crate::output::ZipExtractContext;
    use crate::vfs::ZipIoContext;
    use crate::zip::{U32_LIMIT, ZipParser};
    use std::io::{self, Cursor};
    use std::sync::Arc;

    const GIB: u64 = 1 << 30;

    /// Claims to fill reads without touching the buffer.
    struct Blank {
        remaining: u64,
    }

    impl Read for Blank {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = (buf.len() as u64).min(self.remaining).min(0x10000) as usize;
            self.remaining -= n as u64;
            Ok(n)
        }
    }

    /// Tracks the position and keeps only what lands at or after `keep_from`.
    struct Tail {
        position: u64,
        keep_from: u64,
        kept: Vec<u8>,
    }

    impl Write for Tail {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let end = self.position + buf.len() as u64;
            if end > self.keep_from {
                let skip = self.keep_from.saturating_sub(self.position) as usize;
                self.kept.extend_from_slice(&buf[skip..]);
            }
            self.position = end;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for Tail {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            match pos {
                SeekFrom::Start(p) => self.position = p,
                _ => return Err(io::Error::other("unsupported seek")),
            }
            Ok(self.position)
        }
    }

    fn blank_archive(size: u64, files: &[(&str, u64, u64)]) -> SubArchive<Blank> {
        let entries = files
            .iter()
            .map(|&(name, offset, len)| ZipFileEntry::stored(name.to_string(), 0, len, offset, 0, 0))
            .collect();
        SubArchive::new(Blank { remaining: size }, size, entries)
    }

    /// Raw local header offset field of every directory entry in `cd`.
    fn raw_offsets(cd: &[u8], count: usize) -> Vec<(ZipFileEntry, u32)> {
        let mut cursor = Cursor::new(cd);
        (0..count)
            .map(|_| {
                let start = cursor.position() as usize;
                let entry = ZipFileEntry::read_from(&mut cursor).unwrap();
                let raw = u32::from_le_bytes(cd[start + 42..start + 46].try_into().unwrap());
                (entry, raw)
            })
            .collect()
    }

    #[test]
    fn test_zip64_offsets_only_past_4gib() {
        let size_a = 3 * GIB;
        let size_b = 2 * GIB;
        let b_second = 1200 << 20;

        let sink = Tail {
            position: 0,
            keep_from: size_a + size_b,
            kept: Vec::new(),
        };
        let mut merger = ZipMerger::new(sink).unwrap();

        merger
            .merge(blank_archive(size_a, &[("a.bin", 0, size_a - 100)]))
            .unwrap();
        merger
            .merge(blank_archive(
                size_b,
                &[("b/first.bin", 0, 1000), ("b/second.bin", b_second, 1000)],
            ))
            .unwrap();
        assert_eq!(merger.position(), size_a + size_b);

        let sink = merger.finish_merge().unwrap();
        let entries = raw_offsets(&sink.kept, 3);

        let (a, a_raw) = &entries[0];
        assert_eq!(a.lfh_offset, 0);
        assert_eq!(*a_raw, 0);
        assert!(a.zip64_extra().is_none());

        let (b1, b1_raw) = &entries[1];
        assert_eq!(b1.lfh_offset, size_a);
        assert_eq!(*b1_raw as u64, size_a);

        let (b2, b2_raw) = &entries[2];
        assert_eq!(b2.lfh_offset, size_a + b_second);
        assert_eq!(*b2_raw as u64, U32_LIMIT);
        assert!(b2.zip64_extra().is_some());
    }

    #[test]
    fn test_merge_with_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.zip");

        let mut first = ZipExtractContext::temporary().unwrap();
        first.new_file("x/one.txt").unwrap();
        first.send_data(b"first").unwrap();

        let mut second = ZipExtractContext::temporary().unwrap();
        second.set_prefix("nested");
        second.new_file("two.txt").unwrap();
        second.send_data(b"second").unwrap();
        second.new_file("three.txt").unwrap();
        second.send_data(b"third!").unwrap();

        let out = File::create(&path).unwrap();
        let mut merger = ZipMerger::with_cache(out, cache_path(&path)).unwrap();
        merger.merge(first.into_sub_archive().unwrap()).unwrap();
        merger.merge(second.into_sub_archive().unwrap()).unwrap();
        assert_eq!(merger.num_entries(), 3);
        merger.finish_merge().unwrap();

        let data = Arc::new(std::fs::read(&path).unwrap());
        let names: Vec<_> = ZipParser::new(data)
            .list_files()
            .unwrap()
            .into_iter()
            .map(|e| e.file_name)
            .collect();
        assert_eq!(names, ["x/one.txt", "nested/two.txt", "nested/three.txt"]);

        let zip = ZipIoContext::open(&path).unwrap();
        assert!(zip.is_cached());
        let entry = zip.lookup("nested/three.txt");
        assert_eq!(zip.get_chunk(entry, 0, entry.size).unwrap(), b"third!");
        assert!(!zip.lookup("nested/four.txt").is_found());
    }

    #[test]
    fn test_merge_nothing() {
        let merger = ZipMerger::new(Cursor::new(Vec::new())).unwrap();
        let out = merger.finish_merge().unwrap().into_inner();

        let parser = ZipParser::new(Arc::new(out));
        assert!(parser.list_files().unwrap().is_empty());
    }
}
