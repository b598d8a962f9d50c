use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use flate2::Crc;
use tracing::debug;

use super::merger::SubArchive;
use super::{normalize_path, write_paired_cache};
use crate::cache::{BASE_HEADER_SIZE, CacheGenerator, cache_path};
use crate::context::AppExtractContext;
use crate::error::{Error, Result};
use crate::zip::{CHECKUP_EXTRA_ID, LocalFileHeader, ZipFileEntry, dos_timestamp, write_directory_end};

/// Called every time a new output file is started.
pub type FileCallback = Box<dyn FnMut() + Send>;

struct OpenFile {
    name: String,
    header: LocalFileHeader,
    offset: u64,
    crc: Crc,
    size: u64,
}

/// Writes a store-only archive one file at a time.
///
/// Local headers and data go to the records file as they arrive; central
/// directory entries are kept aside until the archive is finished, either
/// on its own with [`finish_zip`](Self::finish_zip) or by handing it to a
/// [`ZipMerger`](super::ZipMerger) through
/// [`into_sub_archive`](Self::into_sub_archive).
///
/// Local headers never carry extra fields, so the data of an entry always
/// starts right after its name.
pub struct ZipExtractContext {
    records: BufWriter<File>,
    position: u64,
    /// Final archive path, unknown for temporary contexts
    output: Option<PathBuf>,
    cache: Option<CacheGenerator>,
    entries: Vec<ZipFileEntry>,
    current: Option<OpenFile>,
    prefix: String,
    for_each_file: Option<FileCallback>,
}

impl ZipExtractContext {
    fn with_records(records: File, output: Option<PathBuf>, cache: Option<CacheGenerator>) -> Self {
        Self {
            records: BufWriter::new(records),
            position: 0,
            output,
            cache,
            entries: Vec::new(),
            current: None,
            prefix: String::new(),
            for_each_file: None,
        }
    }

    /// A standalone archive at `path`, optionally with its paired cache.
    pub fn create(path: &Path, generate_cache: bool) -> Result<Self> {
        debug!("Creating archive {}", path.display());
        let records = File::create(path)?;
        let cache = generate_cache.then(CacheGenerator::new);
        Ok(Self::with_records(records, Some(path.to_path_buf()), cache))
    }

    /// A private archive in an anonymous temporary file, to be merged.
    pub fn temporary() -> Result<Self> {
        Ok(Self::with_records(tempfile::tempfile()?, None, None))
    }

    /// Prepended to every following file name. A trailing `/` is added
    /// when missing.
    pub fn set_prefix(&mut self, prefix: &str) {
        self.prefix = split_prefix(prefix);
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn set_file_callback(&mut self, cb: Option<FileCallback>) {
        self.for_each_file = cb;
    }

    /// Files written so far, including the open one.
    pub fn num_files(&self) -> usize {
        self.entries.len() + usize::from(self.current.is_some())
    }

    fn finish_file(&mut self) -> Result<()> {
        let Some(mut file) = self.current.take() else {
            return Ok(());
        };

        let crc = file.crc.sum();
        file.header.set_data(crc, file.size);

        self.records.seek(SeekFrom::Start(file.offset))?;
        file.header.write_to(&mut self.records)?;
        self.records.seek(SeekFrom::Start(self.position))?;

        if let Some(cache) = &mut self.cache {
            if file.size > 0 {
                let data_offset = file.offset + file.header.data_start();
                cache.add_file(&file.name, data_offset, file.size)?;
            }
            cache.update_crc(crc);
        }

        self.entries.push(ZipFileEntry::stored(
            file.name,
            crc,
            file.size,
            file.offset,
            file.header.last_mod_time,
            file.header.last_mod_date,
        ));

        Ok(())
    }

    /// Write the central directory and close the archive.
    ///
    /// With a cache, the last directory entry carries the checkup record,
    /// which is patched with the cache header once the cache is written.
    pub fn finish_zip(mut self) -> Result<()> {
        self.finish_file()?;

        let mut cache = self.cache.take();
        if cache.is_some() && self.entries.is_empty() {
            debug!("Archive is empty, no cache written");
            cache = None;
        }

        let cd_offset = self.position;
        let num_entries = self.entries.len();
        let mut checkup_offset = 0;

        for (i, entry) in self.entries.iter_mut().enumerate() {
            if cache.is_some() && i + 1 == num_entries {
                checkup_offset =
                    self.position + (entry.raw_extra_position() + entry.extra.len() + 4) as u64;
                entry.push_extra(CHECKUP_EXTRA_ID, &[0; BASE_HEADER_SIZE]);
            }

            entry.write_to(&mut self.records)?;
            self.position += entry.encoded_len() as u64;
        }

        let mut end = Vec::new();
        write_directory_end(
            &mut end,
            self.position,
            num_entries as u64,
            self.position - cd_offset,
            cd_offset,
        )?;
        self.records.write_all(&end)?;
        self.position += end.len() as u64;

        if let (Some(mut cache), Some(output)) = (cache, &self.output) {
            cache.set_zip_size(self.position);
            cache.set_checkup_offset(checkup_offset);
            write_paired_cache(cache, &cache_path(output), &mut self.records, checkup_offset)?;
        }

        self.records.flush()?;
        Ok(())
    }

    /// Close the open file and hand the records and entries over for merging.
    pub fn into_sub_archive(mut self) -> Result<SubArchive<File>> {
        self.finish_file()?;

        let mut records = self
            .records
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        records.seek(SeekFrom::Start(0))?;

        Ok(SubArchive::new(records, self.position, self.entries))
    }
}

fn split_prefix(prefix: &str) -> String {
    match normalize_path(prefix) {
        Ok(mut prefix) => {
            prefix.push('/');
            prefix
        }
        Err(_) => String::new(),
    }
}

impl AppExtractContext for ZipExtractContext {
    fn new_file(&mut self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        self.finish_file()?;

        let name = format!("{}{}", self.prefix, path);
        let name_len = u16::try_from(name.len()).map_err(|_| Error::InvalidPath(name.clone()))?;

        let (time, date) = dos_timestamp(&Local::now());
        let header = LocalFileHeader::stored(name_len, time, date);

        let offset = self.position;
        header.write_to(&mut self.records)?;
        self.records.write_all(name.as_bytes())?;
        self.position += header.data_start();

        self.current = Some(OpenFile {
            name,
            header,
            offset,
            crc: Crc::new(),
            size: 0,
        });

        if let Some(cb) = &mut self.for_each_file {
            cb();
        }

        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let file = self.current.as_mut().ok_or(Error::NoOpenFile)?;

        file.crc.update(data);
        file.size += data.len() as u64;
        self.records.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn requires_folders(&self) -> bool {
        false
    }

    fn add_folder_path(&mut self, _path: &str) -> Result<()> {
        Err(folders_unsupported())
    }

    fn generate_folders(&mut self) -> Result<()> {
        Err(folders_unsupported())
    }
}

fn folders_unsupported() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "archives have no folders, check requires_folders first",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ZipIoContext;
    use crate::zip::ZipParser;
    use std::io::Read;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_files(ctx: &mut ZipExtractContext, files: &[(&str, &[u8])]) {
        for (name, data) in files {
            ctx.new_file(name).unwrap();
            ctx.send_data(data).unwrap();
        }
    }

    #[test]
    fn test_standalone_archive_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.zip");

        let mut ctx = ZipExtractContext::create(&path, false).unwrap();
        ctx.set_prefix("pre\\fix");
        write_files(&mut ctx, &[("a/one.txt", b"one"), ("two.bin", b"22")]);
        ctx.finish_zip().unwrap();

        let data = Arc::new(std::fs::read(&path).unwrap());
        let entries = ZipParser::new(data.clone()).list_files().unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, ["pre/fix/a/one.txt", "pre/fix/two.bin"]);

        let mut crc = Crc::new();
        crc.update(b"one");
        assert_eq!(entries[0].crc32, crc.sum());
        assert_eq!(entries[0].compressed_size, 3);

        // Local headers got patched with the final CRC and size
        let lfh = LocalFileHeader::from_bytes(&data[..]).unwrap();
        assert_eq!(lfh.crc32, crc.sum());
        assert_eq!(lfh.compressed_size, 3);
        assert!(!path.with_extension("zip.cache").exists());
    }

    #[test]
    fn test_standalone_archive_with_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.zip");

        let mut ctx = ZipExtractContext::create(&path, true).unwrap();
        write_files(
            &mut ctx,
            &[("models/hero.mdl", b"hero"), ("textures/hero_diffuse.dds", b"pixels")],
        );
        ctx.finish_zip().unwrap();
        assert!(cache_path(&path).exists());

        let zip = ZipIoContext::open(&path).unwrap();
        assert!(zip.is_cached());
        let mut text = String::new();
        zip.request_file("textures/hero_diffuse.dds")
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "pixels");

        // The checkup record is also visible to a plain parse
        let data = Arc::new(std::fs::read(&path).unwrap());
        let entries = ZipParser::new(data).list_files().unwrap();
        assert_eq!(entries[1].find_extra(CHECKUP_EXTRA_ID).map(<[u8]>::len), Some(32));
    }

    #[test]
    fn test_send_without_file() {
        let mut ctx = ZipExtractContext::temporary().unwrap();
        assert!(matches!(ctx.send_data(b"x"), Err(Error::NoOpenFile)));
        assert!(matches!(ctx.new_file("/"), Err(Error::InvalidPath(_))));
        assert!(ctx.add_folder_path("x").is_err());
    }

    #[test]
    fn test_file_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();

        let mut ctx = ZipExtractContext::temporary().unwrap();
        ctx.set_file_callback(Some(Box::new(move || {
            seen.fetch_add(1, Ordering::Relaxed);
        })));
        write_files(&mut ctx, &[("a", b"1"), ("b", b"2")]);

        assert_eq!(count.load(Ordering::Relaxed), 2);
        assert_eq!(ctx.num_files(), 2);

        let sub = ctx.into_sub_archive().unwrap();
        assert_eq!(sub.entries().len(), 2);
    }
}
