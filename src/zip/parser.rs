//! Low-level ZIP archive parser.
//!
//! This module handles the binary parsing of ZIP file structures,
//! reading from any source that implements the [`ReadAt`] trait.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) near the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Read the Central Directory to get metadata for all files
//! 4. For reading, resolve each file's Local File Header to its data
//!
//! Archives may carry a prepended stub (self-extractors, signed blobs) or
//! trailing garbage. The stub size is inferred from where the directory
//! really ends versus where the EOCD says it should start, and every local
//! header offset is shifted by it.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::io::ReadAt;

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// How far before the locator a misplaced ZIP64 EOCD is searched for.
const ZIP64_SEARCH_SIZE: u64 = 0x1000;

/// Location of the central directory inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryInfo {
    /// Absolute offset of the first central directory entry
    pub cd_offset: u64,
    pub cd_size: u64,
    pub total_entries: u64,
    /// Bytes in front of the archive proper; added to every stored offset
    pub base_offset: u64,
}

/// Low-level ZIP file parser.
///
/// This struct handles reading and parsing ZIP structures from
/// a data source. It's generic over the reader type so the same code runs
/// over mapped archives and in-memory buffers.
///
/// ## Example
///
/// ```ignore
/// let parser = ZipParser::new(reader);
/// let entries = parser.list_files()?;
/// for entry in entries {
///     let offset = parser.get_data_offset(&entry)?;
///     // Read file data from offset...
/// }
/// ```
pub struct ZipParser<R: ReadAt> {
    /// The underlying data source
    reader: Arc<R>,
    /// Total size of the archive in bytes
    size: u64,
}

impl<R: ReadAt> ZipParser<R> {
    pub fn new(reader: Arc<R>) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    fn read_exact_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let buf = self.reader.read_chunk(offset, Some(len))?;
        if buf.len() != len {
            return Err(Error::OutOfBounds {
                offset,
                size: len as u64,
            });
        }
        Ok(buf)
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// The EOCD is located at the end of the ZIP file. This method
    /// handles both the simple case (no comment) and archives with
    /// comments or trailing bytes by searching backwards for the signature.
    ///
    /// # Returns
    ///
    /// A tuple of (EOCD record, offset of EOCD in file).
    pub fn find_eocd(&self) -> Result<(EndOfCentralDirectory, u64)> {
        // First try the simple case where there's no comment
        if self.size >= EndOfCentralDirectory::SIZE as u64 {
            let offset = self.size - EndOfCentralDirectory::SIZE as u64;
            let buf = self.read_exact_at(offset, EndOfCentralDirectory::SIZE)?;

            if &buf[0..4] == EndOfCentralDirectory::SIGNATURE && &buf[20..22] == b"\x00\x00" {
                let eocd = EndOfCentralDirectory::from_bytes(&buf)?;
                return Ok((eocd, offset));
            }
        }

        // EOCD not at expected location - search for it.
        // The EOCD could be earlier if there's a ZIP comment or junk after it.
        let search_size = (MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64).min(self.size);
        let search_start = self.size - search_size;
        let buf = self.read_exact_at(search_start, search_size as usize)?;
        if buf.len() < EndOfCentralDirectory::SIZE {
            return Err(Error::InvalidZip("file is too small".into()));
        }

        for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
            if &buf[i..i + 4] != EndOfCentralDirectory::SIGNATURE {
                continue;
            }

            // The comment must fit in what's left of the file; anything past
            // it is tolerated as trailing garbage.
            let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;

            if i + EndOfCentralDirectory::SIZE + comment_len <= buf.len() {
                let eocd =
                    EndOfCentralDirectory::from_bytes(&buf[i..i + EndOfCentralDirectory::SIZE])?;
                return Ok((eocd, search_start + i as u64));
            }
        }

        Err(Error::InvalidZip("end of central directory not found".into()))
    }

    /// Read the ZIP64 End of Central Directory record.
    ///
    /// Called when the regular EOCD indicates ZIP64 extensions are needed
    /// (fields set to 0xFFFF or 0xFFFFFFFF).
    ///
    /// # Returns
    ///
    /// The parsed record and its actual position in the file.
    pub fn read_zip64_eocd(&self, eocd_offset: u64) -> Result<(Zip64EOCD, u64)> {
        // The ZIP64 EOCD Locator is located immediately before the regular EOCD
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| Error::InvalidZip("missing ZIP64 locator".into()))?;
        let locator_buf = self.read_exact_at(locator_offset, Zip64EOCDLocator::SIZE)?;
        let locator = Zip64EOCDLocator::from_bytes(&locator_buf)?;

        if let Ok(buf) = self.read_exact_at(locator.eocd64_offset, Zip64EOCD::MIN_SIZE)
            && let Ok(eocd64) = Zip64EOCD::from_bytes(&buf)
        {
            return Ok((eocd64, locator.eocd64_offset));
        }

        // A prepended stub shifts the record away from where the locator
        // points; look for it right in front of the locator instead.
        let search_size = ZIP64_SEARCH_SIZE.min(locator_offset);
        let search_start = locator_offset - search_size;
        let buf = self.read_exact_at(search_start, search_size as usize)?;
        let last = buf.len().checked_sub(Zip64EOCD::MIN_SIZE);

        for i in last.into_iter().flat_map(|last| (0..=last).rev()) {
            if &buf[i..i + 4] == Zip64EOCD::SIGNATURE {
                let eocd64 = Zip64EOCD::from_bytes(&buf[i..])?;
                return Ok((eocd64, search_start + i as u64));
            }
        }

        Err(Error::InvalidZip(
            "ZIP64 end of central directory not found".into(),
        ))
    }

    /// Locate the central directory, resolving ZIP64 and prepended data.
    pub fn directory(&self) -> Result<DirectoryInfo> {
        let (eocd, eocd_offset) = self.find_eocd()?;

        let (cd_offset, cd_size, total_entries, end_offset) = if eocd.is_zip64() {
            let (eocd64, eocd64_offset) = self.read_zip64_eocd(eocd_offset)?;
            (
                eocd64.cd_offset,
                eocd64.cd_size,
                eocd64.total_entries,
                eocd64_offset,
            )
        } else {
            (
                eocd.cd_offset as u64,
                eocd.cd_size as u64,
                eocd.total_entries as u64,
                eocd_offset,
            )
        };

        // The directory ends right where the end record starts
        let base_offset = cd_offset
            .checked_add(cd_size)
            .and_then(|declared_end| end_offset.checked_sub(declared_end))
            .ok_or_else(|| Error::InvalidZip("central directory exceeds archive".into()))?;

        if base_offset > 0 {
            debug!("Archive has {} bytes of prepended data", base_offset);
        }

        Ok(DirectoryInfo {
            cd_offset: cd_offset + base_offset,
            cd_size,
            total_entries,
            base_offset,
        })
    }

    /// List all files in the ZIP archive.
    ///
    /// Reads the Central Directory to get metadata for all entries.
    /// Local header offsets in the result are absolute file offsets.
    pub fn list_files(&self) -> Result<Vec<ZipFileEntry>> {
        let mut entries = Vec::new();
        self.for_each_entry(|entry| {
            entries.push(entry);
            Ok(())
        })?;
        Ok(entries)
    }

    /// Walk every central directory entry in stored order.
    pub fn for_each_entry<F>(&self, mut cb: F) -> Result<()>
    where
        F: FnMut(ZipFileEntry) -> Result<()>,
    {
        let dir = self.directory()?;

        // Read the entire Central Directory in one go
        let cd_data = self.read_exact_at(dir.cd_offset, dir.cd_size as usize)?;
        let mut cursor = Cursor::new(cd_data.as_slice());

        for _ in 0..dir.total_entries {
            let mut entry = ZipFileEntry::read_from(&mut cursor)?;
            entry.lfh_offset = entry
                .lfh_offset
                .checked_add(dir.base_offset)
                .ok_or_else(|| Error::InvalidZip("local header offset overflows".into()))?;
            cb(entry)?;
        }

        Ok(())
    }

    /// Get the actual data offset for a file entry.
    ///
    /// The Local File Header (LFH) has variable-length fields (filename,
    /// extra field) that may differ from the Central Directory entry.
    /// This method reads the LFH to calculate where the actual file
    /// data begins.
    pub fn get_data_offset(&self, entry: &ZipFileEntry) -> Result<u64> {
        let lfh_buf = self.read_exact_at(entry.lfh_offset, LFH_SIZE)?;
        let lfh = LocalFileHeader::from_bytes(&lfh_buf)?;

        entry
            .lfh_offset
            .checked_add(lfh.data_start())
            .ok_or(Error::OutOfBounds {
                offset: entry.lfh_offset,
                size: lfh.data_start(),
            })
    }

    /// Data offset computed from raw header bytes already in memory.
    pub fn data_offset_in(data: &[u8], lfh_offset: u64) -> Result<u64> {
        let out_of_bounds = Error::OutOfBounds {
            offset: lfh_offset,
            size: LFH_SIZE as u64,
        };
        let header = usize::try_from(lfh_offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(LFH_SIZE)?))
            .and_then(|range| data.get(range))
            .ok_or(out_of_bounds)?;

        if &header[0..4] != LFH_SIGNATURE {
            return Err(Error::InvalidZip("invalid local file header".into()));
        }

        let mut cursor = Cursor::new(&header[26..]);
        let file_name_length = cursor.read_u16::<LittleEndian>()? as u64;
        let extra_field_length = cursor.read_u16::<LittleEndian>()? as u64;

        // Below `data.len()` plus 128 KiB, so no overflow once the header is in bounds
        Ok(lfh_offset + LFH_SIZE as u64 + file_name_length + extra_field_length)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::Crc;

    /// Build a store-only archive in memory.
    pub(crate) fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut entries = Vec::new();

        for (name, data) in files {
            let mut crc = Crc::new();
            crc.update(data);

            let mut lfh = LocalFileHeader::stored(name.len() as u16, 0, 0);
            lfh.set_data(crc.sum(), data.len() as u64);

            let offset = out.len() as u64;
            lfh.write_to(&mut out).unwrap();
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(data);

            entries.push(ZipFileEntry::stored(
                name.to_string(),
                crc.sum(),
                data.len() as u64,
                offset,
                0,
                0,
            ));
        }

        let cd_offset = out.len() as u64;
        for entry in &entries {
            entry.write_to(&mut out).unwrap();
        }
        let cd_size = out.len() as u64 - cd_offset;
        let position = out.len() as u64;
        write_directory_end(&mut out, position, entries.len() as u64, cd_size, cd_offset).unwrap();
        out
    }

    fn read_entry(data: &Arc<Vec<u8>>, entry: &ZipFileEntry) -> Vec<u8> {
        let parser = ZipParser::new(data.clone());
        let offset = parser.get_data_offset(entry).unwrap() as usize;
        data[offset..offset + entry.compressed_size as usize].to_vec()
    }

    #[test]
    fn test_list_files() {
        let data = Arc::new(build_zip(&[("a.txt", b"hello"), ("dir/b.txt", b"world!")]));
        let parser = ZipParser::new(data.clone());
        let entries = parser.list_files().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].file_name, "dir/b.txt");
        assert_eq!(read_entry(&data, &entries[1]), b"world!");
    }

    #[test]
    fn test_trailing_and_prepended_garbage() {
        let zip = build_zip(&[("a.txt", b"hello")]);

        let mut data = b"#!/bin/sh\nexit 0\n".to_vec();
        data.extend_from_slice(&zip);
        data.extend_from_slice(&[0xAB; 100]);
        let data = Arc::new(data);

        let parser = ZipParser::new(data.clone());
        let dir = parser.directory().unwrap();
        assert_eq!(dir.base_offset, 17);

        let entries = parser.list_files().unwrap();
        assert_eq!(entries[0].lfh_offset, 17);
        assert_eq!(read_entry(&data, &entries[0]), b"hello");
    }

    #[test]
    fn test_zip64_directory() {
        let mut out = Vec::new();
        let mut lfh = LocalFileHeader::stored(1, 0, 0);
        lfh.set_data(0, 3);
        lfh.write_to(&mut out).unwrap();
        out.extend_from_slice(b"xabc");

        let cd_offset = out.len() as u64;
        ZipFileEntry::stored("x".into(), 0, 3, 0, 0, 0)
            .write_to(&mut out)
            .unwrap();
        let cd_size = out.len() as u64 - cd_offset;

        // Force the ZIP64 path with saturated classic fields
        let eocd64_offset = out.len() as u64;
        Zip64EOCD::for_directory(1, cd_size, cd_offset)
            .write_to(&mut out)
            .unwrap();
        Zip64EOCDLocator::new(eocd64_offset).write_to(&mut out).unwrap();
        let (mut eocd, _) = EndOfCentralDirectory::for_directory(1, cd_size, cd_offset);
        eocd.cd_offset = 0xFFFFFFFF;
        eocd.write_to(&mut out).unwrap();

        let data = Arc::new(out);
        let parser = ZipParser::new(data.clone());
        let dir = parser.directory().unwrap();
        assert_eq!(dir.cd_offset, cd_offset);
        assert_eq!(dir.base_offset, 0);

        let entries = parser.list_files().unwrap();
        assert_eq!(read_entry(&data, &entries[0]), b"abc");
    }

    #[test]
    fn test_not_a_zip() {
        let data = Arc::new(vec![0u8; 64]);
        let parser = ZipParser::new(data);
        assert!(matches!(parser.list_files(), Err(Error::InvalidZip(_))));
    }

    #[test]
    fn test_unknown_directory_record() {
        let mut zip = build_zip(&[("a.txt", b"hello")]);
        let dir = ZipParser::new(Arc::new(zip.clone())).directory().unwrap();
        zip[dir.cd_offset as usize + 3] = 0x09;

        let parser = ZipParser::new(Arc::new(zip));
        assert!(matches!(parser.list_files(), Err(Error::InvalidZip(_))));
    }

    #[test]
    fn test_data_offset_in_memory() {
        let zip = build_zip(&[("abc", b"1234")]);
        assert_eq!(ZipParser::<Vec<u8>>::data_offset_in(&zip, 0).unwrap(), 33);
        assert!(ZipParser::<Vec<u8>>::data_offset_in(&zip, 1).is_err());
        assert!(matches!(
            ZipParser::<Vec<u8>>::data_offset_in(&zip, u64::MAX - 5),
            Err(Error::OutOfBounds { .. })
        ));
    }

    /// One-entry archive whose local header offset is `offset`, stored in a
    /// ZIP64 extra field when it needs one.
    fn with_zip64_offset(offset: u64) -> Vec<u8> {
        let mut out = Vec::new();
        let mut lfh = LocalFileHeader::stored(1, 0, 0);
        lfh.set_data(0, 3);
        lfh.write_to(&mut out).unwrap();
        out.extend_from_slice(b"xabc");

        let cd_offset = out.len() as u64;
        let mut entry = ZipFileEntry::stored("x".into(), 0, 3, 0, 0, 0);
        entry.lfh_offset = offset;
        entry.write_to(&mut out).unwrap();
        let cd_size = out.len() as u64 - cd_offset;
        let position = out.len() as u64;
        write_directory_end(&mut out, position, 1, cd_size, cd_offset).unwrap();
        out
    }

    #[test]
    fn test_huge_local_header_offset() {
        let data = Arc::new(with_zip64_offset(u64::MAX - 5));
        let parser = ZipParser::new(data.clone());

        let entries = parser.list_files().unwrap();
        assert_eq!(entries[0].lfh_offset, u64::MAX - 5);
        assert!(parser.get_data_offset(&entries[0]).is_err());
        assert!(matches!(
            ZipParser::<Vec<u8>>::data_offset_in(&data, entries[0].lfh_offset),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_offset_past_stub_overflows() {
        let mut data = vec![0u8; 16];
        data.extend_from_slice(&with_zip64_offset(u64::MAX - 5));

        let parser = ZipParser::new(Arc::new(data));
        assert_eq!(parser.directory().unwrap().base_offset, 16);
        assert!(matches!(parser.list_files(), Err(Error::InvalidZip(_))));
    }
}
