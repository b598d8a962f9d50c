use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::error::{Error, Result};

/// Largest value a 32-bit ZIP field can carry before it must move to ZIP64.
pub const U32_LIMIT: u64 = 0xFFFF_FFFF;
const U16_LIMIT: u64 = 0xFFFF;

/// ZIP64 extended information extra field
pub const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Extra field holding a copy of the paired cache header ("CS")
pub const CHECKUP_EXTRA_ID: u16 = 0x4353;

const VERSION_STORE: u16 = 10;
const VERSION_ZIP64: u16 = 45;

const FLAG_ENCRYPTED: u16 = 0x0001;

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// Store `value` into a narrower field, saturating at the field's limit.
///
/// Returns the stored value and whether it overflowed.
fn clamp(value: u64, limit: u64) -> (u64, bool) {
    if value >= limit {
        (limit, true)
    } else {
        (value, false)
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::InvalidZip(
                "invalid end of central directory".into(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// Build the record for a finished directory.
    ///
    /// Overflowing fields are saturated; the returned flag tells the caller
    /// that ZIP64 records must be written in front of this one.
    pub fn for_directory(num_entries: u64, cd_size: u64, cd_offset: u64) -> (Self, bool) {
        let (entries, entries_over) = clamp(num_entries, U16_LIMIT);
        let (size, size_over) = clamp(cd_size, U32_LIMIT);
        let (offset, offset_over) = clamp(cd_offset, U32_LIMIT);

        let eocd = Self {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: entries as u16,
            total_entries: entries as u16,
            cd_size: size as u32,
            cd_offset: offset as u32,
            comment_len: 0,
        };

        (eocd, entries_over || size_over || offset_over)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.disk_number)?;
        w.write_u16::<LittleEndian>(self.disk_with_cd)?;
        w.write_u16::<LittleEndian>(self.disk_entries)?;
        w.write_u16::<LittleEndian>(self.total_entries)?;
        w.write_u32::<LittleEndian>(self.cd_size)?;
        w.write_u32::<LittleEndian>(self.cd_offset)?;
        w.write_u16::<LittleEndian>(self.comment_len)
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFFFFFF
            || self.cd_offset == 0xFFFFFFFF
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn new(eocd64_offset: u64) -> Self {
        Self {
            disk_with_eocd64: 0,
            eocd64_offset,
            total_disks: 1,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::InvalidZip("invalid ZIP64 locator".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u32::<LittleEndian>(self.disk_with_eocd64)?;
        w.write_u64::<LittleEndian>(self.eocd64_offset)?;
        w.write_u32::<LittleEndian>(self.total_disks)
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn for_directory(num_entries: u64, cd_size: u64, cd_offset: u64) -> Self {
        Self {
            // size of the remaining record, excluding signature and this field
            eocd64_size: (Self::MIN_SIZE - 12) as u64,
            version_made_by: VERSION_ZIP64,
            version_needed: VERSION_ZIP64,
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: num_entries,
            total_entries: num_entries,
            cd_size,
            cd_offset,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::InvalidZip(
                "invalid ZIP64 end of central directory".into(),
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>()?,
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u64::<LittleEndian>(self.eocd64_size)?;
        w.write_u16::<LittleEndian>(self.version_made_by)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u32::<LittleEndian>(self.disk_number)?;
        w.write_u32::<LittleEndian>(self.disk_with_cd)?;
        w.write_u64::<LittleEndian>(self.disk_entries)?;
        w.write_u64::<LittleEndian>(self.total_entries)?;
        w.write_u64::<LittleEndian>(self.cd_size)?;
        w.write_u64::<LittleEndian>(self.cd_offset)
    }
}

/// Write the records that close an archive: ZIP64 end record and locator
/// when any field overflowed, then the classic end record.
///
/// `position` is the absolute offset the first byte will land at.
pub fn write_directory_end<W: Write>(
    w: &mut W,
    position: u64,
    num_entries: u64,
    cd_size: u64,
    cd_offset: u64,
) -> io::Result<()> {
    let (eocd, needs_zip64) = EndOfCentralDirectory::for_directory(num_entries, cd_size, cd_offset);

    if needs_zip64 {
        Zip64EOCD::for_directory(num_entries, cd_size, cd_offset).write_to(w)?;
        Zip64EOCDLocator::new(position).write_to(w)?;
    }

    eocd.write_to(w)
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Fixed part of a Local File Header.
///
/// The file name and extra field follow it on disk; only their lengths are
/// kept here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

impl LocalFileHeader {
    /// A store-only header with sizes and CRC still unknown.
    pub fn stored(file_name_length: u16, last_mod_time: u16, last_mod_date: u16) -> Self {
        Self {
            version_needed: VERSION_STORE,
            last_mod_time,
            last_mod_date,
            file_name_length,
            ..Self::default()
        }
    }

    /// Fill in CRC and sizes once the data is complete.
    ///
    /// Sizes that overflow are saturated. There is no room left for a ZIP64
    /// extra in front of the data, so the central directory entry is the
    /// authoritative source for such sizes.
    pub fn set_data(&mut self, crc32: u32, size: u64) {
        let (size, _) = clamp(size, U32_LIMIT);
        self.crc32 = crc32;
        self.compressed_size = size as u32;
        self.uncompressed_size = size as u32;
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < LFH_SIZE || &data[0..4] != LFH_SIGNATURE {
            return Err(Error::InvalidZip("invalid local file header".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            version_needed: cursor.read_u16::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
            compression_method: cursor.read_u16::<LittleEndian>()?,
            last_mod_time: cursor.read_u16::<LittleEndian>()?,
            last_mod_date: cursor.read_u16::<LittleEndian>()?,
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()?,
            uncompressed_size: cursor.read_u32::<LittleEndian>()?,
            file_name_length: cursor.read_u16::<LittleEndian>()?,
            extra_field_length: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(LFH_SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.compression_method)?;
        w.write_u16::<LittleEndian>(self.last_mod_time)?;
        w.write_u16::<LittleEndian>(self.last_mod_date)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(self.compressed_size)?;
        w.write_u32::<LittleEndian>(self.uncompressed_size)?;
        w.write_u16::<LittleEndian>(self.file_name_length)?;
        w.write_u16::<LittleEndian>(self.extra_field_length)
    }

    /// Bytes between the header start and the first data byte.
    pub fn data_start(&self) -> u64 {
        LFH_SIZE as u64 + self.file_name_length as u64 + self.extra_field_length as u64
    }
}

/// One central directory entry, as parsed or as about to be written.
///
/// Sizes and the local header offset are always held at full width. Whether
/// they need a ZIP64 extra is decided when the entry is written, so an entry
/// that gets rebased past 4 GiB picks up the extra on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipFileEntry {
    pub file_name: String,
    pub compression_method: CompressionMethod,
    pub flags: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub lfh_offset: u64,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    /// Extra fields other than ZIP64, kept raw
    pub extra: Vec<u8>,
}

impl ZipFileEntry {
    /// A store-only entry as produced by the archive writers.
    pub fn stored(
        file_name: String,
        crc32: u32,
        size: u64,
        lfh_offset: u64,
        last_mod_time: u16,
        last_mod_date: u16,
    ) -> Self {
        Self {
            file_name,
            compression_method: CompressionMethod::Stored,
            flags: 0,
            compressed_size: size,
            uncompressed_size: size,
            crc32,
            lfh_offset,
            last_mod_time,
            last_mod_date,
            extra: Vec::new(),
        }
    }

    /// Parse a Central Directory File Header from a cursor.
    pub fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut sig = [0u8; 4];
        cursor.read_exact(&mut sig)?;
        if sig != CDFH_SIGNATURE {
            return Err(Error::InvalidZip(format!(
                "unexpected record {:02x?} in central directory",
                sig
            )));
        }

        let _version_made_by = cursor.read_u16::<LittleEndian>()?;
        let _version_needed = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let compression_method = cursor.read_u16::<LittleEndian>()?;
        let last_mod_time = cursor.read_u16::<LittleEndian>()?;
        let last_mod_date = cursor.read_u16::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
        let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
        let file_name_length = cursor.read_u16::<LittleEndian>()?;
        let extra_field_length = cursor.read_u16::<LittleEndian>()?;
        let file_comment_length = cursor.read_u16::<LittleEndian>()?;
        let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
        let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
        let _external_attrs = cursor.read_u32::<LittleEndian>()?;
        let mut lfh_offset = cursor.read_u32::<LittleEndian>()? as u64;

        let mut file_name_bytes = vec![0u8; file_name_length as usize];
        cursor.read_exact(&mut file_name_bytes)?;
        // Use lossy conversion to handle non-UTF8 filenames gracefully
        let file_name = String::from_utf8_lossy(&file_name_bytes).into_owned();

        let mut extra_bytes = vec![0u8; extra_field_length as usize];
        cursor.read_exact(&mut extra_bytes)?;

        let mut extra = Vec::new();
        let mut fields = Cursor::new(extra_bytes.as_slice());
        let extra_end = extra_bytes.len() as u64;

        while fields.position() + 4 <= extra_end {
            let field_start = fields.position() as usize;
            let header_id = fields.read_u16::<LittleEndian>()?;
            let field_size = fields.read_u16::<LittleEndian>()? as u64;
            let field_end = (fields.position() + field_size).min(extra_end);

            if header_id == ZIP64_EXTRA_ID {
                // Fields are present only if the header field is saturated
                if uncompressed_size == U32_LIMIT && fields.position() + 8 <= field_end {
                    uncompressed_size = fields.read_u64::<LittleEndian>()?;
                }
                if compressed_size == U32_LIMIT && fields.position() + 8 <= field_end {
                    compressed_size = fields.read_u64::<LittleEndian>()?;
                }
                if lfh_offset == U32_LIMIT && fields.position() + 8 <= field_end {
                    lfh_offset = fields.read_u64::<LittleEndian>()?;
                }
            } else {
                extra.extend_from_slice(&extra_bytes[field_start..field_end as usize]);
            }

            fields.set_position(field_end);
        }

        // Skip over the file comment (we don't use it)
        cursor.set_position(cursor.position() + file_comment_length as u64);

        Ok(Self {
            file_name,
            compression_method: CompressionMethod::from_u16(compression_method),
            flags,
            compressed_size,
            uncompressed_size,
            crc32,
            lfh_offset,
            last_mod_time,
            last_mod_date,
            extra,
        })
    }

    /// The ZIP64 extra this entry needs, if any.
    ///
    /// Only overflowing fields are present, in the order the format mandates:
    /// uncompressed size, compressed size, local header offset.
    pub fn zip64_extra(&self) -> Option<Vec<u8>> {
        let sizes = self.uncompressed_size >= U32_LIMIT || self.compressed_size >= U32_LIMIT;
        let offset = self.lfh_offset >= U32_LIMIT;

        if !sizes && !offset {
            return None;
        }

        let mut payload = Vec::with_capacity(24);
        if sizes {
            payload.extend_from_slice(&self.uncompressed_size.to_le_bytes());
            payload.extend_from_slice(&self.compressed_size.to_le_bytes());
        }
        if offset {
            payload.extend_from_slice(&self.lfh_offset.to_le_bytes());
        }

        let mut field = Vec::with_capacity(4 + payload.len());
        field.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        field.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        field.extend_from_slice(&payload);
        Some(field)
    }

    fn zip64_extra_len(&self) -> usize {
        let sizes = self.uncompressed_size >= U32_LIMIT || self.compressed_size >= U32_LIMIT;
        let offset = self.lfh_offset >= U32_LIMIT;
        let mut len = 0;
        if sizes {
            len += 16;
        }
        if offset {
            len += 8;
        }
        if len > 0 { len + 4 } else { 0 }
    }

    /// Size of this entry once written to the central directory.
    pub fn encoded_len(&self) -> usize {
        CDFH_MIN_SIZE + self.file_name.len() + self.zip64_extra_len() + self.extra.len()
    }

    /// Position of the `extra` bytes relative to the start of the written entry.
    pub fn raw_extra_position(&self) -> usize {
        CDFH_MIN_SIZE + self.file_name.len() + self.zip64_extra_len()
    }

    /// Append a raw extra field.
    pub fn push_extra(&mut self, id: u16, payload: &[u8]) {
        self.extra.extend_from_slice(&id.to_le_bytes());
        self.extra.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        self.extra.extend_from_slice(payload);
    }

    /// Payload of the first raw extra field with `id`.
    pub fn find_extra(&self, id: u16) -> Option<&[u8]> {
        let mut pos = 0;
        while pos + 4 <= self.extra.len() {
            let field_id = u16::from_le_bytes([self.extra[pos], self.extra[pos + 1]]);
            let size = u16::from_le_bytes([self.extra[pos + 2], self.extra[pos + 3]]) as usize;
            let end = (pos + 4 + size).min(self.extra.len());
            if field_id == id {
                return Some(&self.extra[pos + 4..end]);
            }
            pos = end;
        }
        None
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let zip64 = self.zip64_extra();
        let version = if zip64.is_some() {
            VERSION_ZIP64
        } else {
            VERSION_STORE
        };
        let zip64 = zip64.unwrap_or_default();

        let extra_len = zip64.len() + self.extra.len();
        if extra_len > u16::MAX as usize || self.file_name.len() > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("central directory entry {} is too large", self.file_name),
            ));
        }

        w.write_all(CDFH_SIGNATURE)?;
        w.write_u16::<LittleEndian>(version)?;
        w.write_u16::<LittleEndian>(version)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.compression_method.as_u16())?;
        w.write_u16::<LittleEndian>(self.last_mod_time)?;
        w.write_u16::<LittleEndian>(self.last_mod_date)?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(clamp(self.compressed_size, U32_LIMIT).0 as u32)?;
        w.write_u32::<LittleEndian>(clamp(self.uncompressed_size, U32_LIMIT).0 as u32)?;
        w.write_u16::<LittleEndian>(self.file_name.len() as u16)?;
        w.write_u16::<LittleEndian>(extra_len as u16)?;
        w.write_u16::<LittleEndian>(0)?; // comment
        w.write_u16::<LittleEndian>(0)?; // disk number start
        w.write_u16::<LittleEndian>(0)?; // internal attributes
        w.write_u32::<LittleEndian>(0)?; // external attributes
        w.write_u32::<LittleEndian>(clamp(self.lfh_offset, U32_LIMIT).0 as u32)?;
        w.write_all(self.file_name.as_bytes())?;
        w.write_all(&zip64)?;
        w.write_all(&self.extra)
    }

    pub fn is_directory(&self) -> bool {
        self.file_name.ends_with('/')
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }
}

/// Encode a timestamp as DOS (time, date).
pub fn dos_timestamp<T: chrono::Datelike + chrono::Timelike>(ts: &T) -> (u16, u16) {
    let year = (ts.year() - 1980).clamp(0, 127) as u16;
    let date = (year << 9) | ((ts.month() as u16) << 5) | ts.day() as u16;
    let time = ((ts.hour() as u16) << 11) | ((ts.minute() as u16) << 5) | (ts.second() as u16 / 2);
    (time, date)
}
