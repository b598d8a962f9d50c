//! On-disk layout of the lookup cache.
//!
//! All fields are native-endian. Every reference is a signed 32-bit delta
//! from the position of the field holding it to its target.
//!
//! ```text
//! base header      32  magic, version, numLevels, maxPathSize, numFiles,
//!                      zipCRC, zipSize, zipCheckupOffset
//! extended header  16  cacheSize, root (rel), entries (rel), reserved
//! string pool          deduplicated path text, padded to 8
//! entries          40  per file, sorted by full path
//! nodes                per directory level, deepest first, root last
//! ```
//!
//! Entry record:
//!
//! ```text
//!  0 offset u64 | 8 size u64 | 16 parent rel | 20 path rel
//! 24 name [8] or (rel, 0) | 32 nameSize u16 | 34 pathSize u16 | 36 reserved
//! ```
//!
//! Node record:
//!
//! ```text
//!  0 parent rel (0 for root) | 4 numChildren u32 | 8 numFinals u32
//! 12 nameSize u16 | 14 reserved | 16 name [8] or (rel, 0)
//! 24 children rel * numChildren | finals rel * numFinals
//! ```

use byteorder::{NativeEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};

pub const CACHE_MAGIC: [u8; 4] = *b"SPCH";
pub const CACHE_VERSION: u8 = 3;

pub const BASE_HEADER_SIZE: usize = 32;
pub const HEADER_SIZE: usize = 48;
pub const ENTRY_SIZE: usize = 40;
pub const NODE_FIXED_SIZE: usize = 24;

/// Names up to this length live inside the record instead of the pool.
pub const INLINE_NAME_SIZE: usize = 8;

pub const MAX_LEVELS: usize = u8::MAX as usize;

pub(crate) mod entry {
    pub const OFFSET: usize = 0;
    pub const SIZE: usize = 8;
    pub const PARENT: usize = 16;
    pub const PATH: usize = 20;
    pub const NAME: usize = 24;
    pub const NAME_SIZE: usize = 32;
    pub const PATH_SIZE: usize = 34;
}

pub(crate) mod node {
    pub const PARENT: usize = 0;
    pub const NUM_CHILDREN: usize = 4;
    pub const NUM_FINALS: usize = 8;
    pub const NAME_SIZE: usize = 12;
    pub const NAME: usize = 16;
    pub const REFS: usize = 24;
}

pub(crate) mod header {
    pub const CACHE_SIZE: usize = 32;
    pub const ROOT: usize = 36;
    pub const ENTRIES: usize = 40;
}

/// The fixed header every cache starts with.
///
/// Its 32 serialized bytes double as the checkup record embedded in the
/// paired archive; a cache is only trusted when both copies are identical.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheBaseHeader {
    /// Deepest path, in components
    pub num_levels: u8,
    /// Longest path, in bytes
    pub max_path_size: u16,
    pub num_files: u32,
    /// CRC32 chained over every entry's CRC, in archive order
    pub zip_crc: u32,
    pub zip_size: u64,
    /// Absolute offset of the checkup payload inside the archive
    pub zip_checkup_offset: u64,
}

impl CacheBaseHeader {
    pub fn to_bytes(&self) -> [u8; BASE_HEADER_SIZE] {
        let mut buf = [0u8; BASE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&CACHE_MAGIC);
        buf[4] = CACHE_VERSION;
        buf[5] = self.num_levels;
        buf[6..8].copy_from_slice(&self.max_path_size.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.num_files.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.zip_crc.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.zip_size.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.zip_checkup_offset.to_ne_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.get(0..4) != Some(&CACHE_MAGIC[..]) {
            return Err(Error::InvalidCacheMagic);
        }

        if let Some(&version) = data.get(4)
            && version != CACHE_VERSION
        {
            return Err(Error::UnsupportedCacheVersion(version));
        }

        if data.len() < BASE_HEADER_SIZE {
            return Err(Error::CorruptedCache("truncated header"));
        }

        let mut cursor = Cursor::new(&data[5..BASE_HEADER_SIZE]);

        Ok(Self {
            num_levels: cursor.read_u8()?,
            max_path_size: cursor.read_u16::<NativeEndian>()?,
            num_files: cursor.read_u32::<NativeEndian>()?,
            zip_crc: cursor.read_u32::<NativeEndian>()?,
            zip_size: cursor.read_u64::<NativeEndian>()?,
            zip_checkup_offset: cursor.read_u64::<NativeEndian>()?,
        })
    }
}

/// Split a path into cache components.
///
/// Both separators are accepted; empty and `.` components are dropped, so
/// `./a//b\c` and `a/b/c` address the same file.
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
}
