//! ZIP archive records, parsing and writing primitives.
//!
//! ## Architecture
//!
//! - [`structures`]: Data structures representing ZIP format elements (EOCD,
//!   file headers, ZIP64 records), each able to read and write itself
//! - [`parser`]: Locating and walking the central directory of an archive
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! This implementation reads the EOCD first (from the end of the file),
//! then the Central Directory, which allows listing files without reading
//! the payload.
//!
//! ## Supported Features
//!
//! - Standard ZIP format (PKZIP APPNOTE 6.3.x compatible)
//! - ZIP64 extensions for archives and files > 4GB
//! - STORED (no compression) method only for data access
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - Compressed entries are listed but refused when served

mod parser;
mod structures;

pub use parser::{DirectoryInfo, ZipParser};
pub use structures::*;

#[cfg(test)]
pub(crate) use parser::tests::build_zip;
