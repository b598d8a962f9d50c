//! Error types for the core library.
//!
//! Not-found conditions are never errors here: lookups return sentinels
//! ([`ZipEntry`](crate::vfs::ZipEntry) with zero size, empty
//! [`ZipIoEntry`](crate::vfs::ZipIoEntry)) or `None`. Everything below is
//! either a format problem or an unsupported feature, and aborts the
//! operation that hit it.

use std::io;

use thiserror::Error;

/// Errors produced by the cache, ZIP and output layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid cache magic")]
    InvalidCacheMagic,

    #[error("Unsupported cache version: {0}")]
    UnsupportedCacheVersion(u8),

    #[error("Corrupted cache: {0}")]
    CorruptedCache(&'static str),

    #[error("Invalid ZIP: {0}")]
    InvalidZip(String),

    #[error("Unsupported ZIP entry {name}: {reason}")]
    UnsupportedEntry { name: String, reason: &'static str },

    #[error("Cache header and ZIP checkup record are different")]
    CheckupMismatch,

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Read of {size} bytes at {offset} is out of bounds")]
    OutOfBounds { offset: u64, size: u64 },

    #[error("No file is open, call new_file first")]
    NoOpenFile,

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
