//! Seekless lookup cache for large archives.
//!
//! A cache is a flat binary trie of every file in one archive, written next
//! to it as `<archive>.cache`. Loading it replaces the central directory
//! parse: a lookup is one binary search per path component over mapped
//! memory. The cache and its archive are paired through a checkup record,
//! see [`CacheBaseHeader`].

mod format;
mod generator;
mod reader;
mod slider;

pub use format::{
    BASE_HEADER_SIZE, CACHE_MAGIC, CACHE_VERSION, CacheBaseHeader, MAX_LEVELS, split_path,
};
pub use generator::{CacheGenerator, Metrics};
pub use reader::Cache;
pub use slider::{PARALLEL_SEARCH_THRESHOLD, StringSlider};

use std::path::{Path, PathBuf};

/// Where the cache paired with `archive` lives.
pub fn cache_path(archive: &Path) -> PathBuf {
    let mut path = archive.as_os_str().to_os_string();
    path.push(".cache");
    PathBuf::from(path)
}
