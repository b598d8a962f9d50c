//! Interfaces between the batch engine and the processing callbacks.
//!
//! A callback receives an [`AppContext`] for the file it handles. Through it
//! the callback reads the file, looks up sibling files in the same source,
//! and writes its results to an [`AppExtractContext`].

use std::io::Read;

use crate::error::Result;
use crate::vfs::EntryStream;

/// A per-file view of the batch, handed to processing callbacks.
pub trait AppContext {
    /// Full path of the file being processed, relative to its source.
    fn working_file(&self) -> &str;

    /// Open the file being processed.
    fn stream(&self) -> Result<EntryStream<'_>>;

    /// Up to `size` bytes of the file being processed, from `offset`.
    fn read_chunk(&self, offset: u64, size: u64) -> Result<Vec<u8>>;

    /// Open another file of the same source by its full path.
    fn request_file(&self, path: &str) -> Option<EntryStream<'_>>;

    /// First file under `root` matching `pattern`, with its full path.
    fn find_file(&self, root: &str, pattern: &str) -> Option<(String, EntryStream<'_>)>;

    /// Release a stream obtained from this context.
    fn dispose_file(&self, stream: EntryStream<'_>) {
        drop(stream);
    }

    /// The sink outputs of this file go to.
    fn extract_context(&mut self) -> Result<&mut dyn AppExtractContext>;
}

/// Sink for files produced while processing one input.
///
/// Only one output file is open at a time; [`new_file`](Self::new_file)
/// closes the previous one.
pub trait AppExtractContext {
    fn new_file(&mut self, path: &str) -> Result<()>;

    /// Append to the file opened by the last `new_file`.
    fn send_data(&mut self, data: &[u8]) -> Result<()>;

    /// Whether folders must be announced through `add_folder_path` and
    /// created with `generate_folders` before files are written into them.
    fn requires_folders(&self) -> bool;

    fn add_folder_path(&mut self, path: &str) -> Result<()>;

    fn generate_folders(&mut self) -> Result<()>;
}

/// Sink for packing a set of files into one archive.
///
/// Calls may come from several threads at once.
pub trait AppPackContext: Send + Sync {
    fn send_file(&self, path: &str, stream: &mut dyn Read) -> Result<()>;

    /// Write out the archive. Further `send_file` calls fail.
    fn finish(&self) -> Result<()>;
}
