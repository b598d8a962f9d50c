//! # batchzip
//!
//! Batch processing of files held in folders and in store-only ZIP archives.
//!
//! Inputs are walked by a [`Batch`], which runs a processing callback once
//! per file on a fixed worker pool. Callbacks read their file through an
//! [`AppContext`] and write results through an
//! [`AppExtractContext`](context::AppExtractContext). The results of all
//! workers end up merged into a single store-only archive.
//!
//! Every archive written here is paired with a `<archive>.cache` file: a flat
//! binary trie of its members that [`ZipIoContext`] maps instead of parsing
//! the central directory. A checkup record stored in the archive ties the two
//! together, so a stale cache is detected and ignored.
//!
//! ## Features
//!
//! - ZIP64 archives, prepended stubs and trailing garbage
//! - Constrained glob lookups (`^`, `$`, one `*`), see [`pattern`]
//! - Archive members addressed like folders: `data.zip/models/hero.mdl`
//! - Per-worker output archives merged without recompression
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use batchzip::{Batch, Settings};
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings {
//!         output: Some("out.zip".into()),
//!         ..Settings::default()
//!     };
//!
//!     let mut batch = Batch::new(settings, |ctx| {
//!         let header = ctx.read_chunk(0, 4)?;
//!         if header == b"MDL1" {
//!             let name = format!("models/{}", ctx.working_file());
//!             let out = ctx.extract_context()?;
//!             out.new_file(&name)?;
//!             out.send_data(&header)?;
//!         }
//!         Ok(())
//!     })?;
//!
//!     batch.add_file(Path::new("assets"))?;
//!     batch.finish_batch()
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod io;
pub mod output;
pub mod pattern;
pub mod vfs;
pub mod zip;

pub use batch::{Batch, ExtractStats};
pub use cache::{Cache, CacheGenerator};
pub use cli::Cli;
pub use config::{Settings, SettingsProvider};
pub use context::{AppContext, AppExtractContext, AppPackContext};
pub use error::{Error, Result};
pub use io::{LocalFileReader, MappedFile, ReadAt};
pub use output::{IoExtractContext, ZipExtractContext, ZipMerger, ZipPackContext};
pub use pattern::{PathFilter, Pattern};
pub use vfs::{EntryStream, ZipEntry, ZipIoContext, ZipIoEntry, ZipIoEntryKind};
pub use zip::ZipFileEntry;
