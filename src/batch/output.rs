//! Where a batch's outputs go.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::cache::cache_path;
use crate::config::Settings;
use crate::context::AppExtractContext;
use crate::error::{Error, Result};
use crate::output::{IoExtractContext, ZipExtractContext, ZipMerger};

pub(crate) enum OutputKind {
    /// Outputs were not requested
    Disabled,
    Folder(PathBuf),
    /// Per-worker archives, merged into `path` when the batch finishes
    Archive {
        path: PathBuf,
        generate_cache: bool,
        idle: Mutex<Vec<ZipExtractContext>>,
    },
}

/// Output shared by every task of a batch.
pub(crate) struct BatchOutput {
    kind: OutputKind,
    files_written: Arc<AtomicUsize>,
}

impl BatchOutput {
    pub(crate) fn new(settings: &Settings) -> Self {
        let kind = match &settings.output {
            None => OutputKind::Disabled,
            Some(path) if settings.create_output_zip => OutputKind::Archive {
                path: path.clone(),
                generate_cache: settings.generate_cache,
                idle: Mutex::new(Vec::new()),
            },
            Some(path) => OutputKind::Folder(path.clone()),
        };

        Self {
            kind,
            files_written: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn files_written(&self) -> usize {
        self.files_written.load(Ordering::Relaxed)
    }

    fn counter(&self) -> Box<dyn FnMut() + Send> {
        let files_written = self.files_written.clone();
        Box::new(move || {
            files_written.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn acquire(&self, prefix: &str) -> Result<Sink> {
        match &self.kind {
            OutputKind::Disabled => Err(Error::Io(std::io::Error::other(
                "no output is configured for this batch",
            ))),
            OutputKind::Folder(dir) => {
                let mut ctx = IoExtractContext::new(dir.join(prefix));
                ctx.set_file_callback(Some(self.counter()));
                Ok(Sink::Folder(ctx))
            }
            OutputKind::Archive { idle, .. } => {
                let reused = idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
                let mut ctx = match reused {
                    Some(ctx) => ctx,
                    None => {
                        let mut ctx = ZipExtractContext::temporary()?;
                        ctx.set_file_callback(Some(self.counter()));
                        ctx
                    }
                };
                ctx.set_prefix(prefix);
                Ok(Sink::Zip(ctx))
            }
        }
    }

    fn release(&self, sink: Sink) -> Result<()> {
        match sink {
            Sink::Folder(mut ctx) => ctx.close(),
            Sink::Zip(ctx) => {
                if let OutputKind::Archive { idle, .. } = &self.kind {
                    idle.lock().unwrap_or_else(PoisonError::into_inner).push(ctx);
                }
                Ok(())
            }
        }
    }

    /// Merge every per-worker archive into the output archive.
    ///
    /// Must only run while no task holds a sink.
    pub(crate) fn finish(&self) -> Result<()> {
        let OutputKind::Archive {
            path,
            generate_cache,
            idle,
        } = &self.kind
        else {
            return Ok(());
        };

        let parts = std::mem::take(&mut *idle.lock().unwrap_or_else(PoisonError::into_inner));
        if parts.iter().all(|part| part.num_files() == 0) {
            debug!("Nothing was written, {} not created", path.display());
            return Ok(());
        }

        info!("Merging {} archives into {}", parts.len(), path.display());
        let records = BufWriter::new(File::create(path)?);
        let mut merger = if *generate_cache {
            ZipMerger::with_cache(records, cache_path(path))?
        } else {
            ZipMerger::new(records)?
        };

        for part in parts {
            merger.merge(part.into_sub_archive()?)?;
        }

        let records = merger.finish_merge()?;
        records.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        Ok(())
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        match &self.kind {
            OutputKind::Disabled => None,
            OutputKind::Folder(path) => Some(path),
            OutputKind::Archive { path, .. } => Some(path),
        }
    }
}

enum Sink {
    Zip(ZipExtractContext),
    Folder(IoExtractContext),
}

impl Sink {
    fn as_extract_context(&mut self) -> &mut dyn AppExtractContext {
        match self {
            Sink::Zip(ctx) => ctx,
            Sink::Folder(ctx) => ctx,
        }
    }
}

/// A task's claim on the batch output, taken on first use.
pub(crate) struct OutputLease {
    output: Arc<BatchOutput>,
    prefix: String,
    sink: Option<Sink>,
}

impl OutputLease {
    pub(crate) fn new(output: Arc<BatchOutput>, prefix: String) -> Self {
        Self {
            output,
            prefix,
            sink: None,
        }
    }

    pub(crate) fn get(&mut self) -> Result<&mut dyn AppExtractContext> {
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => self.output.acquire(&self.prefix)?,
        };
        Ok(self.sink.insert(sink).as_extract_context())
    }

    /// Hand the sink back to the batch.
    pub(crate) fn release(&mut self) -> Result<()> {
        match self.sink.take() {
            Some(sink) => self.output.release(sink),
            None => Ok(()),
        }
    }
}

impl Drop for OutputLease {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed releasing output: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ZipIoContext;

    fn settings(output: &Path, zip: bool) -> Settings {
        Settings {
            output: Some(output.to_path_buf()),
            create_output_zip: zip,
            ..Settings::default()
        }
    }

    #[test]
    fn test_leases_merge_into_one_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.zip");
        let output = Arc::new(BatchOutput::new(&settings(&path, true)));

        let mut first = OutputLease::new(output.clone(), String::new());
        let mut second = OutputLease::new(output.clone(), "sub".into());
        first.get().unwrap().new_file("a.txt").unwrap();
        first.get().unwrap().send_data(b"aaa").unwrap();
        second.get().unwrap().new_file("b.txt").unwrap();
        second.get().unwrap().send_data(b"bb").unwrap();
        drop(first);
        drop(second);

        assert_eq!(output.files_written(), 2);
        output.finish().unwrap();

        let zip = ZipIoContext::open(&path).unwrap();
        assert!(zip.is_cached());
        assert_eq!(zip.lookup("sub/b.txt").size, 2);
        assert_eq!(zip.lookup("a.txt").size, 3);
    }

    #[test]
    fn test_folder_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = Arc::new(BatchOutput::new(&settings(dir.path(), false)));

        let mut lease = OutputLease::new(output.clone(), "pre".into());
        let ctx = lease.get().unwrap();
        assert!(ctx.requires_folders());
        ctx.new_file("x/y.txt").unwrap();
        ctx.send_data(b"y").unwrap();
        lease.release().unwrap();

        assert_eq!(std::fs::read(dir.path().join("pre/x/y.txt")).unwrap(), b"y");
        output.finish().unwrap();
    }

    #[test]
    fn test_disabled_output() {
        let output = Arc::new(BatchOutput::new(&Settings::default()));
        let mut lease = OutputLease::new(output.clone(), String::new());
        assert!(lease.get().is_err());
        assert!(output.path().is_none());
        output.finish().unwrap();
    }
}
