//! Batch orchestration.
//!
//! A [`Batch`] turns input paths into tasks: one per matching file, whether
//! the file is loose on disk or a member of an archive. Every task runs the
//! processing callback with a per-file [`AppContext`] and then hands its
//! output sink back. When the batch finishes, the per-worker output archives
//! are merged into one archive with its cache.
//!
//! Inputs are classified as:
//!
//! - a folder, scanned recursively; archives found inside are expanded
//!   when `scan_archives` is set
//! - a `.zip` file, every member of which is an input
//! - a plain file
//! - a path leading into an archive, such as `data.zip/models`, which
//!   selects part of that archive; these are collected per archive and
//!   processed by [`finish_batch`](Batch::finish_batch)
//!
//! An archive given as a whole is loaded once. Later requests for it, or for
//! paths inside it, are dropped.

mod contexts;
mod output;
mod worker;

pub use contexts::{FileContext, ZipEntryContext};
pub use worker::{InlineManager, MultiThreadManager, Task, WorkerManager};

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::context::AppContext;
use crate::error::Error;
use crate::io::{DirectoryScanner, ScanCallback};
use crate::pattern::PathFilter;
use crate::vfs::{ZipIoContext, ZipIoEntry, ZipIoEntryKind};
use contexts::relative_name;
use output::BatchOutput;

/// Processing callback, run once per input file.
pub type ProcessFn = dyn Fn(&mut dyn AppContext) -> Result<()> + Send + Sync;

/// Extract-stat callback: predicts how many files processing an input
/// would produce.
pub type StatFn = dyn Fn(&dyn AppContext) -> Result<usize> + Send + Sync;

pub type FolderCallback = Box<dyn FnMut(&Path, usize) + Send>;
pub type FolderFinishCallback = Box<dyn FnMut() + Send>;
pub type FileCountCallback = Box<dyn FnMut(usize) + Send>;

/// Predicted output counts gathered by an extract-stat pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractStats {
    /// Per input, keyed by its full path
    pub files: BTreeMap<String, usize>,
    pub total_files: usize,
}

impl ExtractStats {
    fn record(&mut self, key: String, count: usize) {
        self.total_files += count;
        if let Some(previous) = self.files.insert(key, count) {
            self.total_files -= previous;
        }
    }
}

trait TaskContext: AppContext + Send + 'static {
    fn key(&self) -> String;
    fn finish(self) -> crate::Result<()>;
}

impl TaskContext for FileContext {
    fn key(&self) -> String {
        self.full_path().to_string_lossy().into_owned()
    }

    fn finish(self) -> crate::Result<()> {
        FileContext::finish(self)
    }
}

impl TaskContext for ZipEntryContext {
    fn key(&self) -> String {
        format!("{}/{}", self.archive().path().display(), self.entry().as_str())
    }

    fn finish(self) -> crate::Result<()> {
        ZipEntryContext::finish(self)
    }
}

pub struct Batch {
    settings: Settings,
    filter: PathFilter,
    manager: WorkerManager,
    output: Arc<BatchOutput>,
    process: Arc<ProcessFn>,
    stat: Option<Arc<StatFn>>,
    stats: Arc<Mutex<ExtractStats>>,
    scanner: DirectoryScanner,
    /// Archives addressed by inner paths, with the prefixes selected so far
    pending: BTreeMap<PathBuf, PathFilter>,
    /// Archives added as a whole
    root_archives: HashSet<PathBuf>,
    for_each_folder: Option<FolderCallback>,
    for_each_folder_finish: Option<FolderFinishCallback>,
    update_file_count: Option<FileCountCallback>,
    num_queued: usize,
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Split `data.zip/inner/path` into the archive and the inner path.
fn split_archive_path(path: &Path) -> Option<(PathBuf, String)> {
    path.ancestors()
        .skip(1)
        .find(|ancestor| is_archive(ancestor) && ancestor.is_file())
        .and_then(|archive| Some((archive.to_path_buf(), relative_name(archive, path)?)))
}

impl Batch {
    pub fn new<F>(settings: Settings, process: F) -> Result<Self>
    where
        F: Fn(&mut dyn AppContext) -> Result<()> + Send + Sync + 'static,
    {
        let manager = WorkerManager::new(
            settings.queue_capacity_per_thread,
            settings.threads,
            settings.propagate_task_errors,
        )?;
        let filter = settings.filters.iter().cloned().collect();
        let output = Arc::new(BatchOutput::new(&settings));

        Ok(Self {
            settings,
            filter,
            manager,
            output,
            process: Arc::new(process),
            stat: None,
            stats: Arc::new(Mutex::new(ExtractStats::default())),
            scanner: DirectoryScanner::new(),
            pending: BTreeMap::new(),
            root_archives: HashSet::new(),
            for_each_folder: None,
            for_each_folder_finish: None,
            update_file_count: None,
            num_queued: 0,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Called with each input folder and the number of files queued from it.
    ///
    /// Archive inputs count as folders named after the archive without its
    /// extension. Archives expanded during a folder scan belong to that
    /// folder.
    pub fn set_for_each_folder(&mut self, cb: Option<FolderCallback>) {
        self.for_each_folder = cb;
    }

    /// Called once every task of an input folder or archive has completed.
    pub fn set_for_each_folder_finish(&mut self, cb: Option<FolderFinishCallback>) {
        self.for_each_folder_finish = cb;
    }

    /// Called with the number of files each input adds to the batch.
    pub fn set_update_file_count(&mut self, cb: Option<FileCountCallback>) {
        self.update_file_count = cb;
    }

    pub fn set_scan_callback(&mut self, cb: Option<ScanCallback>) {
        self.scanner.set_scan_callback(cb);
    }

    /// Run `stat` instead of the processing callback, collecting
    /// [`ExtractStats`]. `None` switches back to processing.
    pub fn set_stat_callback<F>(&mut self, stat: Option<F>)
    where
        F: Fn(&dyn AppContext) -> Result<usize> + Send + Sync + 'static,
    {
        self.stat = stat.map(|f| Arc::new(f) as Arc<StatFn>);
    }

    pub fn stats(&self) -> ExtractStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take_stats(&self) -> ExtractStats {
        std::mem::take(&mut *self.stats.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Tasks queued since the batch was created.
    pub fn num_queued(&self) -> usize {
        self.num_queued
    }

    /// Tasks that failed or panicked.
    pub fn num_failures(&self) -> usize {
        self.manager.num_failures()
    }

    /// Output files written so far.
    pub fn files_written(&self) -> usize {
        self.output.files_written()
    }

    fn count_files(&mut self, count: usize) {
        if let Some(cb) = &mut self.update_file_count {
            cb(count);
        }
    }

    fn spawn<C, F>(&mut self, make: F) -> Result<()>
    where
        C: TaskContext,
        F: FnOnce() -> C + Send + 'static,
    {
        let process = self.process.clone();
        let stat = self.stat.clone();
        let stats = self.stats.clone();

        self.num_queued += 1;
        self.manager.push(Box::new(move || {
            let mut ctx = make();

            match stat {
                Some(stat) => {
                    let count = stat(&ctx)
                        .with_context(|| format!("Failed stat of {}", ctx.working_file()))?;
                    stats
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record(ctx.key(), count);
                }
                None => process(&mut ctx)
                    .with_context(|| format!("Failed processing {}", ctx.working_file()))?,
            }

            ctx.finish()?;
            Ok(())
        }))
    }

    fn spawn_file(&mut self, base: &Path, name: String) -> Result<()> {
        let base = base.to_path_buf();
        let output = self.output.clone();
        self.spawn(move || FileContext::new(base, name).with_output(output, String::new()))
    }

    /// Queue one input, see the module documentation for how it is read.
    pub fn add_file(&mut self, path: &Path) -> Result<()> {
        if path.is_dir() {
            return self.add_folder(path);
        }

        if path.is_file() {
            if is_archive(path) {
                if !self.root_archives.insert(path.to_path_buf()) {
                    debug!("{} is already loaded", path.display());
                    return Ok(());
                }
                self.pending.remove(path);
                return self.add_archive(path, &PathFilter::new());
            }

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;
            let base = path.parent().unwrap_or(Path::new(""));

            self.count_files(1);
            return self.spawn_file(base, name);
        }

        match split_archive_path(path) {
            Some((archive, _)) if self.root_archives.contains(&archive) => {
                debug!("{} is already loaded whole", archive.display());
                Ok(())
            }
            Some((archive, inner)) => {
                debug!("Deferring {} inside {}", inner, archive.display());
                self.pending
                    .entry(archive)
                    .or_default()
                    .add_filter(format!("^{}", inner));
                Ok(())
            }
            None => {
                warn!("Invalid path: {}", path.display());
                Err(Error::InvalidPath(path.display().to_string()).into())
            }
        }
    }

    fn add_folder(&mut self, dir: &Path) -> Result<()> {
        self.scanner.clear();
        self.scanner.scan(dir);

        let mut loose = Vec::new();
        let mut archives = Vec::new();

        for file in self.scanner.take_files() {
            if self.settings.scan_archives && is_archive(&file) {
                archives.push(file);
            } else if let Some(name) = relative_name(dir, &file)
                && self.filter.is_filtered(&name)
            {
                loose.push(name);
            }
        }

        debug!(
            "{}: {} files, {} archives",
            dir.display(),
            loose.len(),
            archives.len()
        );

        if let Some(cb) = &mut self.for_each_folder {
            cb(dir, loose.len());
        }
        self.count_files(loose.len());

        for name in loose {
            self.spawn_file(dir, name)?;
        }

        for archive in archives {
            let queued = self
                .load_archive(&archive, &PathFilter::new())
                .and_then(|(zip, entries)| self.spawn_archive(&archive, zip, entries));
            if let Err(e) = queued {
                error!("Skipping archive {}: {:#}", archive.display(), e);
            }
        }

        self.finish_folder()
    }

    /// Wait for the current folder and report it done, if anyone listens.
    fn finish_folder(&mut self) -> Result<()> {
        if let Some(cb) = &mut self.for_each_folder_finish {
            let waited = self.manager.wait();
            cb();
            waited?;
        }
        Ok(())
    }

    /// Queue the members of `path` passing both `selection` and the batch
    /// filters, as one folder.
    fn add_archive(&mut self, path: &Path, selection: &PathFilter) -> Result<()> {
        let (zip, entries) = self.load_archive(path, selection)?;

        if let Some(cb) = &mut self.for_each_folder {
            cb(&path.with_extension(""), entries.len());
        }
        self.spawn_archive(path, zip, entries)?;

        self.finish_folder()
    }

    fn load_archive(
        &self,
        path: &Path,
        selection: &PathFilter,
    ) -> Result<(Arc<ZipIoContext>, Vec<ZipIoEntry<'static>>)> {
        info!("Loading ZIP vfs: {}", path.display());

        let archive = if self.settings.filtered_load {
            ZipIoContext::open_filtered(path, selection, &self.filter)
        } else {
            ZipIoContext::open(path)
        }
        .with_context(|| format!("Cannot load {}", path.display()))?;
        let archive = Arc::new(archive);

        let entries: Vec<ZipIoEntry<'static>> = archive
            .iter(ZipIoEntryKind::String)
            .filter(|e| selection.is_filtered(&e.name) && self.filter.is_filtered(&e.name))
            .map(ZipIoEntry::into_owned)
            .collect();

        debug!("{}: {} of {} files", path.display(), entries.len(), archive.num_files());
        Ok((archive, entries))
    }

    fn spawn_archive(
        &mut self,
        path: &Path,
        archive: Arc<ZipIoContext>,
        entries: Vec<ZipIoEntry<'static>>,
    ) -> Result<()> {
        let prefix = if self.settings.folder_per_archive {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            String::new()
        };

        self.count_files(entries.len());

        for entry in entries {
            let archive = archive.clone();
            let output = self.output.clone();
            let prefix = prefix.clone();
            self.spawn(move || archive.instance(entry).with_output(output, prefix))?;
        }

        Ok(())
    }

    /// Block until every queued task has completed.
    pub fn wait(&self) -> Result<()> {
        self.manager.wait()
    }

    /// Process deferred archive paths, wait for every task and write the
    /// output archive.
    ///
    /// Everything queued runs even when some tasks fail; the first failure
    /// is returned afterwards when `propagate_task_errors` is set.
    pub fn finish_batch(&mut self) -> Result<()> {
        let mut first_error = None;

        for (archive, selection) in std::mem::take(&mut self.pending) {
            if let Err(e) = self.add_archive(&archive, &selection) {
                error!("{:#}", e);
                first_error.get_or_insert(e);
            }
        }

        let waited = self.manager.wait();
        let finished = self.output.finish();

        if let Some(path) = self.output.path() {
            info!(
                "Batch done: {} tasks, {} failed, {} files written to {}",
                self.num_queued,
                self.num_failures(),
                self.files_written(),
                path.display()
            );
        }

        waited?;
        finished.context("Cannot write batch output")?;
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(inline: bool) -> Settings {
        Settings {
            queue_capacity_per_thread: if inline { 0 } else { 2 },
            threads: 2,
            propagate_task_errors: true,
            ..Settings::default()
        }
    }

    fn collecting_batch(settings: Settings) -> (Batch, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let batch = Batch::new(settings, move |ctx| {
            sink.lock().unwrap().push(ctx.working_file().to_string());
            Ok(())
        })
        .unwrap();
        (batch, seen)
    }

    fn sorted(seen: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        seen
    }

    #[test]
    fn test_split_archive_path() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("data.zip");
        std::fs::write(&archive, crate::zip::build_zip(&[("m/a.txt", b"a")])).unwrap();

        let (found, inner) = split_archive_path(&archive.join("m/a.txt")).unwrap();
        assert_eq!(found, archive);
        assert_eq!(inner, "m/a.txt");
        assert!(split_archive_path(&dir.path().join("missing/x")).is_none());
    }

    #[test]
    fn test_folder_with_filters_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.bin"), b"b").unwrap();
        std::fs::write(dir.path().join("sub/c.txt"), b"c").unwrap();
        std::fs::write(
            dir.path().join("sub/pack.zip"),
            crate::zip::build_zip(&[("in/d.txt", b"d"), ("in/e.bin", b"e")]),
        )
        .unwrap();

        let mut settings = settings(false);
        settings.filters = vec![".txt$".into()];
        let (mut batch, seen) = collecting_batch(settings);

        let folders = Arc::new(AtomicUsize::new(0));
        let counted = folders.clone();
        batch.set_for_each_folder(Some(Box::new(move |_: &Path, n: usize| {
            counted.fetch_add(n, Ordering::SeqCst);
        })));

        batch.add_file(dir.path()).unwrap();
        batch.finish_batch().unwrap();

        assert_eq!(sorted(&seen), ["a.txt", "in/d.txt", "sub/c.txt"]);
        assert_eq!(folders.load(Ordering::SeqCst), 2);
        assert_eq!(batch.num_queued(), 3);
    }

    #[test]
    fn test_inner_archive_paths_are_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("data.zip");
        std::fs::write(
            &archive,
            crate::zip::build_zip(&[("x/1.txt", b"1"), ("x/2.txt", b"2"), ("y/3.txt", b"3")]),
        )
        .unwrap();

        let (mut batch, seen) = collecting_batch(settings(true));
        batch.add_file(&archive.join("x")).unwrap();
        batch.add_file(&archive.join("y/3.txt")).unwrap();
        assert!(seen.lock().unwrap().is_empty());

        batch.finish_batch().unwrap();
        assert_eq!(sorted(&seen), ["x/1.txt", "x/2.txt", "y/3.txt"]);

        assert!(batch.add_file(&dir.path().join("nothing/here")).is_err());
    }

    #[test]
    fn test_archive_requests_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("data.zip");
        std::fs::write(
            &archive,
            crate::zip::build_zip(&[("x/1.txt", b"1"), ("y/2.txt", b"2")]),
        )
        .unwrap();

        let (mut batch, seen) = collecting_batch(settings(false));
        batch.add_file(&archive.join("x")).unwrap();
        batch.add_file(&archive).unwrap();
        batch.add_file(&archive).unwrap();
        batch.add_file(&archive.join("y")).unwrap();
        batch.finish_batch().unwrap();

        assert_eq!(sorted(&seen), ["x/1.txt", "y/2.txt"]);
        assert_eq!(batch.num_queued(), 2);
    }

    #[test]
    fn test_folder_hooks_for_archives() {
        let dir = tempfile::tempdir().unwrap();
        let whole = dir.path().join("whole.zip");
        std::fs::write(
            &whole,
            crate::zip::build_zip(&[("a/1.txt", b"1"), ("a/2.txt", b"2")]),
        )
        .unwrap();
        let partial = dir.path().join("partial.zip");
        std::fs::write(
            &partial,
            crate::zip::build_zip(&[("x/1.txt", b"1"), ("y/2.txt", b"2")]),
        )
        .unwrap();

        let (mut batch, seen) = collecting_batch(settings(false));

        let folders = Arc::new(Mutex::new(Vec::new()));
        let opened = folders.clone();
        batch.set_for_each_folder(Some(Box::new(move |folder: &Path, n: usize| {
            opened.lock().unwrap().push((folder.to_path_buf(), n));
        })));

        // Tasks processed when each folder reports finished
        let finished = Arc::new(Mutex::new(Vec::new()));
        let closed = finished.clone();
        let done = seen.clone();
        batch.set_for_each_folder_finish(Some(Box::new(move || {
            closed.lock().unwrap().push(done.lock().unwrap().len());
        })));

        batch.add_file(&whole).unwrap();
        batch.add_file(&partial.join("x")).unwrap();
        assert_eq!(finished.lock().unwrap().len(), 1);
        batch.finish_batch().unwrap();

        assert_eq!(
            *folders.lock().unwrap(),
            [(dir.path().join("whole"), 2), (dir.path().join("partial"), 1)]
        );
        assert_eq!(*finished.lock().unwrap(), [2, 3]);
        assert_eq!(sorted(&seen), ["a/1.txt", "a/2.txt", "x/1.txt"]);
    }

    #[test]
    fn test_outputs_merge_into_archive() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        for i in 0..8 {
            std::fs::write(input.join(format!("{}.txt", i)), format!("file {}", i)).unwrap();
        }

        let out = dir.path().join("out.zip");
        let mut settings = settings(false);
        settings.output = Some(out.clone());

        let mut batch = Batch::new(settings, |ctx| {
            let mut text = String::new();
            ctx.stream()?.read_to_string(&mut text)?;
            let name = format!("upper/{}", ctx.working_file());

            let out = ctx.extract_context()?;
            out.new_file(&name)?;
            out.send_data(text.to_uppercase().as_bytes())?;
            Ok(())
        })
        .unwrap();

        batch.add_file(&input).unwrap();
        batch.finish_batch().unwrap();
        assert_eq!(batch.files_written(), 8);

        let zip = ZipIoContext::open(&out).unwrap();
        assert!(zip.is_cached());
        assert_eq!(zip.num_files(), 8);
        let entry = zip.lookup("upper/5.txt");
        assert_eq!(zip.get_chunk(entry, 0, entry.size).unwrap(), b"FILE 5");
    }

    #[test]
    fn test_failures_do_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["good1", "bad", "good2"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }

        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let mut batch = Batch::new(settings(false), move |ctx| {
            if ctx.working_file() == "bad" {
                anyhow::bail!("cannot handle this one");
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        batch.add_file(dir.path()).unwrap();
        let result = batch.finish_batch();

        assert!(result.is_err());
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(batch.num_failures(), 1);
    }

    #[test]
    fn test_extract_stats_pass() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"abc").unwrap();
        std::fs::write(dir.path().join("b"), b"abcdef").unwrap();

        let (mut batch, seen) = collecting_batch(settings(true));
        batch.set_stat_callback(Some(|ctx: &dyn AppContext| {
            Ok(ctx.read_chunk(0, 64)?.len())
        }));

        batch.add_file(dir.path()).unwrap();
        batch.finish_batch().unwrap();

        let stats = batch.take_stats();
        assert_eq!(stats.total_files, 9);
        assert_eq!(stats.files.len(), 2);
        assert!(seen.lock().unwrap().is_empty());
    }
}
