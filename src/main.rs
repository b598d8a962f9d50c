//! Command-line driver for batchzip.
//!
//! `extract` copies inputs into one merged archive (or folder), `pack` turns
//! folders into archives, `list` and `find` query an archive through its
//! cache when one is present.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use batchzip::cli::Command;
use batchzip::zip::{CompressionMethod, ZipParser};
use batchzip::{
    AppContext, AppPackContext, Batch, Cli, MappedFile, Settings, ZipIoContext, ZipIoEntryKind,
    ZipPackContext,
};

/// Bytes moved per read when copying a file to the output.
const COPY_BLOCK: u64 = 0x10000;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let settings = cli.settings()?;

    match &cli.command {
        Command::Extract {
            inputs,
            output,
            to_folder,
            filters,
            dry_run,
        } => {
            let mut settings = settings;
            settings.output = Some(output.clone());
            settings.create_output_zip = !to_folder;
            settings.filters.extend(filters.iter().cloned());
            extract(settings, inputs, *dry_run, cli.is_quiet())
        }
        Command::Pack { folders } => pack(settings, folders),
        Command::List { archive, verbose } => list(archive, *verbose),
        Command::Find {
            archive,
            pattern,
            all,
        } => find(archive, pattern, *all),
    }
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.is_very_quiet() {
        "error"
    } else if cli.is_quiet() {
        "warn"
    } else {
        "info"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Copy the file behind `ctx` to its output under the same path.
fn copy_file(ctx: &mut dyn AppContext) -> Result<()> {
    let name = ctx.working_file().to_string();

    let out = ctx.extract_context()?;
    if out.requires_folders()
        && let Some((folder, _)) = name.rsplit_once('/')
    {
        out.add_folder_path(folder)?;
        out.generate_folders()?;
    }
    out.new_file(&name)?;

    let mut offset = 0;
    loop {
        let chunk = ctx.read_chunk(offset, COPY_BLOCK)?;
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
        ctx.extract_context()?.send_data(&chunk)?;
    }

    Ok(())
}

fn extract(settings: Settings, inputs: &[PathBuf], dry_run: bool, quiet: bool) -> Result<()> {
    let output = settings.output.clone();
    let mut batch = Batch::new(settings, copy_file)?;

    let queued = Arc::new(AtomicUsize::new(0));
    let counter = queued.clone();
    batch.set_update_file_count(Some(Box::new(move |n| {
        counter.fetch_add(n, Ordering::Relaxed);
    })));

    if !quiet {
        batch.set_scan_callback(Some(Box::new(|folders: usize, files: usize| {
            if files % 1000 == 0 {
                debug!("Scanned {} folders, {} files", folders, files);
            }
        })));
    }

    if dry_run {
        batch.set_stat_callback(Some(|_: &dyn AppContext| Ok(1)));
    }

    for input in inputs {
        batch.add_file(input)?;
    }
    batch.finish_batch()?;

    if dry_run {
        let stats = batch.take_stats();
        for (input, count) in &stats.files {
            println!("{:>6}  {}", count, input);
        }
        println!("{} files would be written", stats.total_files);
        return Ok(());
    }

    if !quiet && let Some(output) = output {
        println!(
            "{} of {} files written to {}",
            batch.files_written(),
            queued.load(Ordering::Relaxed),
            output.display()
        );
    }

    Ok(())
}

fn archive_for(folder: &Path) -> PathBuf {
    let trimmed = folder.components().as_path();
    let mut path = OsString::from(trimmed.as_os_str());
    path.push(".zip");
    PathBuf::from(path)
}

/// Pack each folder into `<folder>.zip`, one archive at a time.
fn pack(mut settings: Settings, folders: &[PathBuf]) -> Result<()> {
    settings.output = None;
    settings.scan_archives = false;
    let generate_cache = settings.generate_cache;

    let current: Arc<Mutex<Option<Arc<ZipPackContext>>>> = Arc::default();

    let target = current.clone();
    let mut batch = Batch::new(settings, move |ctx| {
        let pack = target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .context("no archive is open")?;
        let mut stream = ctx.stream()?;
        pack.send_file(ctx.working_file(), &mut stream)?;
        Ok(())
    })?;

    let opening = current.clone();
    batch.set_for_each_folder(Some(Box::new(move |folder: &Path, count: usize| {
        let path = archive_for(folder);
        info!("Packing {} files into {}", count, path.display());

        let pack = match ZipPackContext::create(&path, generate_cache) {
            Ok(pack) => Some(Arc::new(pack)),
            Err(e) => {
                error!("Cannot create {}: {}", path.display(), e);
                None
            }
        };
        *opening.lock().unwrap_or_else(PoisonError::into_inner) = pack;
    })));

    let closing = current;
    batch.set_for_each_folder_finish(Some(Box::new(move || {
        let pack = closing.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pack) = pack
            && let Err(e) = pack.finish()
        {
            error!("Cannot finish {}: {}", pack.path().display(), e);
        }
    })));

    for folder in folders {
        if !folder.is_dir() {
            bail!("{} is not a folder", folder.display());
        }
        batch.add_file(folder)?;
    }

    batch.finish_batch()
}

fn list(archive: &Path, verbose: bool) -> Result<()> {
    if verbose {
        return list_verbose(archive);
    }

    let zip = ZipIoContext::open(archive)
        .with_context(|| format!("Cannot open {}", archive.display()))?;

    for entry in zip.iter(ZipIoEntryKind::View) {
        println!("{}", entry.name);
    }

    Ok(())
}

/// Detailed listing straight from the central directory, which keeps the
/// dates and methods a cache leaves out.
fn list_verbose(archive: &Path) -> Result<()> {
    let mapped = MappedFile::open(archive)
        .with_context(|| format!("Cannot open {}", archive.display()))?;
    let entries = ZipParser::new(Arc::new(mapped)).list_files()?;

    println!(
        "{:>10}  {:>12}  {:>6}  {:>10}  {:>5}  Name",
        "Length", "Offset", "Method", "Date", "Time"
    );
    println!("{}", "-".repeat(70));

    let mut total = 0u64;
    let mut file_count = 0usize;

    for entry in &entries {
        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();
        let method = match entry.compression_method {
            CompressionMethod::Stored => "Stored",
            CompressionMethod::Deflate => "Defl",
            CompressionMethod::Unknown(_) => "?",
        };

        println!(
            "{:>10}  {:>12}  {:>6}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            entry.uncompressed_size,
            entry.lfh_offset,
            method,
            year,
            month,
            day,
            hour,
            minute,
            entry.file_name
        );

        if !entry.is_directory() {
            total += entry.uncompressed_size;
            file_count += 1;
        }
    }

    println!("{}", "-".repeat(70));
    println!("{:>10}  {:>49}  {} files", total, "", file_count);
    Ok(())
}

fn find(archive: &Path, pattern: &str, all: bool) -> Result<()> {
    let zip = ZipIoContext::open(archive)
        .with_context(|| format!("Cannot open {}", archive.display()))?;

    if all {
        for entry in zip.find_all(pattern) {
            println!("{}", entry.name);
        }
        return Ok(());
    }

    let entry = zip.find(pattern);
    if !entry.is_found() {
        bail!("No member of {} matches {}", archive.display(), pattern);
    }
    println!("{}", entry.name);
    Ok(())
}
