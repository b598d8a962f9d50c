//! Batch settings.
//!
//! Settings are a plain value threaded through [`Batch::new`](crate::Batch::new).
//! They can be filled from any key/value source implementing
//! [`SettingsProvider`], or one key at a time with [`Settings::apply`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Read-only key/value source of settings.
pub trait SettingsProvider {
    fn get(&self, key: &str) -> Option<&str>;
}

impl SettingsProvider for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key).map(String::as_str)
    }
}

impl SettingsProvider for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        BTreeMap::get(self, key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Merge all outputs into one archive instead of writing plain files
    pub create_output_zip: bool,
    /// Put outputs of each input archive under a folder named after it
    pub folder_per_archive: bool,
    /// Write a `.cache` next to every produced archive
    pub generate_cache: bool,
    /// Output archive, or output folder when no archive is created
    pub output: Option<PathBuf>,
    /// Pending tasks allowed per worker; 0 runs everything on the caller
    pub queue_capacity_per_thread: usize,
    pub threads: usize,
    /// Patterns selecting the files to process, see [`PathFilter`](crate::PathFilter)
    pub filters: Vec<String>,
    /// Load archives without the ability to look up other members
    pub filtered_load: bool,
    /// Treat `.zip` files found while scanning folders as inputs to expand
    pub scan_archives: bool,
    /// Return the first task failure from `wait` and `finish_batch`
    pub propagate_task_errors: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            create_output_zip: true,
            folder_per_archive: false,
            generate_cache: true,
            output: None,
            queue_capacity_per_thread: 4,
            threads: num_cpus::get(),
            filters: Vec::new(),
            filtered_load: false,
            scan_archives: true,
            propagate_task_errors: cfg!(debug_assertions),
        }
    }
}

impl Settings {
    pub const KEYS: &'static [&'static str] = &[
        "create_output_zip",
        "folder_per_archive",
        "generate_cache",
        "output",
        "queue_capacity_per_thread",
        "threads",
        "filters",
        "filtered_load",
        "scan_archives",
        "propagate_task_errors",
    ];

    /// Defaults overridden by every known key `provider` has.
    pub fn from_provider<P: SettingsProvider + ?Sized>(provider: &P) -> Result<Self> {
        let mut settings = Self::default();
        for key in Self::KEYS {
            if let Some(value) = provider.get(key) {
                settings.apply(key, value)?;
            }
        }
        Ok(settings)
    }

    /// Set one setting from its textual form.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();

        match key {
            "create_output_zip" => self.create_output_zip = parse_bool(key, value)?,
            "folder_per_archive" => self.folder_per_archive = parse_bool(key, value)?,
            "generate_cache" => self.generate_cache = parse_bool(key, value)?,
            "output" => {
                self.output = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "queue_capacity_per_thread" => {
                self.queue_capacity_per_thread = parse_usize(key, value)?
            }
            "threads" => {
                let threads = parse_usize(key, value)?;
                if threads == 0 {
                    return Err(invalid(key, "must be at least 1"));
                }
                self.threads = threads;
            }
            "filters" => {
                self.filters = value
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from)
                    .collect();
            }
            "filtered_load" => self.filtered_load = parse_bool(key, value)?,
            "scan_archives" => self.scan_archives = parse_bool(key, value)?,
            "propagate_task_errors" => self.propagate_task_errors = parse_bool(key, value)?,
            _ => return Err(invalid(key, "unknown setting")),
        }

        Ok(())
    }

    /// Parse `key=value`, as given on the command line.
    pub fn apply_pair(&mut self, pair: &str) -> Result<()> {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| invalid(pair, "expected key=value"))?;
        self.apply(key.trim(), value)
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> Error {
    Error::InvalidSetting {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, format!("{:?} is not a boolean", value))),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|e| invalid(key, format!("{:?}: {}", value, e)))
}
