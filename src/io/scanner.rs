use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Progress callback: `(folders seen, files seen)`.
pub type ScanCallback = Box<dyn FnMut(usize, usize) + Send>;

/// Recursive file enumeration.
///
/// Filtering is left to the caller, which knows the root the names are
/// relative to. Results accumulate across [`scan`](Self::scan) calls until
/// [`clear`](Self::clear).
#[derive(Default)]
pub struct DirectoryScanner {
    files: Vec<PathBuf>,
    num_files: usize,
    num_folders: usize,
    scan_cb: Option<ScanCallback>,
}

impl DirectoryScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scan_callback(&mut self, cb: Option<ScanCallback>) {
        self.scan_cb = cb;
    }

    /// Walk `dir` recursively, collecting every regular file.
    ///
    /// Entries are visited in file-name order so repeated scans of the same
    /// tree produce the same list. Unreadable entries are logged and skipped.
    pub fn scan(&mut self, dir: &Path) {
        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            let file_type = entry.file_type();

            if file_type.is_dir() {
                self.num_folders += 1;
            } else if file_type.is_file() {
                self.num_files += 1;
                self.files.push(entry.into_path());
            } else {
                continue;
            }

            if let Some(cb) = self.scan_cb.as_mut() {
                cb(self.num_folders, self.num_files);
            }
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn take_files(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.files)
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.num_files = 0;
        self.num_folders = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_scan_is_sorted_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("b.bin"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"c").unwrap();
        fs::write(dir.path().join("sub/deeper/d.txt"), b"d").unwrap();

        let progress = Arc::new(Mutex::new((0usize, 0usize)));
        let last = progress.clone();

        let mut scanner = DirectoryScanner::new();
        scanner.set_scan_callback(Some(Box::new(move |folders: usize, files: usize| {
            *last.lock().unwrap() = (folders, files);
        })));
        scanner.scan(dir.path());

        let names: Vec<_> = scanner
            .files()
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();

        assert_eq!(
            names,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b.bin"),
                PathBuf::from("sub/c.txt"),
                PathBuf::from("sub/deeper/d.txt"),
            ]
        );
        assert_eq!(*progress.lock().unwrap(), (3, 4));

        assert_eq!(scanner.take_files().len(), 4);
        assert!(scanner.files().is_empty());
        scanner.clear();
    }
}
