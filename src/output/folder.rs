use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::extract::FileCallback;
use super::normalize_path;
use crate::context::AppExtractContext;
use crate::error::{Error, Result};

/// Writes outputs as plain files under a directory.
pub struct IoExtractContext {
    out_dir: PathBuf,
    current: Option<BufWriter<File>>,
    folders: BTreeSet<String>,
    for_each_file: Option<FileCallback>,
}

impl IoExtractContext {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            current: None,
            folders: BTreeSet::new(),
            for_each_file: None,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn set_file_callback(&mut self, cb: Option<FileCallback>) {
        self.for_each_file = cb;
    }

    /// Flush and close the open file.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }
        Ok(())
    }
}

impl AppExtractContext for IoExtractContext {
    fn new_file(&mut self, path: &str) -> Result<()> {
        self.close()?;

        let path = self.out_dir.join(normalize_path(path)?);
        let file = match File::create(&path) {
            Ok(file) => file,
            Err(_) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                File::create(&path)?
            }
        };
        self.current = Some(BufWriter::new(file));

        if let Some(cb) = &mut self.for_each_file {
            cb();
        }

        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let file = self.current.as_mut().ok_or(Error::NoOpenFile)?;
        file.write_all(data)?;
        Ok(())
    }

    fn requires_folders(&self) -> bool {
        true
    }

    /// Queue `path` and every folder leading to it.
    fn add_folder_path(&mut self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;

        for (i, _) in path.match_indices('/') {
            self.folders.insert(path[..i].to_string());
        }
        self.folders.insert(path);
        Ok(())
    }

    fn generate_folders(&mut self) -> Result<()> {
        for folder in std::mem::take(&mut self.folders) {
            fs::create_dir_all(self.out_dir.join(folder))?;
        }
        Ok(())
    }
}

impl Drop for IoExtractContext {
    fn drop(&mut self) {
        if let Some(mut file) = self.current.take() {
            if let Err(e) = file.flush() {
                tracing::warn!("Failed flushing output file: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_into_missing_folders() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = IoExtractContext::new(dir.path());

        ctx.new_file("deep\\nested/out.txt").unwrap();
        ctx.send_data(b"hello ").unwrap();
        ctx.send_data(b"world").unwrap();
        ctx.close().unwrap();

        let text = fs::read_to_string(dir.path().join("deep/nested/out.txt")).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_generate_folders() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = IoExtractContext::new(dir.path());
        assert!(ctx.requires_folders());

        ctx.add_folder_path("a/b/c").unwrap();
        ctx.add_folder_path("x").unwrap();
        ctx.generate_folders().unwrap();

        assert!(dir.path().join("a/b/c").is_dir());
        assert!(dir.path().join("x").is_dir());
        assert!(matches!(ctx.send_data(b"?"), Err(Error::NoOpenFile)));
    }
}
