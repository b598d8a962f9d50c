use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::info;

use super::extract::ZipExtractContext;
use crate::context::{AppExtractContext, AppPackContext};
use crate::error::{Error, Result};

const PACK_CHUNK_SIZE: usize = 0x10000;

/// Packs files sent from any thread into one store-only archive.
pub struct ZipPackContext {
    path: PathBuf,
    archive: Mutex<Option<ZipExtractContext>>,
}

impl ZipPackContext {
    pub fn create(path: &Path, generate_cache: bool) -> Result<Self> {
        info!("Packing into {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            archive: Mutex::new(Some(ZipExtractContext::create(path, generate_cache)?)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn already_finished() -> Error {
    Error::Io(io::Error::other("archive is already finished"))
}

impl AppPackContext for ZipPackContext {
    fn send_file(&self, path: &str, stream: &mut dyn Read) -> Result<()> {
        let mut archive = self.archive.lock().unwrap_or_else(PoisonError::into_inner);
        let archive = archive.as_mut().ok_or_else(already_finished)?;

        archive.new_file(path)?;

        let mut buffer = vec![0u8; PACK_CHUNK_SIZE];
        loop {
            let n = match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            archive.send_data(&buffer[..n])?;
        }

        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let archive = self
            .archive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(already_finished)?;
        archive.finish_zip()
    }
}
