use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{info, warn};

/// Removes its file when dropped, whether or not anything ever wrote it.
#[derive(Debug)]
pub struct ScratchFile(PathBuf);

impl ScratchFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.0) {
            Ok(()) => info!(path = %self.0.display(), "deleted temporary file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.0.display(), %err, "failed to delete temporary file"),
        }
    }
}
