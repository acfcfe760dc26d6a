use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
#[error("file or directory {} does not exist", .0.display())]
pub struct MissingPath(pub PathBuf);

/// Checks `path` right before it is used.
pub fn ensure_exists<P: AsRef<Path>>(path: P) -> Result<(), MissingPath> {
    let path = path.as_ref();
    if path.exists() {
        Ok(())
    } else {
        error!(path = %path.display(), "required path is missing");
        Err(MissingPath(path.to_owned()))
    }
}
