//! Pulls a model repository from the Hugging Face Hub into a plain directory.
//!
//! Files are downloaded through the hub cache (which also takes care of
//! resuming) and then copied out, so `local_dir` never holds symlinks into the
//! cache.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use hf_hub::{
    api::sync::{ApiBuilder, ApiError},
    Cache, Repo, RepoType,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to talk to the hub: {0}")]
    Hub(#[from] ApiError),

    #[error("refusing to write hub file `{0}` outside the local directory")]
    UnsafeName(String),

    #[error("failed to copy {rfilename} into {}: {source}", .dest.display())]
    Copy {
        rfilename: String,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub repo_id: String,
    pub revision: Option<String>,
    pub local_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub token: Option<String>,
    pub progress: bool,
}

impl Snapshot {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(repo_id: S, local_dir: P) -> Self {
        Self {
            repo_id: repo_id.into(),
            revision: None,
            local_dir: local_dir.into(),
            cache_dir: None,
            token: None,
            progress: true,
        }
    }

    fn repo(&self) -> Repo {
        match &self.revision {
            Some(revision) => {
                Repo::with_revision(self.repo_id.clone(), RepoType::Model, revision.clone())
            }
            None => Repo::model(self.repo_id.clone()),
        }
    }

    /// Downloads every file of the repository; returns their paths in `local_dir`.
    pub fn download(&self) -> Result<Vec<PathBuf>, FetchError> {
        let cache = match &self.cache_dir {
            Some(cache) => Cache::new(cache.clone()),
            None => Cache::default(),
        };
        let api = ApiBuilder::new()
            .with_cache_dir(cache.path().clone())
            .with_token(self.token.clone().or(cache.token()))
            .with_progress(self.progress)
            .build()?
            .repo(self.repo());
        let siblings = api.info()?.siblings;
        info!(
            repo = %self.repo_id,
            files = siblings.len(),
            local_dir = %self.local_dir.display(),
            "downloading snapshot"
        );
        siblings
            .iter()
            .map(|sibling| {
                check_rfilename(&sibling.rfilename)?;
                let cached = api.get(&sibling.rfilename)?;
                materialize(&cached, &self.local_dir, &sibling.rfilename)
            })
            .collect()
    }
}

/// Hub file names must be plain relative paths: no root, no `..`, no `.`.
fn check_rfilename(rfilename: &str) -> Result<(), FetchError> {
    let path = Path::new(rfilename);
    let plain = path.components().all(|c| matches!(c, Component::Normal(_)));
    if rfilename.is_empty() || !plain {
        return Err(FetchError::UnsafeName(rfilename.to_owned()));
    }
    Ok(())
}

/// Copies the file behind `cached` (following symlinks) to `local_dir/rfilename`.
pub fn materialize(cached: &Path, local_dir: &Path, rfilename: &str) -> Result<PathBuf, FetchError> {
    check_rfilename(rfilename)?;
    let dest = local_dir.join(rfilename);
    let copy_err = |source| FetchError::Copy {
        rfilename: rfilename.to_owned(),
        dest: dest.clone(),
        source,
    };
    let source_len = fs::metadata(cached).map_err(copy_err)?.len();
    if let Ok(existing) = fs::symlink_metadata(&dest) {
        if existing.is_file() && existing.len() == source_len {
            debug!(file = rfilename, "already present");
            return Ok(dest);
        }
        // a stale symlink would make `fs::copy` write through to the cache
        fs::remove_file(&dest).map_err(copy_err)?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(copy_err)?;
    }
    fs::copy(cached, &dest).map_err(copy_err)?;
    info!(file = rfilename, bytes = source_len, "fetched");
    Ok(dest)
}
