use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::paths::{ensure_exists, MissingPath};

#[derive(Error, Debug)]
pub enum MergeError {
    #[error(transparent)]
    MissingPath(#[from] MissingPath),

    #[error("failed to launch {}: {source}", .program.to_string_lossy())]
    Spawn {
        program: OsString,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint merge failed ({status}): {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

/// The external script that reassembles a sharded checkpoint into one file,
/// e.g. DeepSpeed's `zero_to_fp32.py`.
#[derive(Debug, Clone)]
pub struct MergeTool {
    pub interpreter: OsString,
    pub script: PathBuf,
}

impl MergeTool {
    pub fn new<S: Into<OsString>, P: Into<PathBuf>>(interpreter: S, script: P) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
        }
    }

    /// Runs `interpreter script checkpoint_dir output` and waits for it.
    ///
    /// Whether `output` was actually written is left to the next stage.
    pub fn run<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        checkpoint_dir: P,
        output: Q,
    ) -> Result<(), MergeError> {
        let checkpoint_dir = checkpoint_dir.as_ref();
        let output = output.as_ref();
        info!(checkpoint = %checkpoint_dir.display(), "merging sharded checkpoint");
        ensure_exists(checkpoint_dir)?;
        ensure_exists(&self.script)?;

        let result = Command::new(&self.interpreter)
            .arg(&self.script)
            .arg(checkpoint_dir)
            .arg(output)
            .output()
            .map_err(|source| MergeError::Spawn {
                program: self.interpreter.clone(),
                source,
            })?;
        debug!(stdout = %String::from_utf8_lossy(&result.stdout), "merge tool output");
        if !result.status.success() {
            return Err(MergeError::Failed {
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim_end().to_owned(),
            });
        }
        info!(output = %output.display(), "checkpoint merged");
        Ok(())
    }
}
