use std::path::PathBuf;

use candle_core::DType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("failed to write torch archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid model config: {0}")]
    InvalidConfig(String),

    #[error("unsupported model_type `{0}`")]
    UnsupportedArchitecture(String),

    #[error("dtype {0:?} has no torch storage type")]
    UnsupportedDtype(DType),

    #[error("stripping `{prefix}` maps both `{first}` and `{second}` to `{key}`")]
    KeyCollision {
        prefix: String,
        key: String,
        first: String,
        second: String,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
