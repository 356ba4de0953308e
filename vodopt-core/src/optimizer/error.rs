use std::path::PathBuf;

use thiserror::Error;

use crate::encoder::EncoderError;
use crate::keys::KeyError;
use crate::playlist::PlaylistError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("key provisioning failed: {0}")]
    Keys(#[from] KeyError),
    #[error("encoder failed: {0}")]
    Encoder(#[from] EncoderError),
    #[error("manifest rebuild failed: {0}")]
    Playlist(#[from] PlaylistError),
    #[error("progress store failed: {0}")]
    Store(#[from] StoreError),
    #[error("processing cancelled at {path}")]
    Cancelled { path: PathBuf },
}

pub type OptimizerResult<T> = Result<T, OptimizerError>;
