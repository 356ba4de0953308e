use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// AES-128 key written next to the segments for `ffmpeg -hls_key_info_file`.
pub const KEY_FILE_NAME: &str = "key.key";
/// Three-line descriptor consumed by ffmpeg: retrieval URI, key path, hex key.
pub const KEY_INFO_FILE_NAME: &str = "key_info";

const KEY_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type KeyResult<T> = std::result::Result<T, KeyError>;

/// Key material provisioned for a single job output directory.
#[derive(Debug, Clone)]
pub struct ProvisionedKey {
    pub key_path: PathBuf,
    pub info_path: PathBuf,
    pub hex: String,
}

/// Writes per-job segment encryption keys.
///
/// Every job gets a fresh 128-bit key. The retrieval URI is embedded
/// verbatim in the descriptor; serving the key file at that URI is the
/// responsibility of whatever fronts the output directory.
#[derive(Debug, Clone)]
pub struct KeyManager {
    key_uri: String,
}

impl KeyManager {
    pub fn new(key_uri: impl Into<String>) -> Self {
        Self {
            key_uri: key_uri.into(),
        }
    }

    pub fn provision(&self, output_dir: &Path) -> KeyResult<ProvisionedKey> {
        let key = generate_key();
        let hex = hex::encode(key);
        let key_path = output_dir.join(KEY_FILE_NAME);
        fs::write(&key_path, key).map_err(|source| KeyError::Io {
            source,
            path: key_path.clone(),
        })?;
        let info_path = output_dir.join(KEY_INFO_FILE_NAME);
        let descriptor = format!("{}\n{}\n{}\n", self.key_uri, key_path.display(), hex);
        fs::write(&info_path, descriptor).map_err(|source| KeyError::Io {
            source,
            path: info_path.clone(),
        })?;
        debug!(key_info = %info_path.display(), "segment encryption key provisioned");
        Ok(ProvisionedKey {
            key_path,
            info_path,
            hex,
        })
    }
}

fn generate_key() -> [u8; KEY_LEN] {
    use rand::Rng;
    rand::thread_rng().gen()
}
