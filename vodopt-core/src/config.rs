use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VodoptConfig {
    pub paths: PathsSection,
    pub selection: SelectionSection,
    pub encoder: EncoderSection,
    pub encryption: EncryptionSection,
    pub store: StoreSection,
}

impl VodoptConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    /// Location of the persisted job progress document.
    pub fn state_file(&self) -> PathBuf {
        self.resolve_path(&self.paths.state_dir)
            .join(&self.store.file_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub output_dir: String,
    pub state_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionSection {
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSection {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub segment_seconds: u32,
    pub keyframe_fps: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionSection {
    pub key_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub file_name: String,
}

pub fn load_vodopt_config<P: AsRef<Path>>(path: P) -> Result<VodoptConfig> {
    let path = path.as_ref();
    let config: VodoptConfig = load_toml(path)?;
    if config.encoder.segment_seconds == 0 {
        return Err(ConfigError::Invalid {
            reason: "encoder.segment_seconds must be at least 1".to_string(),
            path: path.to_path_buf(),
        });
    }
    if config.encoder.keyframe_fps == 0 {
        return Err(ConfigError::Invalid {
            reason: "encoder.keyframe_fps must be at least 1".to_string(),
            path: path.to_path_buf(),
        });
    }
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
