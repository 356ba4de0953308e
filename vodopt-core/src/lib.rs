pub mod config;
pub mod encoder;
pub mod error;
pub mod keys;
pub mod optimizer;
pub mod playlist;
pub mod store;

pub use config::{
    load_vodopt_config, EncoderSection, EncryptionSection, PathsSection, SelectionSection,
    StoreSection, VodoptConfig,
};
pub use encoder::{
    CancelSignal, CommandExecutor, EncodeProgress, EncodeRequest, Encoder, EncoderError,
    EncoderPaths, EncoderResult, SystemCommandExecutor,
};
pub use error::{ConfigError, Result};
pub use keys::{KeyError, KeyManager, KeyResult, ProvisionedKey};
pub use optimizer::{
    JobPaths, JobReport, Optimizer, OptimizerError, OptimizerEvent, OptimizerResult,
    SelectionSummary, SkippedInput,
};
pub use playlist::{PlaylistError, PlaylistResult, RebuiltPlaylist};
pub use store::{JobProgressStore, JobRecord, StoreError, StoreResult};
