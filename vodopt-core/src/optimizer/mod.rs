mod error;
mod types;

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::VodoptConfig;
use crate::encoder::{
    CancelSignal, CommandExecutor, EncodeRequest, Encoder, EncoderError, EncoderPaths,
};
use crate::keys::KeyManager;
use crate::playlist;
use crate::store::{JobProgressStore, JobRecord, StoreError};

pub use error::{OptimizerError, OptimizerResult};
pub use types::{JobPaths, JobReport, OptimizerEvent, SelectionSummary, SkippedInput};

pub const EVENT_CHANNEL_CAPACITY: usize = 64;

const FAILURE_LOG_NAME: &str = "optimizer_failures.log";

/// Drives batches of conversions end to end: selection, key
/// provisioning, the encoder subprocess, write-through progress
/// persistence, and manifest reconciliation.
///
/// One encoder subprocess runs at a time; jobs within a batch are strictly
/// sequential, which also makes this the progress document's only writer.
pub struct Optimizer {
    config: Arc<VodoptConfig>,
    store: JobProgressStore,
    encoder: Encoder,
    keys: KeyManager,
    events: mpsc::Sender<OptimizerEvent>,
    cancel: CancelSignal,
    output_dir: PathBuf,
    log_path: PathBuf,
}

impl fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Optimizer")
            .field("config", &self.config)
            .field("output_dir", &self.output_dir)
            .field("state_file", &self.store.path())
            .finish()
    }
}

impl Optimizer {
    /// Builds the orchestrator and the receiving end of its event stream.
    /// Any previously persisted progress document is loaded immediately so
    /// `resume` can run without further setup.
    pub fn new(
        config: VodoptConfig,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> OptimizerResult<(Self, mpsc::Receiver<OptimizerEvent>)> {
        let config = Arc::new(config);
        let store = JobProgressStore::load(config.state_file());
        let encoder_paths = EncoderPaths {
            ffmpeg: PathBuf::from(&config.encoder.ffmpeg),
            ffprobe: PathBuf::from(&config.encoder.ffprobe),
        };
        let encoder = Encoder::new(config.encoder.clone(), encoder_paths, executor);
        let keys = KeyManager::new(config.encryption.key_uri.clone());
        let output_dir = config.resolve_path(&config.paths.output_dir);
        let log_path = config
            .resolve_path(&config.paths.logs_dir)
            .join(FAILURE_LOG_NAME);
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| OptimizerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok((
            Self {
                config,
                store,
                encoder,
                keys,
                events,
                cancel: CancelSignal::new(),
                output_dir,
                log_path,
            },
            receiver,
        ))
    }

    /// Handle for requesting cancellation from another task. Cancelling
    /// kills the running encoder and stops the batch; the interrupted job
    /// keeps `completed = false` so the next resume picks it up.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn store(&self) -> &JobProgressStore {
        &self.store
    }

    /// Validates each candidate against the container allow-list, probes
    /// its duration, and resets the progress document to exactly the
    /// accepted batch. Rejected files are skipped, never fatal.
    pub async fn select_inputs(
        &mut self,
        candidates: &[PathBuf],
    ) -> OptimizerResult<SelectionSummary> {
        let mut accepted = Vec::new();
        let mut skipped = Vec::new();
        let mut jobs = Vec::new();
        let mut total_duration = 0.0;

        for candidate in candidates {
            if !self.extension_allowed(candidate) {
                warn!(input = %candidate.display(), "unsupported container, skipped");
                skipped.push(SkippedInput {
                    path: candidate.clone(),
                    reason: "unsupported container".to_string(),
                });
                continue;
            }
            match self.encoder.probe_duration(candidate).await {
                Ok(duration) => {
                    total_duration += duration;
                    jobs.push(JobRecord::new(candidate.clone(), duration));
                    accepted.push(candidate.clone());
                }
                Err(error) => {
                    warn!(input = %candidate.display(), %error, "duration probe failed, skipped");
                    skipped.push(SkippedInput {
                        path: candidate.clone(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        self.store.replace_all(jobs)?;
        info!(
            accepted = accepted.len(),
            skipped = skipped.len(),
            total_duration,
            "inputs selected"
        );
        Ok(SelectionSummary {
            accepted,
            total_duration,
            skipped,
        })
    }

    /// Converts one selected input. `batch_total_duration` is the summed
    /// duration of the whole batch; persisted percent is relative to it so
    /// the document tracks overall batch progress.
    pub async fn convert(
        &mut self,
        input: &Path,
        batch_total_duration: f64,
    ) -> OptimizerResult<JobReport> {
        self.run_job(input, batch_total_duration, false).await
    }

    /// Converts every job in the progress document in order, stopping at
    /// the first failure.
    pub async fn convert_all(&mut self) -> OptimizerResult<Vec<JobReport>> {
        let pending: Vec<PathBuf> = self
            .store
            .incomplete()
            .map(|job| job.input_file_path.clone())
            .collect();
        let batch_total = self.store.total_duration();
        let mut reports = Vec::with_capacity(pending.len());
        for input in pending {
            if self.cancel.is_cancelled() {
                return Err(OptimizerError::Cancelled { path: input });
            }
            reports.push(self.run_job(&input, batch_total, false).await?);
        }
        Ok(reports)
    }

    /// Restarts every incomplete job from the persisted document. The
    /// whole job is re-encoded from second zero; the stored time mark is a
    /// diagnostic, not a seek position.
    pub async fn resume(&mut self) -> OptimizerResult<Vec<JobReport>> {
        let pending: Vec<PathBuf> = self
            .store
            .incomplete()
            .map(|job| job.input_file_path.clone())
            .collect();
        if pending.is_empty() {
            info!("no incomplete jobs to resume");
            return Ok(Vec::new());
        }
        info!(jobs = pending.len(), "resuming incomplete jobs");
        let batch_total = self.store.total_duration();
        let mut reports = Vec::with_capacity(pending.len());
        for input in pending {
            if self.cancel.is_cancelled() {
                return Err(OptimizerError::Cancelled { path: input });
            }
            reports.push(self.run_job(&input, batch_total, true).await?);
        }
        Ok(reports)
    }

    async fn run_job(
        &mut self,
        input: &Path,
        batch_total_duration: f64,
        restart: bool,
    ) -> OptimizerResult<JobReport> {
        let stage = if restart { "resume" } else { "convert" };
        let job = match self.store.get(input) {
            Some(job) => job.clone(),
            None => {
                return Err(OptimizerError::Store(StoreError::UnknownJob {
                    path: input.to_path_buf(),
                }))
            }
        };

        if let Err(source) = std::fs::create_dir_all(&self.output_dir) {
            let error = OptimizerError::Io {
                path: self.output_dir.clone(),
                source,
            };
            self.notify_error(input, &error).await;
            self.log_failure(stage, &error);
            return Err(error);
        }
        let paths = JobPaths::for_input(&self.output_dir, input);
        let provisioned = match self.keys.provision(&self.output_dir) {
            Ok(provisioned) => provisioned,
            Err(error) => {
                let error = OptimizerError::from(error);
                self.notify_error(input, &error).await;
                self.log_failure(stage, &error);
                return Err(error);
            }
        };

        let request = EncodeRequest {
            input: input.to_path_buf(),
            manifest_path: paths.manifest_path.clone(),
            segment_template: paths.segment_template.clone(),
            key_info_path: provisioned.info_path.clone(),
            restart,
        };

        let events = self.events.clone();
        let job_duration = job.duration;
        let input_owned = input.to_path_buf();
        let store = &mut self.store;
        let result = self
            .encoder
            .encode(&request, &self.cancel, |tick| {
                let persisted = if batch_total_duration > 0.0 {
                    tick.seconds * 100.0 / batch_total_duration
                } else {
                    0.0
                };
                if let Err(error) = store.record_progress(&input_owned, persisted, tick.seconds) {
                    warn!(input = %input_owned.display(), %error, "progress write failed, continuing");
                }
                let observed = if job_duration > 0.0 {
                    Some(tick.seconds * 100.0 / job_duration)
                } else if batch_total_duration > 0.0 {
                    Some(store.combined_percent())
                } else {
                    None
                };
                if events
                    .try_send(OptimizerEvent::Progress {
                        message: progress_message(observed),
                    })
                    .is_err()
                {
                    debug!("observer saturated, progress tick dropped");
                }
            })
            .await;

        if let Err(error) = result {
            let error = match error {
                EncoderError::Cancelled { input } => OptimizerError::Cancelled { path: input },
                other => OptimizerError::Encoder(other),
            };
            self.notify_error(input, &error).await;
            self.log_failure(stage, &error);
            return Err(error);
        }

        // Reconcile before flipping the flag: a job whose manifest cannot
        // be rebuilt is not done and stays eligible for resume.
        let rebuilt = match playlist::rebuild(
            &self.output_dir,
            &paths.manifest_path,
            &paths.segment_prefix,
            f64::from(self.config.encoder.segment_seconds),
            job.duration,
        ) {
            Ok(rebuilt) => rebuilt,
            Err(error) => {
                let error = OptimizerError::from(error);
                self.notify_error(input, &error).await;
                self.log_failure(stage, &error);
                return Err(error);
            }
        };

        if let Err(error) = self.store.mark_completed(input) {
            warn!(input = %input.display(), %error, "completion write failed, document stale");
        }

        let message = format!(
            "Video optimized and converted successfully as {}.",
            paths.manifest_path.display()
        );
        self.notify(OptimizerEvent::Completed {
            input: input.to_path_buf(),
            manifest_path: paths.manifest_path.clone(),
            message,
        })
        .await;
        info!(
            input = %input.display(),
            manifest = %paths.manifest_path.display(),
            segments = rebuilt.segment_count,
            stage,
            "job completed"
        );

        Ok(JobReport {
            input: input.to_path_buf(),
            manifest_path: paths.manifest_path,
            segment_count: rebuilt.segment_count,
            completed_at: Utc::now(),
        })
    }

    fn extension_allowed(&self, input: &Path) -> bool {
        let Some(extension) = input.extension() else {
            return false;
        };
        let extension = extension.to_string_lossy();
        self.config
            .selection
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension.as_ref()))
    }

    async fn notify_error(&self, input: &Path, error: &OptimizerError) {
        let message = format!("Error during video processing: {error}");
        self.notify(OptimizerEvent::Error {
            input: input.to_path_buf(),
            message,
        })
        .await;
    }

    async fn notify(&self, event: OptimizerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped, notification skipped");
        }
    }

    fn log_failure(&self, stage: &str, error: &OptimizerError) {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        {
            let _ = writeln!(file, "{} [{}] {}", Utc::now().to_rfc3339(), stage, error);
        }
    }
}

/// Percent is `None` when neither the job nor the batch has a usable
/// duration to divide by, e.g. a probe that reported zero seconds.
fn progress_message(percent: Option<f64>) -> String {
    match percent {
        Some(percent) => format!("Processing: {}% done", percent.round()),
        None => "Processing...".to_string(),
    }
}
