use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to serialize progress document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no job recorded for {path}")]
    UnknownJob { path: PathBuf },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One conversion job as persisted in the progress document.
///
/// Field names are part of the on-disk contract; documents written by
/// earlier deployments must keep loading, so the completed flag keeps its
/// historical `isOptimization` name in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub file_name: String,
    pub duration: f64,
    pub progress: f64,
    pub time_mark_second: f64,
    #[serde(rename = "isOptimization")]
    pub completed: bool,
    pub input_file_path: PathBuf,
}

impl JobRecord {
    pub fn new(input_file_path: impl Into<PathBuf>, duration: f64) -> Self {
        let input_file_path = input_file_path.into();
        let file_name = input_file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            file_name,
            duration,
            progress: 0.0,
            time_mark_second: 0.0,
            completed: false,
            input_file_path,
        }
    }
}

/// Durable record of batch conversion progress.
///
/// The whole job list is rewritten as one pretty-printed JSON document
/// after every mutation, so a crash at any point leaves the document at
/// the last completed write. Jobs are keyed by full input path.
#[derive(Debug)]
pub struct JobProgressStore {
    path: PathBuf,
    jobs: Vec<JobRecord>,
}

impl JobProgressStore {
    /// Loads the document at `path`. A missing or unreadable document is
    /// not an error: an interrupted first run and a corrupted document
    /// both resume from an empty job list.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let jobs = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(jobs) => jobs,
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        %error,
                        "progress document unparsable, starting empty"
                    );
                    Vec::new()
                }
            },
            Err(error) => {
                if error.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %path.display(),
                        %error,
                        "progress document unreadable, starting empty"
                    );
                }
                Vec::new()
            }
        };
        Self { path, jobs }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    pub fn get(&self, input: &Path) -> Option<&JobRecord> {
        self.jobs.iter().find(|job| job.input_file_path == input)
    }

    pub fn incomplete(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter().filter(|job| !job.completed)
    }

    /// Sum of all recorded durations, the denominator for batch percent.
    pub fn total_duration(&self) -> f64 {
        self.jobs.iter().map(|job| job.duration).sum()
    }

    /// Sum of per-job percents capped at 100, the observer fallback when
    /// the encoder tick carries no percent of its own.
    pub fn combined_percent(&self) -> f64 {
        let total: f64 = self.jobs.iter().map(|job| job.progress).sum();
        total.min(100.0)
    }

    /// Replaces the job list wholesale. Selection calls this to reset the
    /// document to exactly the accepted batch.
    pub fn replace_all(&mut self, jobs: Vec<JobRecord>) -> StoreResult<()> {
        self.jobs = jobs;
        self.persist()
    }

    /// Updates progress percent and time mark for one job, nothing else.
    pub fn record_progress(
        &mut self,
        input: &Path,
        percent: f64,
        time_mark_second: f64,
    ) -> StoreResult<()> {
        let job = self.find_mut(input)?;
        job.progress = percent;
        job.time_mark_second = time_mark_second;
        self.persist()
    }

    /// Flips the completed flag for one job, nothing else.
    pub fn mark_completed(&mut self, input: &Path) -> StoreResult<()> {
        let job = self.find_mut(input)?;
        job.completed = true;
        self.persist()
    }

    /// Overwrites the document, creating the containing directory first.
    pub fn persist(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        let body = serde_json::to_string_pretty(&self.jobs)?;
        fs::write(&self.path, body).map_err(|source| StoreError::Io {
            source,
            path: self.path.clone(),
        })
    }

    fn find_mut(&mut self, input: &Path) -> StoreResult<&mut JobRecord> {
        self.jobs
            .iter_mut()
            .find(|job| job.input_file_path == input)
            .ok_or_else(|| StoreError::UnknownJob {
                path: input.to_path_buf(),
            })
    }
}
