use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

const MANIFEST_PREFIX: &str = "optimized_";
const SEGMENT_NAME_INFIX: &str = "_segment_";

/// Outcome of validating and probing one batch of candidate inputs.
#[derive(Debug, Clone, Serialize)]
pub struct SelectionSummary {
    pub accepted: Vec<PathBuf>,
    pub total_duration: f64,
    pub skipped: Vec<SkippedInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedInput {
    pub path: PathBuf,
    pub reason: String,
}

/// One-way notifications for whatever fronts the pipeline. Progress
/// messages are lossy under backpressure; terminal messages are not.
#[derive(Debug, Clone)]
pub enum OptimizerEvent {
    Progress { message: String },
    Completed {
        input: PathBuf,
        manifest_path: PathBuf,
        message: String,
    },
    Error { input: PathBuf, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub input: PathBuf,
    pub manifest_path: PathBuf,
    pub segment_count: usize,
    pub completed_at: DateTime<Utc>,
}

/// Output-artifact locations for one input, all derived from its stem.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub segment_template: PathBuf,
    pub segment_prefix: String,
    pub stem: String,
}

impl JobPaths {
    pub fn for_input(output_dir: &Path, input: &Path) -> Self {
        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        let manifest_path = output_dir.join(format!("{MANIFEST_PREFIX}{stem}.m3u8"));
        let segment_prefix = format!("{stem}{SEGMENT_NAME_INFIX}");
        let segment_template = output_dir.join(format!("{segment_prefix}%03d.ts"));
        Self {
            output_dir: output_dir.to_path_buf(),
            manifest_path,
            segment_template,
            segment_prefix,
            stem,
        }
    }
}
