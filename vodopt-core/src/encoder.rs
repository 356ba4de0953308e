use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::EncoderSection;

const STDERR_TAIL_LINES: usize = 32;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("unreadable duration for {input}: {raw:?}")]
    UnreadableDuration { input: PathBuf, raw: String },
    #[error("encode cancelled for {input}")]
    Cancelled { input: PathBuf },
}

pub type EncoderResult<T> = std::result::Result<T, EncoderError>;

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> io::Result<std::process::Output>;

    fn spawn(&self, command: &mut Command) -> io::Result<Child> {
        command.spawn()
    }
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<std::process::Output> {
        command.output().await
    }
}

#[derive(Debug, Clone)]
pub struct EncoderPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

/// Cooperative stop flag shared between the orchestrator and whoever owns
/// the shutdown surface. Cancelling mid-encode kills the subprocess; the
/// job stays incomplete and is picked up by the next resume.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        // send_replace updates the value even with no live receivers, so
        // the flag latches before anyone subscribes.
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One encoder invocation, fully resolved to paths on disk.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub manifest_path: PathBuf,
    pub segment_template: PathBuf,
    pub key_info_path: PathBuf,
    /// Resume restarts the whole job: segment numbering and the input
    /// clock are pinned back to zero instead of seeking.
    pub restart: bool,
}

/// One progress tick parsed from the encoder's machine-readable output.
#[derive(Debug, Clone)]
pub struct EncodeProgress {
    pub timemark: String,
    pub seconds: f64,
}

/// Drives ffmpeg/ffprobe subprocesses.
pub struct Encoder {
    settings: EncoderSection,
    paths: EncoderPaths,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("settings", &self.settings)
            .field("paths", &self.paths)
            .finish()
    }
}

impl Encoder {
    pub fn new(
        settings: EncoderSection,
        paths: EncoderPaths,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            settings,
            paths,
            executor,
        }
    }

    /// Probes the container duration in seconds.
    pub async fn probe_duration(&self, input: &Path) -> EncoderResult<f64> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            input.to_string_lossy().to_string(),
        ];
        let output = self.run_external(&self.paths.ffprobe, &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(EncoderError::CommandFailure {
                command: format!("{} {}", self.paths.ffprobe.display(), args.join(" ")),
                status: output.status.code(),
                stderr,
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let raw = stdout.trim();
        raw.parse::<f64>()
            .map_err(|_| EncoderError::UnreadableDuration {
                input: input.to_path_buf(),
                raw: raw.to_string(),
            })
    }

    /// Argument list for one HLS transcode, in the exact order segments
    /// and manifests have always been produced with.
    pub fn hls_args(&self, request: &EncodeRequest) -> Vec<String> {
        let gop = self.settings.segment_seconds * self.settings.keyframe_fps;
        let mut args = vec![
            "-y".to_string(),
            "-progress".to_string(),
            "pipe:2".to_string(),
            "-nostats".to_string(),
            "-i".to_string(),
            request.input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            self.settings.video_codec.clone(),
            "-preset".to_string(),
            self.settings.preset.clone(),
            "-crf".to_string(),
            self.settings.crf.to_string(),
            "-c:a".to_string(),
            self.settings.audio_codec.clone(),
            "-b:a".to_string(),
            self.settings.audio_bitrate.clone(),
            "-f".to_string(),
            "hls".to_string(),
            "-g".to_string(),
            gop.to_string(),
        ];
        if request.restart {
            args.push("-start_number".to_string());
            args.push("0".to_string());
            args.push("-ss".to_string());
            args.push("0".to_string());
        }
        args.push("-hls_key_info_file".to_string());
        args.push(request.key_info_path.to_string_lossy().to_string());
        args.push("-hls_time".to_string());
        args.push(self.settings.segment_seconds.to_string());
        args.push("-hls_playlist_type".to_string());
        args.push("vod".to_string());
        args.push("-hls_segment_filename".to_string());
        args.push(request.segment_template.to_string_lossy().to_string());
        args.push(request.manifest_path.to_string_lossy().to_string());
        args
    }

    /// Runs one transcode to completion, emitting a progress tick per
    /// `-progress` block read from the subprocess.
    ///
    /// Cancellation kills the subprocess and surfaces as
    /// [`EncoderError::Cancelled`]; the caller decides what that means for
    /// the persisted job.
    pub async fn encode<F>(
        &self,
        request: &EncodeRequest,
        cancel: &CancelSignal,
        mut on_progress: F,
    ) -> EncoderResult<()>
    where
        F: FnMut(EncodeProgress),
    {
        let args = self.hls_args(request);
        debug!(
            input = %request.input.display(),
            manifest = %request.manifest_path.display(),
            restart = request.restart,
            "starting encoder"
        );

        let mut command = Command::new(&self.paths.ffmpeg);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = self.executor.spawn(&mut command)?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "encoder stderr not piped"))?;

        let mut lines = BufReader::new(stderr).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut last_timemark: Option<String> = None;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if let Some(value) = line.strip_prefix("out_time=") {
                        last_timemark = Some(value.trim().to_string());
                    } else if line.starts_with("progress=") {
                        if let Some(timemark) = &last_timemark {
                            if let Some(seconds) = parse_timemark(timemark) {
                                on_progress(EncodeProgress {
                                    timemark: timemark.clone(),
                                    seconds,
                                });
                            }
                        }
                        continue;
                    }
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                _ = cancel.cancelled() => {
                    warn!(input = %request.input.display(), "cancel requested, killing encoder");
                    child.kill().await?;
                    return Err(EncoderError::Cancelled {
                        input: request.input.clone(),
                    });
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let stderr = tail.into_iter().collect::<Vec<_>>().join("\n");
            return Err(EncoderError::CommandFailure {
                command: format!("{} {}", self.paths.ffmpeg.display(), args.join(" ")),
                status: status.code(),
                stderr,
            });
        }
        Ok(())
    }

    async fn run_external(
        &self,
        program: &Path,
        args: &[String],
    ) -> EncoderResult<std::process::Output> {
        let mut command = Command::new(program);
        for arg in args {
            command.arg(arg);
        }
        self.executor
            .run(&mut command)
            .await
            .map_err(EncoderError::Io)
    }
}

/// Converts an encoder `HH:MM:SS.fff` timemark to seconds. Returns `None`
/// for the `N/A` and negative-clock placeholders ffmpeg emits before the
/// first frame lands.
pub fn parse_timemark(timemark: &str) -> Option<f64> {
    let mut parts = timemark.split(':');
    let hours = parts.next()?.trim().parse::<u64>().ok()?;
    let minutes = parts.next()?.trim().parse::<u64>().ok()?;
    let seconds = parts.next()?.trim().parse::<f64>().ok()?;
    if parts.next().is_some() || seconds < 0.0 {
        return None;
    }
    Some(hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds)
}
