#![cfg(unix)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::sync::mpsc;

use vodopt_core::config::{load_vodopt_config, VodoptConfig};
use vodopt_core::optimizer::{Optimizer, OptimizerError, OptimizerEvent};
use vodopt_core::store::{JobProgressStore, JobRecord};

const FFPROBE_STUB: &str = "#!/bin/sh\necho \"95.000000\"\n";

const FFMPEG_STUB: &str = r#"#!/bin/sh
log="$(dirname "$0")/calls.log"
printf '%s\n' "$*" >> "$log"
template=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-hls_segment_filename" ]; then
    template="$arg"
  fi
  prev="$arg"
  manifest="$arg"
done
echo "out_time=00:00:30.000000" >&2
echo "progress=continue" >&2
i=0
while [ "$i" -lt 10 ]; do
  seg=$(printf "$template" "$i")
  printf 'ts' > "$seg"
  i=$((i+1))
done
: > "$manifest"
echo "out_time=00:01:35.000000" >&2
echo "progress=end" >&2
exit 0
"#;

const FFMPEG_HANG_STUB: &str = r#"#!/bin/sh
echo "out_time=00:00:05.000000" >&2
echo "progress=continue" >&2
sleep 30
exit 0
"#;

const FFMPEG_FAIL_STUB: &str = r#"#!/bin/sh
log="$(dirname "$0")/calls.log"
printf '%s\n' "$*" >> "$log"
echo "out_time=00:00:10.000000" >&2
echo "progress=continue" >&2
echo "clip.mp4: Invalid data found when processing input" >&2
exit 1
"#;

const FFMPEG_NO_SEGMENTS_STUB: &str = r#"#!/bin/sh
echo "out_time=00:01:35.000000" >&2
echo "progress=end" >&2
exit 0
"#;

fn fixture_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join(relative)
}

fn adjust_config(base: &TempDir, mut config: VodoptConfig) -> VodoptConfig {
    let base_dir = base.path().join("vodopt");
    let output_dir = base_dir.join("hls");
    let state_dir = base_dir.join("state");
    let logs_dir = base_dir.join("logs");
    std::fs::create_dir_all(&output_dir).unwrap();
    std::fs::create_dir_all(&state_dir).unwrap();
    std::fs::create_dir_all(&logs_dir).unwrap();
    config.paths.base_dir = base_dir.to_string_lossy().to_string();
    config.paths.output_dir = output_dir.to_string_lossy().to_string();
    config.paths.state_dir = state_dir.to_string_lossy().to_string();
    config.paths.logs_dir = logs_dir.to_string_lossy().to_string();
    config
}

fn install_stub(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, script).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}

fn build_config(base: &TempDir, ffmpeg_script: &str) -> (VodoptConfig, PathBuf) {
    let mut config = adjust_config(
        base,
        load_vodopt_config(fixture_path("configs/vodopt.toml")).unwrap(),
    );
    let stub_dir = base.path().join("bin");
    std::fs::create_dir_all(&stub_dir).unwrap();
    let ffmpeg = install_stub(&stub_dir, "ffmpeg", ffmpeg_script);
    let ffprobe = install_stub(&stub_dir, "ffprobe", FFPROBE_STUB);
    config.encoder.ffmpeg = ffmpeg.to_string_lossy().to_string();
    config.encoder.ffprobe = ffprobe.to_string_lossy().to_string();
    (config, stub_dir)
}

async fn drain_events(mut receiver: mpsc::Receiver<OptimizerEvent>) -> Vec<String> {
    let mut messages = Vec::new();
    while let Some(event) = receiver.recv().await {
        let message = match event {
            OptimizerEvent::Progress { message } => message,
            OptimizerEvent::Completed { message, .. } => message,
            OptimizerEvent::Error { message, .. } => message,
        };
        messages.push(message);
    }
    messages
}

#[tokio::test]
async fn convert_batch_end_to_end() {
    let base = TempDir::new().unwrap();
    let (config, stub_dir) = build_config(&base, FFMPEG_STUB);
    let output_dir = PathBuf::from(&config.paths.output_dir);
    let state_file = config.state_file();

    let media_dir = base.path().join("media");
    std::fs::create_dir_all(&media_dir).unwrap();
    let input = media_dir.join("clip.mp4");
    std::fs::write(&input, b"fake video").unwrap();
    let rejected = media_dir.join("notes.txt");
    std::fs::write(&rejected, b"not a video").unwrap();

    let (mut optimizer, receiver) = Optimizer::new(config, None).unwrap();
    let summary = optimizer
        .select_inputs(&[input.clone(), rejected.clone()])
        .await
        .unwrap();
    assert_eq!(summary.accepted, vec![input.clone()]);
    assert_eq!(summary.total_duration, 95.0);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].reason, "unsupported container");

    let reports = optimizer.convert_all().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].segment_count, 10);
    let manifest = output_dir.join("optimized_clip.m3u8");
    assert_eq!(reports[0].manifest_path, manifest);

    let store = JobProgressStore::load(&state_file);
    let job = store.get(&input).unwrap();
    assert!(job.completed);
    assert_eq!(job.progress, 100.0);
    assert_eq!(job.time_mark_second, 95.0);

    let key = std::fs::read(output_dir.join("key.key")).unwrap();
    assert_eq!(key.len(), 16);
    let descriptor = std::fs::read_to_string(output_dir.join("key_info")).unwrap();
    let lines: Vec<&str> = descriptor.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "http://localhost:3001/videos/key.key");
    assert_eq!(lines[1], output_dir.join("key.key").display().to_string());
    assert_eq!(lines[2].len(), 32);

    let body = std::fs::read_to_string(&manifest).unwrap();
    assert!(body.starts_with("#EXTM3U\n"));
    assert!(body.contains("#EXT-X-TARGETDURATION:10"));
    assert!(body.contains("#EXT-X-MEDIA-SEQUENCE:0"));
    assert_eq!(body.matches("#EXTINF:10.000000,").count(), 9);
    assert!(body.contains("#EXTINF:5.000000,"));
    assert!(body.contains("clip_segment_009.ts"));
    assert!(body.trim_end().ends_with("#EXT-X-ENDLIST"));

    let calls = std::fs::read_to_string(stub_dir.join("calls.log")).unwrap();
    assert_eq!(calls.lines().count(), 1);
    let call = calls.lines().next().unwrap();
    assert!(call.contains("-hls_key_info_file"));
    assert!(call.contains("-hls_time 10"));
    assert!(call.contains("-g 300"));
    assert!(!call.contains("-start_number"));
    assert!(call.contains(&input.display().to_string()));

    drop(optimizer);
    let messages = drain_events(receiver).await;
    assert!(messages.contains(&"Processing: 32% done".to_string()));
    assert!(messages.contains(&"Processing: 100% done".to_string()));
    assert!(messages.contains(&format!(
        "Video optimized and converted successfully as {}.",
        manifest.display()
    )));
}

#[tokio::test]
async fn resume_restarts_only_the_incomplete_job() {
    let base = TempDir::new().unwrap();
    let (config, stub_dir) = build_config(&base, FFMPEG_STUB);
    let state_file = config.state_file();

    let media_dir = base.path().join("media");
    std::fs::create_dir_all(&media_dir).unwrap();
    let done = media_dir.join("done.mp4");
    let pending = media_dir.join("pending.mp4");
    std::fs::write(&done, b"fake video").unwrap();
    std::fs::write(&pending, b"fake video").unwrap();

    let mut store = JobProgressStore::load(&state_file);
    store
        .replace_all(vec![
            JobRecord::new(done.clone(), 30.0),
            JobRecord::new(pending.clone(), 95.0),
        ])
        .unwrap();
    store.record_progress(&pending, 40.0, 38.0).unwrap();
    store.mark_completed(&done).unwrap();
    drop(store);

    let (mut optimizer, _receiver) = Optimizer::new(config, None).unwrap();
    let reports = optimizer.resume().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].input, pending);

    let calls = std::fs::read_to_string(stub_dir.join("calls.log")).unwrap();
    assert_eq!(calls.lines().count(), 1);
    let call = calls.lines().next().unwrap();
    assert!(call.contains("-start_number 0 -ss 0"));
    assert!(call.contains("pending.mp4"));
    assert!(!call.contains("done.mp4"));

    let reloaded = JobProgressStore::load(&state_file);
    let job = reloaded.get(&pending).unwrap();
    assert!(job.completed);
    assert_eq!(job.time_mark_second, 95.0);
    // Persisted percent stays relative to the whole batch (125s), so a
    // 95s job tops out below 100 on its own.
    assert_eq!(job.progress, 76.0);
    assert!(reloaded.incomplete().next().is_none());
}

#[tokio::test]
async fn encoder_failure_leaves_job_incomplete_with_no_retry() {
    let base = TempDir::new().unwrap();
    let (config, stub_dir) = build_config(&base, FFMPEG_FAIL_STUB);
    let state_file = config.state_file();

    let media_dir = base.path().join("media");
    std::fs::create_dir_all(&media_dir).unwrap();
    let input = media_dir.join("clip.mp4");
    std::fs::write(&input, b"fake video").unwrap();

    let (mut optimizer, receiver) = Optimizer::new(config, None).unwrap();
    optimizer.select_inputs(&[input.clone()]).await.unwrap();

    let result = optimizer.convert_all().await;
    assert!(matches!(result, Err(OptimizerError::Encoder(_))));

    // One invocation only, the batch stops at the failure.
    let calls = std::fs::read_to_string(stub_dir.join("calls.log")).unwrap();
    assert_eq!(calls.lines().count(), 1);

    let store = JobProgressStore::load(&state_file);
    let job = store.get(&input).unwrap();
    assert!(!job.completed);
    assert_eq!(job.time_mark_second, 10.0);

    drop(optimizer);
    let messages = drain_events(receiver).await;
    let errors: Vec<&String> = messages
        .iter()
        .filter(|message| message.starts_with("Error during video processing:"))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Invalid data found"));
}

#[tokio::test]
async fn reconcile_failure_leaves_job_incomplete() {
    let base = TempDir::new().unwrap();
    let (config, _stub_dir) = build_config(&base, FFMPEG_NO_SEGMENTS_STUB);
    let output_dir = PathBuf::from(&config.paths.output_dir);
    let state_file = config.state_file();

    let media_dir = base.path().join("media");
    std::fs::create_dir_all(&media_dir).unwrap();
    let input = media_dir.join("clip.mp4");
    std::fs::write(&input, b"fake video").unwrap();

    let (mut optimizer, receiver) = Optimizer::new(config, None).unwrap();
    optimizer.select_inputs(&[input.clone()]).await.unwrap();

    // The encoder exits cleanly but produced no segments, so the manifest
    // cannot be rebuilt and the job must stay eligible for resume.
    let result = optimizer.convert_all().await;
    assert!(matches!(result, Err(OptimizerError::Playlist(_))));
    assert!(!output_dir.join("optimized_clip.m3u8").exists());

    let store = JobProgressStore::load(&state_file);
    let job = store.get(&input).unwrap();
    assert!(!job.completed);

    drop(optimizer);
    let messages = drain_events(receiver).await;
    let errors: Vec<&String> = messages
        .iter()
        .filter(|message| message.starts_with("Error during video processing:"))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("no segments found"));
}

#[tokio::test]
async fn cancel_kills_the_encoder_and_leaves_the_job_resumable() {
    let base = TempDir::new().unwrap();
    let (config, _stub_dir) = build_config(&base, FFMPEG_HANG_STUB);
    let state_file = config.state_file();

    let media_dir = base.path().join("media");
    std::fs::create_dir_all(&media_dir).unwrap();
    let input = media_dir.join("clip.mp4");
    std::fs::write(&input, b"fake video").unwrap();

    let (mut optimizer, mut receiver) = Optimizer::new(config, None).unwrap();
    optimizer.select_inputs(&[input.clone()]).await.unwrap();

    let cancel = optimizer.cancel_signal();
    let worker = tokio::spawn(async move { optimizer.convert_all().await });

    while let Some(event) = receiver.recv().await {
        if matches!(event, OptimizerEvent::Progress { .. }) {
            break;
        }
    }
    cancel.cancel();

    let result = worker.await.unwrap();
    assert!(matches!(result, Err(OptimizerError::Cancelled { .. })));

    let mut saw_error = false;
    while let Some(event) = receiver.recv().await {
        if let OptimizerEvent::Error { message, .. } = event {
            assert!(message.starts_with("Error during video processing:"));
            saw_error = true;
        }
    }
    assert!(saw_error);

    let store = JobProgressStore::load(&state_file);
    let job = store.get(&input).unwrap();
    assert!(!job.completed);
    assert!(job.progress > 0.0);
    assert_eq!(job.time_mark_second, 5.0);
}
