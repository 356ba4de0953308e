use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

const SEGMENT_EXTENSION: &str = ".ts";

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("no segments found in {dir}")]
    NoSegments { dir: PathBuf },
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type PlaylistResult<T> = std::result::Result<T, PlaylistError>;

/// Summary of one manifest rebuild.
#[derive(Debug, Clone)]
pub struct RebuiltPlaylist {
    pub manifest_path: PathBuf,
    pub segment_count: usize,
    pub media_sequence: u64,
}

#[derive(Debug)]
struct SegmentFile {
    ordinal: u64,
    file_name: String,
}

/// Recomputes a VOD manifest from the segment files present on disk.
///
/// The manifest is never patched in place. Every call lists the output
/// directory, orders the matching segments by the numeric ordinal in their
/// names, and overwrites the manifest wholesale, so the call is idempotent
/// for identical inputs. At most `ceil(total / target)` entries are
/// emitted; extra files from an earlier aborted run are ignored. Each
/// entry gets the target duration except the one at the expected-count
/// boundary, which gets the remainder of `total_duration`.
pub fn rebuild(
    output_dir: &Path,
    manifest_path: &Path,
    segment_prefix: &str,
    target_segment_duration: f64,
    total_duration: f64,
) -> PlaylistResult<RebuiltPlaylist> {
    let segments = scan_segments(output_dir, segment_prefix)?;
    if segments.is_empty() {
        return Err(PlaylistError::NoSegments {
            dir: output_dir.to_path_buf(),
        });
    }

    let expected = (total_duration / target_segment_duration).ceil() as usize;
    let media_sequence = segments[0].ordinal;

    let mut manifest = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    manifest.push_str(&format!(
        "#EXT-X-TARGETDURATION:{}\n",
        target_segment_duration.ceil() as u64
    ));
    manifest.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
    manifest.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");

    let mut emitted = 0usize;
    for (index, segment) in segments.iter().take(expected).enumerate() {
        let duration = if index + 1 == expected {
            (total_duration - target_segment_duration * index as f64).max(0.0)
        } else {
            target_segment_duration
        };
        manifest.push_str(&format!("#EXTINF:{:.6},\n{}\n", duration, segment.file_name));
        emitted += 1;
    }
    manifest.push_str("#EXT-X-ENDLIST\n");

    fs::write(manifest_path, manifest).map_err(|source| PlaylistError::Io {
        source,
        path: manifest_path.to_path_buf(),
    })?;

    debug!(
        manifest = %manifest_path.display(),
        segments = emitted,
        media_sequence,
        "manifest rebuilt"
    );
    Ok(RebuiltPlaylist {
        manifest_path: manifest_path.to_path_buf(),
        segment_count: emitted,
        media_sequence,
    })
}

fn scan_segments(output_dir: &Path, prefix: &str) -> PlaylistResult<Vec<SegmentFile>> {
    let ordinal_pattern = Regex::new(r"\d+").expect("valid regex");
    let entries = fs::read_dir(output_dir).map_err(|source| PlaylistError::Io {
        source,
        path: output_dir.to_path_buf(),
    })?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PlaylistError::Io {
            source,
            path: output_dir.to_path_buf(),
        })?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !file_name.starts_with(prefix) || !file_name.ends_with(SEGMENT_EXTENSION) {
            continue;
        }
        // The ordinal is searched after the prefix so digits in the input
        // stem cannot shadow the segment number.
        let tail = &file_name[prefix.len()..];
        let ordinal = match ordinal_pattern.find(tail).map(|m| m.as_str().parse()) {
            Some(Ok(ordinal)) => ordinal,
            _ => {
                warn!(segment = %file_name, "segment name carries no usable ordinal, skipped");
                continue;
            }
        };
        segments.push(SegmentFile { ordinal, file_name });
    }
    segments.sort_by_key(|segment| segment.ordinal);
    Ok(segments)
}
