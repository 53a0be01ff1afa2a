//! Transcript rendering.
//!
//! Every write is at-most-once: content goes to a `.part` sibling and
//! is renamed into place. Existing files are never overwritten; a
//! timestamp suffix keeps the new artifact distinct.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use tracing::info;

use scribe_core::event::epoch_millis;
use scribe_core::task::{OutputFormat, TaskId, TranscriptSegment};

/// The per-task transcript a render call works from: all input files
/// merged, in submission order.
#[derive(Debug, Clone)]
pub struct CombinedTranscript {
    pub language: String,
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
}

/// Render `transcript` as `format` under `out_dir`, named after the
/// first input file. Returns the final path.
pub fn render(
    format: OutputFormat,
    base_name: &str,
    transcript: &CombinedTranscript,
    out_dir: &Path,
    task_id: TaskId,
) -> io::Result<PathBuf> {
    fs::create_dir_all(out_dir)?;
    let final_path = collision_free_path(out_dir, base_name, format.extension());

    let content = match format {
        OutputFormat::Plaintext => transcript.text.clone(),
        OutputFormat::Srt => render_srt(&transcript.segments),
        OutputFormat::Vtt => render_vtt(&transcript.segments),
        OutputFormat::Structured => render_structured(task_id, base_name, transcript)?,
    };

    let temp_path = final_path.with_extension(format!("{}.part", format.extension()));
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, &final_path)?;
    info!(path = %final_path.display(), format = format.extension(), "Transcript rendered");
    Ok(final_path)
}

fn collision_free_path(out_dir: &Path, base_name: &str, extension: &str) -> PathBuf {
    let candidate = out_dir.join(format!("{base_name}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }
    out_dir.join(format!("{base_name}_{}.{extension}", epoch_millis()))
}

fn render_srt(segments: &[TranscriptSegment]) -> String {
    let mut out = String::new();
    for (index, segment) in segments.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_timestamp(segment.start, ','),
            format_timestamp(segment.end, ','),
            segment.text.trim()
        ));
    }
    out
}

fn render_vtt(segments: &[TranscriptSegment]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for segment in segments {
        out.push_str(&format!(
            "{} --> {}\n{}\n\n",
            format_timestamp(segment.start, '.'),
            format_timestamp(segment.end, '.'),
            segment.text.trim()
        ));
    }
    out
}

fn render_structured(
    task_id: TaskId,
    base_name: &str,
    transcript: &CombinedTranscript,
) -> io::Result<String> {
    let payload = json!({
        "metadata": {
            "task_id": task_id,
            "created_at": epoch_millis(),
            "filename": base_name,
        },
        "transcription": {
            "language": transcript.language,
            "text": transcript.text,
            "segments": transcript.segments,
        },
    });
    serde_json::to_string_pretty(&payload).map_err(io::Error::other)
}

/// `HH:MM:SS<sep>mmm`; SRT wants a comma, VTT a dot.
fn format_timestamp(seconds: f64, millis_sep: char) -> String {
    let seconds = seconds.max(0.0);
    let hours = (seconds / 3600.0) as u64;
    let minutes = ((seconds % 3600.0) / 60.0) as u64;
    let secs = (seconds % 60.0) as u64;
    let millis = ((seconds % 1.0) * 1000.0) as u64;
    format!("{hours:02}:{minutes:02}:{secs:02}{millis_sep}{millis:03}")
}

/// One entry in the rendered-artifact listing.
#[derive(Debug, Clone, Serialize)]
pub struct OutputFileInfo {
    pub name: String,
    pub size: u64,
    pub modified_ms: u64,
}

/// Everything currently rendered under `out_dir`, newest first.
/// `.part` leftovers and dotfiles are skipped.
pub fn list_outputs(out_dir: &Path) -> io::Result<Vec<OutputFileInfo>> {
    let mut files = Vec::new();
    if !out_dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(out_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name.ends_with(".part") {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        files.push(OutputFileInfo {
            name,
            size: metadata.len(),
            modified_ms,
        });
    }
    files.sort_by(|a, b| b.modified_ms.cmp(&a.modified_ms));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> CombinedTranscript {
        CombinedTranscript {
            language: "en".into(),
            text: "hello world".into(),
            segments: vec![
                TranscriptSegment {
                    start: 0.0,
                    end: 1.5,
                    text: "hello".into(),
                },
                TranscriptSegment {
                    start: 1.5,
                    end: 3.25,
                    text: "world".into(),
                },
            ],
        }
    }

    #[test]
    fn timestamp_formats() {
        assert_eq!(format_timestamp(0.0, ','), "00:00:00,000");
        assert_eq!(format_timestamp(61.5, ','), "00:01:01,500");
        assert_eq!(format_timestamp(3661.042, '.'), "01:01:01.041");
    }

    #[test]
    fn srt_numbers_cues() {
        let srt = render_srt(&transcript().segments);
        assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:01,500\nhello\n"));
        assert!(srt.contains("2\n00:00:01,500 --> 00:00:03,250\nworld\n"));
    }

    #[test]
    fn vtt_has_header_and_dot_millis() {
        let vtt = render_vtt(&transcript().segments);
        assert!(vtt.starts_with("WEBVTT\n\n"));
        assert!(vtt.contains("00:00:00.000 --> 00:00:01.500\nhello\n"));
    }

    #[test]
    fn render_commits_atomically() {
        let dir = std::env::temp_dir().join(format!("scribe-render-{}", uuid_suffix()));
        let path = render(
            OutputFormat::Plaintext,
            "meeting",
            &transcript(),
            &dir,
            TaskId::new(),
        )
        .unwrap();
        assert_eq!(path, dir.join("meeting.txt"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello world");
        // No temp debris left behind.
        assert!(!dir.join("meeting.txt.part").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn render_never_overwrites() {
        let dir = std::env::temp_dir().join(format!("scribe-render-{}", uuid_suffix()));
        let first = render(
            OutputFormat::Plaintext,
            "meeting",
            &transcript(),
            &dir,
            TaskId::new(),
        )
        .unwrap();
        let second = render(
            OutputFormat::Plaintext,
            "meeting",
            &transcript(),
            &dir,
            TaskId::new(),
        )
        .unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn structured_output_is_valid_json() {
        let dir = std::env::temp_dir().join(format!("scribe-render-{}", uuid_suffix()));
        let path = render(
            OutputFormat::Structured,
            "meeting",
            &transcript(),
            &dir,
            TaskId::new(),
        )
        .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["transcription"]["language"], "en");
        assert_eq!(
            value["transcription"]["segments"].as_array().unwrap().len(),
            2
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn listing_skips_partials_and_sorts_newest_first() {
        let dir = std::env::temp_dir().join(format!("scribe-render-{}", uuid_suffix()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.txt"), "a").unwrap();
        fs::write(dir.join("b.srt.part"), "partial").unwrap();
        fs::write(dir.join(".hidden"), "x").unwrap();
        let files = list_outputs(&dir).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.txt");
        fs::remove_dir_all(&dir).unwrap();
    }

    fn uuid_suffix() -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!(
            "{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        )
    }
}
