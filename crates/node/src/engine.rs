//! Thin adapters over the external transcription tooling: the
//! `whisper` CLI as the engine and `ffprobe` for audio durations.
//! Everything behind the scribe-engine traits, so the orchestrator
//! never sees a process boundary.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use scribe_core::model::WhisperModel;
use scribe_core::task::TranscriptSegment;
use scribe_engine::{
    AudioMetadata, Device, DownloadProgress, EngineError, EngineResult, ModelHandle,
    Transcription, TranscriptionEngine,
};

pub struct WhisperCliEngine {
    model_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl WhisperCliEngine {
    pub fn new(model_dir: PathBuf, scratch_dir: PathBuf) -> Self {
        Self {
            model_dir,
            scratch_dir,
        }
    }

    fn model_file(&self, model: WhisperModel) -> PathBuf {
        self.model_dir.join(format!("{model}.pt"))
    }
}

#[async_trait]
impl TranscriptionEngine for WhisperCliEngine {
    async fn load(
        &self,
        model: WhisperModel,
        device: Device,
        progress: DownloadProgress<'_>,
    ) -> EngineResult<Box<dyn ModelHandle>> {
        // The CLI loads weights per invocation, so "load" only checks
        // the local cache. A missing file is fetched by the first
        // transcribe run; we report the cache state either way.
        if self.model_file(model).is_file() {
            progress(100, "model cached locally");
        } else {
            progress(0, "model will be fetched on first use");
        }
        info!(model = %model, device = %device, "Whisper CLI handle ready");
        Ok(Box::new(CliHandle {
            model,
            device,
            model_dir: self.model_dir.clone(),
            scratch_dir: self.scratch_dir.clone(),
        }))
    }
}

struct CliHandle {
    model: WhisperModel,
    device: Device,
    model_dir: PathBuf,
    scratch_dir: PathBuf,
}

#[async_trait]
impl ModelHandle for CliHandle {
    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<&str>,
    ) -> EngineResult<Transcription> {
        let scratch = self.scratch_dir.join(format!(
            "{}-{}",
            std::process::id(),
            audio
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        ));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| EngineError::Transient(format!("scratch dir: {e}")))?;

        let mut cmd = Command::new("whisper");
        cmd.arg(audio)
            .args(["--model", self.model.name()])
            .arg("--model_dir")
            .arg(&self.model_dir)
            .args(["--output_format", "json"])
            .arg("--output_dir")
            .arg(&scratch)
            .arg("--device")
            .arg(self.device.to_string())
            .args(["--verbose", "False"]);
        if let Some(language) = language {
            cmd.args(["--language", language]);
        }

        debug!(audio = %audio.display(), model = %self.model, "Invoking whisper CLI");
        let output = cmd
            .output()
            .await
            .map_err(|e| EngineError::Transient(format!("failed to spawn whisper: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_dir_all(&scratch).await;
            return Err(classify_failure(&stderr));
        }

        let stem = audio
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let json_path = scratch.join(format!("{stem}.json"));
        let raw = tokio::fs::read_to_string(&json_path)
            .await
            .map_err(|e| EngineError::Fatal(format!("whisper produced no result: {e}")))?;
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        parse_whisper_json(&raw)
    }

    fn peak_memory_gb(&self) -> Option<f64> {
        // The CLI exposes no allocator statistics; calibration skips
        // this sample.
        None
    }

    async fn unload(self: Box<Self>) {}
}

fn classify_failure(stderr: &str) -> EngineError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("out of memory") || lowered.contains("cuda error") {
        EngineError::Transient(last_line(stderr))
    } else if lowered.contains("failed to load audio") || lowered.contains("no such file") {
        EngineError::InvalidInput(last_line(stderr))
    } else {
        EngineError::Fatal(last_line(stderr))
    }
}

/// The last non-empty stderr line carries the actual error in a
/// Python traceback.
fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("whisper failed without output")
        .trim()
        .to_string()
}

fn parse_whisper_json(raw: &str) -> EngineResult<Transcription> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| EngineError::Fatal(format!("unparseable whisper output: {e}")))?;
    let text = value["text"].as_str().unwrap_or_default().trim().to_string();
    let detected_language = value["language"].as_str().unwrap_or("unknown").to_string();
    let segments = value["segments"]
        .as_array()
        .map(|segments| {
            segments
                .iter()
                .map(|s| TranscriptSegment {
                    start: s["start"].as_f64().unwrap_or(0.0),
                    end: s["end"].as_f64().unwrap_or(0.0),
                    text: s["text"].as_str().unwrap_or_default().trim().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(Transcription {
        text,
        detected_language,
        segments,
    })
}

/// Audio duration via `ffprobe`.
pub struct FfprobeMetadata;

impl AudioMetadata for FfprobeMetadata {
    fn duration_seconds(&self, audio: &Path) -> EngineResult<f64> {
        let output = std::process::Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(audio)
            .output()
            .map_err(|e| EngineError::Transient(format!("failed to spawn ffprobe: {e}")))?;
        if !output.status.success() {
            return Err(EngineError::InvalidInput(format!(
                "ffprobe rejected {}",
                audio.display()
            )));
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| EngineError::InvalidInput(format!("no duration for {}", audio.display())))
    }
}
