//! Contracts between the orchestrator and its collaborators: the
//! transcription engine, audio metadata and output rendering. The
//! orchestrator only ever sees these traits; production wires a real
//! whisper backend, tests wire [`mock::MockEngine`].

pub mod mock;
pub mod render;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use scribe_core::error::{TaskError, TaskErrorKind};
use scribe_core::model::WhisperModel;
use scribe_core::task::TranscriptSegment;

/// Compute placement for an engine handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cuda(u32),
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cuda(id) => write!(f, "cuda:{id}"),
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

/// Engine output for a single audio reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub detected_language: String,
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transient engine failure: {0}")]
    Transient(String),

    #[error("Fatal engine failure: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Map an engine failure onto the task error taxonomy.
    pub fn into_task_error(self) -> TaskError {
        match self {
            EngineError::InvalidInput(msg) => TaskError::new(TaskErrorKind::InputInvalid, msg),
            EngineError::Transient(msg) => TaskError::new(TaskErrorKind::EngineTransient, msg),
            EngineError::Fatal(msg) => TaskError::new(TaskErrorKind::EngineFatal, msg),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Fetch-progress callback: 0..=99 in flight, 100 done, -1 failed.
pub type DownloadProgress<'a> = &'a (dyn Fn(i8, &str) + Send + Sync);

/// A loaded model bound to one device. The engine is only required to
/// be thread-safe across distinct handles on distinct devices; the
/// worker serializes same-device use.
#[async_trait]
pub trait ModelHandle: Send + Sync {
    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<&str>,
    ) -> EngineResult<Transcription>;

    /// Peak device memory this handle has used, when the backend
    /// tracks it. Feeds pool calibration; `None` skips the sample.
    fn peak_memory_gb(&self) -> Option<f64>;

    async fn unload(self: Box<Self>);
}

#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Acquire `model` on `device`, fetching the weights if they are
    /// not cached locally. Fetch progress is streamed through
    /// `progress`.
    async fn load(
        &self,
        model: WhisperModel,
        device: Device,
        progress: DownloadProgress<'_>,
    ) -> EngineResult<Box<dyn ModelHandle>>;
}

/// Duration lookup used by the admission estimator.
pub trait AudioMetadata: Send + Sync {
    fn duration_seconds(&self, audio: &Path) -> EngineResult<f64>;
}
