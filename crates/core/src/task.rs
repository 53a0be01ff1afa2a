use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;
use crate::event::epoch_millis;
use crate::model::WhisperModel;

/// Opaque task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Strict ordering: High > Normal > Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[serde(rename = "txt")]
    Plaintext,
    Srt,
    Vtt,
    #[serde(rename = "json")]
    Structured,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Plaintext => "txt",
            OutputFormat::Srt => "srt",
            OutputFormat::Vtt => "vtt",
            OutputFormat::Structured => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Loading,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Legal edges of the task state machine. Anything else is an
    /// internal error on the caller's side.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Loading)
                | (Pending, Failed)
                | (Loading, Processing)
                | (Loading, Retrying)
                | (Loading, Failed)
                | (Processing, Completed)
                | (Processing, Retrying)
                | (Processing, Failed)
                | (Retrying, Pending)
        )
    }
}

/// A single timestamped utterance from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// The transcription of one input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTranscript {
    pub file: String,
    pub language: String,
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub transcripts: Vec<FileTranscript>,
    pub outputs: Vec<PathBuf>,
}

/// What the client submitted. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub files: Vec<String>,
    pub model: WhisperModel,
    /// `None` means automatic detection.
    pub language: Option<String>,
    pub output_formats: Vec<OutputFormat>,
    pub priority: TaskPriority,
    /// Optional placement hint; honored only when the device admits.
    pub preferred_gpu: Option<u32>,
}

/// A submission plus its mutable execution state. Only the queue, the
/// scheduler and the owning worker ever mutate one.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub created_at_ms: u64,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub assigned_gpu: Option<u32>,
    pub reserved_gb: Option<f64>,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    /// 0..=100, monotonic except on reset into Retrying.
    pub progress: f32,
    pub message: Option<String>,
    /// Model fetch sub-progress: -1 failed, 0..=99 in flight, 100 done.
    pub download_progress: Option<i8>,
    pub error: Option<TaskError>,
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: TaskId::new(),
            spec,
            created_at_ms: epoch_millis(),
            status: TaskStatus::Pending,
            retry_count: 0,
            assigned_gpu: None,
            reserved_gb: None,
            started_at_ms: None,
            finished_at_ms: None,
            progress: 0.0,
            message: None,
            download_progress: None,
            error: None,
            result: None,
        }
    }

    /// Language shown to clients: the requested code, or the detected
    /// one once a transcript exists for an `auto` submission.
    fn public_language(&self) -> String {
        if let Some(code) = &self.spec.language {
            return code.clone();
        }
        self.result
            .as_ref()
            .and_then(|r| r.transcripts.first())
            .map(|t| t.language.clone())
            .unwrap_or_else(|| "auto".to_string())
    }

    /// Snapshot with public fields only, for event fan-out and the API.
    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id,
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            model: self.spec.model,
            language: self.public_language(),
            files: self.spec.files.clone(),
            priority: self.spec.priority,
            created_at: self.created_at_ms,
            start_time: self.started_at_ms,
            end_time: self.finished_at_ms,
            retry_count: self.retry_count,
            gpu: self.assigned_gpu,
            error: self.error.clone(),
            outputs: self
                .result
                .as_ref()
                .map(|r| r.outputs.clone())
                .unwrap_or_default(),
        }
    }
}

/// Public projection of a task, shaped like the `task_update` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub status: TaskStatus,
    pub progress: f32,
    pub message: Option<String>,
    pub model: WhisperModel,
    pub language: String,
    pub files: Vec<String>,
    pub priority: TaskPriority,
    pub created_at: u64,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub retry_count: u32,
    pub gpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub outputs: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TaskSpec {
        TaskSpec {
            files: vec!["a.wav".into()],
            model: WhisperModel::Base,
            language: None,
            output_formats: vec![OutputFormat::Plaintext],
            priority: TaskPriority::Normal,
            preferred_gpu: None,
        }
    }

    #[test]
    fn priority_orders_high_first() {
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn legal_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Loading));
        assert!(Loading.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Loading));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn new_task_starts_pending() {
        let task = Task::new(spec());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.progress, 0.0);
        assert!(task.reserved_gb.is_none());
    }

    #[test]
    fn view_defaults_language_to_auto() {
        let task = Task::new(spec());
        assert_eq!(task.view().language, "auto");
    }

    #[test]
    fn two_submissions_get_distinct_ids() {
        assert_ne!(Task::new(spec()).id, Task::new(spec()).id);
    }

    #[test]
    fn format_extensions() {
        assert_eq!(OutputFormat::Plaintext.extension(), "txt");
        assert_eq!(OutputFormat::Structured.extension(), "json");
    }
}
