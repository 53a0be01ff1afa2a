use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskId;

/// Classification of task failures. The kind decides retry eligibility
/// and is the stable error code surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Missing/unreadable file, unsupported format, unknown model or
    /// language. Terminal, never retried.
    InputInvalid,
    /// Transient shortage: GPU out of memory, probe failure, no device
    /// qualifies right now.
    ResourceUnavailable,
    /// Intermittent engine error during transcription.
    EngineTransient,
    /// Model corrupt or unrecoverable engine state. Terminal.
    EngineFatal,
    /// Wall-clock budget exceeded. Terminal.
    TaskTimeout,
    /// Explicit cancel from the public API. Terminal.
    ClientCancelled,
    /// Invariant violation inside the orchestrator itself.
    Internal,
}

impl TaskErrorKind {
    /// Whether the queue may send the task back for another attempt.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            TaskErrorKind::EngineTransient | TaskErrorKind::ResourceUnavailable
        )
    }

    pub fn code(self) -> &'static str {
        match self {
            TaskErrorKind::InputInvalid => "input_invalid",
            TaskErrorKind::ResourceUnavailable => "resource_unavailable",
            TaskErrorKind::EngineTransient => "engine_transient",
            TaskErrorKind::EngineFatal => "engine_fatal",
            TaskErrorKind::TaskTimeout => "task_timeout",
            TaskErrorKind::ClientCancelled => "client_cancelled",
            TaskErrorKind::Internal => "internal",
        }
    }
}

/// A classified task failure with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {message}", kind.code())]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn input_invalid(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::InputInvalid, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::EngineTransient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::EngineFatal, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Internal, message)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Orchestrator is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, CoreError>;
