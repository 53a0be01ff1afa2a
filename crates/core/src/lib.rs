pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod task;

pub use bus::{EventBus, SubscriberId, Subscription};
pub use config::{OrchestratorConfig, SharedConcurrency, HARD_CONCURRENCY_LIMIT};
pub use error::{CoreError, Result, TaskError, TaskErrorKind};
pub use event::BusEvent;
pub use model::WhisperModel;
pub use task::{
    FileTranscript, OutputFormat, Task, TaskId, TaskPriority, TaskResult, TaskSpec, TaskStatus,
    TaskView, TranscriptSegment,
};
