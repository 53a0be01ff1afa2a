pub mod queue;
pub mod scheduler;
pub mod system;
pub mod worker;

pub use queue::{BucketHead, CancelOutcome, QueueSnapshot, QueueStats, TaskQueue};
pub use scheduler::{BatchScheduler, SchedulerStatus};
pub use system::{DeviceChoice, QueueListing, TranscriptionSystem};
pub use worker::WorkerPool;
