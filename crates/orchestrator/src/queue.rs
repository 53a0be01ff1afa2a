//! Multi-priority task queue, grouped by model.
//!
//! The queue owns every task state transition. Each bucket keeps
//! strict priority order with FIFO ties; running tasks live in a
//! separate map and terminal tasks linger in a short ring so clients
//! can still observe the final state. Every transition is published
//! to the event bus under the same critical section that applied it,
//! so per-task event order always matches transition order.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use scribe_core::bus::EventBus;
use scribe_core::error::{TaskError, TaskErrorKind};
use scribe_core::event::{epoch_millis, BusEvent};
use scribe_core::model::{language_supported, WhisperModel};
use scribe_core::task::{Task, TaskId, TaskResult, TaskSpec, TaskStatus, TaskView};

const FINISHED_RETENTION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub total_added: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
}

/// Head-of-bucket summary the scheduler ranks on.
#[derive(Debug, Clone)]
pub struct BucketHead {
    pub model: WhisperModel,
    pub task_id: TaskId,
    pub files: Vec<String>,
    pub preferred_gpu: Option<u32>,
    pub head_created_at: u64,
    pub pending: usize,
}

/// Where a cancel request found the task.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Was still pending; removed and marked terminal.
    Removed,
    /// Owned by a worker; the caller must trip its token.
    Running,
    /// Unknown or already terminal.
    NoOp,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub pending: Vec<TaskView>,
    pub running: Vec<TaskView>,
    pub stats: QueueStats,
}

struct QueueState {
    buckets: HashMap<WhisperModel, VecDeque<Task>>,
    running: HashMap<TaskId, Task>,
    finished: VecDeque<(Instant, Task)>,
    stats: QueueStats,
}

impl QueueState {
    fn evict_finished(&mut self) {
        while let Some((at, _)) = self.finished.front() {
            if at.elapsed() > FINISHED_RETENTION {
                self.finished.pop_front();
            } else {
                break;
            }
        }
    }

    fn find_pending(&self, id: TaskId) -> Option<(WhisperModel, usize)> {
        for (model, bucket) in &self.buckets {
            if let Some(index) = bucket.iter().position(|t| t.id == id) {
                return Some((*model, index));
            }
        }
        None
    }
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
    bus: Arc<EventBus>,
    wakeup: Arc<Notify>,
    max_retries: u32,
    upload_dir: PathBuf,
}

impl TaskQueue {
    pub fn new(bus: Arc<EventBus>, max_retries: u32, upload_dir: PathBuf) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buckets: HashMap::new(),
                running: HashMap::new(),
                finished: VecDeque::new(),
                stats: QueueStats::default(),
            }),
            bus,
            wakeup: Arc::new(Notify::new()),
            max_retries,
            upload_dir,
        }
    }

    /// Signal handle the scheduler waits on.
    pub fn wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    pub fn resolve_audio(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.upload_dir.join(path)
        }
    }

    fn validate(&self, spec: &TaskSpec) -> Result<(), TaskError> {
        if spec.files.is_empty() {
            return Err(TaskError::input_invalid("no input files"));
        }
        for file in &spec.files {
            let path = self.resolve_audio(file);
            if !path.is_file() {
                return Err(TaskError::input_invalid(format!(
                    "audio file not found: {file}"
                )));
            }
        }
        if let Some(language) = spec.language.as_deref() {
            if !language_supported(language) {
                return Err(TaskError::input_invalid(format!(
                    "unsupported language: {language}"
                )));
            }
        }
        if spec.output_formats.is_empty() {
            return Err(TaskError::input_invalid("no output formats requested"));
        }
        Ok(())
    }

    /// Validate and enqueue a submission. Publishes the initial
    /// Pending update and wakes the scheduler.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId, TaskError> {
        self.validate(&spec)?;
        let task = Task::new(spec);
        let id = task.id;
        {
            let mut state = self.state.lock();
            state.evict_finished();
            let bucket = state.buckets.entry(task.spec.model).or_default();
            // Strict priority, FIFO among equals: insert before the
            // first strictly lower-priority entry.
            let position = bucket
                .iter()
                .position(|queued| queued.spec.priority < task.spec.priority)
                .unwrap_or(bucket.len());
            info!(
                task = %id,
                model = %task.spec.model,
                priority = ?task.spec.priority,
                queue_len = bucket.len() + 1,
                "Task submitted"
            );
            self.bus.publish(BusEvent::TaskUpdate(task.view()));
            bucket.insert(position, task);
            state.stats.total_added += 1;
        }
        self.wakeup.notify_one();
        Ok(id)
    }

    /// One summary per non-empty bucket.
    pub fn bucket_heads(&self) -> Vec<BucketHead> {
        let state = self.state.lock();
        state
            .buckets
            .iter()
            .filter_map(|(model, bucket)| {
                bucket.front().map(|head| BucketHead {
                    model: *model,
                    task_id: head.id,
                    files: head.spec.files.clone(),
                    preferred_gpu: head.spec.preferred_gpu,
                    head_created_at: head.created_at_ms,
                    pending: bucket.len(),
                })
            })
            .collect()
    }

    /// `(gpu, model)` pairs currently in flight, for locality ranking.
    pub fn running_models(&self) -> Vec<(u32, WhisperModel)> {
        let state = self.state.lock();
        state
            .running
            .values()
            .filter_map(|t| t.assigned_gpu.map(|gpu| (gpu, t.spec.model)))
            .collect()
    }

    /// Move a pending task into Loading on `gpu`, after its memory was
    /// reserved. Returns the task for dispatch, or `None` if it left
    /// the queue in the meantime (the caller must undo the
    /// reservation).
    pub fn take_for_dispatch(&self, id: TaskId, gpu: u32, reserved_gb: f64) -> Option<Task> {
        let mut state = self.state.lock();
        let (model, index) = state.find_pending(id)?;
        let mut task = state
            .buckets
            .get_mut(&model)
            .and_then(|bucket| bucket.remove(index))?;
        debug_assert!(task.status.can_transition_to(TaskStatus::Loading));
        task.status = TaskStatus::Loading;
        task.assigned_gpu = Some(gpu);
        task.reserved_gb = Some(reserved_gb);
        task.message = Some(format!("loading {} on device {gpu}", task.spec.model));
        self.bus.publish(BusEvent::TaskUpdate(task.view()));
        state.running.insert(id, task.clone());
        info!(task = %id, gpu, reserved_gb, "Task dispatched");
        Some(task)
    }

    /// Loading is done, the engine is about to transcribe.
    pub fn mark_processing(&self, id: TaskId) {
        let mut state = self.state.lock();
        if let Some(task) = state.running.get_mut(&id) {
            if !task.status.can_transition_to(TaskStatus::Processing) {
                warn!(task = %id, status = ?task.status, "Illegal transition to Processing");
                return;
            }
            task.status = TaskStatus::Processing;
            task.started_at_ms = Some(epoch_millis());
            task.message = Some("transcribing".to_string());
            self.bus.publish(BusEvent::TaskUpdate(task.view()));
        }
    }

    /// Progress is monotonic: regressions are suppressed, repeats of
    /// the current value still publish (liveness during long stages).
    pub fn update_progress(&self, id: TaskId, progress: f32, message: Option<String>) {
        let mut state = self.state.lock();
        if let Some(task) = state.running.get_mut(&id) {
            let progress = progress.clamp(0.0, 100.0);
            if progress < task.progress {
                return;
            }
            task.progress = progress;
            if message.is_some() {
                task.message = message;
            }
            self.bus.publish(BusEvent::TaskUpdate(task.view()));
        }
    }

    /// Record model-fetch sub-progress on the task; the worker emits
    /// the matching `download_progress` event itself.
    pub fn set_download_progress(&self, id: TaskId, progress: i8) {
        let mut state = self.state.lock();
        if let Some(task) = state.running.get_mut(&id) {
            task.download_progress = Some(progress);
        }
    }

    pub fn complete(&self, id: TaskId, result: TaskResult) {
        let mut state = self.state.lock();
        state.evict_finished();
        let Some(mut task) = state.running.remove(&id) else {
            warn!(task = %id, "Completion for unknown task");
            return;
        };
        if !task.status.can_transition_to(TaskStatus::Completed) {
            warn!(task = %id, status = ?task.status, "Illegal transition to Completed");
        }
        task.status = TaskStatus::Completed;
        task.progress = 100.0;
        task.finished_at_ms = Some(epoch_millis());
        task.message = Some("completed".to_string());
        task.result = Some(result);
        task.reserved_gb = None;
        state.stats.total_completed += 1;
        info!(task = %id, "Task completed");
        self.bus.publish(BusEvent::TaskUpdate(task.view()));
        state.finished.push_back((Instant::now(), task));
        drop(state);
        self.wakeup.notify_one();
    }

    /// Worker-reported failure. Retryable kinds under the retry budget
    /// go back to the tail of their bucket (Retrying then Pending);
    /// everything else is terminal.
    pub fn fail(&self, id: TaskId, error: TaskError) {
        let mut state = self.state.lock();
        state.evict_finished();
        let Some(mut task) = state.running.remove(&id) else {
            warn!(task = %id, "Failure report for unknown task");
            return;
        };

        if error.kind.retryable() && task.retry_count < self.max_retries {
            task.status = TaskStatus::Retrying;
            task.retry_count += 1;
            task.message = Some(format!(
                "retrying ({}/{}): {}",
                task.retry_count, self.max_retries, error.message
            ));
            self.bus.publish(BusEvent::TaskUpdate(task.view()));

            task.status = TaskStatus::Pending;
            task.assigned_gpu = None;
            task.reserved_gb = None;
            task.started_at_ms = None;
            task.progress = 0.0;
            task.download_progress = None;
            self.bus.publish(BusEvent::TaskUpdate(task.view()));
            info!(task = %id, retry = task.retry_count, "Task requeued after failure");
            // Tail of the same bucket, no priority boost.
            state.buckets.entry(task.spec.model).or_default().push_back(task);
            state.stats.total_retried += 1;
        } else {
            task.status = TaskStatus::Failed;
            task.finished_at_ms = Some(epoch_millis());
            task.message = Some(error.message.clone());
            task.error = Some(error);
            task.reserved_gb = None;
            state.stats.total_failed += 1;
            info!(task = %id, retries = task.retry_count, "Task failed terminally");
            self.bus.publish(BusEvent::TaskUpdate(task.view()));
            state.finished.push_back((Instant::now(), task));
        }
        drop(state);
        self.wakeup.notify_one();
    }

    /// Cancel handling for the pending half: a queued task is removed
    /// and marked terminal right here. Running tasks are the worker's
    /// responsibility; the caller trips the token.
    pub fn cancel(&self, id: TaskId) -> CancelOutcome {
        let mut state = self.state.lock();
        state.evict_finished();
        if state.running.contains_key(&id) {
            return CancelOutcome::Running;
        }
        let Some((model, index)) = state.find_pending(id) else {
            return CancelOutcome::NoOp;
        };
        let Some(mut task) = state
            .buckets
            .get_mut(&model)
            .and_then(|bucket| bucket.remove(index))
        else {
            return CancelOutcome::NoOp;
        };
        task.status = TaskStatus::Failed;
        task.finished_at_ms = Some(epoch_millis());
        task.error = Some(TaskError::new(
            TaskErrorKind::ClientCancelled,
            "cancelled before execution",
        ));
        task.message = Some("cancelled".to_string());
        state.stats.total_failed += 1;
        info!(task = %id, "Pending task cancelled");
        self.bus.publish(BusEvent::TaskUpdate(task.view()));
        state.finished.push_back((Instant::now(), task));
        CancelOutcome::Removed
    }

    pub fn get(&self, id: TaskId) -> Option<TaskView> {
        let mut state = self.state.lock();
        state.evict_finished();
        if let Some(task) = state.running.get(&id) {
            return Some(task.view());
        }
        if let Some((model, index)) = state.find_pending(id) {
            return state.buckets[&model].get(index).map(Task::view);
        }
        state
            .finished
            .iter()
            .find(|(_, t)| t.id == id)
            .map(|(_, t)| t.view())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut state = self.state.lock();
        state.evict_finished();
        let mut pending: Vec<TaskView> = state
            .buckets
            .values()
            .flat_map(|bucket| bucket.iter().map(Task::view))
            .collect();
        pending.sort_by_key(|view| view.created_at);
        let running = state.running.values().map(Task::view).collect();
        QueueSnapshot {
            pending,
            running,
            stats: state.stats,
        }
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().buckets.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::task::{OutputFormat, TaskPriority};
    use std::fs;

    fn upload_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("scribe-queue-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        for name in ["a.wav", "b.wav", "c.wav"] {
            let _ = fs::write(dir.join(name), b"riff");
        }
        dir
    }

    fn queue() -> TaskQueue {
        let bus = Arc::new(EventBus::new(
            Duration::from_secs(30),
            Duration::from_secs(120),
        ));
        TaskQueue::new(bus, 3, upload_dir())
    }

    fn spec(model: WhisperModel, priority: TaskPriority) -> TaskSpec {
        TaskSpec {
            files: vec!["a.wav".into()],
            model,
            language: None,
            output_formats: vec![OutputFormat::Plaintext],
            priority,
            preferred_gpu: None,
        }
    }

    #[test]
    fn rejects_missing_file() {
        let queue = queue();
        let mut bad = spec(WhisperModel::Base, TaskPriority::Normal);
        bad.files = vec!["missing.wav".into()];
        let err = queue.submit(bad).unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::InputInvalid);
    }

    #[test]
    fn rejects_unknown_language() {
        let queue = queue();
        let mut bad = spec(WhisperModel::Base, TaskPriority::Normal);
        bad.language = Some("tlh".into());
        assert_eq!(
            queue.submit(bad).unwrap_err().kind,
            TaskErrorKind::InputInvalid
        );
    }

    #[test]
    fn priority_orders_within_bucket() {
        let queue = queue();
        let n1 = queue
            .submit(spec(WhisperModel::Base, TaskPriority::Normal))
            .unwrap();
        let h1 = queue
            .submit(spec(WhisperModel::Base, TaskPriority::High))
            .unwrap();
        let n2 = queue
            .submit(spec(WhisperModel::Base, TaskPriority::Normal))
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            let head = &queue.bucket_heads()[0];
            order.push(head.task_id);
            queue.take_for_dispatch(head.task_id, 0, 1.0).unwrap();
            queue.mark_processing(head.task_id);
            queue.complete(head.task_id, TaskResult::default());
        }
        assert_eq!(order, vec![h1, n1, n2]);
    }

    #[test]
    fn take_for_dispatch_is_single_shot() {
        let queue = queue();
        let id = queue
            .submit(spec(WhisperModel::Base, TaskPriority::Normal))
            .unwrap();
        assert!(queue.take_for_dispatch(id, 0, 1.0).is_some());
        assert!(queue.take_for_dispatch(id, 0, 1.0).is_none());
        assert_eq!(queue.running_count(), 1);
    }

    #[test]
    fn retryable_failure_requeues_at_tail_with_counter() {
        let queue = queue();
        let first = queue
            .submit(spec(WhisperModel::Small, TaskPriority::Normal))
            .unwrap();
        let second = queue
            .submit(spec(WhisperModel::Small, TaskPriority::Normal))
            .unwrap();

        queue.take_for_dispatch(first, 0, 1.0).unwrap();
        queue.fail(first, TaskError::transient("flaky"));

        // Requeued at the tail, behind `second`.
        let head = &queue.bucket_heads()[0];
        assert_eq!(head.task_id, second);
        let view = queue.get(first).unwrap();
        assert_eq!(view.status, TaskStatus::Pending);
        assert_eq!(view.retry_count, 1);
        assert_eq!(view.gpu, None);
    }

    #[test]
    fn retry_budget_exhaustion_is_terminal() {
        let queue = queue();
        let id = queue
            .submit(spec(WhisperModel::Small, TaskPriority::Normal))
            .unwrap();
        for round in 0..4 {
            queue.take_for_dispatch(id, 0, 1.0).unwrap();
            queue.fail(id, TaskError::transient(format!("attempt {round}")));
        }
        let view = queue.get(id).unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.retry_count, 3);
        assert_eq!(view.error.unwrap().kind, TaskErrorKind::EngineTransient);
    }

    #[test]
    fn non_retryable_failure_is_immediately_terminal() {
        let queue = queue();
        let id = queue
            .submit(spec(WhisperModel::Small, TaskPriority::Normal))
            .unwrap();
        queue.take_for_dispatch(id, 0, 1.0).unwrap();
        queue.fail(id, TaskError::fatal("weights corrupt"));
        let view = queue.get(id).unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.retry_count, 0);
    }

    #[test]
    fn cancel_pending_marks_client_cancelled() {
        let queue = queue();
        let id = queue
            .submit(spec(WhisperModel::Base, TaskPriority::Normal))
            .unwrap();
        assert_eq!(queue.cancel(id), CancelOutcome::Removed);
        let view = queue.get(id).unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.error.unwrap().kind, TaskErrorKind::ClientCancelled);
        // Idempotent.
        assert_eq!(queue.cancel(id), CancelOutcome::NoOp);
    }

    #[test]
    fn cancel_running_defers_to_worker() {
        let queue = queue();
        let id = queue
            .submit(spec(WhisperModel::Base, TaskPriority::Normal))
            .unwrap();
        queue.take_for_dispatch(id, 0, 1.0).unwrap();
        assert_eq!(queue.cancel(id), CancelOutcome::Running);
    }

    #[test]
    fn progress_is_monotonic() {
        let queue = queue();
        let id = queue
            .submit(spec(WhisperModel::Base, TaskPriority::Normal))
            .unwrap();
        queue.take_for_dispatch(id, 0, 1.0).unwrap();
        queue.mark_processing(id);
        queue.update_progress(id, 40.0, None);
        queue.update_progress(id, 20.0, None);
        assert_eq!(queue.get(id).unwrap().progress, 40.0);
        queue.update_progress(id, 60.0, None);
        assert_eq!(queue.get(id).unwrap().progress, 60.0);
    }

    #[test]
    fn stats_track_lifecycle() {
        let queue = queue();
        let id = queue
            .submit(spec(WhisperModel::Base, TaskPriority::Normal))
            .unwrap();
        queue.take_for_dispatch(id, 0, 1.0).unwrap();
        queue.mark_processing(id);
        queue.complete(id, TaskResult::default());
        let stats = queue.snapshot().stats;
        assert_eq!(stats.total_added, 1);
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.total_failed, 0);
    }

    #[test]
    fn bucket_heads_reports_each_model_once() {
        let queue = queue();
        queue
            .submit(spec(WhisperModel::Base, TaskPriority::Normal))
            .unwrap();
        queue
            .submit(spec(WhisperModel::Base, TaskPriority::Normal))
            .unwrap();
        queue
            .submit(spec(WhisperModel::Large, TaskPriority::Normal))
            .unwrap();
        let mut heads = queue.bucket_heads();
        heads.sort_by_key(|h| h.model.size_rank());
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[0].model, WhisperModel::Base);
        assert_eq!(heads[0].pending, 2);
        assert_eq!(heads[1].model, WhisperModel::Large);
    }
}
