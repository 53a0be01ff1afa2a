//! Per-task execution pipeline: load, transcribe, finalize, release.
//!
//! Each admitted task runs on its own tokio task. The pool reservation
//! is released on every exit path; success additionally feeds the
//! observed peak back into calibration. Engine access on one device is
//! serialized behind a per-device mutex since the engine must not be
//! re-entered on the same device.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scribe_core::bus::EventBus;
use scribe_core::error::{TaskError, TaskErrorKind};
use scribe_core::event::BusEvent;
use scribe_core::task::{FileTranscript, Task, TaskId, TaskResult};
use scribe_engine::render::{render, CombinedTranscript};
use scribe_engine::{Device, ModelHandle, Transcription, TranscriptionEngine};
use scribe_gpu::MemoryPool;

use crate::queue::TaskQueue;

const PROGRESS_TICK: Duration = Duration::from_secs(2);
const PROGRESS_FLOOR: f32 = 5.0;
const PROGRESS_TRANSCRIBED: f32 = 90.0;
const PROGRESS_RENDERING: f32 = 95.0;

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    pool: Arc<MemoryPool>,
    engine: Arc<dyn TranscriptionEngine>,
    bus: Arc<EventBus>,
    output_dir: PathBuf,
    task_timeout: Duration,
    active: AtomicUsize,
    tokens: DashMap<TaskId, CancellationToken>,
    device_locks: DashMap<u32, Arc<tokio::sync::Mutex<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        pool: Arc<MemoryPool>,
        engine: Arc<dyn TranscriptionEngine>,
        bus: Arc<EventBus>,
        output_dir: PathBuf,
        task_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            pool,
            engine,
            bus,
            output_dir,
            task_timeout,
            active: AtomicUsize::new(0),
            tokens: DashMap::new(),
            device_locks: DashMap::new(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Trip the cancellation token of a running task.
    pub fn cancel(&self, id: TaskId) -> bool {
        if let Some(token) = self.tokens.get(&id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Hand an admitted task to a fresh worker. The task must already
    /// hold its reservation and be in Loading.
    pub fn dispatch(self: &Arc<Self>, task: Task) {
        let token = CancellationToken::new();
        self.tokens.insert(task.id, token.clone());
        self.active.fetch_add(1, Ordering::SeqCst);
        let workers = Arc::clone(self);
        tokio::spawn(async move {
            workers.run(task, token).await;
        });
    }

    /// Cancel everything in flight and wait up to `grace` for workers
    /// to wind down.
    pub async fn shutdown(&self, grace: Duration) {
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }
        let deadline = tokio::time::Instant::now() + grace;
        while self.active() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.active() > 0 {
            warn!(stuck = self.active(), "Workers still live after grace period");
        }
    }

    async fn run(self: Arc<Self>, task: Task, token: CancellationToken) {
        let id = task.id;
        let gpu = task.assigned_gpu.unwrap_or(0);
        let model = task.spec.model;
        let peak: Arc<Mutex<Option<f64>>> = Arc::new(Mutex::new(None));

        let outcome = tokio::select! {
            _ = token.cancelled() => Err(TaskError::new(
                TaskErrorKind::ClientCancelled,
                "cancelled by client",
            )),
            result = tokio::time::timeout(
                self.task_timeout,
                self.pipeline(&task, gpu, &token, Arc::clone(&peak)),
            ) => match result {
                Ok(inner) => inner,
                Err(_) => Err(TaskError::new(
                    TaskErrorKind::TaskTimeout,
                    format!("exceeded the {}s task budget", self.task_timeout.as_secs()),
                )),
            },
        };

        // Release runs on every exit path, exactly once per admission.
        self.pool.release(id);
        if outcome.is_ok() {
            if let Some(observed) = *peak.lock() {
                self.pool.calibrate(gpu, model, observed);
            }
        }

        match outcome {
            Ok(result) => self.queue.complete(id, result),
            Err(error) => {
                info!(task = %id, kind = error.kind.code(), "Worker reported failure: {}", error.message);
                self.queue.fail(id, error);
            }
        }

        self.tokens.remove(&id);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn pipeline(
        &self,
        task: &Task,
        gpu: u32,
        token: &CancellationToken,
        peak: Arc<Mutex<Option<f64>>>,
    ) -> Result<TaskResult, TaskError> {
        let id = task.id;
        let device = if self.pool.is_cpu_only() {
            Device::Cpu
        } else {
            Device::Cuda(gpu)
        };

        let lock = self.device_lock(gpu);
        let _device_guard = lock.lock().await;

        // Load, streaming fetch progress to subscribers.
        let progress = |pct: i8, message: &str| {
            self.queue.set_download_progress(id, pct);
            self.bus.publish(BusEvent::DownloadProgress {
                task_id: id,
                model_name: task.spec.model,
                progress: pct,
                message: message.to_string(),
            });
        };
        let handle = self
            .engine
            .load(task.spec.model, device, &progress)
            .await
            .map_err(|e| e.into_task_error())?;

        self.queue.mark_processing(id);

        let transcripts = self.transcribe_all(task, handle.as_ref(), token).await;
        if let Some(observed) = handle.peak_memory_gb() {
            *peak.lock() = Some(observed);
        }
        handle.unload().await;
        let transcripts = transcripts?;

        // Finalize: render every requested format atomically.
        self.queue.update_progress(
            id,
            PROGRESS_RENDERING,
            Some("rendering output files".to_string()),
        );
        let combined = combine(&transcripts);
        let base_name = base_name_of(&task.spec.files[0]);
        let mut outputs = Vec::with_capacity(task.spec.output_formats.len());
        for format in &task.spec.output_formats {
            let path = render(*format, &base_name, &combined, &self.output_dir, id)
                .map_err(|e| {
                    TaskError::internal(format!(
                        "rendering {} output failed: {e}",
                        format.extension()
                    ))
                })?;
            outputs.push(path);
        }

        Ok(TaskResult {
            transcripts,
            outputs,
        })
    }

    async fn transcribe_all(
        &self,
        task: &Task,
        handle: &dyn ModelHandle,
        token: &CancellationToken,
    ) -> Result<Vec<FileTranscript>, TaskError> {
        let id = task.id;
        let total = task.spec.files.len();
        let language = task.spec.language.as_deref().filter(|l| *l != "auto");
        let mut transcripts = Vec::with_capacity(total);

        for (index, file) in task.spec.files.iter().enumerate() {
            if token.is_cancelled() {
                return Err(TaskError::new(
                    TaskErrorKind::ClientCancelled,
                    "cancelled by client",
                ));
            }
            let path = self.queue.resolve_audio(file);
            if !path.is_file() {
                return Err(TaskError::input_invalid(format!(
                    "audio file disappeared: {file}"
                )));
            }
            let floor = file_progress(index, total);
            self.queue.update_progress(
                id,
                floor,
                Some(format!("transcribing file {}/{total}: {file}", index + 1)),
            );
            let output = self
                .transcribe_file(handle, &path, language, id, floor, file)
                .await?;
            transcripts.push(FileTranscript {
                file: file.clone(),
                language: output.detected_language,
                text: output.text,
                segments: output.segments,
            });
            self.queue.update_progress(
                id,
                file_progress(index + 1, total),
                Some(format!("finished file {}/{total}", index + 1)),
            );
        }
        Ok(transcripts)
    }

    /// One engine call, re-announcing progress every couple of seconds
    /// so subscribers see liveness during long transcriptions.
    async fn transcribe_file(
        &self,
        handle: &dyn ModelHandle,
        path: &Path,
        language: Option<&str>,
        id: TaskId,
        floor: f32,
        label: &str,
    ) -> Result<Transcription, TaskError> {
        let work = handle.transcribe(path, language);
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        ticker.tick().await;
        loop {
            tokio::select! {
                result = &mut work => {
                    return result.map_err(|e| e.into_task_error());
                }
                _ = ticker.tick() => {
                    self.queue.update_progress(
                        id,
                        floor,
                        Some(format!("still transcribing {label}")),
                    );
                }
            }
        }
    }

    fn device_lock(&self, gpu: u32) -> Arc<tokio::sync::Mutex<()>> {
        self.device_locks
            .entry(gpu)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Progress after `done` of `total` files, inside the transcribe band.
fn file_progress(done: usize, total: usize) -> f32 {
    let span = PROGRESS_TRANSCRIBED - PROGRESS_FLOOR;
    PROGRESS_FLOOR + span * (done as f32 / total.max(1) as f32)
}

fn base_name_of(file: &str) -> String {
    Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "transcript".to_string())
}

fn combine(transcripts: &[FileTranscript]) -> CombinedTranscript {
    CombinedTranscript {
        language: transcripts
            .first()
            .map(|t| t.language.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        text: transcripts
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        segments: transcripts
            .iter()
            .flat_map(|t| t.segments.iter().cloned())
            .collect(),
    }
}
