//! Batch scheduler: the single control loop matching pending work to
//! devices.
//!
//! Wakes on its interval, on queue signals (submission, completion,
//! failure) and on manual kicks. Every iteration re-derives its
//! counters from the queue and the pool; nothing is cached across
//! ticks, so a failed iteration simply recovers on the next one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scribe_core::config::SharedConcurrency;
use scribe_core::model::WhisperModel;
use scribe_engine::AudioMetadata;
use scribe_gpu::{GpuProbe, MemoryPool};

use crate::queue::{BucketHead, TaskQueue};
use crate::worker::WorkerPool;

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub tick_ms: u64,
    pub active_workers: usize,
    pub pending_tasks: usize,
}

pub struct BatchScheduler {
    queue: Arc<TaskQueue>,
    pool: Arc<MemoryPool>,
    probe: Arc<GpuProbe>,
    metadata: Arc<dyn AudioMetadata>,
    workers: Arc<WorkerPool>,
    concurrency: Arc<SharedConcurrency>,
    tick: Duration,
    kick: Arc<Notify>,
    running: AtomicBool,
}

impl BatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        pool: Arc<MemoryPool>,
        probe: Arc<GpuProbe>,
        metadata: Arc<dyn AudioMetadata>,
        workers: Arc<WorkerPool>,
        concurrency: Arc<SharedConcurrency>,
        tick: Duration,
    ) -> Self {
        Self {
            queue,
            pool,
            probe,
            metadata,
            workers,
            concurrency,
            tick,
            kick: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Manual trigger: schedule an extra iteration right away.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            tick_ms: self.tick.as_millis() as u64,
            active_workers: self.workers.active(),
            pending_tasks: self.queue.pending_count(),
        }
    }

    /// The scheduler loop. One iteration at a time; runs until the
    /// token fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);
        info!(tick_ms = self.tick.as_millis() as u64, "Scheduler started");
        let wakeup = self.queue.wakeup();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wakeup.notified() => {}
                _ = self.kick.notified() => {}
                _ = shutdown.cancelled() => break,
            }
            self.iterate();
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }

    /// One scheduling pass: place tasks until the global budget is
    /// spent or no bucket yields a placement.
    pub fn iterate(&self) {
        if !self.pool.is_cpu_only() {
            if let Err(err) = self.probe.snapshot() {
                warn!(error = %err, "Skipping iteration, accelerator snapshot failed");
                return;
            }
        }

        let mut budget = self
            .concurrency
            .get()
            .saturating_sub(self.queue.running_count());
        let mut skipped: HashSet<WhisperModel> = HashSet::new();

        while budget > 0 {
            let running = self.queue.running_models();
            let running_models: HashSet<WhisperModel> =
                running.iter().map(|(_, model)| *model).collect();

            let mut heads: Vec<BucketHead> = self
                .queue
                .bucket_heads()
                .into_iter()
                .filter(|head| !skipped.contains(&head.model))
                .collect();
            if heads.is_empty() {
                break;
            }
            // Bucket priority: models already loaded somewhere first,
            // then small models, oldest head on ties.
            heads.sort_by_key(|head| {
                (
                    u8::from(!running_models.contains(&head.model)),
                    head.model.size_rank(),
                    head.head_created_at,
                )
            });

            let mut placed = false;
            for head in heads {
                if self.try_place(&head, &running) {
                    budget -= 1;
                    placed = true;
                    break;
                }
                // No device takes this model right now; leave the
                // bucket alone for the rest of the iteration.
                skipped.insert(head.model);
            }
            if !placed {
                break;
            }
        }
    }

    fn try_place(&self, head: &BucketHead, running: &[(u32, WhisperModel)]) -> bool {
        let audio_seconds = self.total_duration(&head.files);

        let preferred = head
            .preferred_gpu
            .filter(|hint| self.pool.can_admit(*hint, head.model, audio_seconds).admitted);
        let Some(gpu) =
            preferred.or_else(|| self.choose_device(head.model, audio_seconds, running))
        else {
            debug!(task = %head.task_id, model = %head.model, "No device admits this task");
            return false;
        };

        let estimate = self.pool.estimate_for(gpu, head.model, audio_seconds);
        if !self.pool.reserve(gpu, estimate, head.task_id) {
            return false;
        }
        match self.queue.take_for_dispatch(head.task_id, gpu, estimate) {
            Some(task) => {
                self.workers.dispatch(task);
                true
            }
            None => {
                // The task left the queue between the peek and now
                // (e.g. cancelled); undo the reservation.
                self.pool.release(head.task_id);
                false
            }
        }
    }

    /// Devices already running this model come first, then the pool's
    /// placement policy over all devices.
    fn choose_device(
        &self,
        model: WhisperModel,
        audio_seconds: f64,
        running: &[(u32, WhisperModel)],
    ) -> Option<u32> {
        let local: HashSet<u32> = running
            .iter()
            .filter(|(_, m)| *m == model)
            .map(|(gpu, _)| *gpu)
            .collect();
        if !local.is_empty() {
            let chosen = self
                .pool
                .status()
                .into_iter()
                .filter(|s| local.contains(&s.gpu_id))
                .filter(|s| self.pool.can_admit(s.gpu_id, model, audio_seconds).admitted)
                .min_by(|a, b| {
                    a.allocated_gb
                        .total_cmp(&b.allocated_gb)
                        .then(b.available_gb.total_cmp(&a.available_gb))
                        .then(a.gpu_id.cmp(&b.gpu_id))
                })
                .map(|s| s.gpu_id);
            if chosen.is_some() {
                return chosen;
            }
        }
        self.pool.choose_gpu(model, audio_seconds)
    }

    fn total_duration(&self, files: &[String]) -> f64 {
        files
            .iter()
            .map(|file| {
                let path = self.queue.resolve_audio(file);
                self.metadata.duration_seconds(&path).unwrap_or_else(|err| {
                    debug!(file = %file, error = %err, "Audio duration unavailable, assuming zero");
                    0.0
                })
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::bus::EventBus;
    use scribe_core::task::{OutputFormat, TaskPriority, TaskSpec, TaskStatus};
    use scribe_engine::mock::{MockEngine, StaticMetadata};
    use scribe_engine::TranscriptionEngine;
    use scribe_gpu::probe::{AcceleratorDriver, GpuDescriptor};
    use scribe_gpu::{GpuError, PoolSettings};
    use std::fs;
    use std::path::PathBuf;

    struct StaticDriver {
        devices: Vec<GpuDescriptor>,
    }

    impl AcceleratorDriver for StaticDriver {
        fn enumerate(&self) -> scribe_gpu::Result<Vec<GpuDescriptor>> {
            if self.devices.is_empty() {
                Err(GpuError::ProbeUnavailable)
            } else {
                Ok(self.devices.clone())
            }
        }
    }

    fn device(id: u32, total_gb: f64) -> GpuDescriptor {
        GpuDescriptor {
            id,
            name: format!("GPU {id}"),
            total_gb,
            used_gb: 0.0,
            free_gb: total_gb,
            temperature_c: None,
            utilization_pct: None,
            updated_at: 0,
        }
    }

    fn upload_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("scribe-sched-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        let _ = fs::write(dir.join("a.wav"), b"riff");
        dir
    }

    struct Fixture {
        queue: Arc<TaskQueue>,
        pool: Arc<MemoryPool>,
        scheduler: BatchScheduler,
    }

    fn fixture(devices: Vec<GpuDescriptor>, concurrency: usize, engine: MockEngine) -> Fixture {
        let bus = Arc::new(EventBus::new(
            Duration::from_secs(30),
            Duration::from_secs(120),
        ));
        let queue = Arc::new(TaskQueue::new(Arc::clone(&bus), 3, upload_dir()));
        let pool = Arc::new(MemoryPool::from_devices(&devices, PoolSettings::default()));
        let probe = Arc::new(GpuProbe::new(
            Box::new(StaticDriver { devices }),
            Duration::from_secs(30),
        ));
        let engine: Arc<dyn TranscriptionEngine> = Arc::new(engine);
        let workers = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            engine,
            bus,
            std::env::temp_dir().join("scribe-sched-out"),
            Duration::from_secs(60),
        ));
        let scheduler = BatchScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            probe,
            Arc::new(StaticMetadata::new(60.0)),
            workers,
            Arc::new(SharedConcurrency::new(concurrency)),
            Duration::from_millis(50),
        );
        Fixture {
            queue,
            pool,
            scheduler,
        }
    }

    fn spec(model: WhisperModel) -> TaskSpec {
        TaskSpec {
            files: vec!["a.wav".into()],
            model,
            language: None,
            output_formats: vec![OutputFormat::Plaintext],
            priority: TaskPriority::Normal,
            preferred_gpu: None,
        }
    }

    #[tokio::test]
    async fn places_up_to_the_global_budget() {
        let engine = MockEngine::new().with_latency(Duration::from_millis(250));
        let f = fixture(vec![device(0, 48.0)], 2, engine);
        for _ in 0..3 {
            f.queue.submit(spec(WhisperModel::Base)).unwrap();
        }
        f.scheduler.iterate();
        assert_eq!(f.queue.running_count(), 2);
        assert_eq!(f.queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn oversized_task_stays_pending_without_spinning() {
        let engine = MockEngine::new();
        let f = fixture(vec![device(0, 4.0)], 4, engine);
        let id = f.queue.submit(spec(WhisperModel::Large)).unwrap();
        f.scheduler.iterate();
        f.scheduler.iterate();
        assert_eq!(f.queue.pending_count(), 1);
        assert_eq!(f.queue.get(id).unwrap().status, TaskStatus::Pending);
        assert_eq!(f.pool.status()[0].allocated_gb, 0.0);
    }

    #[tokio::test]
    async fn preferred_gpu_hint_wins_when_it_admits() {
        let engine = MockEngine::new().with_latency(Duration::from_millis(250));
        let f = fixture(vec![device(0, 48.0), device(1, 48.0)], 4, engine);
        let mut hinted = spec(WhisperModel::Base);
        hinted.preferred_gpu = Some(1);
        let id = f.queue.submit(hinted).unwrap();
        f.scheduler.iterate();
        assert_eq!(f.queue.get(id).unwrap().gpu, Some(1));
    }

    #[tokio::test]
    async fn spreads_load_to_least_allocated_device() {
        let engine = MockEngine::new().with_latency(Duration::from_millis(250));
        let f = fixture(vec![device(0, 48.0), device(1, 48.0)], 4, engine);
        // Two different models, so locality does not pin them together.
        f.queue.submit(spec(WhisperModel::Medium)).unwrap();
        let second = f.queue.submit(spec(WhisperModel::Turbo)).unwrap();
        f.scheduler.iterate();
        assert_eq!(f.queue.running_count(), 2);
        // First went to GPU 0; the second model must land on GPU 1.
        assert_eq!(f.queue.get(second).unwrap().gpu, Some(1));
    }

    #[tokio::test]
    async fn smaller_models_schedule_first_on_ties() {
        let engine = MockEngine::new().with_latency(Duration::from_millis(250));
        let f = fixture(vec![device(0, 48.0)], 1, engine);
        let large = f.queue.submit(spec(WhisperModel::Large)).unwrap();
        let small = f.queue.submit(spec(WhisperModel::Tiny)).unwrap();
        f.scheduler.iterate();
        // One budget slot: the tiny model wins it, large stays queued.
        assert_ne!(f.queue.get(small).unwrap().status, TaskStatus::Pending);
        assert_eq!(f.queue.get(large).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let engine = MockEngine::new();
        let f = fixture(vec![device(0, 48.0)], 2, engine);
        let status = f.scheduler.status();
        assert!(!status.running);
        assert_eq!(status.tick_ms, 50);
        assert_eq!(status.pending_tasks, 0);
    }
}
