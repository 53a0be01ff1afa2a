//! The assembled orchestrator and its public surface.
//!
//! Components are instantiated once, in dependency order (bus, pool,
//! queue, workers, scheduler) and passed by `Arc`; there are no
//! process-wide globals. Shutdown runs the same order in reverse: stop the
//! scheduler, cancel workers with a grace period, then drop every
//! remaining reservation.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scribe_core::bus::{EventBus, Subscription};
use scribe_core::config::{OrchestratorConfig, SharedConcurrency};
use scribe_core::error::TaskError;
use scribe_core::task::{TaskId, TaskSpec, TaskView};
use scribe_engine::render::{list_outputs, OutputFileInfo};
use scribe_engine::{AudioMetadata, TranscriptionEngine};
use scribe_gpu::probe::{cpu_descriptor, AcceleratorDriver, GpuDescriptor};
use scribe_gpu::{GpuPoolStatus, GpuProbe, MemoryPool, PoolSettings};

use crate::queue::{CancelOutcome, QueueStats, TaskQueue};
use crate::scheduler::{BatchScheduler, SchedulerStatus};
use crate::worker::WorkerPool;

/// Response shape of the queue listing API.
#[derive(Debug, Clone, Serialize)]
pub struct QueueListing {
    pub pending: Vec<TaskView>,
    pub running: Vec<TaskView>,
    pub current_running_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub stats: QueueStats,
}

/// One entry of the device picker: the CPU pseudo-device plus every
/// discovered accelerator.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceChoice {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub available_gb: Option<f64>,
    pub temperature_c: Option<u32>,
}

pub struct TranscriptionSystem {
    config: OrchestratorConfig,
    concurrency: Arc<SharedConcurrency>,
    bus: Arc<EventBus>,
    probe: Arc<GpuProbe>,
    pool: Arc<MemoryPool>,
    queue: Arc<TaskQueue>,
    workers: Arc<WorkerPool>,
    scheduler: Arc<BatchScheduler>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TranscriptionSystem {
    /// Bring the orchestrator up. Must run inside a tokio runtime;
    /// spawns the heartbeat and scheduler loops.
    pub fn init(
        config: OrchestratorConfig,
        engine: Arc<dyn TranscriptionEngine>,
        metadata: Arc<dyn AudioMetadata>,
        driver: Box<dyn AcceleratorDriver>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(
            config.heartbeat_interval,
            config.heartbeat_timeout,
        ));
        let probe = Arc::new(GpuProbe::new(driver, config.gpu_snapshot_ttl));

        let settings = PoolSettings {
            max_memory_utilization: config.max_memory_utilization,
            max_tasks_per_gpu: config.max_tasks_per_gpu,
            reserved_memory_gb: config.reserved_memory_gb_per_gpu,
            confidence_factor: config.memory_confidence_factor,
            calibration_sample_size: config.calibration_sample_size,
            standard_audio_duration_secs: config.standard_audio_duration_secs,
            audio_duration_factor_slope: config.audio_duration_factor_slope,
        };
        let pool = match probe.snapshot() {
            Ok(devices) => {
                info!(devices = devices.len(), "Accelerators discovered");
                Arc::new(MemoryPool::from_devices(&devices, settings))
            }
            Err(err) => {
                warn!(error = %err, "No accelerator available, running CPU-only");
                Arc::new(MemoryPool::cpu_only(settings))
            }
        };

        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&bus),
            config.max_retries,
            config.upload_dir.clone(),
        ));
        let workers = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            engine,
            Arc::clone(&bus),
            config.output_dir.clone(),
            config.task_timeout,
        ));
        let concurrency = Arc::new(SharedConcurrency::new(config.max_concurrent_tasks));
        let scheduler = Arc::new(BatchScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            Arc::clone(&probe),
            metadata,
            Arc::clone(&workers),
            Arc::clone(&concurrency),
            config.scheduler_tick,
        ));

        let shutdown = CancellationToken::new();
        let system = Arc::new(Self {
            config,
            concurrency,
            bus,
            probe,
            pool,
            queue,
            workers,
            scheduler,
            shutdown,
            handles: Mutex::new(Vec::new()),
        });

        let heartbeat = {
            let bus = Arc::clone(&system.bus);
            let token = system.shutdown.clone();
            tokio::spawn(async move { bus.run_heartbeat(token).await })
        };
        let scheduling = {
            let scheduler = Arc::clone(&system.scheduler);
            let token = system.shutdown.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };
        system.handles.lock().extend([heartbeat, scheduling]);
        info!("Transcription system initialized");
        system
    }

    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId, TaskError> {
        if self.shutdown.is_cancelled() {
            return Err(TaskError::internal("orchestrator is shutting down"));
        }
        self.queue.submit(spec)
    }

    /// Idempotent; returns false when there is nothing left to cancel.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.queue.cancel(id) {
            CancelOutcome::Removed => true,
            CancelOutcome::Running => self.workers.cancel(id),
            CancelOutcome::NoOp => false,
        }
    }

    pub fn status(&self, id: TaskId) -> Option<TaskView> {
        self.queue.get(id)
    }

    pub fn list_queue(&self) -> QueueListing {
        let snapshot = self.queue.snapshot();
        QueueListing {
            current_running_tasks: snapshot.running.len(),
            max_concurrent_tasks: self.concurrency.get(),
            pending: snapshot.pending,
            running: snapshot.running,
            stats: snapshot.stats,
        }
    }

    pub fn gpu_status(&self) -> Vec<GpuDescriptor> {
        if self.pool.is_cpu_only() {
            return vec![cpu_descriptor()];
        }
        self.probe
            .snapshot()
            .map(|devices| devices.as_ref().clone())
            .unwrap_or_default()
    }

    pub fn pool_status(&self) -> Vec<GpuPoolStatus> {
        self.pool.status()
    }

    /// Device picker entries: CPU first, then every accelerator with
    /// its pool availability.
    pub fn device_choices(&self) -> Vec<DeviceChoice> {
        let mut choices = vec![DeviceChoice {
            id: "cpu".to_string(),
            name: "CPU".to_string(),
            kind: "cpu".to_string(),
            available_gb: None,
            temperature_c: None,
        }];
        if self.pool.is_cpu_only() {
            return choices;
        }
        let descriptors = self.gpu_status();
        for status in self.pool.status() {
            let descriptor = descriptors.iter().find(|d| d.id == status.gpu_id);
            choices.push(DeviceChoice {
                id: format!("gpu_{}", status.gpu_id),
                name: descriptor
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| format!("GPU {}", status.gpu_id)),
                kind: "gpu".to_string(),
                available_gb: Some(status.available_gb),
                temperature_c: descriptor.and_then(|d| d.temperature_c),
            });
        }
        choices
    }

    /// The accelerator with the most pool headroom right now.
    pub fn best_gpu(&self) -> Option<u32> {
        if self.pool.is_cpu_only() {
            return None;
        }
        self.pool
            .status()
            .into_iter()
            .max_by(|a, b| a.available_gb.total_cmp(&b.available_gb))
            .map(|s| s.gpu_id)
    }

    pub fn concurrency_get(&self) -> usize {
        self.concurrency.get()
    }

    /// Clamped to `[1, 20]`; running tasks are never interrupted, the
    /// new ceiling only gates future admissions.
    pub fn concurrency_set(&self, requested: usize) -> usize {
        let applied = self.concurrency.set(requested);
        info!(requested, applied, "Concurrency limit updated");
        self.scheduler.kick();
        applied
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Manual scheduling trigger.
    pub fn kick(&self) {
        self.scheduler.kick();
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub fn output_files(&self) -> io::Result<Vec<OutputFileInfo>> {
        list_outputs(&self.config.output_dir)
    }

    /// Ordered teardown: stop the scheduler and heartbeat, cancel
    /// workers and wait out the grace period, then drop whatever
    /// reservations are left.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down transcription system");
        self.shutdown.cancel();
        self.workers.shutdown(grace).await;
        self.pool.release_all();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Transcription system stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_engine::mock::{MockEngine, StaticMetadata};
    use scribe_gpu::GpuError;

    struct NoDevices;

    impl AcceleratorDriver for NoDevices {
        fn enumerate(&self) -> scribe_gpu::Result<Vec<GpuDescriptor>> {
            Err(GpuError::ProbeUnavailable)
        }
    }

    fn cpu_system() -> Arc<TranscriptionSystem> {
        let mut config = OrchestratorConfig::default();
        config.scheduler_tick = Duration::from_millis(20);
        config.upload_dir = std::env::temp_dir();
        config.output_dir = std::env::temp_dir().join("scribe-system-out");
        TranscriptionSystem::init(
            config,
            Arc::new(MockEngine::new()),
            Arc::new(StaticMetadata::new(60.0)),
            Box::new(NoDevices),
        )
    }

    #[tokio::test]
    async fn falls_back_to_cpu_only_mode() {
        let system = cpu_system();
        let devices = system.gpu_status();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "cpu");
        assert_eq!(system.device_choices().len(), 1);
        assert_eq!(system.best_gpu(), None);
        system.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn concurrency_is_clamped_by_the_api() {
        let system = cpu_system();
        assert_eq!(system.concurrency_set(99), 20);
        assert_eq!(system.concurrency_set(0), 1);
        assert_eq!(system.concurrency_get(), 1);
        system.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn submit_validates_inputs() {
        use scribe_core::model::WhisperModel;
        use scribe_core::task::{OutputFormat, TaskPriority};
        let system = cpu_system();
        let err = system
            .submit(TaskSpec {
                files: vec!["definitely-not-there.wav".into()],
                model: WhisperModel::Base,
                language: None,
                output_formats: vec![OutputFormat::Plaintext],
                priority: TaskPriority::Normal,
                preferred_gpu: None,
            })
            .unwrap_err();
        assert_eq!(err.kind, scribe_core::error::TaskErrorKind::InputInvalid);
        system.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn cancel_of_unknown_task_is_a_noop() {
        let system = cpu_system();
        assert!(!system.cancel(TaskId::new()));
        system.shutdown(Duration::from_millis(200)).await;
    }
}
