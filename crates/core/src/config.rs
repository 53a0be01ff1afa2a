use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CoreError, Result};

/// Hard ceiling for the global concurrency knob, regardless of what
/// the environment or the runtime API asks for.
pub const HARD_CONCURRENCY_LIMIT: usize = 20;

/// Immutable orchestrator configuration, loaded once at startup.
///
/// Every knob has an environment override named after the field; the
/// defaults match the values the service was tuned with.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Initial value for the global concurrent-task limit (1..=20).
    pub max_concurrent_tasks: usize,
    /// At-most-N running tasks per accelerator.
    pub max_tasks_per_gpu: usize,
    /// Fraction of total device memory admission may ever use.
    pub max_memory_utilization: f64,
    /// Multiplier applied to memory estimates as a safety cushion.
    pub memory_confidence_factor: f64,
    /// Calibration ring capacity per `(gpu, model)`.
    pub calibration_sample_size: usize,
    /// Memory floor reserved for the system on every GPU, in GB.
    pub reserved_memory_gb_per_gpu: f64,
    /// Scheduler wake interval.
    pub scheduler_tick: Duration,
    /// How long a probe snapshot stays fresh.
    pub gpu_snapshot_ttl: Duration,
    /// Retry budget for transient failures.
    pub max_retries: u32,
    /// Per-task wall-clock budget.
    pub task_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Reference audio duration for the estimate scaling factor.
    pub standard_audio_duration_secs: u32,
    /// Slope of the duration factor beyond the standard duration.
    pub audio_duration_factor_slope: f64,
    /// Root directory for submitted audio references.
    pub upload_dir: PathBuf,
    /// Directory transcript artifacts are rendered into.
    pub output_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_tasks_per_gpu: 5,
            max_memory_utilization: 0.9,
            memory_confidence_factor: 1.2,
            calibration_sample_size: 50,
            reserved_memory_gb_per_gpu: 1.0,
            scheduler_tick: Duration::from_millis(2000),
            gpu_snapshot_ttl: Duration::from_millis(30_000),
            max_retries: 3,
            task_timeout: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(120_000),
            standard_audio_duration_secs: 180,
            audio_duration_factor_slope: 0.3,
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl OrchestratorConfig {
    /// Read the configuration from the environment, falling back to
    /// defaults, then validate it.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            max_concurrent_tasks: env_parse(
                "MAX_CONCURRENT_TASKS_DEFAULT",
                defaults.max_concurrent_tasks,
            ),
            max_tasks_per_gpu: env_parse("MAX_TASKS_PER_GPU", defaults.max_tasks_per_gpu),
            max_memory_utilization: env_parse(
                "MAX_MEMORY_UTILIZATION",
                defaults.max_memory_utilization,
            ),
            memory_confidence_factor: env_parse(
                "MEMORY_CONFIDENCE_FACTOR",
                defaults.memory_confidence_factor,
            ),
            calibration_sample_size: env_parse(
                "CALIBRATION_SAMPLE_SIZE",
                defaults.calibration_sample_size,
            ),
            reserved_memory_gb_per_gpu: env_parse(
                "RESERVED_MEMORY_GB_PER_GPU",
                defaults.reserved_memory_gb_per_gpu,
            ),
            scheduler_tick: Duration::from_millis(env_parse(
                "SCHEDULER_TICK_MS",
                defaults.scheduler_tick.as_millis() as u64,
            )),
            gpu_snapshot_ttl: Duration::from_millis(env_parse(
                "GPU_SNAPSHOT_TTL_MS",
                defaults.gpu_snapshot_ttl.as_millis() as u64,
            )),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),
            task_timeout: Duration::from_secs(env_parse(
                "TASK_TIMEOUT_SEC",
                defaults.task_timeout.as_secs(),
            )),
            heartbeat_interval: Duration::from_millis(env_parse(
                "HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval.as_millis() as u64,
            )),
            heartbeat_timeout: Duration::from_millis(env_parse(
                "HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout.as_millis() as u64,
            )),
            standard_audio_duration_secs: env_parse(
                "STANDARD_AUDIO_DURATION_SEC",
                defaults.standard_audio_duration_secs,
            ),
            audio_duration_factor_slope: env_parse(
                "AUDIO_DURATION_FACTOR_SLOPE",
                defaults.audio_duration_factor_slope,
            ),
            upload_dir: std::env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            output_dir: std::env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks < 1 || self.max_concurrent_tasks > HARD_CONCURRENCY_LIMIT {
            return Err(CoreError::InvalidConfig(format!(
                "max_concurrent_tasks must be within 1..={HARD_CONCURRENCY_LIMIT}, got {}",
                self.max_concurrent_tasks
            )));
        }
        if self.max_tasks_per_gpu == 0 {
            return Err(CoreError::InvalidConfig(
                "max_tasks_per_gpu must be at least 1".into(),
            ));
        }
        if !(0.1..=1.0).contains(&self.max_memory_utilization) {
            return Err(CoreError::InvalidConfig(format!(
                "max_memory_utilization must be within 0.1..=1.0, got {}",
                self.max_memory_utilization
            )));
        }
        if self.memory_confidence_factor < 1.0 {
            return Err(CoreError::InvalidConfig(
                "memory_confidence_factor must be >= 1.0".into(),
            ));
        }
        if self.calibration_sample_size == 0 {
            return Err(CoreError::InvalidConfig(
                "calibration_sample_size must be at least 1".into(),
            ));
        }
        if self.reserved_memory_gb_per_gpu < 0.0 {
            return Err(CoreError::InvalidConfig(
                "reserved_memory_gb_per_gpu must not be negative".into(),
            ));
        }
        if self.scheduler_tick.is_zero() {
            return Err(CoreError::InvalidConfig(
                "scheduler_tick must be non-zero".into(),
            ));
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(CoreError::InvalidConfig(
                "heartbeat_timeout must be at least the heartbeat interval".into(),
            ));
        }
        Ok(())
    }
}

/// The one runtime-mutable knob: the global concurrent-task ceiling.
/// Reads and writes go through a mutex so `Concurrency.Set` from the
/// API cannot race the scheduler's reads.
#[derive(Debug)]
pub struct SharedConcurrency {
    limit: Mutex<usize>,
}

impl SharedConcurrency {
    pub fn new(initial: usize) -> Self {
        Self {
            limit: Mutex::new(initial.clamp(1, HARD_CONCURRENCY_LIMIT)),
        }
    }

    pub fn get(&self) -> usize {
        *self.limit.lock()
    }

    /// Set the limit, clamped to `[1, HARD_CONCURRENCY_LIMIT]`.
    /// Returns the value actually applied.
    pub fn set(&self, requested: usize) -> usize {
        let clamped = requested.clamp(1, HARD_CONCURRENCY_LIMIT);
        *self.limit.lock() = clamped;
        clamped
    }
}
