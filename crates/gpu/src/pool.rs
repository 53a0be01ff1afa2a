//! Per-GPU memory reservation ledger.
//!
//! Reservations are the single source of truth for admission. Each
//! device entry sits behind its own mutex; nothing takes a pool-wide
//! lock, so contention on one device never stalls the others. The
//! estimator starts from the static model table and switches to
//! calibrated `mean + stddev * confidence` once observed samples for
//! a `(gpu, model)` pair exist.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use scribe_core::model::WhisperModel;
use scribe_core::task::TaskId;

use crate::probe::GpuDescriptor;

/// Estimator and admission knobs, copied from the orchestrator config
/// at startup.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_memory_utilization: f64,
    pub max_tasks_per_gpu: usize,
    pub reserved_memory_gb: f64,
    pub confidence_factor: f64,
    pub calibration_sample_size: usize,
    pub standard_audio_duration_secs: u32,
    pub audio_duration_factor_slope: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_memory_utilization: 0.9,
            max_tasks_per_gpu: 5,
            reserved_memory_gb: 1.0,
            confidence_factor: 1.2,
            calibration_sample_size: 50,
            standard_audio_duration_secs: 180,
            audio_duration_factor_slope: 0.3,
        }
    }
}

/// Running statistics over observed peak usage, ring-capped.
#[derive(Debug, Clone, Default)]
struct CalibrationStats {
    samples: VecDeque<f64>,
    mean: f64,
    stddev: f64,
}

impl CalibrationStats {
    fn record(&mut self, observed_gb: f64, cap: usize) {
        if self.samples.len() >= cap {
            self.samples.pop_front();
        }
        self.samples.push_back(observed_gb);
        let n = self.samples.len() as f64;
        self.mean = self.samples.iter().sum::<f64>() / n;
        self.stddev = (self
            .samples
            .iter()
            .map(|x| (x - self.mean).powi(2))
            .sum::<f64>()
            / n)
            .sqrt();
    }
}

struct GpuEntry {
    gpu_id: u32,
    total_gb: f64,
    allocated_gb: f64,
    /// CPU-only logical device: memory checks are disabled, the task
    /// cap is still enforced.
    unbounded: bool,
    max_tasks: usize,
    reservations: HashMap<TaskId, f64>,
    calibration: HashMap<WhisperModel, CalibrationStats>,
}

impl GpuEntry {
    fn available_gb(&self, settings: &PoolSettings) -> f64 {
        if self.unbounded {
            return f64::MAX;
        }
        let headroom = (self.total_gb - settings.reserved_memory_gb) - self.allocated_gb;
        let utilization_cap = self.total_gb * settings.max_memory_utilization - self.allocated_gb;
        headroom.min(utilization_cap).max(0.0)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub struct AdmitDecision {
    pub admitted: bool,
    pub available_gb: f64,
    pub reason: Option<String>,
}

/// Public status of one device entry.
#[derive(Debug, Clone, Serialize)]
pub struct GpuPoolStatus {
    pub gpu_id: u32,
    pub total_gb: f64,
    pub allocated_gb: f64,
    pub available_gb: f64,
    pub tasks: usize,
    pub estimates: Vec<ModelEstimate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEstimate {
    pub model: WhisperModel,
    pub samples: usize,
    pub mean_gb: f64,
    pub stddev_gb: f64,
    pub estimate_gb: f64,
}

pub struct MemoryPool {
    entries: Vec<Mutex<GpuEntry>>,
    settings: PoolSettings,
    cpu_only: bool,
}

impl MemoryPool {
    /// Build one entry per discovered device.
    pub fn from_devices(devices: &[GpuDescriptor], settings: PoolSettings) -> Self {
        let entries = devices
            .iter()
            .map(|d| {
                Mutex::new(GpuEntry {
                    gpu_id: d.id,
                    total_gb: d.total_gb,
                    allocated_gb: 0.0,
                    unbounded: false,
                    max_tasks: settings.max_tasks_per_gpu,
                    reservations: HashMap::new(),
                    calibration: HashMap::new(),
                })
            })
            .collect();
        Self {
            entries,
            settings,
            cpu_only: false,
        }
    }

    /// Degraded mode: one logical device, unlimited memory, a single
    /// concurrent task.
    pub fn cpu_only(settings: PoolSettings) -> Self {
        let entry = Mutex::new(GpuEntry {
            gpu_id: 0,
            total_gb: 0.0,
            allocated_gb: 0.0,
            unbounded: true,
            max_tasks: 1,
            reservations: HashMap::new(),
            calibration: HashMap::new(),
        });
        Self {
            entries: vec![entry],
            settings,
            cpu_only: true,
        }
    }

    pub fn is_cpu_only(&self) -> bool {
        self.cpu_only
    }

    pub fn device_ids(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.lock().gpu_id).collect()
    }

    fn entry(&self, gpu_id: u32) -> Option<&Mutex<GpuEntry>> {
        self.entries.iter().find(|e| e.lock().gpu_id == gpu_id)
    }

    fn duration_factor(&self, audio_seconds: f64) -> f64 {
        let standard = self.settings.standard_audio_duration_secs as f64;
        1.0 + (audio_seconds / standard - 1.0).max(0.0) * self.settings.audio_duration_factor_slope
    }

    fn estimate_locked(&self, entry: &GpuEntry, model: WhisperModel, audio_seconds: f64) -> f64 {
        if let Some(stats) = entry.calibration.get(&model) {
            if !stats.samples.is_empty() {
                return stats.mean + stats.stddev * self.settings.confidence_factor;
            }
        }
        model.base_memory_gb() * self.duration_factor(audio_seconds) * self.settings.confidence_factor
    }

    /// Deterministic estimate of peak usage for `model` on `gpu_id`.
    pub fn estimate_for(&self, gpu_id: u32, model: WhisperModel, audio_seconds: f64) -> f64 {
        match self.entry(gpu_id) {
            Some(entry) => {
                let entry = entry.lock();
                self.estimate_locked(&entry, model, audio_seconds)
            }
            None => model.base_memory_gb() * self.settings.confidence_factor,
        }
    }

    /// Can `gpu_id` take this task right now? Checks both the memory
    /// estimate and the per-device task cap.
    pub fn can_admit(&self, gpu_id: u32, model: WhisperModel, audio_seconds: f64) -> AdmitDecision {
        let Some(entry) = self.entry(gpu_id) else {
            return AdmitDecision {
                admitted: false,
                available_gb: 0.0,
                reason: Some(format!("unknown device {gpu_id}")),
            };
        };
        let entry = entry.lock();
        let available = entry.available_gb(&self.settings);
        if entry.reservations.len() >= entry.max_tasks {
            return AdmitDecision {
                admitted: false,
                available_gb: available,
                reason: Some(format!(
                    "device {gpu_id} is at its task cap ({})",
                    entry.max_tasks
                )),
            };
        }
        let required = self.estimate_locked(&entry, model, audio_seconds);
        if available < required {
            return AdmitDecision {
                admitted: false,
                available_gb: available,
                reason: Some(format!(
                    "device {gpu_id} has {available:.2} GB available, {required:.2} GB required"
                )),
            };
        }
        AdmitDecision {
            admitted: true,
            available_gb: available,
            reason: None,
        }
    }

    /// Atomically reserve `estimate_gb` for `task_id`. The admission
    /// check and the increment happen under the same lock; a failed
    /// check mutates nothing.
    pub fn reserve(&self, gpu_id: u32, estimate_gb: f64, task_id: TaskId) -> bool {
        let Some(entry) = self.entry(gpu_id) else {
            warn!(gpu = gpu_id, %task_id, "Reserve against unknown device");
            return false;
        };
        let mut entry = entry.lock();
        if entry.reservations.len() >= entry.max_tasks {
            return false;
        }
        if !entry.unbounded && entry.available_gb(&self.settings) < estimate_gb {
            return false;
        }
        entry.allocated_gb += estimate_gb;
        entry.reservations.insert(task_id, estimate_gb);
        debug!(
            gpu = gpu_id,
            %task_id,
            reserved_gb = estimate_gb,
            allocated_gb = entry.allocated_gb,
            "Memory reserved"
        );
        true
    }

    /// Give back whatever `task_id` holds. Idempotent; releasing an
    /// unknown id only logs.
    pub fn release(&self, task_id: TaskId) {
        for entry in &self.entries {
            let mut entry = entry.lock();
            if let Some(amount) = entry.reservations.remove(&task_id) {
                entry.allocated_gb = (entry.allocated_gb - amount).max(0.0);
                info!(
                    gpu = entry.gpu_id,
                    %task_id,
                    released_gb = amount,
                    allocated_gb = entry.allocated_gb,
                    "Memory released"
                );
                return;
            }
        }
        warn!(%task_id, "Release for unknown reservation, ignoring");
    }

    /// Feed one observed peak back into the estimator.
    pub fn calibrate(&self, gpu_id: u32, model: WhisperModel, observed_gb: f64) {
        let Some(entry) = self.entry(gpu_id) else {
            warn!(gpu = gpu_id, "Calibration sample for unknown device");
            return;
        };
        let mut entry = entry.lock();
        let cap = self.settings.calibration_sample_size;
        let stats = entry.calibration.entry(model).or_default();
        stats.record(observed_gb, cap);
        info!(
            gpu = gpu_id,
            model = %model,
            observed_gb,
            mean_gb = stats.mean,
            stddev_gb = stats.stddev,
            samples = stats.samples.len(),
            "Calibrated model memory estimate"
        );
    }

    pub fn in_flight(&self, gpu_id: u32) -> usize {
        self.entry(gpu_id)
            .map(|e| e.lock().reservations.len())
            .unwrap_or(0)
    }

    /// Placement policy: among admitting devices, the least allocated
    /// wins; ties break by most available, then lowest id.
    pub fn choose_gpu(&self, model: WhisperModel, audio_seconds: f64) -> Option<u32> {
        let mut candidates: Vec<(u32, f64, f64)> = Vec::new();
        for entry in &self.entries {
            let entry = entry.lock();
            if entry.reservations.len() >= entry.max_tasks {
                continue;
            }
            let available = entry.available_gb(&self.settings);
            let required = self.estimate_locked(&entry, model, audio_seconds);
            if available >= required {
                candidates.push((entry.gpu_id, entry.allocated_gb, available));
            }
        }
        candidates
            .into_iter()
            .min_by(|a, b| {
                a.1.total_cmp(&b.1)
                    .then(b.2.total_cmp(&a.2))
                    .then(a.0.cmp(&b.0))
            })
            .map(|(id, _, _)| id)
    }

    pub fn status(&self) -> Vec<GpuPoolStatus> {
        self.entries
            .iter()
            .map(|entry| {
                let entry = entry.lock();
                let estimates = entry
                    .calibration
                    .iter()
                    .map(|(model, stats)| ModelEstimate {
                        model: *model,
                        samples: stats.samples.len(),
                        mean_gb: stats.mean,
                        stddev_gb: stats.stddev,
                        estimate_gb: stats.mean + stats.stddev * self.settings.confidence_factor,
                    })
                    .collect();
                GpuPoolStatus {
                    gpu_id: entry.gpu_id,
                    total_gb: entry.total_gb,
                    allocated_gb: entry.allocated_gb,
                    available_gb: entry.available_gb(&self.settings),
                    tasks: entry.reservations.len(),
                    estimates,
                }
            })
            .collect()
    }

    /// Drop every live reservation. Shutdown path only.
    pub fn release_all(&self) {
        for entry in &self.entries {
            let mut entry = entry.lock();
            if !entry.reservations.is_empty() {
                warn!(
                    gpu = entry.gpu_id,
                    count = entry.reservations.len(),
                    "Releasing reservations on shutdown"
                );
            }
            entry.reservations.clear();
            entry.allocated_gb = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::event::epoch_millis;

    fn device(id: u32, total_gb: f64) -> GpuDescriptor {
        GpuDescriptor {
            id,
            name: format!("GPU {id}"),
            total_gb,
            used_gb: 0.0,
            free_gb: total_gb,
            temperature_c: None,
            utilization_pct: None,
            updated_at: epoch_millis(),
        }
    }

    fn pool(totals: &[f64]) -> MemoryPool {
        let devices: Vec<GpuDescriptor> = totals
            .iter()
            .enumerate()
            .map(|(id, total)| device(id as u32, *total))
            .collect();
        MemoryPool::from_devices(&devices, PoolSettings::default())
    }

    #[test]
    fn uncalibrated_estimate_applies_confidence_and_duration() {
        let pool = pool(&[24.0]);
        // Short audio: factor is exactly 1.
        let short = pool.estimate_for(0, WhisperModel::Small, 60.0);
        assert!((short - 2.0 * 1.2).abs() < 1e-9);
        // 540 s = 3x standard: factor 1 + 2 * 0.3 = 1.6.
        let long = pool.estimate_for(0, WhisperModel::Small, 540.0);
        assert!((long - 2.0 * 1.6 * 1.2).abs() < 1e-9);
    }

    #[test]
    fn calibrated_estimate_replaces_table_value() {
        let pool = pool(&[24.0]);
        for observed in [4.0, 4.5, 5.0, 4.5, 4.0] {
            pool.calibrate(0, WhisperModel::Medium, observed);
        }
        let mean = 4.4;
        let var = [4.0, 4.5, 5.0, 4.5, 4.0]
            .iter()
            .map(|x| (x - mean) * (x - mean))
            .sum::<f64>()
            / 5.0;
        let expected = mean + var.sqrt() * 1.2;
        let estimate = pool.estimate_for(0, WhisperModel::Medium, 6000.0);
        // Calibrated path ignores the duration factor entirely.
        assert!((estimate - expected).abs() < 1e-9);
    }

    #[test]
    fn calibration_ring_is_capped() {
        let mut settings = PoolSettings::default();
        settings.calibration_sample_size = 3;
        let pool = MemoryPool::from_devices(&[device(0, 24.0)], settings);
        for observed in [10.0, 10.0, 2.0, 2.0, 2.0] {
            pool.calibrate(0, WhisperModel::Base, observed);
        }
        // Only the last three samples remain.
        let estimate = pool.estimate_for(0, WhisperModel::Base, 60.0);
        assert!((estimate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn reserve_then_release_restores_availability() {
        let pool = pool(&[12.0]);
        let id = TaskId::new();
        let before = pool.can_admit(0, WhisperModel::Large, 60.0).available_gb;
        assert!(pool.reserve(0, 10.0, id));
        let during = pool.can_admit(0, WhisperModel::Large, 60.0).available_gb;
        assert!(during < before);
        pool.release(id);
        let after = pool.can_admit(0, WhisperModel::Large, 60.0).available_gb;
        assert_eq!(before, after);
    }

    #[test]
    fn release_is_idempotent() {
        let pool = pool(&[12.0]);
        let id = TaskId::new();
        assert!(pool.reserve(0, 4.0, id));
        pool.release(id);
        pool.release(id);
        pool.release(TaskId::new());
        assert_eq!(pool.status()[0].allocated_gb, 0.0);
    }

    #[test]
    fn reserve_never_exceeds_utilization_cap() {
        // 12 GB card, 0.9 utilization: at most 10.8 GB may ever be allocated.
        let pool = pool(&[12.0]);
        assert!(pool.reserve(0, 10.0, TaskId::new()));
        assert!(!pool.reserve(0, 1.0, TaskId::new()));
        let status = &pool.status()[0];
        assert!(status.allocated_gb <= 12.0 * 0.9);
    }

    #[test]
    fn reserved_system_floor_is_honored() {
        // 12 GB total, 1 GB system floor: headroom is 11 GB, below the
        // 10.8 GB utilization cap only when allocations grow.
        let pool = pool(&[12.0]);
        let available = pool.can_admit(0, WhisperModel::Tiny, 60.0).available_gb;
        assert!((available - 10.8).abs() < 1e-9);
    }

    #[test]
    fn task_cap_blocks_admission() {
        let mut settings = PoolSettings::default();
        settings.max_tasks_per_gpu = 2;
        let pool = MemoryPool::from_devices(&[device(0, 48.0)], settings);
        assert!(pool.reserve(0, 1.0, TaskId::new()));
        assert!(pool.reserve(0, 1.0, TaskId::new()));
        let decision = pool.can_admit(0, WhisperModel::Tiny, 60.0);
        assert!(!decision.admitted);
        assert!(decision.reason.unwrap().contains("task cap"));
        assert!(!pool.reserve(0, 1.0, TaskId::new()));
    }

    #[test]
    fn choose_gpu_prefers_least_allocated() {
        let pool = pool(&[24.0, 24.0]);
        assert!(pool.reserve(0, 5.0, TaskId::new()));
        assert_eq!(pool.choose_gpu(WhisperModel::Base, 60.0), Some(1));
    }

    #[test]
    fn choose_gpu_breaks_ties_by_available_then_id() {
        // Same allocation, larger card wins; identical cards fall back
        // to the lowest id.
        let mixed = pool(&[12.0, 24.0]);
        assert_eq!(mixed.choose_gpu(WhisperModel::Base, 60.0), Some(1));
        let even = pool(&[24.0, 24.0]);
        assert_eq!(even.choose_gpu(WhisperModel::Base, 60.0), Some(0));
    }

    #[test]
    fn choose_gpu_returns_none_when_nothing_fits() {
        let pool = pool(&[4.0]);
        assert_eq!(pool.choose_gpu(WhisperModel::Large, 60.0), None);
    }

    #[test]
    fn cpu_only_pool_caps_at_one_task() {
        let pool = MemoryPool::cpu_only(PoolSettings::default());
        assert!(pool.is_cpu_only());
        assert!(pool.can_admit(0, WhisperModel::Large, 9999.0).admitted);
        assert!(pool.reserve(0, 12.0, TaskId::new()));
        assert!(!pool.can_admit(0, WhisperModel::Tiny, 10.0).admitted);
        assert_eq!(pool.choose_gpu(WhisperModel::Tiny, 10.0), None);
    }

    #[test]
    fn allocated_always_equals_live_reservations() {
        let pool = pool(&[24.0]);
        let ids: Vec<TaskId> = (0..3).map(|_| TaskId::new()).collect();
        pool.reserve(0, 2.0, ids[0]);
        pool.reserve(0, 3.0, ids[1]);
        pool.reserve(0, 4.0, ids[2]);
        assert_eq!(pool.status()[0].allocated_gb, 9.0);
        assert_eq!(pool.in_flight(0), 3);
        pool.release(ids[1]);
        assert_eq!(pool.status()[0].allocated_gb, 6.0);
        assert_eq!(pool.in_flight(0), 2);
    }

    #[test]
    fn concurrent_reserves_never_oversubscribe() {
        use std::sync::Arc;
        use std::thread;

        // 12 GB card admits at most one 6 GB reservation (10.8 GB cap).
        let pool = Arc::new(pool(&[12.0]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.reserve(0, 6.0, TaskId::new()))
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 1);
        let status = &pool.status()[0];
        assert!(status.allocated_gb <= 12.0 * 0.9);
        assert_eq!(status.tasks, granted);
    }

    #[test]
    fn release_all_clears_every_entry() {
        let pool = pool(&[12.0, 12.0]);
        assert!(pool.reserve(0, 2.0, TaskId::new()));
        assert!(pool.reserve(1, 3.0, TaskId::new()));
        pool.release_all();
        for status in pool.status() {
            assert_eq!(status.allocated_gb, 0.0);
            assert_eq!(status.tasks, 0);
        }
    }
}
