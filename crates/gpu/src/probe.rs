//! Accelerator discovery.
//!
//! Device readings come from an injected [`AcceleratorDriver`]; the
//! production driver queries `nvidia-smi`, tests use a static one.
//! Snapshots are cached with a TTL and served under a read lock.

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use scribe_core::event::epoch_millis;

use crate::error::{GpuError, Result};

/// Read-mostly snapshot of one device. Consumers never mutate these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDescriptor {
    pub id: u32,
    pub name: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub temperature_c: Option<u32>,
    pub utilization_pct: Option<u32>,
    pub updated_at: u64,
}

/// Thin contract over whatever can enumerate accelerators.
pub trait AcceleratorDriver: Send + Sync {
    /// Enumerate devices with fresh memory and thermal readings.
    fn enumerate(&self) -> Result<Vec<GpuDescriptor>>;
}

/// Driver backed by the vendor management CLI.
#[derive(Debug, Default)]
pub struct NvidiaSmiDriver;

impl NvidiaSmiDriver {
    const QUERY: &'static str =
        "--query-gpu=index,name,memory.total,memory.used,memory.free,temperature.gpu,utilization.gpu";

    fn parse_line(line: &str) -> Option<GpuDescriptor> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 5 {
            return None;
        }
        let mib_to_gb = |raw: &str| raw.parse::<f64>().ok().map(|mib| mib / 1024.0);
        Some(GpuDescriptor {
            id: fields[0].parse().ok()?,
            name: fields[1].to_string(),
            total_gb: mib_to_gb(fields[2])?,
            used_gb: mib_to_gb(fields[3])?,
            free_gb: mib_to_gb(fields[4])?,
            temperature_c: fields.get(5).and_then(|f| f.parse().ok()),
            utilization_pct: fields.get(6).and_then(|f| f.parse().ok()),
            updated_at: epoch_millis(),
        })
    }
}

impl AcceleratorDriver for NvidiaSmiDriver {
    fn enumerate(&self) -> Result<Vec<GpuDescriptor>> {
        let output = Command::new("nvidia-smi")
            .args([Self::QUERY, "--format=csv,noheader,nounits"])
            .output()
            .map_err(|_| GpuError::ProbeUnavailable)?;

        if !output.status.success() {
            return Err(GpuError::DriverFailure(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let devices: Vec<GpuDescriptor> = stdout.lines().filter_map(Self::parse_line).collect();
        if devices.is_empty() {
            return Err(GpuError::ProbeUnavailable);
        }
        Ok(devices)
    }
}

struct CachedSnapshot {
    taken: Instant,
    devices: Arc<Vec<GpuDescriptor>>,
}

/// TTL-cached view over the driver. A forced refresh bypasses the
/// cache; everything else is served under the read lock.
pub struct GpuProbe {
    driver: Box<dyn AcceleratorDriver>,
    ttl: Duration,
    cache: RwLock<Option<CachedSnapshot>>,
}

impl GpuProbe {
    pub fn new(driver: Box<dyn AcceleratorDriver>, ttl: Duration) -> Self {
        Self {
            driver,
            ttl,
            cache: RwLock::new(None),
        }
    }

    pub fn snapshot(&self) -> Result<Arc<Vec<GpuDescriptor>>> {
        {
            let cache = self.cache.read();
            if let Some(cached) = cache.as_ref() {
                if cached.taken.elapsed() < self.ttl {
                    return Ok(Arc::clone(&cached.devices));
                }
            }
        }
        self.refresh()
    }

    /// Re-query the driver, ignoring the cache.
    pub fn refresh(&self) -> Result<Arc<Vec<GpuDescriptor>>> {
        match self.driver.enumerate() {
            Ok(devices) => {
                debug!(count = devices.len(), "Accelerator snapshot refreshed");
                let devices = Arc::new(devices);
                *self.cache.write() = Some(CachedSnapshot {
                    taken: Instant::now(),
                    devices: Arc::clone(&devices),
                });
                Ok(devices)
            }
            Err(err) => {
                warn!(error = %err, "Accelerator probe failed");
                Err(err)
            }
        }
    }

    pub fn describe(&self, id: u32) -> Result<GpuDescriptor> {
        let devices = self.snapshot()?;
        devices
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(GpuError::UnknownDevice(id))
    }

    pub fn count(&self) -> usize {
        self.snapshot().map(|devices| devices.len()).unwrap_or(0)
    }
}

/// The logical device the system schedules on when no accelerator
/// exists. Memory bookkeeping is disabled for it.
pub fn cpu_descriptor() -> GpuDescriptor {
    GpuDescriptor {
        id: 0,
        name: "cpu".to_string(),
        total_gb: 0.0,
        used_gb: 0.0,
        free_gb: 0.0,
        temperature_c: None,
        utilization_pct: None,
        updated_at: epoch_millis(),
    }
}
