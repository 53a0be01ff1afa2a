pub mod error;
pub mod pool;
pub mod probe;

pub use error::{GpuError, Result};
pub use pool::{AdmitDecision, GpuPoolStatus, MemoryPool, ModelEstimate, PoolSettings};
pub use probe::{cpu_descriptor, AcceleratorDriver, GpuDescriptor, GpuProbe, NvidiaSmiDriver};
