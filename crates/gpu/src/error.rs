use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("No accelerator is discoverable on this host")]
    ProbeUnavailable,

    #[error("Accelerator driver failure: {0}")]
    DriverFailure(String),

    #[error("Unknown device id: {0}")]
    UnknownDevice(u32),
}

pub type Result<T> = std::result::Result<T, GpuError>;
