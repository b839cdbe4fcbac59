use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ErrorKind;

pub use gpu::{
    GpuBuildError, GpuBuilder, GpuContext, GpuContextId, default_gpu, init_default_gpu,
    is_unified_memory_adapter,
};

pub mod gpu;

/// Where the memory of a tensor lives and where its work runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

impl Device {
    /// Checks if work on this device always completes before the issuing call returns.
    #[inline]
    pub fn is_synchronous(self) -> bool {
        matches!(self, Device::Cpu)
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown device: {0}")]
    UnknownDevice(Device),
    #[error("unknown device combination: {0} and {1}")]
    UnknownDeviceCombination(Device, Device),
    #[error("no GPU runtime is installed")]
    GpuUnavailable,
    #[error("device mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: Device, actual: Device },
    #[error("null buffer with non-zero element count")]
    NullBuffer,
    #[error("copy of {size} bytes exceeds buffer capacity {capacity}")]
    OutOfBounds { size: usize, capacity: usize },
    #[error("failed to poll device: {0}")]
    Poll(String),
    #[error("failed to map buffer")]
    Map(#[from] wgpu::BufferAsyncError),
    #[error("streams belong to different GPU contexts")]
    ContextMismatch,
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Mismatch { .. }
            | DeviceError::NullBuffer
            | DeviceError::OutOfBounds { .. } => ErrorKind::Precondition,
            _ => ErrorKind::Fatal,
        }
    }
}
