//! Compute backends
//!
//! A backend family contributes two things: a [`DeviceBackend`] that a
//! [`crate::device::Device`] composes for its backend-specific capabilities
//! and initialization, and one or more [`Engine`]s that allocate memory,
//! build ops and execute an in-order command stream. Only the CPU family is
//! compiled in; the factory reports the accelerator families as unsupported
//! hardware.

pub mod cpu;
pub mod stream;

use crate::config::DeviceConfig;
use crate::error::{DenoiseError, DenoiseResult};
use crate::memory::{Allocation, Storage};
use crate::ops::{AutoexposureOp, ConvDesc, ConvOp, ImageCopyOp, InputProcessOp, OutputProcessOp, ResampleOp};
use crate::tensor::{DataType, ImageDesc, TensorDesc, TensorLayout};
use std::fmt;
use std::sync::Arc;

/// Work item executed on an engine stream
pub type HostFunc = Box<dyn FnOnce() -> DenoiseResult<()> + Send + 'static>;

/// Device families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum DeviceType {
    /// Pick the best available device
    #[default]
    Default = 0,
    Cpu = 1,
    Sycl = 2,
    Cuda = 3,
    Hip = 4,
    Metal = 5,
}

impl DeviceType {
    /// Convert from the raw integer representation
    pub fn from_raw(value: i32) -> DenoiseResult<Self> {
        match value {
            0 => Ok(DeviceType::Default),
            1 => Ok(DeviceType::Cpu),
            2 => Ok(DeviceType::Sycl),
            3 => Ok(DeviceType::Cuda),
            4 => Ok(DeviceType::Hip),
            5 => Ok(DeviceType::Metal),
            _ => Err(DenoiseError::InvalidArgument(format!(
                "invalid device type: {}",
                value
            ))),
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Default => "default",
            DeviceType::Cpu => "CPU",
            DeviceType::Sycl => "SYCL",
            DeviceType::Cuda => "CUDA",
            DeviceType::Hip => "HIP",
            DeviceType::Metal => "Metal",
        };
        f.write_str(name)
    }
}

/// Whether work submission blocks until completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Sync,
    Async,
}

/// External memory handle types a device can import (bit flags)
pub mod external_memory {
    pub const NONE: u32 = 0;
    pub const OPAQUE_FD: u32 = 1 << 0;
    pub const DMA_BUF: u32 = 1 << 1;
    pub const OPAQUE_WIN32: u32 = 1 << 2;
    pub const OPAQUE_WIN32_KMT: u32 = 1 << 3;
}

/// Static capabilities of a backend family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Images may wrap plain host pointers
    pub system_memory_supported: bool,
    pub managed_memory_supported: bool,
    /// Bit set of [`external_memory`] flags
    pub external_memory_types: u32,
    /// Native tensor element type
    pub tensor_data_type: DataType,
    pub tensor_layout: TensorLayout,
    /// Channel padding of native tensors
    pub tensor_block_c: usize,
}

/// Execution context of a device
pub trait Engine: Send + Sync + fmt::Debug {
    fn device_type(&self) -> DeviceType;

    /// Allocate `byte_size` bytes of `storage`; huge requests fail with OutOfMemory
    fn alloc(&self, byte_size: usize, storage: Storage) -> DenoiseResult<Allocation>;

    fn is_storage_supported(&self, storage: Storage) -> bool;

    /// Enqueue a host function on the command stream
    fn submit_host_func(&self, func: HostFunc);

    /// Block until the stream drains; returns (and clears) the first error
    /// raised by queued work since the last wait
    fn wait(&self) -> DenoiseResult<()>;

    /// Worker threads available to kernels
    fn num_threads(&self) -> usize;

    fn new_conv(&self, desc: &ConvDesc) -> DenoiseResult<Box<dyn ConvOp>>;

    fn new_pool(&self, src: &TensorDesc) -> DenoiseResult<Box<dyn ResampleOp>>;

    fn new_upsample(&self, src: &TensorDesc) -> DenoiseResult<Box<dyn ResampleOp>>;

    fn new_input_process(&self, dst: &TensorDesc) -> DenoiseResult<Box<dyn InputProcessOp>>;

    fn new_output_process(&self, src: &TensorDesc) -> DenoiseResult<Box<dyn OutputProcessOp>>;

    fn new_autoexposure(&self, src: &ImageDesc) -> DenoiseResult<Box<dyn AutoexposureOp>>;

    fn new_image_copy(&self) -> DenoiseResult<Box<dyn ImageCopyOp>>;
}

/// Backend-specific part of a device
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    fn device_type(&self) -> DeviceType;

    fn capabilities(&self) -> DeviceCapabilities;

    /// Human-readable device name
    fn name(&self) -> String;

    /// Create the engines for a committed configuration
    fn init(&self, config: &DeviceConfig) -> DenoiseResult<Vec<Arc<dyn Engine>>>;
}

/// Build the backend for a device type
pub fn create_backend(device_type: DeviceType) -> DenoiseResult<Box<dyn DeviceBackend>> {
    match device_type {
        DeviceType::Default | DeviceType::Cpu => Ok(Box::new(cpu::CpuBackend::new())),
        other => Err(DenoiseError::UnsupportedHardware(format!(
            "{} devices are not supported by this build",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_device_type_roundtrip() {
        for raw in 0..6 {
            assert_eq!(DeviceType::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(
            DeviceType::from_raw(9).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn test_factory() {
        assert_eq!(
            create_backend(DeviceType::Default).unwrap().device_type(),
            DeviceType::Cpu
        );
        for ty in [DeviceType::Sycl, DeviceType::Cuda, DeviceType::Hip, DeviceType::Metal] {
            let err = create_backend(ty).unwrap_err();
            assert_eq!(err.code(), ErrorCode::UnsupportedHardware);
        }
    }
}
