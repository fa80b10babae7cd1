//! CPU backend
//!
//! One engine per device. Kernels run on a rayon pool sized from the device
//! configuration; the in-order command stream hands each kernel to the pool
//! and waits for it before starting the next command. With `setAffinity` the
//! pool workers are pinned round-robin to the cores the process may use.

pub mod cpu_features;
pub mod kernels;

pub use cpu_features::{CpuArch, CpuInfo};

use crate::backend::stream::CommandStream;
use crate::backend::{
    external_memory, DeviceBackend, DeviceCapabilities, DeviceType, Engine, HostFunc,
};
use crate::config::DeviceConfig;
use crate::error::{DenoiseError, DenoiseResult};
use crate::logic_error;
use crate::memory::{Allocation, Storage};
use crate::ops::{
    AutoexposureOp, ConvDesc, ConvOp, ImageCopyOp, InputProcessOp, OutputProcessOp, ResampleOp,
};
use crate::tensor::{DataType, ImageDesc, TensorDesc, TensorLayout};
use kernels::{
    CpuAutoexposure, CpuConv, CpuImageCopy, CpuInputProcess, CpuOutputProcess, CpuResample,
    ResampleKind,
};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Backend half of a CPU device
#[derive(Debug, Default, Clone)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for CpuBackend {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            system_memory_supported: true,
            managed_memory_supported: true,
            external_memory_types: external_memory::NONE,
            tensor_data_type: DataType::Float32,
            tensor_layout: TensorLayout::Chw,
            tensor_block_c: 1,
        }
    }

    fn name(&self) -> String {
        CpuInfo::get().device_name()
    }

    fn init(&self, config: &DeviceConfig) -> DenoiseResult<Vec<Arc<dyn Engine>>> {
        let engine: Arc<dyn Engine> = CpuEngine::new(config)?;
        Ok(vec![engine])
    }
}

/// CPU execution context
#[derive(Debug)]
pub struct CpuEngine {
    this: Weak<CpuEngine>,
    pool: Arc<ThreadPool>,
    stream: CommandStream,
    num_threads: usize,
    affinity_cores: usize,
    pinned_workers: Arc<AtomicUsize>,
}

impl CpuEngine {
    /// Create an engine with its worker pool and command stream
    pub fn new(config: &DeviceConfig) -> DenoiseResult<Arc<Self>> {
        let num_threads = config.effective_num_threads();
        let cores = if config.set_affinity {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        if config.set_affinity && cores.is_empty() {
            warn!("thread affinity requested but the core list is unavailable");
        }

        let pinned_workers = Arc::new(AtomicUsize::new(0));
        let mut builder = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("denoise-cpu-{}", i));
        if !cores.is_empty() {
            let cores = cores.clone();
            let pinned = Arc::clone(&pinned_workers);
            builder = builder.start_handler(move |index| {
                let core = cores[index % cores.len()];
                if core_affinity::set_for_current(core) {
                    pinned.fetch_add(1, Ordering::Relaxed);
                } else {
                    warn!("could not pin worker {} to core {}", index, core.id);
                }
            });
        }
        let pool = builder.build().map_err(|e| {
            DenoiseError::UnsupportedHardware(format!("cannot start CPU worker pool: {}", e))
        })?;
        let stream = CommandStream::new("denoise-cpu-stream")?;

        if !cores.is_empty() {
            debug!("pinning {} workers across {} cores", num_threads, cores.len());
        }
        info!(
            "CPU engine: {} with {} threads (f32 x{})",
            CpuInfo::get(),
            num_threads,
            CpuInfo::get().f32_lanes()
        );

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            pool: Arc::new(pool),
            stream,
            num_threads,
            affinity_cores: cores.len(),
            pinned_workers,
        }))
    }

    /// Cores the workers are pinned across; zero when affinity is off
    pub fn affinity_cores(&self) -> usize {
        self.affinity_cores
    }

    /// Workers that started and were pinned successfully
    pub fn pinned_workers(&self) -> usize {
        self.pinned_workers.load(Ordering::Relaxed)
    }

    /// Strong handle for ops, which keep their engine alive
    fn handle(&self) -> DenoiseResult<Arc<CpuEngine>> {
        self.this
            .upgrade()
            .ok_or_else(|| logic_error!("CPU engine is being destroyed"))
    }

    /// Enqueue a kernel that runs inside the worker pool
    ///
    /// The kernel is borrowed by the pool and dropped on the stream thread,
    /// so releasing the last engine reference never happens on a worker.
    pub(crate) fn submit_kernel<F>(&self, kernel: F)
    where
        F: Fn() -> DenoiseResult<()> + Send + Sync + 'static,
    {
        let pool = Arc::clone(&self.pool);
        self.stream.submit(Box::new(move || pool.install(|| kernel())));
    }
}

impl Engine for CpuEngine {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn alloc(&self, byte_size: usize, storage: Storage) -> DenoiseResult<Allocation> {
        if !self.is_storage_supported(storage) {
            return Err(logic_error!("cannot allocate {:?} storage", storage));
        }
        Allocation::zeroed(byte_size)
    }

    fn is_storage_supported(&self, storage: Storage) -> bool {
        matches!(storage, Storage::Host | Storage::Device | Storage::Managed)
    }

    fn submit_host_func(&self, func: HostFunc) {
        self.stream.submit(func);
    }

    fn wait(&self) -> DenoiseResult<()> {
        self.stream.wait()
    }

    fn num_threads(&self) -> usize {
        self.num_threads
    }

    fn new_conv(&self, desc: &ConvDesc) -> DenoiseResult<Box<dyn ConvOp>> {
        Ok(Box::new(CpuConv::new(self.handle()?, desc.clone())))
    }

    fn new_pool(&self, src: &TensorDesc) -> DenoiseResult<Box<dyn ResampleOp>> {
        Ok(Box::new(CpuResample::new(
            self.handle()?,
            ResampleKind::MaxPool2x2,
            src.clone(),
        )))
    }

    fn new_upsample(&self, src: &TensorDesc) -> DenoiseResult<Box<dyn ResampleOp>> {
        Ok(Box::new(CpuResample::new(
            self.handle()?,
            ResampleKind::Nearest2x,
            src.clone(),
        )))
    }

    fn new_input_process(&self, dst: &TensorDesc) -> DenoiseResult<Box<dyn InputProcessOp>> {
        Ok(Box::new(CpuInputProcess::new(self.handle()?, dst.clone())))
    }

    fn new_output_process(&self, src: &TensorDesc) -> DenoiseResult<Box<dyn OutputProcessOp>> {
        Ok(Box::new(CpuOutputProcess::new(self.handle()?, src.clone())))
    }

    fn new_autoexposure(&self, src: &ImageDesc) -> DenoiseResult<Box<dyn AutoexposureOp>> {
        Ok(Box::new(CpuAutoexposure::new(self.handle()?, *src)))
    }

    fn new_image_copy(&self) -> DenoiseResult<Box<dyn ImageCopyOp>> {
        Ok(Box::new(CpuImageCopy::new(self.handle()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_thread_count() {
        let engine = CpuEngine::new(&DeviceConfig::new().with_num_threads(3)).unwrap();
        assert_eq!(engine.num_threads(), 3);
        assert_eq!(engine.device_type(), DeviceType::Cpu);
    }

    #[test]
    fn test_kernels_run_on_pool_in_order() {
        let engine = CpuEngine::new(&DeviceConfig::new().with_num_threads(2)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for expected in 0..8 {
            let counter = Arc::clone(&counter);
            engine.submit_kernel(move || {
                assert!(rayon::current_thread_index().is_some());
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                if seen != expected {
                    return Err(logic_error!("out of order: {} != {}", seen, expected));
                }
                Ok(())
            });
        }
        engine.wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_affinity_pins_every_worker() {
        let loose = CpuEngine::new(&DeviceConfig::new().with_num_threads(2).with_set_affinity(false)).unwrap();
        loose.pool.broadcast(|_| ());
        assert_eq!(loose.affinity_cores(), 0);
        assert_eq!(loose.pinned_workers(), 0);

        let pinned = CpuEngine::new(&DeviceConfig::new().with_num_threads(3).with_set_affinity(true)).unwrap();
        // every worker has run its start handler once it took part in a broadcast
        pinned.pool.broadcast(|_| ());
        if cfg!(target_os = "linux") {
            assert!(pinned.affinity_cores() > 0);
            assert_eq!(pinned.pinned_workers(), 3);
        }
    }

    #[test]
    fn test_storage_support() {
        let engine = CpuEngine::new(&DeviceConfig::new()).unwrap();
        assert!(engine.is_storage_supported(Storage::Host));
        assert!(engine.is_storage_supported(Storage::Managed));
        assert!(!engine.is_storage_supported(Storage::Undefined));
        assert!(engine.alloc(64, Storage::Device).is_ok());
    }

    #[test]
    fn test_backend_capabilities() {
        let backend = CpuBackend::new();
        let caps = backend.capabilities();
        assert!(caps.system_memory_supported);
        assert_eq!(caps.external_memory_types, external_memory::NONE);
        let engines = backend.init(&DeviceConfig::new().with_num_threads(1)).unwrap();
        assert_eq!(engines.len(), 1);
    }
}
