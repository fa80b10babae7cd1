//! Engine-owned buffers and the view registry
//!
//! A [`Buffer`] owns an [`Allocation`] and knows nothing about how its bytes
//! are interpreted. Views ([`crate::tensor::Tensor`], [`crate::tensor::Image`])
//! hold a strong reference to the buffer and register a weak handle to
//! themselves on construction, so that [`Buffer::realloc`] can tell every live
//! view to recompute its cached pointer. The buffer never keeps a view alive.

use crate::backend::Engine;
use crate::error::{DenoiseError, DenoiseResult};
use crate::memory::MEMORY_ALIGNMENT;
use crate::{invalid_argument, logic_error};
use std::alloc::Layout;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// Memory domain of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum Storage {
    /// Let the device pick its default
    #[default]
    Undefined = -1,
    /// Host memory visible to the device
    Host = 0,
    /// Device-local memory
    Device = 1,
    /// Unified memory migrated between host and device
    Managed = 2,
}

impl Storage {
    /// Convert from the raw integer representation
    pub fn from_raw(value: i32) -> DenoiseResult<Self> {
        match value {
            -1 => Ok(Storage::Undefined),
            0 => Ok(Storage::Host),
            1 => Ok(Storage::Device),
            2 => Ok(Storage::Managed),
            _ => Err(invalid_argument!("invalid storage mode: {}", value)),
        }
    }
}

/// Host-addressable allocation aligned to [`MEMORY_ALIGNMENT`]
///
/// Zero-sized allocations carry a null pointer and are never dereferenced.
#[derive(Debug)]
pub struct Allocation {
    ptr: *mut u8,
    byte_size: usize,
    layout: Option<Layout>,
}

// SAFETY: the allocation is uniquely owned; the raw pointer is only shared
// through views whose accesses are serialized by the engine stream.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    /// Allocate `byte_size` zeroed bytes
    pub fn zeroed(byte_size: usize) -> DenoiseResult<Self> {
        if byte_size == 0 {
            return Ok(Self::empty());
        }
        let layout = Layout::from_size_align(byte_size, MEMORY_ALIGNMENT).map_err(|_| {
            DenoiseError::OutOfMemory(format!("cannot allocate {} bytes", byte_size))
        })?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DenoiseError::OutOfMemory(format!(
                "cannot allocate {} bytes",
                byte_size
            )));
        }
        Ok(Self {
            ptr,
            byte_size,
            layout: Some(layout),
        })
    }

    /// Zero-sized allocation
    pub fn empty() -> Self {
        Self {
            ptr: ptr::null_mut(),
            byte_size: 0,
            layout: None,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: ptr was returned by alloc_zeroed with this layout
            unsafe { std::alloc::dealloc(self.ptr, layout) };
        }
    }
}

/// Identifier of a view registered with a buffer
pub type ViewId = u64;

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique view id
pub fn next_view_id() -> ViewId {
    NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed)
}

/// A view that caches a pointer derived from a buffer
pub trait Memory: Send + Sync {
    /// Recompute the cached pointer after the backing buffer was reallocated
    fn update_ptr(&self) -> DenoiseResult<()>;
}

struct ViewEntry {
    id: ViewId,
    view: Weak<dyn Memory>,
}

/// Contiguous storage owned by an engine
pub struct Buffer {
    engine: Arc<dyn Engine>,
    storage: Storage,
    allocation: RwLock<Allocation>,
    views: Mutex<Vec<ViewEntry>>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("storage", &self.storage)
            .field("byte_size", &self.byte_size())
            .field("views", &self.attached_view_count())
            .finish()
    }
}

impl Buffer {
    /// Allocate a new buffer on `engine`
    ///
    /// `Storage::Undefined` selects host storage. Zero-sized buffers are valid.
    pub fn new(engine: Arc<dyn Engine>, byte_size: usize, storage: Storage) -> DenoiseResult<Arc<Self>> {
        let storage = match storage {
            Storage::Undefined => Storage::Host,
            other => other,
        };
        if !engine.is_storage_supported(storage) {
            return Err(invalid_argument!(
                "storage mode {:?} is not supported by the device",
                storage
            ));
        }
        let allocation = engine.alloc(byte_size, storage)?;

        tracing::trace!("allocated {:?} buffer of {} bytes", storage, byte_size);

        Ok(Arc::new(Self {
            engine,
            storage,
            allocation: RwLock::new(allocation),
            views: Mutex::new(Vec::new()),
        }))
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn storage(&self) -> Storage {
        self.storage
    }

    /// Size of the current allocation
    ///
    /// The allocation is swapped whole under the lock, so a poisoned lock
    /// still guards a consistent value and is read through. Use
    /// [`Buffer::try_byte_size`] where poisoning must surface as an error.
    pub fn byte_size(&self) -> usize {
        self.allocation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .byte_size()
    }

    /// Size of the current allocation, failing on a poisoned lock
    pub fn try_byte_size(&self) -> DenoiseResult<usize> {
        Ok(self.allocation.read()?.byte_size())
    }

    /// Base pointer of the current allocation (null when empty)
    pub fn data_ptr(&self) -> *mut u8 {
        self.allocation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ptr()
    }

    /// Validate that `[byte_offset, byte_offset + len)` lies in the buffer
    pub fn check_range(&self, byte_offset: usize, len: usize) -> DenoiseResult<()> {
        let end = byte_offset
            .checked_add(len)
            .ok_or_else(|| invalid_argument!("buffer region is out of range"))?;
        if end > self.try_byte_size()? {
            return Err(invalid_argument!("buffer region is out of range"));
        }
        Ok(())
    }

    /// Copy bytes out of the buffer after all queued work has finished
    pub fn read(&self, byte_offset: usize, dst: &mut [u8]) -> DenoiseResult<()> {
        self.check_range(byte_offset, dst.len())?;
        self.engine.wait()?;
        self.copy_out(byte_offset, dst)
    }

    /// Copy bytes into the buffer after all queued work has finished
    pub fn write(&self, byte_offset: usize, src: &[u8]) -> DenoiseResult<()> {
        self.check_range(byte_offset, src.len())?;
        self.engine.wait()?;
        self.copy_in(byte_offset, src)
    }

    /// Enqueue a read; the bytes are available from the returned handle
    /// once the device has been synchronized
    pub fn read_async(self: &Arc<Self>, byte_offset: usize, byte_size: usize) -> DenoiseResult<PendingRead> {
        self.check_range(byte_offset, byte_size)?;
        let pending = PendingRead::default();
        let slot = Arc::clone(&pending.slot);
        let buffer = Arc::clone(self);
        self.engine.submit_host_func(Box::new(move || -> DenoiseResult<()> {
            let mut data = vec![0u8; byte_size];
            buffer.copy_out(byte_offset, &mut data)?;
            *slot.lock()? = Some(data);
            Ok(())
        }));
        Ok(pending)
    }

    /// Enqueue a write of a copy of `src`
    pub fn write_async(self: &Arc<Self>, byte_offset: usize, src: &[u8]) -> DenoiseResult<()> {
        self.check_range(byte_offset, src.len())?;
        let data = src.to_vec();
        let buffer = Arc::clone(self);
        self.engine
            .submit_host_func(Box::new(move || buffer.copy_in(byte_offset, &data)));
        Ok(())
    }

    /// Replace the storage with a fresh allocation of `byte_size` bytes
    ///
    /// Contents are discarded. Every attached view is told to refresh its
    /// pointer; a view that can no longer be resolved is a logic error.
    pub fn realloc(&self, byte_size: usize) -> DenoiseResult<()> {
        self.engine.wait()?;
        let fresh = self.engine.alloc(byte_size, self.storage)?;
        {
            let mut allocation = self.allocation.write()?;
            *allocation = fresh;
        }

        let views: Vec<Arc<dyn Memory>> = self
            .views
            .lock()?
            .iter()
            .filter_map(|entry| entry.view.upgrade())
            .collect();

        tracing::debug!(
            "reallocated buffer to {} bytes, updating {} views",
            byte_size,
            views.len()
        );

        for view in views {
            view.update_ptr()
                .map_err(|e| logic_error!("failed to update view after reallocation: {}", e))?;
        }
        Ok(())
    }

    /// Register a view for reallocation notifications
    pub fn attach(&self, id: ViewId, view: Weak<dyn Memory>) {
        if let Ok(mut views) = self.views.lock() {
            views.push(ViewEntry { id, view });
        }
    }

    /// Remove a view registration
    pub fn detach(&self, id: ViewId) {
        if let Ok(mut views) = self.views.lock() {
            views.retain(|entry| entry.id != id);
        }
    }

    /// Number of registered views (including ones being dropped)
    pub fn attached_view_count(&self) -> usize {
        self.views.lock().map(|v| v.len()).unwrap_or(0)
    }

    fn copy_out(&self, byte_offset: usize, dst: &mut [u8]) -> DenoiseResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let allocation = self.allocation.read()?;
        if byte_offset + dst.len() > allocation.byte_size() {
            return Err(invalid_argument!("buffer region is out of range"));
        }
        // SAFETY: range checked against the live allocation above
        unsafe {
            ptr::copy_nonoverlapping(
                allocation.as_ptr().add(byte_offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    fn copy_in(&self, byte_offset: usize, src: &[u8]) -> DenoiseResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        let allocation = self.allocation.read()?;
        if byte_offset + src.len() > allocation.byte_size() {
            return Err(invalid_argument!("buffer region is out of range"));
        }
        // SAFETY: range checked against the live allocation above
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr(),
                allocation.as_ptr().add(byte_offset),
                src.len(),
            );
        }
        Ok(())
    }
}

/// Result slot of an asynchronous buffer read
#[derive(Debug, Default)]
pub struct PendingRead {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl PendingRead {
    /// Whether the read has executed
    pub fn is_ready(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Take the bytes; `None` until the device was synchronized
    pub fn take(&self) -> Option<Vec<u8>> {
        self.slot.lock().ok().and_then(|mut s| s.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuEngine;
    use crate::config::DeviceConfig;

    fn engine() -> Arc<dyn Engine> {
        CpuEngine::new(&DeviceConfig::new().with_num_threads(2)).unwrap()
    }

    struct CountingView {
        updates: AtomicU64,
        fail: bool,
    }

    impl Memory for CountingView {
        fn update_ptr(&self) -> DenoiseResult<()> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(invalid_argument!("view no longer fits"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_storage_from_raw() {
        assert_eq!(Storage::from_raw(0).unwrap(), Storage::Host);
        assert_eq!(Storage::from_raw(2).unwrap(), Storage::Managed);
        assert!(Storage::from_raw(-42).is_err());
    }

    #[test]
    fn test_zero_sized_buffer() {
        let buffer = Buffer::new(engine(), 0, Storage::Undefined).unwrap();
        assert_eq!(buffer.byte_size(), 0);
        assert!(buffer.data_ptr().is_null());
        assert_eq!(buffer.storage(), Storage::Host);
        buffer.write(0, &[]).unwrap();
    }

    #[test]
    fn test_huge_buffer_is_out_of_memory() {
        let err = Buffer::new(engine(), isize::MAX as usize, Storage::Host).unwrap_err();
        assert!(matches!(err, DenoiseError::OutOfMemory(_)));
    }

    #[test]
    fn test_read_write_roundtrip() {
        let buffer = Buffer::new(engine(), 1024, Storage::Host).unwrap();
        let src: Vec<u8> = (0..256).map(|i| i as u8).collect();
        buffer.write(100, &src).unwrap();
        let mut dst = vec![0u8; 256];
        buffer.read(100, &mut dst).unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn test_out_of_range_copies_nothing() {
        let buffer = Buffer::new(engine(), 256, Storage::Host).unwrap();
        buffer.write(0, &[7u8; 256]).unwrap();

        let err = buffer.write(1, &[1u8; 256]).unwrap_err();
        assert!(matches!(err, DenoiseError::InvalidArgument(_)));

        let mut dst = vec![0u8; 256];
        buffer.read(0, &mut dst).unwrap();
        assert!(dst.iter().all(|&b| b == 7));

        let mut big = vec![0u8; 512];
        assert!(buffer.read(0, &mut big).is_err());
        assert!(big.iter().all(|&b| b == 0));
        assert!(buffer.check_range(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_async_read_write() {
        let engine = engine();
        let buffer = Buffer::new(engine.clone(), 64, Storage::Host).unwrap();
        buffer.write_async(0, &[3u8; 64]).unwrap();
        let pending = buffer.read_async(0, 64).unwrap();
        engine.wait().unwrap();
        assert!(pending.is_ready());
        assert_eq!(pending.take().unwrap(), vec![3u8; 64]);
        assert!(pending.take().is_none());
    }

    #[test]
    fn test_realloc_notifies_live_views() {
        let buffer = Buffer::new(engine(), 64, Storage::Host).unwrap();
        let view = Arc::new(CountingView {
            updates: AtomicU64::new(0),
            fail: false,
        });
        let weak: Weak<dyn Memory> = Arc::downgrade(&view) as Weak<dyn Memory>;
        buffer.attach(7, weak);

        buffer.realloc(128).unwrap();
        assert_eq!(buffer.byte_size(), 128);
        assert_eq!(view.updates.load(Ordering::SeqCst), 1);

        buffer.detach(7);
        buffer.realloc(32).unwrap();
        assert_eq!(view.updates.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.attached_view_count(), 0);
    }

    #[test]
    fn test_realloc_failure_is_logic_error() {
        let buffer = Buffer::new(engine(), 64, Storage::Host).unwrap();
        let view = Arc::new(CountingView {
            updates: AtomicU64::new(0),
            fail: true,
        });
        buffer.attach(1, Arc::downgrade(&view) as Weak<dyn Memory>);
        let err = buffer.realloc(8).unwrap_err();
        assert!(matches!(err, DenoiseError::Logic(_)));
    }

    #[test]
    fn test_dropped_views_are_skipped() {
        let buffer = Buffer::new(engine(), 64, Storage::Host).unwrap();
        {
            let view = Arc::new(CountingView {
                updates: AtomicU64::new(0),
                fail: true,
            });
            buffer.attach(2, Arc::downgrade(&view) as Weak<dyn Memory>);
        }
        buffer.realloc(16).unwrap();
    }

    #[test]
    fn test_poisoned_allocation_lock_reports_lock_error() {
        let buffer = Buffer::new(engine(), 64, Storage::Host).unwrap();
        let poisoner = Arc::clone(&buffer);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.allocation.write().unwrap();
            panic!("poison the allocation lock");
        })
        .join();
        assert!(buffer.allocation.is_poisoned());

        let err = buffer.check_range(0, 16).unwrap_err();
        assert!(matches!(err, DenoiseError::LockPoisoned(_)));
        assert!(buffer.try_byte_size().is_err());
        // plain queries still see the intact allocation
        assert_eq!(buffer.byte_size(), 64);
        assert!(!buffer.data_ptr().is_null());
    }
}
