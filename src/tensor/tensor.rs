//! Tensor views over buffers

use crate::error::DenoiseResult;
use crate::memory::buffer::next_view_id;
use crate::memory::{Buffer, Memory, ViewId};
use crate::tensor::{DataType, TensorDesc, TensorLayout};
use crate::{invalid_argument, logic_error};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

/// A tensor: descriptor + buffer region
///
/// The cached pointer is refreshed when the buffer is reallocated.
#[derive(Debug)]
pub struct Tensor {
    desc: TensorDesc,
    buffer: Arc<Buffer>,
    byte_offset: usize,
    view_id: ViewId,
    ptr: AtomicPtr<u8>,
}

impl Tensor {
    /// Create a view of `desc.byte_size()` bytes at `byte_offset` in `buffer`
    pub fn new(buffer: &Arc<Buffer>, desc: TensorDesc, byte_offset: usize) -> DenoiseResult<Arc<Self>> {
        let end = byte_offset
            .checked_add(desc.byte_size())
            .ok_or_else(|| invalid_argument!("tensor region is out of range"))?;
        if end > buffer.byte_size() {
            return Err(invalid_argument!(
                "tensor region [{}, {}) is out of range of a {} byte buffer",
                byte_offset,
                end,
                buffer.byte_size()
            ));
        }

        let tensor = Arc::new(Self {
            ptr: AtomicPtr::new(offset_ptr(buffer.data_ptr(), byte_offset)),
            desc,
            buffer: Arc::clone(buffer),
            byte_offset,
            view_id: next_view_id(),
        });
        let weak: Weak<dyn Memory> = Arc::downgrade(&tensor) as Weak<dyn Memory>;
        buffer.attach(tensor.view_id, weak);
        Ok(tensor)
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.load(Ordering::Acquire)
    }

    /// Element accessor for single precision tensors
    pub fn accessor(&self) -> DenoiseResult<TensorAccessor> {
        if self.desc.data_type != DataType::Float32 {
            return Err(logic_error!(
                "tensor accessor requires f32 data, got {:?}",
                self.desc.data_type
            ));
        }
        let (c, h, w) = match self.desc.layout {
            TensorLayout::Chw => (self.desc.dims[0], self.desc.dims[1], self.desc.dims[2]),
            TensorLayout::X => (1, 1, self.desc.dims[0]),
            TensorLayout::Oihw => (
                self.desc.dims[0] * self.desc.dims[1],
                self.desc.dims[2],
                self.desc.dims[3],
            ),
        };
        Ok(TensorAccessor {
            ptr: self.ptr() as *mut f32,
            c,
            h,
            w,
        })
    }

    /// Copy host values into the tensor (blocking)
    pub fn upload(&self, values: &[f32]) -> DenoiseResult<()> {
        if values.len() != self.desc.num_elements() {
            return Err(invalid_argument!(
                "expected {} values, got {}",
                self.desc.num_elements(),
                values.len()
            ));
        }
        self.buffer
            .write(self.byte_offset, bytemuck::cast_slice(values))
    }

    /// Copy the tensor into a host vector (blocking)
    pub fn download(&self) -> DenoiseResult<Vec<f32>> {
        let mut values = vec![0f32; self.desc.num_elements()];
        self.buffer
            .read(self.byte_offset, bytemuck::cast_slice_mut(values.as_mut_slice()))?;
        Ok(values)
    }
}

impl Memory for Tensor {
    fn update_ptr(&self) -> DenoiseResult<()> {
        let end = self.byte_offset + self.desc.byte_size();
        if end > self.buffer.byte_size() {
            self.ptr.store(std::ptr::null_mut(), Ordering::Release);
            return Err(invalid_argument!("tensor no longer fits in its buffer"));
        }
        self.ptr.store(
            offset_ptr(self.buffer.data_ptr(), self.byte_offset),
            Ordering::Release,
        );
        Ok(())
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.buffer.detach(self.view_id);
    }
}

pub(crate) fn offset_ptr(base: *mut u8, byte_offset: usize) -> *mut u8 {
    if base.is_null() {
        base
    } else {
        base.wrapping_add(byte_offset)
    }
}

/// Raw CHW accessor captured by kernels
///
/// Copyable so it can move into kernel closures; the tensor (and therefore
/// the buffer) must outlive every use, which kernels guarantee by holding
/// the `Arc<Tensor>` alongside.
#[derive(Debug, Clone, Copy)]
pub struct TensorAccessor {
    ptr: *mut f32,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

// SAFETY: accessors are only dereferenced inside kernels that partition the
// output so that no two threads write the same element.
unsafe impl Send for TensorAccessor {}
unsafe impl Sync for TensorAccessor {}

impl TensorAccessor {
    #[inline]
    fn index(&self, c: usize, h: usize, w: usize) -> usize {
        (c * self.h + h) * self.w + w
    }

    /// # Safety
    /// Indices must be in bounds and the backing tensor alive.
    #[inline]
    pub unsafe fn get(&self, c: usize, h: usize, w: usize) -> f32 {
        *self.ptr.add(self.index(c, h, w))
    }

    /// # Safety
    /// Indices must be in bounds, the backing tensor alive, and no other
    /// thread may access the same element concurrently.
    #[inline]
    pub unsafe fn set(&self, c: usize, h: usize, w: usize, value: f32) {
        *self.ptr.add(self.index(c, h, w)) = value;
    }

    /// Row `h` of channel `c` as a slice
    ///
    /// # Safety
    /// Indices must be in bounds and the backing tensor alive.
    #[inline]
    pub unsafe fn row(&self, c: usize, h: usize) -> &[f32] {
        std::slice::from_raw_parts(self.ptr.add(self.index(c, h, 0)), self.w)
    }

    /// Row `h` of channel `c` as a mutable slice
    ///
    /// # Safety
    /// As [`TensorAccessor::row`], and the row must not be aliased.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn row_mut(&self, c: usize, h: usize) -> &mut [f32] {
        std::slice::from_raw_parts_mut(self.ptr.add(self.index(c, h, 0)), self.w)
    }

    /// All elements as a flat slice
    ///
    /// # Safety
    /// The backing tensor must be alive.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[f32] {
        std::slice::from_raw_parts(self.ptr, self.c * self.h * self.w)
    }

    /// All elements as a flat mutable slice
    ///
    /// # Safety
    /// The backing tensor must be alive and not accessed through any other
    /// path while the slice exists.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [f32] {
        std::slice::from_raw_parts_mut(self.ptr, self.c * self.h * self.w)
    }
}
