//! Image views over buffers or caller-owned memory

use crate::error::DenoiseResult;
use crate::memory::buffer::next_view_id;
use crate::memory::{Buffer, Memory, ViewId};
use crate::tensor::tensor::offset_ptr;
use crate::tensor::{DataType, Format, ImageDesc};
use crate::{invalid_argument, invalid_operation, logic_error};
use half::f16;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug)]
enum Backing {
    /// Region of an engine buffer; registered for reallocation updates
    Buffer { buffer: Arc<Buffer>, view_id: ViewId },
    /// Caller-owned memory ("system" storage); lifetime managed by the caller
    System { base: *mut u8 },
}

/// A strided 2D image
#[derive(Debug)]
pub struct Image {
    desc: ImageDesc,
    backing: Backing,
    byte_offset: usize,
    ptr: AtomicPtr<u8>,
}

// SAFETY: the only non-thread-safe field is the caller-provided base pointer
// of system images, whose validity the caller guarantees for the image's life.
unsafe impl Send for Image {}
unsafe impl Sync for Image {}

impl Image {
    /// View `desc` at `byte_offset` inside `buffer`
    pub fn from_buffer(buffer: &Arc<Buffer>, desc: ImageDesc, byte_offset: usize) -> DenoiseResult<Arc<Self>> {
        let end = byte_offset
            .checked_add(desc.byte_size())
            .ok_or_else(|| invalid_argument!("buffer region is out of range"))?;
        if end > buffer.byte_size() {
            return Err(invalid_argument!("buffer region is out of range"));
        }

        let view_id = next_view_id();
        let image = Arc::new(Self {
            ptr: AtomicPtr::new(offset_ptr(buffer.data_ptr(), byte_offset)),
            desc,
            backing: Backing::Buffer {
                buffer: Arc::clone(buffer),
                view_id,
            },
            byte_offset,
        });
        let weak: Weak<dyn Memory> = Arc::downgrade(&image) as Weak<dyn Memory>;
        buffer.attach(view_id, weak);
        Ok(image)
    }

    /// Wrap caller-owned memory
    ///
    /// # Safety
    /// `base + byte_offset` must be valid for reads and writes of
    /// `desc.byte_size()` bytes for as long as the image or any work that
    /// references it is alive.
    pub unsafe fn from_raw_parts(base: *mut u8, desc: ImageDesc, byte_offset: usize) -> DenoiseResult<Arc<Self>> {
        if base.is_null() && byte_offset.saturating_add(desc.byte_size()) > 0 {
            return Err(invalid_argument!("image pointer is null"));
        }
        Ok(Arc::new(Self {
            ptr: AtomicPtr::new(offset_ptr(base, byte_offset)),
            desc,
            backing: Backing::System { base },
            byte_offset,
        }))
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn width(&self) -> usize {
        self.desc.width
    }

    pub fn height(&self) -> usize {
        self.desc.height
    }

    pub fn format(&self) -> Format {
        self.desc.format
    }

    pub fn byte_size(&self) -> usize {
        self.desc.byte_size()
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Owning buffer, `None` for system images
    pub fn buffer(&self) -> Option<&Arc<Buffer>> {
        match &self.backing {
            Backing::Buffer { buffer, .. } => Some(buffer),
            Backing::System { .. } => None,
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.load(Ordering::Acquire)
    }

    /// Whether both images touch a common byte
    ///
    /// Buffer images only overlap images of the same buffer; system images are
    /// compared by address.
    pub fn overlaps(&self, other: &Image) -> bool {
        if self.byte_size() == 0 || other.byte_size() == 0 {
            return false;
        }
        let (a, b) = match (&self.backing, &other.backing) {
            (Backing::Buffer { buffer: x, .. }, Backing::Buffer { buffer: y, .. }) => {
                if !Arc::ptr_eq(x, y) {
                    return false;
                }
                (
                    (self.byte_offset, self.byte_offset + self.byte_size()),
                    (other.byte_offset, other.byte_offset + other.byte_size()),
                )
            }
            (Backing::System { .. }, Backing::System { .. }) => {
                let x = self.ptr() as usize;
                let y = other.ptr() as usize;
                ((x, x + self.byte_size()), (y, y + other.byte_size()))
            }
            _ => return false,
        };
        a.0 < b.1 && b.0 < a.1
    }

    /// View of the `height x width` region starting at pixel `(h0, w0)`
    ///
    /// Shares the backing memory and strides; no data is copied.
    pub fn sub_image(&self, h0: usize, w0: usize, height: usize, width: usize) -> DenoiseResult<Arc<Self>> {
        if h0 + height > self.desc.height || w0 + width > self.desc.width {
            return Err(logic_error!(
                "sub-image {}x{} at ({}, {}) exceeds {}x{} image",
                width,
                height,
                h0,
                w0,
                self.desc.width,
                self.desc.height
            ));
        }
        let desc = self.desc.with_extent(width, height);
        let byte_offset = self.byte_offset + self.desc.pixel_offset(h0, w0);
        match &self.backing {
            Backing::Buffer { buffer, .. } => Self::from_buffer(buffer, desc, byte_offset),
            // SAFETY: the region lies inside the parent's caller-guaranteed range
            Backing::System { base } => unsafe { Self::from_raw_parts(*base, desc, byte_offset) },
        }
    }

    /// Check that the image still addresses valid memory
    ///
    /// Fails when a reallocation left the backing buffer too small for the
    /// view, or when a non-empty image has no memory behind it.
    pub fn validate(&self) -> DenoiseResult<()> {
        if let Backing::Buffer { buffer, .. } = &self.backing {
            let end = self.byte_offset.saturating_add(self.byte_size());
            let available = buffer.try_byte_size()?;
            if end > available {
                return Err(invalid_operation!(
                    "image region ends at byte {} but its buffer holds {}",
                    end,
                    available
                ));
            }
        }
        if self.byte_size() > 0 && self.ptr().is_null() {
            return Err(invalid_operation!("image memory is no longer valid"));
        }
        Ok(())
    }

    /// Pixel accessor for kernels
    pub fn accessor(&self) -> DenoiseResult<ImageAccessor> {
        self.validate()?;
        Ok(ImageAccessor {
            ptr: self.ptr(),
            data_type: self.desc.format.data_type().unwrap_or(DataType::Float32),
            channels: self.desc.channels(),
            pixel_stride: self.desc.pixel_byte_stride,
            row_stride: self.desc.row_byte_stride,
            height: self.desc.height,
            width: self.desc.width,
        })
    }
}

impl Memory for Image {
    fn update_ptr(&self) -> DenoiseResult<()> {
        let Backing::Buffer { buffer, .. } = &self.backing else {
            return Ok(());
        };
        if self.byte_offset.saturating_add(self.byte_size()) > buffer.try_byte_size()? {
            self.ptr.store(std::ptr::null_mut(), Ordering::Release);
            return Err(invalid_argument!("image no longer fits in its buffer"));
        }
        self.ptr
            .store(offset_ptr(buffer.data_ptr(), self.byte_offset), Ordering::Release);
        Ok(())
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Backing::Buffer { buffer, view_id } = &self.backing {
            buffer.detach(*view_id);
        }
    }
}

/// Raw strided pixel accessor captured by kernels
#[derive(Debug, Clone, Copy)]
pub struct ImageAccessor {
    ptr: *mut u8,
    data_type: DataType,
    channels: usize,
    pixel_stride: usize,
    row_stride: usize,
    pub height: usize,
    pub width: usize,
}

// SAFETY: see TensorAccessor; kernels partition writes by pixel.
unsafe impl Send for ImageAccessor {}
unsafe impl Sync for ImageAccessor {}

impl ImageAccessor {
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    fn channel_ptr(&self, h: usize, w: usize, c: usize) -> *mut u8 {
        self.ptr
            .wrapping_add(h * self.row_stride + w * self.pixel_stride + c * self.data_type.size())
    }

    /// # Safety
    /// `(h, w)` must be inside the image, `c` below the channel count.
    #[inline]
    pub unsafe fn get(&self, h: usize, w: usize, c: usize) -> f32 {
        let p = self.channel_ptr(h, w, c);
        match self.data_type {
            DataType::Float32 => std::ptr::read_unaligned(p as *const f32),
            DataType::Float16 => f16::from_bits(std::ptr::read_unaligned(p as *const u16)).to_f32(),
        }
    }

    /// # Safety
    /// As [`ImageAccessor::get`], and no concurrent access to the same pixel.
    #[inline]
    pub unsafe fn set(&self, h: usize, w: usize, c: usize, value: f32) {
        let p = self.channel_ptr(h, w, c);
        match self.data_type {
            DataType::Float32 => std::ptr::write_unaligned(p as *mut f32, value),
            DataType::Float16 => {
                std::ptr::write_unaligned(p as *mut u16, f16::from_f32(value).to_bits())
            }
        }
    }

    /// First three channels; missing channels read as zero
    ///
    /// # Safety
    /// As [`ImageAccessor::get`].
    #[inline]
    pub unsafe fn get3(&self, h: usize, w: usize) -> [f32; 3] {
        let mut v = [0.0; 3];
        for (c, slot) in v.iter_mut().enumerate().take(self.channels) {
            *slot = self.get(h, w, c);
        }
        v
    }

    /// Write the first three channels; extra channels are left untouched
    ///
    /// # Safety
    /// As [`ImageAccessor::set`].
    #[inline]
    pub unsafe fn set3(&self, h: usize, w: usize, v: [f32; 3]) {
        for (c, value) in v.iter().enumerate().take(self.channels) {
            self.set(h, w, c, *value);
        }
    }
}
