//! Handle-style boundary
//!
//! Mirrors a C-like surface: raw integers for enums, optional names and
//! pointers, and no `Result`s. Every failure is recorded in the sticky error
//! slot of the owning device (or the calling thread's slot for device-less
//! calls) and the call returns a neutral value. The typed core API in
//! [`crate::device`] and [`crate::filter`] is the one to use from Rust.

use crate::backend::{DeviceType, SyncMode};
use crate::device::{self, Device, ErrorCallback, PhysicalDevice};
use crate::error::{DenoiseError, DenoiseResult, ErrorCode};
use crate::filter::{Filter, ProgressCallback};
use crate::invalid_argument;
use crate::memory::{Buffer, PendingRead, Storage};
use crate::tensor::{Format, Image, ImageDesc};
use std::sync::{Arc, Mutex};

fn required<'a>(name: Option<&'a str>, what: &str) -> DenoiseResult<&'a str> {
    name.ok_or_else(|| invalid_argument!("{} name is null", what))
}

/// Return and clear the calling thread's device-less error
pub fn get_error() -> (ErrorCode, Option<String>) {
    device::take_global_error()
}

fn global<T>(result: DenoiseResult<T>) -> Option<T> {
    result.map_err(|err| device::record_global_error(&err)).ok()
}

pub fn num_physical_devices() -> usize {
    device::num_physical_devices()
}

/// Handle to a physical device
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceRef(&'static PhysicalDevice);

impl PhysicalDeviceRef {
    pub fn get(id: i32) -> Option<Self> {
        let id = usize::try_from(id).map_err(|_| invalid_argument!("invalid physical device ID: {}", id));
        global(id.and_then(device::physical_device)).map(PhysicalDeviceRef)
    }

    pub fn get_bool(&self, name: Option<&str>) -> bool {
        global(required(name, "parameter").and_then(|n| self.0.get_bool(n))).unwrap_or(false)
    }

    pub fn get_int(&self, name: Option<&str>) -> i32 {
        global(required(name, "parameter").and_then(|n| self.0.get_int(n))).unwrap_or(0)
    }

    pub fn get_string(&self, name: Option<&str>) -> Option<&'static str> {
        let device: &'static PhysicalDevice = self.0;
        global(required(name, "parameter").and_then(|n| device.get_string(n)))
    }

    pub fn get_data(&self, name: Option<&str>) -> Option<&'static [u8]> {
        let device: &'static PhysicalDevice = self.0;
        global(required(name, "parameter").and_then(|n| device.get_data(n)))
    }
}

/// Shared device handle
#[derive(Debug, Clone)]
pub struct DeviceRef(Arc<Device>);

impl DeviceRef {
    /// Create a device of a raw device type
    pub fn new(device_type: i32) -> Option<Self> {
        global(DeviceType::from_raw(device_type).and_then(Device::new)).map(DeviceRef)
    }

    pub fn from_physical(id: i32) -> Option<Self> {
        let id = usize::try_from(id).map_err(|_| invalid_argument!("invalid physical device ID: {}", id));
        global(id.and_then(Device::from_physical)).map(DeviceRef)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.0
    }

    fn record<T>(&self, result: DenoiseResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.0.record_error(&err);
                None
            }
        }
    }

    pub fn set_int(&self, name: Option<&str>, value: i32) {
        self.record(required(name, "parameter").and_then(|n| self.0.set_int(n, value)));
    }

    pub fn get_int(&self, name: Option<&str>) -> i32 {
        self.record(required(name, "parameter").and_then(|n| self.0.get_int(n)))
            .unwrap_or(0)
    }

    pub fn set_bool(&self, name: Option<&str>, value: bool) {
        self.set_int(name, i32::from(value));
    }

    pub fn get_bool(&self, name: Option<&str>) -> bool {
        self.get_int(name) != 0
    }

    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        self.0.set_error_callback(callback);
    }

    /// Return and clear the device error
    pub fn get_error(&self) -> (ErrorCode, Option<String>) {
        self.0.take_error()
    }

    pub fn commit(&self) {
        self.record(self.0.commit());
    }

    /// Wait for all asynchronous work of the device
    pub fn sync(&self) {
        self.record(self.0.sync());
    }

    /// Allocate a buffer of a raw storage mode
    pub fn new_buffer(&self, byte_size: usize, storage: i32) -> Option<BufferRef> {
        let buffer = Storage::from_raw(storage).and_then(|s| self.0.new_buffer(byte_size, s));
        self.record(buffer).map(|buffer| BufferRef {
            device: Arc::clone(&self.0),
            buffer,
        })
    }

    pub fn new_filter(&self, type_name: Option<&str>) -> Option<FilterRef> {
        let filter = required(type_name, "filter type").and_then(|t| self.0.new_filter(t));
        self.record(filter).map(|filter| FilterRef {
            device: Arc::clone(&self.0),
            filter: Arc::new(Mutex::new(filter)),
        })
    }
}

/// Shared buffer handle
#[derive(Debug, Clone)]
pub struct BufferRef {
    device: Arc<Device>,
    buffer: Arc<Buffer>,
}

impl BufferRef {
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    fn record<T>(&self, result: DenoiseResult<T>) -> Option<T> {
        result.map_err(|err| self.device.record_error(&err)).ok()
    }

    pub fn size(&self) -> usize {
        self.buffer.byte_size()
    }

    pub fn storage(&self) -> i32 {
        self.buffer.storage() as i32
    }

    /// Copy `byte_size` bytes at `byte_offset` into `dst`
    pub fn read(&self, byte_offset: usize, byte_size: usize, dst: Option<&mut [u8]>) {
        let result = match dst {
            None if byte_size > 0 => Err(invalid_argument!("destination pointer is null")),
            None => Ok(()),
            Some(dst) if dst.len() < byte_size => Err(invalid_argument!(
                "destination holds {} bytes, {} requested",
                dst.len(),
                byte_size
            )),
            Some(dst) => self.buffer.read(byte_offset, &mut dst[..byte_size]),
        };
        self.record(result);
    }

    /// Copy `byte_size` bytes from `src` to `byte_offset`
    pub fn write(&self, byte_offset: usize, byte_size: usize, src: Option<&[u8]>) {
        let result = match src {
            None if byte_size > 0 => Err(invalid_argument!("source pointer is null")),
            None => Ok(()),
            Some(src) if src.len() < byte_size => Err(invalid_argument!(
                "source holds {} bytes, {} requested",
                src.len(),
                byte_size
            )),
            Some(src) => self.buffer.write(byte_offset, &src[..byte_size]),
        };
        self.record(result);
    }

    /// Enqueue a read; the bytes are available after a device sync
    pub fn read_async(&self, byte_offset: usize, byte_size: usize) -> Option<PendingRead> {
        self.record(self.buffer.read_async(byte_offset, byte_size))
    }

    /// Enqueue a write of a copy of `src`
    pub fn write_async(&self, byte_offset: usize, byte_size: usize, src: Option<&[u8]>) {
        let result = match src {
            None if byte_size > 0 => Err(invalid_argument!("source pointer is null")),
            None => Ok(()),
            Some(src) if src.len() < byte_size => Err(invalid_argument!(
                "source holds {} bytes, {} requested",
                src.len(),
                byte_size
            )),
            Some(src) => self.buffer.write_async(byte_offset, &src[..byte_size]),
        };
        self.record(result);
    }
}

/// Shared filter handle
#[derive(Debug, Clone)]
pub struct FilterRef {
    device: Arc<Device>,
    filter: Arc<Mutex<Filter>>,
}

impl FilterRef {
    fn with<T>(&self, f: impl FnOnce(&mut Filter) -> DenoiseResult<T>) -> Option<T> {
        let result = self
            .filter
            .lock()
            .map_err(DenoiseError::from)
            .and_then(|mut filter| f(&mut filter));
        result.map_err(|err| self.device.record_error(&err)).ok()
    }

    /// Bind a region of `buffer` to an image role
    ///
    /// A missing buffer with zero dimensions unsets the role.
    #[allow(clippy::too_many_arguments)]
    pub fn set_image(
        &self,
        name: Option<&str>,
        buffer: Option<&BufferRef>,
        format: i32,
        width: usize,
        height: usize,
        byte_offset: usize,
        pixel_stride: usize,
        row_stride: usize,
    ) {
        self.with(|filter| {
            let role = required(name, "image")?;
            let Some(buffer) = buffer else {
                if width == 0 && height == 0 {
                    return filter.unset_image(role);
                }
                return Err(invalid_argument!("image '{}' buffer is null", role));
            };
            let desc = ImageDesc::new(Format::from_raw(format)?, width, height, pixel_stride, row_stride)?;
            let image = Image::from_buffer(&buffer.buffer, desc, byte_offset)?;
            filter.set_image(role, image)
        });
    }

    /// Bind caller-owned memory to an image role
    ///
    /// A null pointer with zero dimensions unsets the role.
    ///
    /// # Safety
    /// `ptr + byte_offset` must be valid for reads and writes of the image's
    /// strided extent until the role is rebound or unset and every execution
    /// that uses it has completed.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn set_shared_image(
        &self,
        name: Option<&str>,
        ptr: *mut u8,
        format: i32,
        width: usize,
        height: usize,
        byte_offset: usize,
        pixel_stride: usize,
        row_stride: usize,
    ) {
        self.with(|filter| {
            let role = required(name, "image")?;
            if ptr.is_null() {
                if width == 0 && height == 0 {
                    return filter.unset_image(role);
                }
                return Err(invalid_argument!("image '{}' pointer is null", role));
            }
            let desc = ImageDesc::new(Format::from_raw(format)?, width, height, pixel_stride, row_stride)?;
            let image = Image::from_raw_parts(ptr, desc, byte_offset)?;
            filter.set_image(role, image)
        });
    }

    pub fn unset_image(&self, name: Option<&str>) {
        self.with(|filter| filter.unset_image(required(name, "image")?));
    }

    /// Set an opaque data parameter; `None` with size 0 removes it
    pub fn set_data(&self, name: Option<&str>, data: Option<&[u8]>, byte_size: usize) {
        self.with(|filter| {
            let name = required(name, "data")?;
            match data {
                None if byte_size > 0 => Err(invalid_argument!("data '{}' pointer is null", name)),
                None => filter.unset_data(name),
                Some(data) if data.len() < byte_size => Err(invalid_argument!(
                    "data '{}' holds {} bytes, {} given",
                    name,
                    data.len(),
                    byte_size
                )),
                Some(data) => filter.set_data(name, Some(&data[..byte_size])),
            }
        });
    }

    pub fn unset_data(&self, name: Option<&str>) {
        self.with(|filter| filter.unset_data(required(name, "data")?));
    }

    pub fn set_int(&self, name: Option<&str>, value: i32) {
        self.with(|filter| filter.set_int(required(name, "parameter")?, value));
    }

    pub fn get_int(&self, name: Option<&str>) -> i32 {
        self.with(|filter| filter.get_int(required(name, "parameter")?))
            .unwrap_or(0)
    }

    pub fn set_bool(&self, name: Option<&str>, value: bool) {
        self.set_int(name, i32::from(value));
    }

    pub fn get_bool(&self, name: Option<&str>) -> bool {
        self.get_int(name) != 0
    }

    pub fn set_float(&self, name: Option<&str>, value: f32) {
        self.with(|filter| filter.set_float(required(name, "parameter")?, value));
    }

    pub fn get_float(&self, name: Option<&str>) -> f32 {
        self.with(|filter| filter.get_float(required(name, "parameter")?))
            .unwrap_or(0.0)
    }

    pub fn set_progress_monitor(&self, callback: Option<ProgressCallback>) {
        self.with(|filter| {
            filter.set_progress_monitor(callback);
            Ok(())
        });
    }

    pub fn commit(&self) {
        self.with(|filter| filter.commit());
    }

    pub fn execute(&self) {
        self.with(|filter| filter.execute(SyncMode::Sync));
    }

    /// Enqueue execution; completes on device sync
    pub fn execute_async(&self) {
        self.with(|filter| filter.execute(SyncMode::Async));
    }
}
