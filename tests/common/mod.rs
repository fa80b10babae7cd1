//! Shared fixtures for integration tests
//!
//! Devices are created with a small worker pool so that suites running in
//! parallel do not oversubscribe the machine.

#![allow(dead_code)]

use denoiseforge::tensor::{Format, Image, ImageDesc};
use denoiseforge::{Buffer, Device, DeviceType, Storage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

pub use serial_test::serial;

/// Committed CPU device with two worker threads
pub fn committed_device() -> Arc<Device> {
    let device = Device::new(DeviceType::Cpu).expect("CPU device");
    device.set_int("numThreads", 2).expect("set numThreads");
    device.commit().expect("commit device");
    device
}

/// A Float3 image backed by its own buffer
pub struct TestImage {
    pub buffer: Arc<Buffer>,
    pub image: Arc<Image>,
    pub width: usize,
    pub height: usize,
}

impl TestImage {
    /// Allocate and fill with `f(x, y, c)`
    pub fn new(device: &Arc<Device>, width: usize, height: usize, f: impl Fn(usize, usize, usize) -> f32) -> Self {
        let desc = ImageDesc::new(Format::Float3, width, height, 0, 0).expect("image desc");
        let buffer = device
            .new_buffer(desc.byte_size(), Storage::Host)
            .expect("image buffer");
        let mut values = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                for c in 0..3 {
                    values.push(f(x, y, c));
                }
            }
        }
        buffer
            .write(0, bytemuck::cast_slice(&values))
            .expect("fill image");
        let image = Image::from_buffer(&buffer, desc, 0).expect("image view");
        Self {
            buffer,
            image,
            width,
            height,
        }
    }

    pub fn constant(device: &Arc<Device>, width: usize, height: usize, value: f32) -> Self {
        Self::new(device, width, height, |_, _, _| value)
    }

    /// Deterministic noise in `[lo, hi)`
    pub fn noise(device: &Arc<Device>, width: usize, height: usize, seed: u64, lo: f32, hi: f32) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let values: Vec<f32> = (0..width * height * 3).map(|_| rng.gen_range(lo..hi)).collect();
        Self::new(device, width, height, |x, y, c| values[(y * width + x) * 3 + c])
    }

    /// Current pixel values
    pub fn pixels(&self) -> Vec<f32> {
        let mut values = vec![0f32; self.width * self.height * 3];
        self.buffer
            .read(0, bytemuck::cast_slice_mut(values.as_mut_slice()))
            .expect("read image");
        values
    }
}

/// Largest absolute difference of two equally sized slices
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
