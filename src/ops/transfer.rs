//! Transfer functions between image values and network values
//!
//! The network works on perceptually uniform values in roughly [0, 1]. LDR
//! linear input goes through the sRGB curve, already sRGB-encoded input is
//! passed through, and HDR input goes through a normalized log curve after
//! being multiplied by the input scale.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Largest HDR value the log curve is normalized for (f16 max)
pub const HDR_MAX: f32 = 65504.0;

/// Shared input scale, written by autoexposure and read by the process ops
/// when they execute
#[derive(Debug)]
pub struct ExposureCell {
    bits: AtomicU32,
}

impl ExposureCell {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.to_bits()),
        }
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }
}

impl Default for ExposureCell {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Linear,
    Srgb,
    Log,
}

/// Transfer curve plus the input scale it is applied after
#[derive(Debug, Clone)]
pub struct TransferFunction {
    kind: TransferKind,
    scale: Arc<ExposureCell>,
}

impl TransferFunction {
    pub fn new(kind: TransferKind, scale: Arc<ExposureCell>) -> Self {
        Self { kind, scale }
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn exposure(&self) -> &Arc<ExposureCell> {
        &self.scale
    }

    /// Current input scale; anything unusable reads as 1
    pub fn input_scale(&self) -> f32 {
        let scale = self.scale.get();
        if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        }
    }

    /// Image value (already scaled and sanitized) to network value
    #[inline]
    pub fn forward(&self, x: f32) -> f32 {
        match self.kind {
            TransferKind::Linear => x,
            TransferKind::Srgb => {
                if x <= 0.0031308 {
                    12.92 * x
                } else {
                    1.055 * x.powf(1.0 / 2.4) - 0.055
                }
            }
            TransferKind::Log => (x + 1.0).log2() / log_norm(),
        }
    }

    /// Network value to image value (before unscaling)
    #[inline]
    pub fn inverse(&self, y: f32) -> f32 {
        match self.kind {
            TransferKind::Linear => y,
            TransferKind::Srgb => {
                if y <= 0.04045 {
                    y / 12.92
                } else {
                    ((y + 0.055) / 1.055).powf(2.4)
                }
            }
            TransferKind::Log => (y * log_norm()).exp2() - 1.0,
        }
    }
}

#[inline]
fn log_norm() -> f32 {
    (HDR_MAX + 1.0).log2()
}
