//! Automatic HDR input scale
//!
//! Average luminance is computed per 16x16 block into scratch, then the
//! geometric mean over blocks with positive luminance gives the scale
//! `0.18 / mean`.

use crate::backend::cpu::CpuEngine;
use crate::error::DenoiseResult;
use crate::logic_error;
use crate::ops::{AutoexposureOp, ExposureCell, Op, OpState};
use crate::tensor::{Image, ImageAccessor, ImageDesc, Tensor};
use rayon::prelude::*;
use std::sync::Arc;

/// Edge length of the luminance blocks
pub const AUTOEXPOSURE_BLOCK: usize = 16;

const KEY: f64 = 0.18;
const EPS: f64 = 1e-8;

pub struct CpuAutoexposure {
    state: OpState,
    engine: Arc<CpuEngine>,
    src_desc: ImageDesc,
    src: Option<Arc<Image>>,
    dst: Option<Arc<ExposureCell>>,
}

impl CpuAutoexposure {
    pub fn new(engine: Arc<CpuEngine>, src_desc: ImageDesc) -> Self {
        Self {
            state: OpState::new("autoexposure"),
            engine,
            src_desc,
            src: None,
            dst: None,
        }
    }

    fn block_grid(&self) -> (usize, usize) {
        (
            self.src_desc.height.div_ceil(AUTOEXPOSURE_BLOCK),
            self.src_desc.width.div_ceil(AUTOEXPOSURE_BLOCK),
        )
    }
}

impl Op for CpuAutoexposure {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn set_name(&mut self, name: &str) {
        self.state.set_name(name);
    }

    fn is_supported(&self) -> bool {
        self.src_desc.channels() >= 3
    }

    fn scratch_byte_size(&self) -> usize {
        let (bh, bw) = self.block_grid();
        bh * bw * std::mem::size_of::<f32>()
    }

    fn set_scratch(&mut self, scratch: Arc<Tensor>) -> DenoiseResult<()> {
        let required = self.scratch_byte_size();
        self.state.set_scratch(scratch, required)
    }

    fn finalize(&mut self) -> DenoiseResult<()> {
        let src = self.state.require(&self.src, "source")?;
        if src.width() != self.src_desc.width || src.height() != self.src_desc.height {
            return Err(logic_error!(
                "source of '{}' is {}x{}, expected {}x{}",
                self.state.name(),
                src.width(),
                src.height(),
                self.src_desc.width,
                self.src_desc.height
            ));
        }
        self.state.require(&self.dst, "destination")?;
        self.state.check_scratch(self.scratch_byte_size())?;
        self.state.mark_finalized();
        Ok(())
    }

    fn submit(&self) -> DenoiseResult<()> {
        self.state.check_finalized()?;
        let src = Arc::clone(self.state.require(&self.src, "source")?);
        let dst = Arc::clone(self.state.require(&self.dst, "destination")?);
        let scratch = self.state.scratch().cloned();
        let grid = self.block_grid();

        self.engine.submit_kernel(move || {
            let scale = match &scratch {
                Some(scratch) => {
                    let blocks = scratch.accessor()?;
                    // SAFETY: scratch holds one f32 per block (checked at finalize)
                    // and only this kernel touches it
                    let slots = unsafe { blocks.as_mut_slice() };
                    autoexposure(src.accessor()?, grid, &mut slots[..grid.0 * grid.1])
                }
                None => 1.0,
            };
            tracing::debug!("autoexposure scale: {}", scale);
            dst.set(scale);
            Ok(())
        });
        Ok(())
    }
}

impl AutoexposureOp for CpuAutoexposure {
    fn set_src(&mut self, src: Arc<Image>) {
        self.src = Some(src);
    }

    fn set_dst(&mut self, dst: Arc<ExposureCell>) {
        self.dst = Some(dst);
    }
}

#[inline]
fn luminance(rgb: [f32; 3]) -> f64 {
    let clean = |v: f32| if v.is_finite() { v.max(0.0) as f64 } else { 0.0 };
    0.212671 * clean(rgb[0]) + 0.715160 * clean(rgb[1]) + 0.072169 * clean(rgb[2])
}

fn autoexposure(src: ImageAccessor, grid: (usize, usize), blocks: &mut [f32]) -> f32 {
    let (bh, bw) = grid;
    blocks.par_iter_mut().enumerate().for_each(|(index, slot)| {
        let (by, bx) = (index / bw, index % bw);
        let (h0, w0) = (by * AUTOEXPOSURE_BLOCK, bx * AUTOEXPOSURE_BLOCK);
        let h1 = (h0 + AUTOEXPOSURE_BLOCK).min(src.height);
        let w1 = (w0 + AUTOEXPOSURE_BLOCK).min(src.width);
        let mut sum = 0.0f64;
        for h in h0..h1 {
            for w in w0..w1 {
                // SAFETY: (h, w) is inside the image
                sum += luminance(unsafe { src.get3(h, w) });
            }
        }
        let count = ((h1 - h0) * (w1 - w0)).max(1);
        *slot = (sum / count as f64) as f32;
    });

    let (log_sum, count) = blocks
        .iter()
        .map(|&l| l as f64)
        .filter(|&l| l > EPS)
        .fold((0.0f64, 0usize), |(s, n), l| (s + l.log2(), n + 1));

    if count == 0 || bh * bw == 0 {
        return 1.0;
    }
    let scale = (KEY / (log_sum / count as f64).exp2()) as f32;
    if scale.is_finite() && scale > 0.0 {
        scale
    } else {
        1.0
    }
}
