//! Conversion between bound images and network tensors
//!
//! The input stage scales, sanitizes and encodes the color, albedo and
//! normal images of one tile into the network input tensor, writing zeros
//! wherever the tile has no source pixels. The output stage decodes the
//! network output of one tile into its destination region of the output
//! image and clamps it into the range of the current mode.

use super::is_native;
use crate::backend::cpu::CpuEngine;
use crate::error::DenoiseResult;
use crate::logic_error;
use crate::ops::transfer::HDR_MAX;
use crate::ops::{InputProcessOp, Op, OpState, OutputProcessOp, ProcessParams};
use crate::tensor::{Image, ImageAccessor, Tensor, TensorAccessor, TensorDesc, Tile};
use rayon::prelude::*;
use std::sync::Arc;

#[inline]
fn nan_to_zero(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v
    }
}

/// Check that `tile` maps inside a `src_h x src_w` source and a
/// `dst_h x dst_w` destination
fn check_tile(op: &str, tile: &Tile, src: (usize, usize), dst: (usize, usize)) -> DenoiseResult<()> {
    if tile.h_src_begin + tile.h > src.0
        || tile.w_src_begin + tile.w > src.1
        || tile.h_dst_begin + tile.h > dst.0
        || tile.w_dst_begin + tile.w > dst.1
    {
        return Err(logic_error!(
            "tile {:?} of '{}' exceeds source {:?} or destination {:?}",
            tile,
            op,
            src,
            dst
        ));
    }
    Ok(())
}

pub struct CpuInputProcess {
    state: OpState,
    engine: Arc<CpuEngine>,
    dst_desc: TensorDesc,
    color: Option<Arc<Image>>,
    albedo: Option<Arc<Image>>,
    normal: Option<Arc<Image>>,
    dst: Option<Arc<Tensor>>,
    tile: Tile,
    params: Option<ProcessParams>,
}

impl CpuInputProcess {
    pub fn new(engine: Arc<CpuEngine>, dst_desc: TensorDesc) -> Self {
        let tile = Tile::full(dst_desc.height(), dst_desc.width());
        Self {
            state: OpState::new("input_process"),
            engine,
            dst_desc,
            color: None,
            albedo: None,
            normal: None,
            dst: None,
            tile,
            params: None,
        }
    }

    fn expected_channels(&self) -> usize {
        3 + if self.albedo.is_some() { 3 } else { 0 } + if self.normal.is_some() { 3 } else { 0 }
    }

    fn validate(&self) -> DenoiseResult<()> {
        let color = self.state.require(&self.color, "color")?;
        let dst = self.state.require(&self.dst, "destination")?;
        self.state.require(&self.params, "parameters")?;
        if dst.desc() != &self.dst_desc {
            return Err(logic_error!("destination of '{}' does not match its descriptor", self.state.name()));
        }
        if self.expected_channels() != self.dst_desc.channels() {
            return Err(logic_error!(
                "'{}' expects {} input channels, bound images provide {}",
                self.state.name(),
                self.dst_desc.channels(),
                self.expected_channels()
            ));
        }
        for image in [Some(color), self.albedo.as_ref(), self.normal.as_ref()].into_iter().flatten() {
            check_tile(
                self.state.name(),
                &self.tile,
                (image.height(), image.width()),
                (self.dst_desc.height(), self.dst_desc.width()),
            )?;
        }
        Ok(())
    }
}

impl Op for CpuInputProcess {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn set_name(&mut self, name: &str) {
        self.state.set_name(name);
    }

    fn is_supported(&self) -> bool {
        is_native(&self.dst_desc) && self.dst_desc.channels() >= 3
    }

    fn set_scratch(&mut self, scratch: Arc<Tensor>) -> DenoiseResult<()> {
        self.state.set_scratch(scratch, 0)
    }

    fn finalize(&mut self) -> DenoiseResult<()> {
        self.state.require(&self.dst, "destination")?;
        self.state.require(&self.params, "parameters")?;
        self.state.mark_finalized();
        Ok(())
    }

    fn submit(&self) -> DenoiseResult<()> {
        self.state.check_finalized()?;
        self.validate()?;

        let color = Arc::clone(self.state.require(&self.color, "color")?);
        let albedo = self.albedo.clone();
        let normal = self.normal.clone();
        let dst = Arc::clone(self.state.require(&self.dst, "destination")?);
        let params = self.state.require(&self.params, "parameters")?.clone();
        let tile = self.tile;

        tracing::trace!("submit {} for {:?}", self.state.name(), tile);

        self.engine.submit_kernel(move || {
            let sources = InputSources {
                color: color.accessor()?,
                albedo: albedo.as_ref().map(|a| a.accessor()).transpose()?,
                normal: normal.as_ref().map(|n| n.accessor()).transpose()?,
            };
            input_process(&sources, dst.accessor()?, &tile, &params);
            Ok(())
        });
        Ok(())
    }
}

impl InputProcessOp for CpuInputProcess {
    fn set_src(&mut self, color: Option<Arc<Image>>, albedo: Option<Arc<Image>>, normal: Option<Arc<Image>>) {
        self.color = color;
        self.albedo = albedo;
        self.normal = normal;
    }

    fn set_dst(&mut self, dst: Arc<Tensor>) {
        self.dst = Some(dst);
    }

    fn set_tile(&mut self, tile: Tile) {
        self.tile = tile;
    }

    fn set_params(&mut self, params: ProcessParams) {
        self.params = Some(params);
    }
}

struct InputSources {
    color: ImageAccessor,
    albedo: Option<ImageAccessor>,
    normal: Option<ImageAccessor>,
}

fn input_process(src: &InputSources, dst: TensorAccessor, tile: &Tile, params: &ProcessParams) {
    let scale = params.transfer.input_scale();
    let lo = if params.snorm { -1.0 } else { 0.0 };
    let hi = if params.hdr { HDR_MAX } else { 1.0 };
    let tf = &params.transfer;

    (0..dst.h).into_par_iter().for_each(|y| {
        // SAFETY: this task is the only writer of row y in every channel
        let mut rows: Vec<&mut [f32]> = (0..dst.c).map(|c| unsafe { dst.row_mut(c, y) }).collect();

        let inside_y = y >= tile.h_dst_begin && y < tile.h_dst_begin + tile.h;
        for x in 0..dst.w {
            let inside = inside_y && x >= tile.w_dst_begin && x < tile.w_dst_begin + tile.w;
            if !inside {
                for row in rows.iter_mut() {
                    row[x] = 0.0;
                }
                continue;
            }
            let (h, w) = (
                tile.h_src_begin + y - tile.h_dst_begin,
                tile.w_src_begin + x - tile.w_dst_begin,
            );

            // SAFETY: the tile was checked against every source image at submit
            let color = unsafe { src.color.get3(h, w) };
            for (c, v) in color.iter().enumerate() {
                let mut v = nan_to_zero(v * scale).clamp(lo, hi);
                if params.snorm {
                    v = v * 0.5 + 0.5;
                }
                rows[c][x] = tf.forward(v);
            }

            let mut c = 3;
            if let Some(albedo) = &src.albedo {
                for v in unsafe { albedo.get3(h, w) } {
                    rows[c][x] = nan_to_zero(v).clamp(0.0, 1.0);
                    c += 1;
                }
            }
            if let Some(normal) = &src.normal {
                for v in unsafe { normal.get3(h, w) } {
                    rows[c][x] = nan_to_zero(v).clamp(-1.0, 1.0) * 0.5 + 0.5;
                    c += 1;
                }
            }
        }
    });
}

pub struct CpuOutputProcess {
    state: OpState,
    engine: Arc<CpuEngine>,
    src_desc: TensorDesc,
    src: Option<Arc<Tensor>>,
    dst: Option<Arc<Image>>,
    tile: Tile,
    params: Option<ProcessParams>,
}

impl CpuOutputProcess {
    pub fn new(engine: Arc<CpuEngine>, src_desc: TensorDesc) -> Self {
        let tile = Tile::full(src_desc.height(), src_desc.width());
        Self {
            state: OpState::new("output_process"),
            engine,
            src_desc,
            src: None,
            dst: None,
            tile,
            params: None,
        }
    }
}

impl Op for CpuOutputProcess {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn set_name(&mut self, name: &str) {
        self.state.set_name(name);
    }

    fn is_supported(&self) -> bool {
        is_native(&self.src_desc) && self.src_desc.channels() == 3
    }

    fn set_scratch(&mut self, scratch: Arc<Tensor>) -> DenoiseResult<()> {
        self.state.set_scratch(scratch, 0)
    }

    fn finalize(&mut self) -> DenoiseResult<()> {
        let src = self.state.require(&self.src, "source")?;
        if src.desc() != &self.src_desc {
            return Err(logic_error!("source of '{}' does not match its descriptor", self.state.name()));
        }
        self.state.require(&self.params, "parameters")?;
        self.state.mark_finalized();
        Ok(())
    }

    fn submit(&self) -> DenoiseResult<()> {
        self.state.check_finalized()?;
        let src = Arc::clone(self.state.require(&self.src, "source")?);
        let dst = Arc::clone(self.state.require(&self.dst, "destination")?);
        let params = self.state.require(&self.params, "parameters")?.clone();
        let tile = self.tile;
        check_tile(
            self.state.name(),
            &tile,
            (self.src_desc.height(), self.src_desc.width()),
            (dst.height(), dst.width()),
        )?;

        tracing::trace!("submit {} for {:?}", self.state.name(), tile);

        self.engine.submit_kernel(move || {
            output_process(src.accessor()?, dst.accessor()?, &tile, &params);
            Ok(())
        });
        Ok(())
    }
}

impl OutputProcessOp for CpuOutputProcess {
    fn set_src(&mut self, src: Arc<Tensor>) {
        self.src = Some(src);
    }

    fn set_dst(&mut self, dst: Arc<Image>) {
        self.dst = Some(dst);
    }

    fn set_tile(&mut self, tile: Tile) {
        self.tile = tile;
    }

    fn set_params(&mut self, params: ProcessParams) {
        self.params = Some(params);
    }
}

fn output_process(src: TensorAccessor, dst: ImageAccessor, tile: &Tile, params: &ProcessParams) {
    let scale = params.transfer.input_scale();
    let tf = &params.transfer;
    let (lo, hi) = if params.snorm {
        (-1.0, 1.0)
    } else if params.hdr {
        (0.0, f32::MAX)
    } else {
        (0.0, 1.0)
    };

    (0..tile.h).into_par_iter().for_each(|ty| {
        let (sy, dy) = (tile.h_src_begin + ty, tile.h_dst_begin + ty);
        for tx in 0..tile.w {
            let (sx, dx) = (tile.w_src_begin + tx, tile.w_dst_begin + tx);
            let mut pixel = [0.0f32; 3];
            for (c, out) in pixel.iter_mut().enumerate() {
                // SAFETY: the tile was checked against the source tensor at submit
                let mut y = nan_to_zero(unsafe { src.get(c, sy, sx) }).max(0.0);
                if !params.hdr {
                    y = y.min(1.0);
                }
                let mut v = tf.inverse(y);
                if params.snorm {
                    v = v * 2.0 - 1.0;
                }
                *out = nan_to_zero(v / scale).clamp(lo, hi);
            }
            // SAFETY: rows are partitioned across tasks and the tile lies in the image
            unsafe { dst.set3(dy, dx, pixel) };
        }
    });
}
