//! 2x2 max pooling and 2x nearest-neighbor upsampling

use super::{check_tensor, is_native};
use crate::backend::cpu::CpuEngine;
use crate::error::DenoiseResult;
use crate::ops::{Op, OpState, ResampleOp};
use crate::tensor::{Tensor, TensorAccessor, TensorDesc};
use rayon::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleKind {
    MaxPool2x2,
    Nearest2x,
}

pub struct CpuResample {
    state: OpState,
    engine: Arc<CpuEngine>,
    kind: ResampleKind,
    src_desc: TensorDesc,
    src: Option<Arc<Tensor>>,
    dst: Option<Arc<Tensor>>,
}

impl CpuResample {
    pub fn new(engine: Arc<CpuEngine>, kind: ResampleKind, src_desc: TensorDesc) -> Self {
        let name = match kind {
            ResampleKind::MaxPool2x2 => "pool",
            ResampleKind::Nearest2x => "upsample",
        };
        Self {
            state: OpState::new(name),
            engine,
            kind,
            src_desc,
            src: None,
            dst: None,
        }
    }
}

impl Op for CpuResample {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn set_name(&mut self, name: &str) {
        self.state.set_name(name);
    }

    fn is_supported(&self) -> bool {
        let even = self.src_desc.height() % 2 == 0 && self.src_desc.width() % 2 == 0;
        is_native(&self.src_desc) && (self.kind == ResampleKind::Nearest2x || even)
    }

    fn set_scratch(&mut self, scratch: Arc<Tensor>) -> DenoiseResult<()> {
        self.state.set_scratch(scratch, 0)
    }

    fn finalize(&mut self) -> DenoiseResult<()> {
        let name = self.state.name().to_string();
        check_tensor(&name, "source", self.state.require(&self.src, "source")?, &self.src_desc)?;
        check_tensor(
            &name,
            "destination",
            self.state.require(&self.dst, "destination")?,
            &self.dst_desc(),
        )?;
        self.state.mark_finalized();
        Ok(())
    }

    fn submit(&self) -> DenoiseResult<()> {
        self.state.check_finalized()?;
        let src = Arc::clone(self.state.require(&self.src, "source")?);
        let dst = Arc::clone(self.state.require(&self.dst, "destination")?);
        let kind = self.kind;

        tracing::trace!("submit {}", self.state.name());

        self.engine.submit_kernel(move || {
            let (src, dst) = (src.accessor()?, dst.accessor()?);
            match kind {
                ResampleKind::MaxPool2x2 => max_pool(src, dst),
                ResampleKind::Nearest2x => upsample(src, dst),
            }
            Ok(())
        });
        Ok(())
    }
}

impl ResampleOp for CpuResample {
    fn set_src(&mut self, src: Arc<Tensor>) {
        self.src = Some(src);
    }

    fn set_dst(&mut self, dst: Arc<Tensor>) {
        self.dst = Some(dst);
    }

    fn dst_desc(&self) -> TensorDesc {
        let (c, h, w) = (
            self.src_desc.channels(),
            self.src_desc.height(),
            self.src_desc.width(),
        );
        match self.kind {
            ResampleKind::MaxPool2x2 => TensorDesc::chw(c, h / 2, w / 2),
            ResampleKind::Nearest2x => TensorDesc::chw(c, h * 2, w * 2),
        }
    }
}

fn max_pool(src: TensorAccessor, dst: TensorAccessor) {
    (0..dst.c * dst.h).into_par_iter().for_each(|index| {
        let (c, y) = (index / dst.h, index % dst.h);
        // SAFETY: rows 2y and 2y+1 exist because the source height is even;
        // this task is the only writer of destination row (c, y)
        let (top, bottom, out) = unsafe { (src.row(c, 2 * y), src.row(c, 2 * y + 1), dst.row_mut(c, y)) };
        for (x, v) in out.iter_mut().enumerate() {
            *v = top[2 * x]
                .max(top[2 * x + 1])
                .max(bottom[2 * x])
                .max(bottom[2 * x + 1]);
        }
    });
}

fn upsample(src: TensorAccessor, dst: TensorAccessor) {
    (0..dst.c * dst.h).into_par_iter().for_each(|index| {
        let (c, y) = (index / dst.h, index % dst.h);
        // SAFETY: source row y/2 exists; single writer per destination row
        let (row, out) = unsafe { (src.row(c, y / 2), dst.row_mut(c, y)) };
        for (x, v) in out.iter_mut().enumerate() {
            *v = row[x / 2];
        }
    });
}
