//! Image-to-image copy, used to detach in-place inputs before tiling

use crate::backend::cpu::CpuEngine;
use crate::error::DenoiseResult;
use crate::logic_error;
use crate::ops::{ImageCopyOp, Op, OpState};
use crate::tensor::{Image, ImageAccessor, Tensor};
use rayon::prelude::*;
use std::sync::Arc;

pub struct CpuImageCopy {
    state: OpState,
    engine: Arc<CpuEngine>,
    src: Option<Arc<Image>>,
    dst: Option<Arc<Image>>,
}

impl CpuImageCopy {
    pub fn new(engine: Arc<CpuEngine>) -> Self {
        Self {
            state: OpState::new("image_copy"),
            engine,
            src: None,
            dst: None,
        }
    }
}

impl Op for CpuImageCopy {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn set_name(&mut self, name: &str) {
        self.state.set_name(name);
    }

    fn set_scratch(&mut self, scratch: Arc<Tensor>) -> DenoiseResult<()> {
        self.state.set_scratch(scratch, 0)
    }

    fn finalize(&mut self) -> DenoiseResult<()> {
        let src = self.state.require(&self.src, "source")?;
        let dst = self.state.require(&self.dst, "destination")?;
        if src.width() != dst.width() || src.height() != dst.height() {
            return Err(logic_error!(
                "'{}' cannot copy a {}x{} image into a {}x{} image",
                self.state.name(),
                src.width(),
                src.height(),
                dst.width(),
                dst.height()
            ));
        }
        self.state.mark_finalized();
        Ok(())
    }

    fn submit(&self) -> DenoiseResult<()> {
        self.state.check_finalized()?;
        let src = Arc::clone(self.state.require(&self.src, "source")?);
        let dst = Arc::clone(self.state.require(&self.dst, "destination")?);
        self.engine.submit_kernel(move || {
            copy_image(src.accessor()?, dst.accessor()?);
            Ok(())
        });
        Ok(())
    }
}

impl ImageCopyOp for CpuImageCopy {
    fn set_src(&mut self, src: Arc<Image>) {
        self.src = Some(src);
    }

    fn set_dst(&mut self, dst: Arc<Image>) {
        self.dst = Some(dst);
    }
}

fn copy_image(src: ImageAccessor, dst: ImageAccessor) {
    let channels = src.channels().min(dst.channels());
    (0..dst.height).into_par_iter().for_each(|h| {
        for w in 0..dst.width {
            for c in 0..channels {
                // SAFETY: both images have the same extent; one writer per row
                unsafe { dst.set(h, w, c, src.get(h, w, c)) };
            }
        }
    });
}
