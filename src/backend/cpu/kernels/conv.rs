//! 3x3 same-padding convolution with fused bias and activation

use super::{check_tensor, is_native};
use crate::backend::cpu::CpuEngine;
use crate::error::DenoiseResult;
use crate::logic_error;
use crate::ops::{Activation, ConvDesc, ConvOp, Op, OpState};
use crate::tensor::{Tensor, TensorAccessor, TensorDesc};
use rayon::prelude::*;
use std::sync::Arc;

pub struct CpuConv {
    state: OpState,
    engine: Arc<CpuEngine>,
    desc: ConvDesc,
    src: Option<Arc<Tensor>>,
    concat: Option<Arc<Tensor>>,
    weight: Option<Arc<Tensor>>,
    bias: Option<Arc<Tensor>>,
    dst: Option<Arc<Tensor>>,
}

impl CpuConv {
    pub fn new(engine: Arc<CpuEngine>, desc: ConvDesc) -> Self {
        Self {
            state: OpState::new("conv"),
            engine,
            desc,
            src: None,
            concat: None,
            weight: None,
            bias: None,
            dst: None,
        }
    }
}

impl Op for CpuConv {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn set_name(&mut self, name: &str) {
        self.state.set_name(name);
    }

    fn is_supported(&self) -> bool {
        let desc = &self.desc;
        let concat_ok = desc.concat.as_ref().map_or(true, |c| {
            is_native(c) && c.height() == desc.src.height() && c.width() == desc.src.width()
        });
        is_native(&desc.src)
            && concat_ok
            && desc.weight.dims.len() == 4
            && desc.weight.dims[1] == desc.in_channels()
            && desc.weight.dims[2] == 3
            && desc.weight.dims[3] == 3
            && desc.bias.dims == [desc.weight.dims[0]]
    }

    fn set_scratch(&mut self, scratch: Arc<Tensor>) -> DenoiseResult<()> {
        self.state.set_scratch(scratch, 0)
    }

    fn finalize(&mut self) -> DenoiseResult<()> {
        let name = self.state.name().to_string();
        check_tensor(&name, "source", self.state.require(&self.src, "source")?, &self.desc.src)?;
        match (&self.desc.concat, &self.concat) {
            (Some(expected), Some(concat)) => check_tensor(&name, "concat source", concat, expected)?,
            (None, None) => {}
            _ => return Err(logic_error!("concat source of '{}' does not match its descriptor", name)),
        }
        check_tensor(&name, "weight", self.state.require(&self.weight, "weight")?, &self.desc.weight)?;
        check_tensor(&name, "bias", self.state.require(&self.bias, "bias")?, &self.desc.bias)?;
        check_tensor(
            &name,
            "destination",
            self.state.require(&self.dst, "destination")?,
            &self.desc.dst_desc(),
        )?;
        self.state.mark_finalized();
        Ok(())
    }

    fn submit(&self) -> DenoiseResult<()> {
        self.state.check_finalized()?;
        let src = Arc::clone(self.state.require(&self.src, "source")?);
        let concat = self.concat.clone();
        let weight = Arc::clone(self.state.require(&self.weight, "weight")?);
        let bias = Arc::clone(self.state.require(&self.bias, "bias")?);
        let dst = Arc::clone(self.state.require(&self.dst, "destination")?);
        let activation = self.desc.activation;

        tracing::trace!("submit {}", self.state.name());

        self.engine.submit_kernel(move || {
            let concat = match &concat {
                Some(t) => Some(t.accessor()?),
                None => None,
            };
            // SAFETY: weight and bias are alive for the duration of the kernel
            let (weight, bias) = unsafe {
                (
                    weight.accessor()?.as_slice().to_vec(),
                    bias.accessor()?.as_slice().to_vec(),
                )
            };
            conv3x3(src.accessor()?, concat, &weight, &bias, dst.accessor()?, activation);
            Ok(())
        });
        Ok(())
    }
}

impl ConvOp for CpuConv {
    fn set_src(&mut self, src: Arc<Tensor>, concat: Option<Arc<Tensor>>) {
        self.src = Some(src);
        self.concat = concat;
    }

    fn set_weight(&mut self, weight: Arc<Tensor>, bias: Arc<Tensor>) {
        self.weight = Some(weight);
        self.bias = Some(bias);
    }

    fn set_dst(&mut self, dst: Arc<Tensor>) {
        self.dst = Some(dst);
    }

    fn dst_desc(&self) -> TensorDesc {
        self.desc.dst_desc()
    }
}

/// Output rows are independent; each task owns one (channel, row) pair.
fn conv3x3(
    src: TensorAccessor,
    concat: Option<TensorAccessor>,
    weight: &[f32],
    bias: &[f32],
    dst: TensorAccessor,
    activation: Activation,
) {
    let (h, w) = (dst.h, dst.w);
    let inputs: Vec<(TensorAccessor, usize)> = (0..src.c)
        .map(|c| (src, c))
        .chain(concat.into_iter().flat_map(|t| (0..t.c).map(move |c| (t, c))))
        .collect();
    let in_channels = inputs.len();

    (0..dst.c * h).into_par_iter().for_each(|index| {
        let (o, y) = (index / h, index % h);
        let mut acc = vec![bias[o]; w];

        for (i, (input, c)) in inputs.iter().enumerate() {
            for ky in 0..3 {
                let Some(iy) = (y + ky).checked_sub(1).filter(|&iy| iy < h) else {
                    continue;
                };
                let base = ((o * in_channels + i) * 3 + ky) * 3;
                // SAFETY: (c, iy) is inside the input, which has the output's extent
                let row = unsafe { input.row(*c, iy) };
                accumulate_row(&mut acc, row, &weight[base..base + 3]);
            }
        }

        if activation == Activation::Relu {
            for v in acc.iter_mut() {
                *v = v.max(0.0);
            }
        }
        // SAFETY: this task is the only writer of row (o, y)
        unsafe { dst.row_mut(o, y) }.copy_from_slice(&acc);
    });
}

/// acc[x] += k0 * row[x-1] + k1 * row[x] + k2 * row[x+1], zero outside the row
#[inline]
fn accumulate_row(acc: &mut [f32], row: &[f32], k: &[f32]) {
    let w = acc.len();
    if w == 0 {
        return;
    }
    for (a, r) in acc[1..].iter_mut().zip(&row[..w - 1]) {
        *a += k[0] * r;
    }
    for (a, r) in acc.iter_mut().zip(row) {
        *a += k[1] * r;
    }
    for (a, r) in acc[..w - 1].iter_mut().zip(&row[1..]) {
        *a += k[2] * r;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Engine;
    use crate::config::DeviceConfig;
    use crate::memory::{Buffer, Storage};
    use crate::tensor::{DataType, TensorLayout};

    fn tensor(engine: &Arc<CpuEngine>, desc: TensorDesc) -> Arc<Tensor> {
        let buffer = Buffer::new(engine.clone(), desc.byte_size(), Storage::Host).unwrap();
        Tensor::new(&buffer, desc, 0).unwrap()
    }

    fn conv_desc(src: TensorDesc, concat: Option<TensorDesc>, out: usize, activation: Activation) -> ConvDesc {
        let cin = src.channels() + concat.as_ref().map_or(0, |c| c.channels());
        ConvDesc {
            src,
            concat,
            weight: TensorDesc::new(vec![out, cin, 3, 3], TensorLayout::Oihw, DataType::Float32).unwrap(),
            bias: TensorDesc::new(vec![out], TensorLayout::X, DataType::Float32).unwrap(),
            activation,
        }
    }

    #[test]
    fn test_accumulate_row_edges() {
        let mut acc = vec![0.0; 4];
        accumulate_row(&mut acc, &[1.0, 2.0, 3.0, 4.0], &[1.0, 10.0, 100.0]);
        assert_eq!(acc, vec![210.0, 321.0, 432.0, 43.0]);
    }

    #[test]
    fn test_box_filter_with_zero_padding() {
        let engine = CpuEngine::new(&DeviceConfig::new().with_num_threads(2)).unwrap();
        let desc = conv_desc(TensorDesc::chw(1, 3, 3), None, 1, Activation::None);
        let src = tensor(&engine, desc.src.clone());
        let weight = tensor(&engine, desc.weight.clone());
        let bias = tensor(&engine, desc.bias.clone());
        let dst = tensor(&engine, desc.dst_desc());
        src.upload(&[1.0; 9]).unwrap();
        weight.upload(&[1.0; 9]).unwrap();
        bias.upload(&[0.5]).unwrap();

        let mut op = engine.new_conv(&desc).unwrap();
        assert!(op.is_supported());
        op.set_src(src, None);
        op.set_weight(weight, bias);
        op.set_dst(dst.clone());
        op.finalize().unwrap();
        op.submit().unwrap();
        engine.wait().unwrap();

        let out = dst.download().unwrap();
        assert_eq!(out, vec![4.5, 6.5, 4.5, 6.5, 9.5, 6.5, 4.5, 6.5, 4.5]);
    }

    #[test]
    fn test_concat_and_relu() {
        let engine = CpuEngine::new(&DeviceConfig::new().with_num_threads(2)).unwrap();
        let desc = conv_desc(
            TensorDesc::chw(1, 2, 2),
            Some(TensorDesc::chw(1, 2, 2)),
            1,
            Activation::Relu,
        );
        let a = tensor(&engine, desc.src.clone());
        let b = tensor(&engine, desc.concat.clone().unwrap());
        let weight = tensor(&engine, desc.weight.clone());
        let bias = tensor(&engine, desc.bias.clone());
        let dst = tensor(&engine, desc.dst_desc());
        a.upload(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        b.upload(&[10.0, 20.0, 30.0, 40.0]).unwrap();
        // center tap only: +a -b
        let mut w = vec![0.0; 18];
        w[4] = 1.0;
        w[13] = -1.0;
        weight.upload(&w).unwrap();
        bias.upload(&[25.0]).unwrap();

        let mut op = engine.new_conv(&desc).unwrap();
        op.set_src(a, Some(b));
        op.set_weight(weight, bias);
        op.set_dst(dst.clone());
        op.finalize().unwrap();
        op.submit().unwrap();
        engine.wait().unwrap();

        assert_eq!(dst.download().unwrap(), vec![16.0, 7.0, 0.0, 0.0]);
    }

    #[test]
    fn test_submit_before_finalize_is_logic_error() {
        let engine = CpuEngine::new(&DeviceConfig::new()).unwrap();
        let desc = conv_desc(TensorDesc::chw(1, 2, 2), None, 1, Activation::None);
        let mut op = engine.new_conv(&desc).unwrap();
        op.set_name("enc_conv0");
        assert!(op.submit().unwrap_err().is_internal_error());
        assert!(op.finalize().unwrap_err().to_string().contains("enc_conv0"));
    }

    #[test]
    fn test_mismatched_weight_is_unsupported() {
        let engine = CpuEngine::new(&DeviceConfig::new()).unwrap();
        let mut desc = conv_desc(TensorDesc::chw(2, 4, 4), None, 3, Activation::None);
        desc.weight = TensorDesc::new(vec![3, 5, 3, 3], TensorLayout::Oihw, DataType::Float32).unwrap();
        assert!(!engine.new_conv(&desc).unwrap().is_supported());
    }
}
