//! CPU kernels for every op kind
//!
//! Kernels read their bindings into accessors when they execute, not when
//! they are submitted, so buffer reallocations between submission and
//! execution are picked up.

mod autoexposure;
mod conv;
mod image_copy;
mod process;
mod resample;

pub use autoexposure::{CpuAutoexposure, AUTOEXPOSURE_BLOCK};
pub use conv::CpuConv;
pub use image_copy::CpuImageCopy;
pub use process::{CpuInputProcess, CpuOutputProcess};
pub use resample::{CpuResample, ResampleKind};

use crate::error::DenoiseResult;
use crate::logic_error;
use crate::tensor::{DataType, Tensor, TensorDesc, TensorLayout};

/// Whether the CPU kernels can run on tensors with this descriptor
pub(crate) fn is_native(desc: &TensorDesc) -> bool {
    desc.data_type == DataType::Float32 && desc.layout == TensorLayout::Chw
}

/// Check that a bound tensor matches the descriptor the op was built for
pub(crate) fn check_tensor(op: &str, what: &str, tensor: &Tensor, expected: &TensorDesc) -> DenoiseResult<()> {
    if tensor.desc() != expected {
        return Err(logic_error!(
            "{} of '{}' has shape {:?}, expected {:?}",
            what,
            op,
            tensor.desc().dims,
            expected.dims
        ));
    }
    Ok(())
}
