//! Operation contract
//!
//! Every stage of the network, including the format conversions at its
//! boundaries, is an [`Op`] built by an engine. The lifecycle is fixed:
//!
//! 1. check [`Op::is_supported`]
//! 2. bind inputs and outputs through the typed trait of the op kind
//! 3. query [`Op::scratch_aligned_size`] and bind scratch with [`Op::set_scratch`]
//! 4. [`Op::finalize`]
//! 5. [`Op::submit`] any number of times (bindings of the boundary ops may
//!    change between submissions)
//!
//! Scratch is assigned from outside so the graph can place the scratch of ops
//! that never run concurrently in the same arena range.

pub mod transfer;

pub use transfer::{ExposureCell, TransferFunction, TransferKind};

use crate::error::DenoiseResult;
use crate::logic_error;
use crate::memory::{round_up, MEMORY_ALIGNMENT};
use crate::tensor::{Image, Tensor, TensorDesc, Tile};
use std::sync::Arc;

/// A computation node with externally assigned scratch
pub trait Op: Send {
    fn name(&self) -> &str;

    fn set_name(&mut self, name: &str);

    /// Whether this backend can run the op with its current descriptors
    fn is_supported(&self) -> bool {
        true
    }

    /// Scratch bytes needed during execution
    fn scratch_byte_size(&self) -> usize {
        0
    }

    /// Scratch size rounded to the memory alignment
    fn scratch_aligned_size(&self) -> usize {
        round_up(self.scratch_byte_size(), MEMORY_ALIGNMENT)
    }

    /// Bind scratch memory of at least `scratch_byte_size()` bytes
    fn set_scratch(&mut self, scratch: Arc<Tensor>) -> DenoiseResult<()>;

    /// Validate bindings; required before the first submit
    fn finalize(&mut self) -> DenoiseResult<()>;

    /// Enqueue the op on the engine stream
    fn submit(&self) -> DenoiseResult<()>;
}

/// Shared lifecycle bookkeeping of op implementations
#[derive(Debug, Default)]
pub struct OpState {
    name: String,
    finalized: bool,
    scratch: Option<Arc<Tensor>>,
}

impl OpState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn scratch(&self) -> Option<&Arc<Tensor>> {
        self.scratch.as_ref()
    }

    /// Bind scratch after checking it is large enough
    pub fn set_scratch(&mut self, scratch: Arc<Tensor>, required: usize) -> DenoiseResult<()> {
        if scratch.desc().byte_size() < required {
            return Err(logic_error!(
                "scratch for '{}' is too small: {} < {} bytes",
                self.name,
                scratch.desc().byte_size(),
                required
            ));
        }
        self.scratch = Some(scratch);
        Ok(())
    }

    /// Check that scratch is bound when the op needs any
    pub fn check_scratch(&self, required: usize) -> DenoiseResult<()> {
        if required > 0 && self.scratch.is_none() {
            return Err(logic_error!("scratch of '{}' is not set", self.name));
        }
        Ok(())
    }

    pub fn mark_finalized(&mut self) {
        self.finalized = true;
    }

    pub fn check_finalized(&self) -> DenoiseResult<()> {
        if !self.finalized {
            return Err(logic_error!(
                "operation '{}' submitted before finalize",
                self.name
            ));
        }
        Ok(())
    }

    /// Require a binding, naming the op and slot in the error
    pub fn require<'a, T>(&self, slot: &'a Option<T>, what: &str) -> DenoiseResult<&'a T> {
        slot.as_ref()
            .ok_or_else(|| logic_error!("{} of '{}' is not set", what, self.name))
    }
}

/// Activation fused into a convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
}

/// 3x3 same-padding convolution, optionally over the channel concatenation
/// of two sources
#[derive(Debug, Clone, PartialEq)]
pub struct ConvDesc {
    pub src: TensorDesc,
    pub concat: Option<TensorDesc>,
    pub weight: TensorDesc,
    pub bias: TensorDesc,
    pub activation: Activation,
}

impl ConvDesc {
    /// Total input channels (source plus concatenated source)
    pub fn in_channels(&self) -> usize {
        self.src.channels() + self.concat.as_ref().map(|c| c.channels()).unwrap_or(0)
    }

    pub fn dst_desc(&self) -> TensorDesc {
        TensorDesc {
            dims: vec![self.weight.dims[0], self.src.height(), self.src.width()],
            layout: self.src.layout,
            data_type: self.src.data_type,
        }
    }
}

/// Convolution op
pub trait ConvOp: Op {
    fn set_src(&mut self, src: Arc<Tensor>, concat: Option<Arc<Tensor>>);
    fn set_weight(&mut self, weight: Arc<Tensor>, bias: Arc<Tensor>);
    fn set_dst(&mut self, dst: Arc<Tensor>);
    fn dst_desc(&self) -> TensorDesc;
}

/// Tensor-to-tensor resampling ops (2x2 max pooling, 2x nearest upsampling)
pub trait ResampleOp: Op {
    fn set_src(&mut self, src: Arc<Tensor>);
    fn set_dst(&mut self, dst: Arc<Tensor>);
    fn dst_desc(&self) -> TensorDesc;
}

/// Parameters of the image <-> tensor conversion stages
#[derive(Debug, Clone)]
pub struct ProcessParams {
    pub transfer: TransferFunction,
    pub hdr: bool,
    /// Color is signed-normalized ([-1, 1])
    pub snorm: bool,
}

/// Input stage: sanitize bound images into the network input tensor
pub trait InputProcessOp: Op {
    fn set_src(&mut self, color: Option<Arc<Image>>, albedo: Option<Arc<Image>>, normal: Option<Arc<Image>>);
    fn set_dst(&mut self, dst: Arc<Tensor>);
    fn set_tile(&mut self, tile: Tile);
    fn set_params(&mut self, params: ProcessParams);
}

/// Output stage: convert the network output tensor into the output image
pub trait OutputProcessOp: Op {
    fn set_src(&mut self, src: Arc<Tensor>);
    fn set_dst(&mut self, dst: Arc<Image>);
    fn set_tile(&mut self, tile: Tile);
    fn set_params(&mut self, params: ProcessParams);
}

/// Computes the HDR input scale from the color image
pub trait AutoexposureOp: Op {
    fn set_src(&mut self, src: Arc<Image>);
    fn set_dst(&mut self, dst: Arc<ExposureCell>);
}

/// Copies one image into another of the same size
pub trait ImageCopyOp: Op {
    fn set_src(&mut self, src: Arc<Image>);
    fn set_dst(&mut self, dst: Arc<Image>);
}
