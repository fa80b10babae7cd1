//! UNet topology
//!
//! Two pooling levels with skip connections at full and half resolution:
//!
//! ```text
//! input -> enc_conv0 -> pool1 -> enc_conv1 -> pool2 -> bottleneck
//!              |                     |                    |
//!              |                     +--- dec_conv1 <- upsample2
//!              |                              |
//!              +------------ dec_conv0 <- upsample1
//!                                |
//!                             output (3 channels)
//! ```
//!
//! Every pooling level halves both spatial dimensions, so tile extents must
//! be multiples of [`UNET_ALIGNMENT`].

use crate::error::DenoiseResult;
use crate::invalid_operation;
use crate::network::weights::Weights;
use crate::ops::Activation;
use std::fmt;

/// Spatial alignment required by the two pooling levels
pub const UNET_ALIGNMENT: usize = 4;

/// Output channels of the network
pub const OUTPUT_CHANNELS: usize = 3;

/// Quality / performance tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Quality {
    /// Resolves to [`Quality::High`]
    #[default]
    Default,
    Fast,
    Balanced,
    High,
}

impl Quality {
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(Quality::Default),
            4 => Some(Quality::Fast),
            5 => Some(Quality::Balanced),
            6 => Some(Quality::High),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Quality::Default => 0,
            Quality::Fast => 4,
            Quality::Balanced => 5,
            Quality::High => 6,
        }
    }

    /// Concrete tier after resolving `Default`
    pub fn resolve(self) -> Self {
        match self {
            Quality::Default => Quality::High,
            q => q,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.resolve() {
            Quality::Fast => "fast",
            Quality::Balanced => "balanced",
            _ => "high",
        };
        f.write_str(name)
    }
}

/// Channel widths of one UNet instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UNetSpec {
    pub in_channels: usize,
    pub enc0: usize,
    pub enc1: usize,
    pub bottleneck: usize,
    pub dec1: usize,
}

/// One convolution of the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvLayer {
    pub name: &'static str,
    /// Channels of the main source
    pub src_channels: usize,
    /// Channels of the skip connection concatenated after the source
    pub concat_channels: usize,
    pub out_channels: usize,
    pub activation: Activation,
}

impl ConvLayer {
    pub fn in_channels(&self) -> usize {
        self.src_channels + self.concat_channels
    }

    pub fn weight_dims(&self) -> [usize; 4] {
        [self.out_channels, self.in_channels(), 3, 3]
    }

    pub fn weight_name(&self) -> String {
        format!("{}.weight", self.name)
    }

    pub fn bias_name(&self) -> String {
        format!("{}.bias", self.name)
    }
}

impl UNetSpec {
    /// Built-in widths of a quality tier
    pub fn for_quality(quality: Quality, in_channels: usize) -> Self {
        let (enc0, enc1, bottleneck, dec1) = match quality.resolve() {
            Quality::Fast => (4, 6, 8, 6),
            Quality::Balanced => (6, 8, 12, 8),
            _ => (8, 12, 16, 12),
        };
        Self {
            in_channels,
            enc0,
            enc1,
            bottleneck,
            dec1,
        }
    }

    /// Widths implied by a weight set, validated against every layer
    pub fn from_weights(weights: &Weights, in_channels: usize) -> DenoiseResult<Self> {
        let width = |name: &str| -> DenoiseResult<usize> {
            let tensor = weights
                .get(&format!("{}.weight", name))
                .ok_or_else(|| invalid_operation!("invalid weights: missing tensor '{}.weight'", name))?;
            match tensor.dims.first() {
                Some(&w) if tensor.dims.len() == 4 && w > 0 => Ok(w),
                _ => Err(invalid_operation!(
                    "invalid weights: '{}.weight' has dims {:?}",
                    name,
                    tensor.dims
                )),
            }
        };

        let spec = Self {
            in_channels,
            enc0: width("enc_conv0")?,
            enc1: width("enc_conv1")?,
            bottleneck: width("bottleneck")?,
            dec1: width("dec_conv1")?,
        };
        spec.validate(weights)?;
        Ok(spec)
    }

    /// Check that `weights` holds a tensor of the right shape for every layer
    pub fn validate(&self, weights: &Weights) -> DenoiseResult<()> {
        for layer in self.layers() {
            weights.expect(&layer.weight_name(), &layer.weight_dims())?;
            weights.expect(&layer.bias_name(), &[layer.out_channels])?;
        }
        Ok(())
    }

    /// Convolutions in execution order
    pub fn layers(&self) -> Vec<ConvLayer> {
        let conv = |name, src_channels, concat_channels, out_channels, activation| ConvLayer {
            name,
            src_channels,
            concat_channels,
            out_channels,
            activation,
        };
        vec![
            conv("enc_conv0", self.in_channels, 0, self.enc0, Activation::Relu),
            conv("enc_conv1", self.enc0, 0, self.enc1, Activation::Relu),
            conv("bottleneck", self.enc1, 0, self.bottleneck, Activation::Relu),
            conv("dec_conv1", self.bottleneck, self.enc1, self.dec1, Activation::Relu),
            conv("dec_conv0", self.dec1, self.enc0, OUTPUT_CHANNELS, Activation::None),
        ]
    }

    pub fn layer(&self, name: &str) -> Option<ConvLayer> {
        self.layers().into_iter().find(|l| l.name == name)
    }

    /// Number of weight and bias values
    pub fn num_weights(&self) -> usize {
        self.layers()
            .iter()
            .map(|l| l.weight_dims().iter().product::<usize>() + l.out_channels)
            .sum()
    }
}
