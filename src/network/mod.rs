//! Denoising network: weights, topology and the executable graph

pub mod builtin;
pub mod graph;
pub mod unet;
pub mod weights;

pub use builtin::builtin_weights;
pub use graph::{GraphConfig, NetworkGraph, TileImages};
pub use unet::{ConvLayer, Quality, UNetSpec, OUTPUT_CHANNELS, UNET_ALIGNMENT};
pub use weights::{WeightDataType, WeightTensor, Weights};
