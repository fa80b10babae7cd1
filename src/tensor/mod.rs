//! Tensor and image descriptors and views
//!
//! Descriptors are plain values describing shape, strides and element type.
//! [`Tensor`] and [`Image`] bind a descriptor to bytes: either a region of a
//! [`crate::memory::Buffer`] (registered for reallocation notifications) or,
//! for images only, a caller-owned pointer.

pub mod desc;
pub mod image;
#[allow(clippy::module_inception)]
pub mod tensor;
pub mod tile;

pub use desc::{DataType, Format, ImageDesc, TensorDesc, TensorLayout, MAX_IMAGE_DIM};
pub use image::{Image, ImageAccessor};
pub use tensor::{Tensor, TensorAccessor};
pub use tile::Tile;
