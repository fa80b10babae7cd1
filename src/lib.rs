//! denoiseforge - neural image denoising engine
//!
//! Runs a fixed UNet denoising filter over images on pluggable compute
//! backends, splitting oversized images into tiles that fit a memory budget
//! and reporting progress with cooperative cancellation.

#![allow(clippy::too_many_arguments)] // Kernel and binding entry points take many scalars
#![allow(clippy::needless_range_loop)] // Clearer for pixel loops
#![allow(clippy::manual_memcpy)] // Strided copies are written out explicitly
#![allow(clippy::type_complexity)] // Callback types
#![allow(clippy::missing_safety_doc)] // Raw image constructors documented at module level

pub mod api;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod filter;
pub mod logging;
pub mod memory;
pub mod network;
pub mod ops;
pub mod tensor;

pub use backend::{DeviceType, SyncMode};
pub use config::DeviceConfig;
pub use device::{Device, PhysicalDevice};
pub use error::{DenoiseError, DenoiseResult, ErrorCategory, ErrorCode};
pub use filter::{Filter, FilterStats, ProgressCallback};
pub use memory::{Buffer, Storage};
pub use network::{Quality, Weights};
pub use tensor::{Format, Image, ImageDesc};
