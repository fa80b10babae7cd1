//! Memory model: buffers, views and arena planning
//!
//! A [`Buffer`] is raw storage owned by an engine allocator. Tensors and
//! images are views into buffers and register themselves with the buffer so
//! that a reallocation can be broadcast to them. The network graph keeps all
//! of its intermediate tensors and op scratch in one buffer whose layout is
//! computed by [`ScratchArena`] from tensor lifetimes.
//!
//! # Pattern
//!
//! 1. Each op reports its scratch requirement before anything is allocated
//! 2. Tensor and scratch lifetimes are expressed as op-index windows
//! 3. Best-fit placement in a single growing arena gives the peak size
//! 4. One buffer of that size backs every view of the graph

pub mod arena;
pub mod buffer;
pub mod calculator;

pub use arena::{plan_lifetimes, ArenaPlan, LifetimeRequest, ScratchArena};
pub use buffer::{Allocation, Buffer, Memory, PendingRead, Storage, ViewId};
pub use calculator::MemoryCalculator;

/// Alignment of every allocation and arena offset in bytes
pub const MEMORY_ALIGNMENT: usize = 128;

/// Round `value` up to a multiple of `alignment` (a power of two)
pub fn round_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 128), 0);
        assert_eq!(round_up(1, 128), 128);
        assert_eq!(round_up(128, 128), 128);
        assert_eq!(round_up(129, 128), 256);
        assert_eq!(round_up(1000, 512), 1024);
    }
}
