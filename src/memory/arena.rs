//! Scratch arena planning
//!
//! The network graph allocates one buffer for all intermediate tensors and
//! op scratch. [`ScratchArena`] simulates best-fit placement inside a growing
//! arena and records the high-water mark; [`plan_lifetimes`] drives it with
//! tensors whose lifetimes are windows of op indices, so storage of tensors
//! that are never alive at the same time is reused.

use crate::error::DenoiseResult;
use crate::invalid_argument;
use crate::memory::{round_up, MEMORY_ALIGNMENT};
use std::collections::HashMap;

/// Free block within the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    /// Byte offset from arena start
    offset: usize,
    /// Size in bytes
    size: usize,
}

impl FreeBlock {
    fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Check if this block is immediately before another block
    fn is_adjacent_to(&self, other: &FreeBlock) -> bool {
        self.end() == other.offset
    }
}

/// Growing arena with best-fit reuse of freed ranges
///
/// Offsets are only planned here; no memory is touched. The arena grows at
/// its top when no free block fits and shrinks again when the topmost range
/// is released, so [`ScratchArena::peak_bytes`] is the size the backing
/// buffer must have.
#[derive(Debug, Default)]
pub struct ScratchArena {
    /// Current end of the used range
    top: usize,
    /// Highest `top` ever reached
    peak: usize,
    /// Currently allocated bytes (without padding)
    allocated: usize,
    /// Free blocks below `top`, sorted by offset
    free_blocks: Vec<FreeBlock>,
    /// Allocation offsets by name (for debugging)
    allocations: HashMap<String, usize>,
}

impl ScratchArena {
    /// Default alignment for arena offsets
    pub const DEFAULT_ALIGNMENT: usize = MEMORY_ALIGNMENT;

    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `size` bytes and return their offset
    ///
    /// Zero-sized requests return offset 0 without reserving anything.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> DenoiseResult<usize> {
        if !alignment.is_power_of_two() {
            return Err(invalid_argument!(
                "alignment must be a power of 2, got {}",
                alignment
            ));
        }
        if size == 0 {
            return Ok(0);
        }

        let offset = match self.find_best_fit(size, alignment) {
            Some(idx) => {
                let block = self.free_blocks.remove(idx);
                let offset = round_up(block.offset, alignment);
                let padding = offset - block.offset;
                let remaining = block.size - padding - size;
                if padding > 0 {
                    self.free_blocks.push(FreeBlock::new(block.offset, padding));
                }
                if remaining > 0 {
                    self.free_blocks.push(FreeBlock::new(offset + size, remaining));
                }
                offset
            }
            None => self.grow(size, alignment),
        };

        self.allocated += size;
        self.sort_free_blocks();

        tracing::trace!(
            "arena placed {} bytes at offset {} (alignment={})",
            size,
            offset,
            alignment
        );

        Ok(offset)
    }

    /// Same as `allocate()` but records the name for debugging
    pub fn allocate_named(&mut self, name: &str, size: usize) -> DenoiseResult<usize> {
        let offset = self.allocate(size, Self::DEFAULT_ALIGNMENT)?;
        self.allocations.insert(name.to_string(), offset);
        Ok(offset)
    }

    /// Release a range previously returned by `allocate()`
    pub fn deallocate(&mut self, offset: usize, size: usize) {
        if size == 0 {
            return;
        }
        self.allocated = self.allocated.saturating_sub(size);
        self.free_blocks.push(FreeBlock::new(offset, size));
        self.sort_free_blocks();

        // Give the topmost free range back so later requests can grow from it
        while let Some(last) = self.free_blocks.last().copied() {
            if last.end() != self.top {
                break;
            }
            self.top = last.offset;
            self.free_blocks.pop();
        }
    }

    /// Size the backing buffer must have
    pub fn peak_bytes(&self) -> usize {
        self.peak
    }

    /// Currently allocated bytes
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Get allocation offset by name
    pub fn get_allocation(&self, name: &str) -> Option<usize> {
        self.allocations.get(name).copied()
    }

    /// Number of free fragments below the top
    pub fn fragment_count(&self) -> usize {
        self.free_blocks.len()
    }

    /// Extend the arena at its top, merging a trailing free block if present
    fn grow(&mut self, size: usize, alignment: usize) -> usize {
        let start = match self.free_blocks.last().copied() {
            Some(last) if last.end() == self.top => {
                self.free_blocks.pop();
                last.offset
            }
            _ => self.top,
        };
        let offset = round_up(start, alignment);
        if offset > start {
            self.free_blocks.push(FreeBlock::new(start, offset - start));
        }
        self.top = offset + size;
        self.peak = self.peak.max(self.top);
        offset
    }

    /// Best-fit: smallest free block that can hold the aligned request
    fn find_best_fit(&self, size: usize, alignment: usize) -> Option<usize> {
        self.free_blocks
            .iter()
            .enumerate()
            .filter_map(|(idx, block)| {
                let aligned = round_up(block.offset, alignment);
                if aligned >= block.end() {
                    return None;
                }
                let usable = block.end() - aligned;
                (usable >= size).then_some((idx, usable))
            })
            .min_by_key(|&(_, usable)| usable)
            .map(|(idx, _)| idx)
    }

    fn sort_free_blocks(&mut self) {
        self.free_blocks.sort_by_key(|b| b.offset);
        let mut i = 0;
        while i + 1 < self.free_blocks.len() {
            let current = self.free_blocks[i];
            let next = self.free_blocks[i + 1];
            if current.is_adjacent_to(&next) {
                self.free_blocks[i].size += next.size;
                self.free_blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

/// A tensor or scratch range alive from op `first_use` to op `last_use`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifetimeRequest {
    pub name: String,
    pub byte_size: usize,
    pub first_use: usize,
    pub last_use: usize,
}

impl LifetimeRequest {
    pub fn new(name: impl Into<String>, byte_size: usize, first_use: usize, last_use: usize) -> Self {
        Self {
            name: name.into(),
            byte_size,
            first_use,
            last_use,
        }
    }
}

/// Result of lifetime planning: one offset per request and the arena size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaPlan {
    pub offsets: Vec<usize>,
    pub byte_size: usize,
}

/// Place every request in one arena so that ranges alive at the same op never overlap
pub fn plan_lifetimes(requests: &[LifetimeRequest]) -> DenoiseResult<ArenaPlan> {
    for req in requests {
        if req.first_use > req.last_use {
            return Err(invalid_argument!(
                "lifetime of '{}' ends before it starts ({} > {})",
                req.name,
                req.first_use,
                req.last_use
            ));
        }
    }

    let mut arena = ScratchArena::new();
    let mut offsets = vec![0; requests.len()];
    let mut live: Vec<usize> = Vec::new();
    let last_op = requests.iter().map(|r| r.last_use).max().unwrap_or(0);

    for op in 0..=last_op {
        // Release everything whose last use was before this op
        live.retain(|&idx| {
            let req = &requests[idx];
            if req.last_use < op {
                arena.deallocate(offsets[idx], round_up(req.byte_size, MEMORY_ALIGNMENT));
                false
            } else {
                true
            }
        });

        for (idx, req) in requests.iter().enumerate() {
            if req.first_use == op {
                let size = round_up(req.byte_size, MEMORY_ALIGNMENT);
                offsets[idx] = arena.allocate_named(&req.name, size)?;
                live.push(idx);
            }
        }
    }

    Ok(ArenaPlan {
        offsets,
        byte_size: arena.peak_bytes(),
    })
}
