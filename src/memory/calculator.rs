//! Memory requirement accounting
//!
//! Sums aligned byte sizes of named allocations so that the filter can report
//! and compare the working set of a candidate tile size against the memory
//! budget before anything is allocated.

use crate::memory::{round_up, MEMORY_ALIGNMENT};

/// Running total of aligned allocation sizes
///
/// # Example
/// ```ignore
/// let mut calc = MemoryCalculator::new();
/// calc.add_tensor("weights", 12_000, 4);
/// calc.add_bytes("arena", plan.byte_size);
/// assert!(calc.total_megabytes() <= budget_mb as f64);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryCalculator {
    entries: Vec<(String, usize)>,
    alignment: usize,
}

impl MemoryCalculator {
    /// Create a new calculator aligned to [`MEMORY_ALIGNMENT`]
    pub fn new() -> Self {
        Self::with_alignment(MEMORY_ALIGNMENT)
    }

    /// Create a new calculator with custom alignment
    pub fn with_alignment(alignment: usize) -> Self {
        Self {
            entries: Vec::new(),
            alignment,
        }
    }

    /// Add a tensor of `element_count` elements of `element_size` bytes
    pub fn add_tensor(&mut self, name: &str, element_count: usize, element_size: usize) {
        self.add_bytes(name, element_count.saturating_mul(element_size));
    }

    /// Add a raw byte range
    pub fn add_bytes(&mut self, name: &str, bytes: usize) {
        self.entries
            .push((name.to_string(), round_up(bytes, self.alignment)));
    }

    /// Sum of all aligned sizes
    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|(_, size)| size).sum()
    }

    /// Total in MiB
    pub fn total_megabytes(&self) -> f64 {
        self.total_bytes() as f64 / (1024.0 * 1024.0)
    }

    /// Whether the total fits in `budget_mb` MiB
    pub fn fits_budget(&self, budget_mb: usize) -> bool {
        self.total_bytes() <= budget_mb.saturating_mul(1024 * 1024)
    }

    /// Number of entries tracked
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Individual entries (for logging)
    pub fn entries(&self) -> &[(String, usize)] {
        &self.entries
    }
}

impl Default for MemoryCalculator {
    fn default() -> Self {
        Self::new()
    }
}
