//! Progress reporting and cooperative cancellation
//!
//! A run reports `0.0` before the first tile and `done / total` after each
//! tile, so the last report of a complete run is exactly `1.0`. The callback
//! returning `false` cancels the run at the next tile boundary.

use crate::error::{DenoiseError, DenoiseResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Receives the completed fraction; returns whether to continue
pub type ProgressCallback = Arc<dyn Fn(f64) -> bool + Send + Sync>;

/// Progress of one filter run
pub struct ProgressMonitor {
    callback: Option<ProgressCallback>,
    total: usize,
    done: AtomicUsize,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for ProgressMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMonitor")
            .field("total", &self.total)
            .field("done", &self.done.load(Ordering::Relaxed))
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ProgressMonitor {
    pub fn new(callback: Option<ProgressCallback>, total: usize) -> Self {
        Self {
            callback,
            total,
            done: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fraction of completed work units
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.done.load(Ordering::Acquire) as f64 / self.total as f64
    }

    fn report(&self, fraction: f64) -> DenoiseResult<()> {
        if self.is_cancelled() {
            return Err(DenoiseError::Cancelled);
        }
        let Some(callback) = &self.callback else {
            return Ok(());
        };
        if callback(fraction) || fraction >= 1.0 {
            return Ok(());
        }
        debug!("run cancelled at {:.3}", fraction);
        self.cancelled.store(true, Ordering::Release);
        Err(DenoiseError::Cancelled)
    }

    /// Report the start of the run
    pub fn start(&self) -> DenoiseResult<()> {
        if self.total == 0 {
            return self.report(1.0);
        }
        self.report(0.0)
    }

    /// Mark one work unit done and report
    pub fn advance(&self) -> DenoiseResult<()> {
        let done = (self.done.fetch_add(1, Ordering::AcqRel) + 1).min(self.total);
        self.report(done as f64 / self.total.max(1) as f64)
    }
}
