//! Tile planning
//!
//! Square tiles of `t` pixels (a multiple of [`TILE_ALIGNMENT`]) step by
//! `t - 2 * TILE_OVERLAP`. Each tile reads its full extent from the input but
//! only writes the part of it at least [`TILE_OVERLAP`] pixels away from an
//! inner tile edge, so every written pixel sees the same neighbourhood as in
//! an untiled run. Source offsets stay multiples of the alignment, which keeps
//! the pooling grid identical across tiles.

use crate::error::DenoiseResult;
use crate::memory::round_up;
use crate::network::UNET_ALIGNMENT;
use crate::tensor::Tile;
use tracing::debug;

pub const TILE_ALIGNMENT: usize = UNET_ALIGNMENT;

/// Context pixels kept on each inner tile edge
pub const TILE_OVERLAP: usize = 24;

/// Smallest tile: one aligned step of output plus the overlap on both sides
pub const MIN_TILE_SIZE: usize = 2 * TILE_OVERLAP + TILE_ALIGNMENT;

/// One tile of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRegion {
    /// Image pixels read into the input tensor
    pub input: Tile,
    /// Output tensor pixels written to the output image
    pub output: Tile,
}

/// Row-major tile decomposition of one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    /// Tensor extent of every tile
    pub tile_h: usize,
    pub tile_w: usize,
    pub tiles: Vec<TileRegion>,
}

impl TilePlan {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Span of one tile along an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    src_begin: usize,
    /// Valid image pixels read
    src_len: usize,
    dst_begin: usize,
    dst_end: usize,
}

/// Split an axis of `extent` pixels (tensor extent `padded`) into spans of `t`
fn split_axis(extent: usize, padded: usize, t: usize) -> Vec<Span> {
    if extent == 0 {
        return Vec::new();
    }
    if t >= padded {
        return vec![Span {
            src_begin: 0,
            src_len: extent,
            dst_begin: 0,
            dst_end: extent,
        }];
    }

    let stride = t - 2 * TILE_OVERLAP;
    let count = 1 + (padded - t).div_ceil(stride);
    let mut spans = Vec::with_capacity(count);
    let mut dst_begin = 0;
    for i in 0..count {
        let src_begin = (i * stride).min(padded - t);
        let dst_end = if i + 1 == count {
            extent
        } else {
            src_begin + t - TILE_OVERLAP
        };
        spans.push(Span {
            src_begin,
            src_len: t.min(extent - src_begin),
            dst_begin,
            dst_end,
        });
        dst_begin = dst_end;
    }
    spans
}

/// Decompose a `height x width` image into tiles of tensor extent `t`
pub fn plan_with_tile_size(height: usize, width: usize, t: usize) -> TilePlan {
    let (hp, wp) = (round_up(height, TILE_ALIGNMENT), round_up(width, TILE_ALIGNMENT));
    let rows = split_axis(height, hp, t);
    let cols = split_axis(width, wp, t);

    let mut tiles = Vec::with_capacity(rows.len() * cols.len());
    for r in &rows {
        for c in &cols {
            tiles.push(TileRegion {
                input: Tile {
                    h_src_begin: r.src_begin,
                    w_src_begin: c.src_begin,
                    h_dst_begin: 0,
                    w_dst_begin: 0,
                    h: r.src_len,
                    w: c.src_len,
                },
                output: Tile {
                    h_src_begin: r.dst_begin - r.src_begin,
                    w_src_begin: c.dst_begin - c.src_begin,
                    h_dst_begin: r.dst_begin,
                    w_dst_begin: c.dst_begin,
                    h: r.dst_end - r.dst_begin,
                    w: c.dst_end - c.dst_begin,
                },
            });
        }
    }

    TilePlan {
        tile_h: t.min(hp),
        tile_w: t.min(wp),
        tiles,
    }
}

/// Choose the largest tile whose estimate fits `budget_bytes` and plan it
///
/// `estimate(tile_h, tile_w)` must be monotonic in the tile size. A budget
/// of 0 forces [`MIN_TILE_SIZE`]; the minimum is used even when it does not
/// fit.
pub fn plan_tiles(
    height: usize,
    width: usize,
    budget_bytes: usize,
    mut estimate: impl FnMut(usize, usize) -> DenoiseResult<usize>,
) -> DenoiseResult<TilePlan> {
    let (hp, wp) = (round_up(height, TILE_ALIGNMENT), round_up(width, TILE_ALIGNMENT));
    let full = hp.max(wp).max(MIN_TILE_SIZE);

    let t = if budget_bytes == 0 {
        MIN_TILE_SIZE
    } else if estimate(hp, wp)? <= budget_bytes {
        full
    } else {
        // largest k with estimate(4k) <= budget, searched over [MIN, full]
        let (mut lo, mut hi) = (MIN_TILE_SIZE / TILE_ALIGNMENT, full / TILE_ALIGNMENT);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            let t = mid * TILE_ALIGNMENT;
            if estimate(t.min(hp), t.min(wp))? <= budget_bytes {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo * TILE_ALIGNMENT
    };

    let plan = plan_with_tile_size(height, width, t);
    debug!(
        "tiling {}x{} image: {} tile(s) of {}x{} (budget {} bytes)",
        width,
        height,
        plan.len(),
        plan.tile_w,
        plan.tile_h,
        budget_bytes
    );
    Ok(plan)
}
