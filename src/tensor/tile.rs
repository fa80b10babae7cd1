//! Tile mapping between a source and a destination region

/// Rectangular mapping: `h x w` pixels copied from `(h_src_begin, w_src_begin)`
/// in the source to `(h_dst_begin, w_dst_begin)` in the destination.
///
/// For the input stage the source is an image and the destination the
/// network input tensor; for the output stage it is the other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tile {
    pub h_src_begin: usize,
    pub w_src_begin: usize,
    pub h_dst_begin: usize,
    pub w_dst_begin: usize,
    pub h: usize,
    pub w: usize,
}

impl Tile {
    /// Identity mapping of an `h x w` region at the origin
    pub fn full(h: usize, w: usize) -> Self {
        Self {
            h,
            w,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.h == 0 || self.w == 0
    }
}
