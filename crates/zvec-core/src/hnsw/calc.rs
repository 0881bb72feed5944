//! Distance calculators: the seam between graph traversal and scoring.
//!
//! Plain HNSW scores stored records directly with the metric's kernels.
//! The RaBitQ variant stores codes instead, so its calculator decodes on
//! the fly and keeps the query in rotated float form. Traversal code only
//! ever sees these two entry points.

use crate::kernels::{KernelSet, Tile};

/// Scoring interface over stored record bytes.
///
/// `query_distance` takes the prepared query buffer (whatever form the
/// index's search path produces); `record_distance` compares two stored
/// records, which insert-time traversal and pruning need.
pub trait DistCalc: Send + Sync {
    /// Distance from the prepared query to one stored record.
    fn query_distance(&self, query: &[u8], record: &[u8]) -> f32;

    /// Distance between two stored records.
    fn record_distance(&self, a: &[u8], b: &[u8]) -> f32;

    /// Scores `out.len()` records spaced `stride` bytes apart.
    fn query_batch(&self, query: &[u8], rows: &[u8], stride: usize, out: &mut [f32]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.query_distance(query, &rows[i * stride..]);
        }
    }
}

/// Kernel-backed calculator for plain vector records.
pub struct KernelCalc {
    kernels: &'static KernelSet,
    dimension: usize,
}

impl KernelCalc {
    /// Binds a kernel set at the stored dimension.
    #[must_use]
    pub fn new(kernels: &'static KernelSet, dimension: usize) -> Self {
        Self { kernels, dimension }
    }
}

impl DistCalc for KernelCalc {
    #[inline]
    fn query_distance(&self, query: &[u8], record: &[u8]) -> f32 {
        (self.kernels.distance)(query, record, self.dimension)
    }

    #[inline]
    fn record_distance(&self, a: &[u8], b: &[u8]) -> f32 {
        (self.kernels.distance)(a, b, self.dimension)
    }

    fn query_batch(&self, query: &[u8], rows: &[u8], stride: usize, out: &mut [f32]) {
        let tile = Tile::widest_for(out.len());
        if tile.lanes() == out.len() {
            self.kernels.batch_for(tile)(query, rows, self.dimension, stride, out);
        } else {
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = self.query_distance(query, &rows[i * stride..]);
            }
        }
    }
}
