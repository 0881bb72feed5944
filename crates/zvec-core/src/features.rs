//! Read-only typed view over a contiguous array of vector records.

use crate::element::ElementType;
use crate::error::{Error, Result};
use crate::store::ByteView;

/// Borrow-free view over the vector rows of one segment.
///
/// Rows are addressed as `node * stride`; the view pins its chunk for its
/// whole lifetime.
pub struct FeaturesView {
    bytes: ByteView,
    element: ElementType,
    dimension: usize,
    stride: usize,
    count: usize,
    vector_bytes: usize,
}

impl std::fmt::Debug for FeaturesView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeaturesView")
            .field("element", &self.element)
            .field("dimension", &self.dimension)
            .field("stride", &self.stride)
            .field("count", &self.count)
            .field("vector_bytes", &self.vector_bytes)
            .finish_non_exhaustive()
    }
}

impl FeaturesView {
    /// Wraps a pinned segment.
    pub fn new(
        bytes: ByteView,
        element: ElementType,
        dimension: usize,
        stride: usize,
        count: usize,
    ) -> Result<Self> {
        let vector_bytes = element.vector_bytes(dimension);
        if stride < vector_bytes {
            return Err(Error::InvalidArgument(format!(
                "stride {stride} below vector size {vector_bytes}"
            )));
        }
        if count > 0 && bytes.len() < (count - 1) * stride + vector_bytes {
            return Err(Error::Mismatch(format!(
                "segment holds {} bytes, need {} for {count} rows",
                bytes.len(),
                (count - 1) * stride + vector_bytes
            )));
        }
        Ok(Self {
            bytes,
            element,
            dimension,
            stride,
            count,
            vector_bytes,
        })
    }

    /// Element type of the rows.
    #[must_use]
    pub fn element(&self) -> ElementType {
        self.element
    }

    /// Stored dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Row stride in bytes.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of rows.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Raw bytes of row `node` (exactly one vector, no padding).
    ///
    /// # Panics
    ///
    /// Panics when `node >= count`.
    #[must_use]
    pub fn vector(&self, node: u32) -> &[u8] {
        let node = node as usize;
        assert!(node < self.count, "row {node} out of {}", self.count);
        let start = node * self.stride;
        &self.bytes[start..start + self.vector_bytes]
    }

    /// Raw bytes from row `node` to the end of the buffer; batch kernels
    /// walk this with the view's stride.
    #[must_use]
    pub fn rows_from(&self, node: u32) -> &[u8] {
        &self.bytes[(node as usize) * self.stride..]
    }
}
