//! Tile batch scoring.
//!
//! Graph traversal and brute-force scans score vectors in small tiles so
//! the next rows can be prefetched while the current ones compute. The
//! tile set matches the shapes the searchers actually issue.

/// Tile shape of a batch distance call.
///
/// `T1xN` scores one query against N rows; `T4x1` scores four queries
/// against one row (issued through the same entry with the roles swapped,
/// which is valid because every built-in kernel metric is symmetric).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Tile {
    /// One query, one row.
    T1x1 = 0,
    /// One query, two rows.
    T1x2 = 1,
    /// One query, four rows.
    T1x4 = 2,
    /// One query, eight rows.
    T1x8 = 3,
    /// Four queries, one row.
    T4x1 = 4,
}

impl Tile {
    /// Number of tile shapes.
    pub const COUNT: usize = 5;

    /// Number of scored outputs the tile produces.
    #[must_use]
    pub fn lanes(self) -> usize {
        match self {
            Self::T1x1 => 1,
            Self::T1x2 => 2,
            Self::T1x4 | Self::T4x1 => 4,
            Self::T1x8 => 8,
        }
    }

    /// Largest `T1xN` tile not exceeding `remaining` rows.
    #[must_use]
    pub fn widest_for(remaining: usize) -> Self {
        match remaining {
            0 | 1 => Self::T1x1,
            2 | 3 => Self::T1x2,
            4..=7 => Self::T1x4,
            _ => Self::T1x8,
        }
    }
}

/// Prefetches the cache line at the start of `data`.
#[inline]
pub fn prefetch(data: &[u8]) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch never faults; any address is acceptable.
    unsafe {
        std::arch::x86_64::_mm_prefetch::<{ std::arch::x86_64::_MM_HINT_T0 }>(
            data.as_ptr().cast(),
        );
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = data;
}

/// Builds a row-loop batch kernel around a scalar distance function,
/// prefetching one row ahead.
macro_rules! batch_rows {
    ($name:ident, $dist:path) => {
        pub(crate) fn $name(
            query: &[u8],
            rows: &[u8],
            dim: usize,
            stride: usize,
            out: &mut [f32],
        ) {
            let count = out.len();
            for i in 0..count {
                if i + 1 < count {
                    $crate::kernels::batch::prefetch(&rows[(i + 1) * stride..]);
                }
                out[i] = $dist(query, &rows[i * stride..], dim);
            }
        }
    };
}

pub(crate) use batch_rows;

// =============================================================================
// FP32 specializations
// =============================================================================

/// AVX2 inner-product batch: four rows per dot4 call, loop remainder.
#[cfg(target_arch = "x86_64")]
pub(crate) fn batch_ip_fp32_avx2(
    query: &[u8],
    rows: &[u8],
    dim: usize,
    stride: usize,
    out: &mut [f32],
) {
    use super::dispatch::fp32_x86;
    use super::x86;

    let count = out.len();
    let mut i = 0;
    while i + 4 <= count {
        if (i + 4) * stride < rows.len() {
            prefetch(&rows[(i + 4) * stride..]);
        }
        // SAFETY: selected post-AVX2-probe; `rows` holds `count` rows of
        // `dim` f32 elements spaced `stride` bytes apart.
        unsafe {
            x86::dot4_f32_avx2(
                query.as_ptr().cast(),
                rows.as_ptr().add(i * stride),
                dim,
                stride,
                &mut out[i..i + 4],
            );
        }
        i += 4;
    }
    // dot4 produces raw dot products; flip to the distance convention.
    for value in &mut out[..i] {
        *value = -*value;
    }
    while i < count {
        out[i] = fp32_x86::ip_avx2(query, &rows[i * stride..], dim);
        i += 1;
    }
}
