//! Typed distance kernels with runtime SIMD dispatch.
//!
//! One [`KernelSet`] exists per supported (element type, metric) pair. The
//! set binds a scalar distance entry, one batch entry per tile shape, and
//! the norm helpers. All entries are plain function pointers chosen once,
//! after the ISA probe, so the hot path never branches on CPU features.
//!
//! The distance convention is larger-is-worse everywhere: inner product
//! returns `-⟨a,b⟩`, cosine returns `1 − cos` over unit-normalized inputs,
//! and squared Euclidean is returned unrooted.

pub(crate) mod batch;
pub(crate) mod dispatch;
pub mod scalar;

#[cfg(target_arch = "aarch64")]
mod neon;
#[cfg(target_arch = "x86_64")]
mod x86;

pub use batch::{prefetch, Tile};
pub use dispatch::{isa_level, IsaLevel};

use std::sync::OnceLock;

use crate::element::ElementType;
use crate::error::{Error, Result};

/// Scalar distance entry: both operands hold `dim` elements.
pub type DistanceFn = fn(a: &[u8], b: &[u8], dim: usize) -> f32;

/// Batch distance entry: scores `out.len()` rows spaced `stride` bytes
/// apart against one query.
pub type BatchDistanceFn =
    fn(query: &[u8], rows: &[u8], dim: usize, stride: usize, out: &mut [f32]);

/// Norm entry over one vector.
pub type NormFn = fn(v: &[u8], dim: usize) -> f32;

/// Metric families the kernel layer computes directly.
///
/// Composite metrics (MIPS lift, quantized-integer wrapping) reduce to one
/// of these via preprocessing in the metric layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelMetric {
    /// Negated inner product.
    InnerProduct,
    /// Squared Euclidean distance.
    SquaredEuclidean,
    /// `1 − cos` over unit-normalized vectors.
    Cosine,
}

/// Bound kernel entries for one (element type, metric) pair.
#[derive(Clone, Copy)]
pub struct KernelSet {
    /// Element type the entries decode.
    pub element: ElementType,
    /// Metric family.
    pub metric: KernelMetric,
    /// Scalar distance.
    pub distance: DistanceFn,
    /// Batch distance per tile shape, indexed by `Tile as usize`.
    pub batch: [BatchDistanceFn; Tile::COUNT],
    /// L1 norm.
    pub norm1: NormFn,
    /// L2 norm.
    pub norm2: NormFn,
}

impl KernelSet {
    /// Returns the batch entry for `tile`.
    #[must_use]
    pub fn batch_for(&self, tile: Tile) -> BatchDistanceFn {
        self.batch[tile as usize]
    }
}

impl std::fmt::Debug for KernelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSet")
            .field("element", &self.element)
            .field("metric", &self.metric)
            .finish_non_exhaustive()
    }
}

// Generic batch loops around each scalar distance entry.
batch::batch_rows!(batch_ip_fp32_scalar, scalar::ip_fp32);
batch::batch_rows!(batch_l2_fp32_scalar, scalar::l2_fp32);
batch::batch_rows!(batch_cos_fp32_scalar, scalar::cosine_fp32);
batch::batch_rows!(batch_ip_fp16, scalar::ip_fp16);
batch::batch_rows!(batch_l2_fp16, scalar::l2_fp16);
batch::batch_rows!(batch_cos_fp16, scalar::cosine_fp16);
batch::batch_rows!(batch_ip_bf16, scalar::ip_bf16);
batch::batch_rows!(batch_l2_bf16, scalar::l2_bf16);
batch::batch_rows!(batch_cos_bf16, scalar::cosine_bf16);
batch::batch_rows!(batch_ip_int8, scalar::ip_int8);
batch::batch_rows!(batch_l2_int8, scalar::l2_int8);
batch::batch_rows!(batch_ip_int4, scalar::ip_int4);
batch::batch_rows!(batch_l2_int4, scalar::l2_int4);
batch::batch_rows!(batch_ip_binary32, scalar::ip_binary32);
batch::batch_rows!(batch_l2_binary32, scalar::l2_binary32);

#[cfg(target_arch = "x86_64")]
batch::batch_rows!(batch_ip_fp32_avx2_rowwise, dispatch::fp32_x86::ip_avx2);
#[cfg(target_arch = "x86_64")]
batch::batch_rows!(batch_l2_fp32_avx2, dispatch::fp32_x86::l2_avx2);
#[cfg(target_arch = "x86_64")]
batch::batch_rows!(batch_cos_fp32_avx2, dispatch::fp32_x86::cosine_avx2);
#[cfg(target_arch = "x86_64")]
batch::batch_rows!(batch_ip_fp32_avx512, dispatch::fp32_x86::ip_avx512);
#[cfg(target_arch = "x86_64")]
batch::batch_rows!(batch_l2_fp32_avx512, dispatch::fp32_x86::l2_avx512);
#[cfg(target_arch = "x86_64")]
batch::batch_rows!(batch_cos_fp32_avx512, dispatch::fp32_x86::cosine_avx512);

#[cfg(target_arch = "aarch64")]
batch::batch_rows!(batch_ip_fp32_neon, dispatch::fp32_neon::ip);
#[cfg(target_arch = "aarch64")]
batch::batch_rows!(batch_l2_fp32_neon, dispatch::fp32_neon::l2);
#[cfg(target_arch = "aarch64")]
batch::batch_rows!(batch_cos_fp32_neon, dispatch::fp32_neon::cosine);

fn uniform_batch(f: BatchDistanceFn) -> [BatchDistanceFn; Tile::COUNT] {
    [f; Tile::COUNT]
}

/// FP32 entries for the active ISA level.
fn fp32_set(metric: KernelMetric) -> KernelSet {
    let level = isa_level();

    let (distance, batch): (DistanceFn, [BatchDistanceFn; Tile::COUNT]) = match level {
        #[cfg(target_arch = "x86_64")]
        IsaLevel::Avx512 => match metric {
            KernelMetric::InnerProduct => (
                dispatch::fp32_x86::ip_avx512,
                uniform_batch(batch_ip_fp32_avx512),
            ),
            KernelMetric::SquaredEuclidean => (
                dispatch::fp32_x86::l2_avx512,
                uniform_batch(batch_l2_fp32_avx512),
            ),
            KernelMetric::Cosine => (
                dispatch::fp32_x86::cosine_avx512,
                uniform_batch(batch_cos_fp32_avx512),
            ),
        },
        #[cfg(target_arch = "x86_64")]
        IsaLevel::Avx2 => match metric {
            KernelMetric::InnerProduct => {
                // Wide tiles go through the 4-row dot kernel.
                let mut batch = uniform_batch(batch_ip_fp32_avx2_rowwise);
                batch[Tile::T1x4 as usize] = batch::batch_ip_fp32_avx2;
                batch[Tile::T1x8 as usize] = batch::batch_ip_fp32_avx2;
                batch[Tile::T4x1 as usize] = batch::batch_ip_fp32_avx2;
                (dispatch::fp32_x86::ip_avx2, batch)
            }
            KernelMetric::SquaredEuclidean => (
                dispatch::fp32_x86::l2_avx2,
                uniform_batch(batch_l2_fp32_avx2),
            ),
            KernelMetric::Cosine => (
                dispatch::fp32_x86::cosine_avx2,
                uniform_batch(batch_cos_fp32_avx2),
            ),
        },
        #[cfg(target_arch = "aarch64")]
        IsaLevel::Neon => match metric {
            KernelMetric::InnerProduct => {
                (dispatch::fp32_neon::ip, uniform_batch(batch_ip_fp32_neon))
            }
            KernelMetric::SquaredEuclidean => {
                (dispatch::fp32_neon::l2, uniform_batch(batch_l2_fp32_neon))
            }
            KernelMetric::Cosine => (
                dispatch::fp32_neon::cosine,
                uniform_batch(batch_cos_fp32_neon),
            ),
        },
        _ => match metric {
            KernelMetric::InnerProduct => {
                (scalar::ip_fp32 as DistanceFn, uniform_batch(batch_ip_fp32_scalar))
            }
            KernelMetric::SquaredEuclidean => {
                (scalar::l2_fp32 as DistanceFn, uniform_batch(batch_l2_fp32_scalar))
            }
            KernelMetric::Cosine => {
                (scalar::cosine_fp32 as DistanceFn, uniform_batch(batch_cos_fp32_scalar))
            }
        },
    };

    KernelSet {
        element: ElementType::Fp32,
        metric,
        distance,
        batch,
        norm1: scalar::norm1_fp32,
        norm2: scalar::norm2_fp32,
    }
}

fn build_registry() -> Vec<KernelSet> {
    use ElementType::*;
    use KernelMetric::*;

    let mut sets = vec![
        fp32_set(InnerProduct),
        fp32_set(SquaredEuclidean),
        fp32_set(Cosine),
    ];

    let entries: [(ElementType, KernelMetric, DistanceFn, BatchDistanceFn, NormFn, NormFn); 12] = [
        (Fp16, InnerProduct, scalar::ip_fp16, batch_ip_fp16, scalar::norm1_fp16, scalar::norm2_fp16),
        (Fp16, SquaredEuclidean, scalar::l2_fp16, batch_l2_fp16, scalar::norm1_fp16, scalar::norm2_fp16),
        (Fp16, Cosine, scalar::cosine_fp16, batch_cos_fp16, scalar::norm1_fp16, scalar::norm2_fp16),
        (Bf16, InnerProduct, scalar::ip_bf16, batch_ip_bf16, scalar::norm1_bf16, scalar::norm2_bf16),
        (Bf16, SquaredEuclidean, scalar::l2_bf16, batch_l2_bf16, scalar::norm1_bf16, scalar::norm2_bf16),
        (Bf16, Cosine, scalar::cosine_bf16, batch_cos_bf16, scalar::norm1_bf16, scalar::norm2_bf16),
        (Int8, InnerProduct, scalar::ip_int8, batch_ip_int8, scalar::norm1_int8, scalar::norm2_int8),
        (Int8, SquaredEuclidean, scalar::l2_int8, batch_l2_int8, scalar::norm1_int8, scalar::norm2_int8),
        (Int4, InnerProduct, scalar::ip_int4, batch_ip_int4, scalar::norm1_int4, scalar::norm2_int4),
        (Int4, SquaredEuclidean, scalar::l2_int4, batch_l2_int4, scalar::norm1_int4, scalar::norm2_int4),
        (Binary32, InnerProduct, scalar::ip_binary32, batch_ip_binary32, scalar::norm1_binary32, scalar::norm2_binary32),
        (Binary32, SquaredEuclidean, scalar::l2_binary32, batch_l2_binary32, scalar::norm1_binary32, scalar::norm2_binary32),
    ];
    for (element, metric, distance, batch, norm1, norm2) in entries {
        sets.push(KernelSet {
            element,
            metric,
            distance,
            batch: uniform_batch(batch),
            norm1,
            norm2,
        });
    }

    sets
}

static REGISTRY: OnceLock<Vec<KernelSet>> = OnceLock::new();

/// Looks up the kernel set for an (element type, metric) pair.
///
/// Fails with `Unsupported` when the pair has no kernel.
pub fn kernel_set(element: ElementType, metric: KernelMetric) -> Result<&'static KernelSet> {
    let registry = REGISTRY.get_or_init(build_registry);
    registry
        .iter()
        .find(|set| set.element == element && set.metric == metric)
        .ok_or_else(|| {
            Error::Unsupported(format!(
                "no kernel for element type '{}' with metric {:?}",
                element.name(),
                metric
            ))
        })
}
