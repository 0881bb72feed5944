//! Runtime ISA selection for the kernel tables.
//!
//! The best available level is probed once, logged, and cached; every
//! kernel table entry is then bound to a concrete function for that level.
//! `ZVEC_FORCE_ISA=scalar|sse|avx2|avx512|neon` overrides the probe, which
//! keeps the scalar reference path reachable on any machine.

use std::sync::OnceLock;

/// SIMD capability level the kernel tables are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsaLevel {
    /// AVX-512F (`x86_64` only).
    Avx512,
    /// AVX2 + FMA (`x86_64` only).
    Avx2,
    /// SSE-era x86 without AVX2; served by the scalar kernels.
    Sse,
    /// NEON (aarch64, always available).
    Neon,
    /// Scalar reference kernels.
    Scalar,
}

impl IsaLevel {
    /// Canonical lowercase name as accepted by `ZVEC_FORCE_ISA`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Avx512 => "avx512",
            Self::Avx2 => "avx2",
            Self::Sse => "sse",
            Self::Neon => "neon",
            Self::Scalar => "scalar",
        }
    }
}

static ISA_LEVEL: OnceLock<IsaLevel> = OnceLock::new();

fn probe_isa() -> IsaLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx512f") {
            return IsaLevel::Avx512;
        }
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return IsaLevel::Avx2;
        }
        return IsaLevel::Sse;
    }

    #[cfg(target_arch = "aarch64")]
    {
        return IsaLevel::Neon;
    }

    #[allow(unreachable_code)]
    IsaLevel::Scalar
}

fn forced_isa() -> Option<IsaLevel> {
    let raw = std::env::var("ZVEC_FORCE_ISA").ok()?;
    match raw.to_ascii_lowercase().as_str() {
        "scalar" => Some(IsaLevel::Scalar),
        "sse" => Some(IsaLevel::Sse),
        "avx2" => Some(IsaLevel::Avx2),
        "avx512" => Some(IsaLevel::Avx512),
        "neon" => Some(IsaLevel::Neon),
        other => {
            tracing::warn!(value = other, "ignoring unknown ZVEC_FORCE_ISA value");
            None
        }
    }
}

/// Returns the cached ISA level, probing (and logging) on first use.
///
/// A forced level is clamped to what the machine actually supports so a
/// stray environment variable cannot select an illegal instruction.
#[must_use]
pub fn isa_level() -> IsaLevel {
    *ISA_LEVEL.get_or_init(|| {
        let probed = probe_isa();
        let level = match forced_isa() {
            Some(forced) if rank(forced) <= rank(probed) => {
                tracing::debug!(
                    probed = probed.name(),
                    forced = forced.name(),
                    "kernel dispatch level forced via ZVEC_FORCE_ISA"
                );
                forced
            }
            Some(forced) => {
                tracing::warn!(
                    probed = probed.name(),
                    forced = forced.name(),
                    "ZVEC_FORCE_ISA requests an unsupported level; keeping probe result"
                );
                probed
            }
            None => probed,
        };
        tracing::debug!(isa = level.name(), "kernel dispatch level selected");
        level
    })
}

/// Capability rank: lower is weaker. Forcing may only lower the level.
fn rank(level: IsaLevel) -> u8 {
    match level {
        IsaLevel::Scalar => 0,
        IsaLevel::Sse => 1,
        IsaLevel::Neon => 2,
        IsaLevel::Avx2 => 3,
        IsaLevel::Avx512 => 4,
    }
}

// =============================================================================
// ISA-bound FP32 entries (selected into the kernel tables at init)
// =============================================================================

#[cfg(target_arch = "x86_64")]
pub(crate) mod fp32_x86 {
    use super::super::x86;

    pub(crate) fn ip_avx2(a: &[u8], b: &[u8], dim: usize) -> f32 {
        // SAFETY: this entry is selected only after the AVX2+FMA probe, and
        // byte buffers hold at least `dim` f32 elements per kernel contract.
        unsafe { -x86::dot_f32_avx2(a.as_ptr().cast(), b.as_ptr().cast(), dim) }
    }

    pub(crate) fn l2_avx2(a: &[u8], b: &[u8], dim: usize) -> f32 {
        // SAFETY: selected only after the AVX2+FMA probe.
        unsafe { x86::squared_l2_f32_avx2(a.as_ptr().cast(), b.as_ptr().cast(), dim) }
    }

    pub(crate) fn cosine_avx2(a: &[u8], b: &[u8], dim: usize) -> f32 {
        1.0 + ip_avx2(a, b, dim)
    }

    pub(crate) fn ip_avx512(a: &[u8], b: &[u8], dim: usize) -> f32 {
        // SAFETY: selected only after the AVX-512F probe.
        unsafe { -x86::dot_f32_avx512(a.as_ptr().cast(), b.as_ptr().cast(), dim) }
    }

    pub(crate) fn l2_avx512(a: &[u8], b: &[u8], dim: usize) -> f32 {
        // SAFETY: selected only after the AVX-512F probe.
        unsafe { x86::squared_l2_f32_avx512(a.as_ptr().cast(), b.as_ptr().cast(), dim) }
    }

    pub(crate) fn cosine_avx512(a: &[u8], b: &[u8], dim: usize) -> f32 {
        1.0 + ip_avx512(a, b, dim)
    }
}

#[cfg(target_arch = "aarch64")]
pub(crate) mod fp32_neon {
    use super::super::neon;

    pub(crate) fn ip(a: &[u8], b: &[u8], dim: usize) -> f32 {
        -neon::dot_f32_neon(a.as_ptr().cast(), b.as_ptr().cast(), dim)
    }

    pub(crate) fn l2(a: &[u8], b: &[u8], dim: usize) -> f32 {
        neon::squared_l2_f32_neon(a.as_ptr().cast(), b.as_ptr().cast(), dim)
    }

    pub(crate) fn cosine(a: &[u8], b: &[u8], dim: usize) -> f32 {
        1.0 + ip(a, b, dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isa_level_is_stable() {
        assert_eq!(isa_level(), isa_level());
    }

    #[test]
    fn test_rank_ordering() {
        assert!(rank(IsaLevel::Scalar) < rank(IsaLevel::Avx512));
        assert!(rank(IsaLevel::Sse) < rank(IsaLevel::Avx2));
    }
}
