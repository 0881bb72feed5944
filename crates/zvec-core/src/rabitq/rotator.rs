//! Seeded orthonormal rotators.
//!
//! Two variants, both deterministic for a given seed: a fast-Hadamard
//! rotation (sign flips + Walsh-Hadamard rounds over a power-of-two
//! padded dimension) and a dense random rotation (Gram-Schmidt over
//! Gaussian rows). Stored vectors and queries go through the same
//! instance, so only the seed has to survive a dump.

use crate::error::{Error, Result};
use crate::hnsw::level::xorshift64;

/// Rotator flavor, persisted in the converter header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RotatorType {
    /// Sign flips + fast Walsh-Hadamard rounds.
    FastHadamard = 0,
    /// Dense random orthonormal matrix.
    DenseRandom = 1,
}

impl RotatorType {
    /// Parses the on-disk discriminant.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::FastHadamard),
            1 => Ok(Self::DenseRandom),
            other => Err(Error::InvalidFormat(format!(
                "unknown rotator type {other}"
            ))),
        }
    }

    /// Parses a configuration name.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "fht" => Ok(Self::FastHadamard),
            "dense" => Ok(Self::DenseRandom),
            other => Err(Error::InvalidArgument(format!(
                "unknown rotator type '{other}'"
            ))),
        }
    }
}

const FHT_ROUNDS: usize = 3;

/// Seeded orthonormal transform over `padded_dim` dimensions.
#[derive(Debug, Clone)]
pub struct Rotator {
    kind: RotatorType,
    dim: usize,
    padded_dim: usize,
    seed: u64,
    /// Per-round sign flips (fast-Hadamard only).
    signs: Vec<Vec<f32>>,
    /// Row-major orthonormal matrix (dense only).
    matrix: Vec<f32>,
}

struct SeededUniform {
    state: u64,
}

impl SeededUniform {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    /// Uniform draw in (0, 1].
    #[allow(clippy::cast_precision_loss)]
    fn next(&mut self) -> f64 {
        self.state = xorshift64(self.state);
        ((self.state >> 11) as f64 + 1.0) / ((1u64 << 53) as f64)
    }

    /// Standard normal draw (Box-Muller).
    #[allow(clippy::cast_possible_truncation)]
    fn next_gaussian(&mut self) -> f32 {
        let u1 = self.next();
        let u2 = self.next();
        ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
    }
}

impl Rotator {
    /// Creates a rotator for vectors of `dim` elements.
    pub fn new(kind: RotatorType, dim: usize, seed: u64) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidArgument("rotator dimension must be >= 1".into()));
        }
        match kind {
            RotatorType::FastHadamard => {
                let padded_dim = dim.next_power_of_two();
                let mut rng = SeededUniform::new(seed);
                let signs = (0..FHT_ROUNDS)
                    .map(|_| {
                        (0..padded_dim)
                            .map(|_| if rng.next() < 0.5 { -1.0 } else { 1.0 })
                            .collect()
                    })
                    .collect();
                Ok(Self {
                    kind,
                    dim,
                    padded_dim,
                    seed,
                    signs,
                    matrix: Vec::new(),
                })
            }
            RotatorType::DenseRandom => {
                let matrix = dense_orthonormal(dim, seed);
                Ok(Self {
                    kind,
                    dim,
                    padded_dim: dim,
                    seed,
                    signs: Vec::new(),
                    matrix,
                })
            }
        }
    }

    /// Rotator flavor.
    #[must_use]
    pub fn kind(&self) -> RotatorType {
        self.kind
    }

    /// Input dimension.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Output dimension (power of two for fast-Hadamard).
    #[must_use]
    pub fn padded_dim(&self) -> usize {
        self.padded_dim
    }

    /// Seed the rotator regenerates from.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Applies the rotation, zero-padding the input when needed.
    ///
    /// # Panics
    ///
    /// Panics when `input` is not `dim` elements.
    #[must_use]
    pub fn rotate(&self, input: &[f32]) -> Vec<f32> {
        assert_eq!(input.len(), self.dim, "rotator input dimension");
        match self.kind {
            RotatorType::FastHadamard => {
                let mut v = vec![0.0f32; self.padded_dim];
                v[..self.dim].copy_from_slice(input);
                #[allow(clippy::cast_precision_loss)]
                let scale = 1.0 / (self.padded_dim as f32).sqrt();
                for signs in &self.signs {
                    for (value, sign) in v.iter_mut().zip(signs.iter()) {
                        *value *= sign;
                    }
                    fwht(&mut v);
                    for value in v.iter_mut() {
                        *value *= scale;
                    }
                }
                v
            }
            RotatorType::DenseRandom => {
                let n = self.dim;
                (0..n)
                    .map(|row| {
                        let row = &self.matrix[row * n..(row + 1) * n];
                        row.iter().zip(input.iter()).map(|(m, x)| m * x).sum()
                    })
                    .collect()
            }
        }
    }
}

/// In-place fast Walsh-Hadamard transform; length must be a power of two.
fn fwht(v: &mut [f32]) {
    let n = v.len();
    let mut h = 1;
    while h < n {
        let mut i = 0;
        while i < n {
            for j in i..i + h {
                let x = v[j];
                let y = v[j + h];
                v[j] = x + y;
                v[j + h] = x - y;
            }
            i += h * 2;
        }
        h *= 2;
    }
}

/// Gram-Schmidt orthonormalization of seeded Gaussian rows.
fn dense_orthonormal(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = SeededUniform::new(seed);
    let mut matrix = vec![0.0f32; n * n];
    for row in 0..n {
        loop {
            for col in 0..n {
                matrix[row * n + col] = rng.next_gaussian();
            }
            // Remove projections onto earlier rows.
            for prev in 0..row {
                let dot: f32 = (0..n)
                    .map(|c| matrix[row * n + c] * matrix[prev * n + c])
                    .sum();
                for c in 0..n {
                    matrix[row * n + c] -= dot * matrix[prev * n + c];
                }
            }
            let norm: f32 = (0..n)
                .map(|c| matrix[row * n + c] * matrix[row * n + c])
                .sum::<f32>()
                .sqrt();
            if norm > 1e-6 {
                for c in 0..n {
                    matrix[row * n + c] /= norm;
                }
                break;
            }
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::scalar::{dot_f32, norm2_f32};

    fn sample(dim: usize) -> Vec<f32> {
        (0..dim).map(|i| ((i as f32) * 0.17).sin()).collect()
    }

    #[test]
    fn test_fht_preserves_norm() {
        let rotator = Rotator::new(RotatorType::FastHadamard, 48, 99).unwrap();
        assert_eq!(rotator.padded_dim(), 64);
        let v = sample(48);
        let rotated = rotator.rotate(&v);
        assert_eq!(rotated.len(), 64);
        assert!((norm2_f32(&v) - norm2_f32(&rotated)).abs() < 1e-4);
    }

    #[test]
    fn test_dense_preserves_norm_and_dot() {
        let rotator = Rotator::new(RotatorType::DenseRandom, 16, 7).unwrap();
        assert_eq!(rotator.padded_dim(), 16);
        let a = sample(16);
        let b: Vec<f32> = (0..16).map(|i| ((i as f32) * 0.41).cos()).collect();
        let ra = rotator.rotate(&a);
        let rb = rotator.rotate(&b);
        assert!((norm2_f32(&a) - norm2_f32(&ra)).abs() < 1e-4);
        assert!((dot_f32(&a, &b) - dot_f32(&ra, &rb)).abs() < 1e-3);
    }

    #[test]
    fn test_deterministic_for_seed() {
        for kind in [RotatorType::FastHadamard, RotatorType::DenseRandom] {
            let a = Rotator::new(kind, 24, 1234).unwrap();
            let b = Rotator::new(kind, 24, 1234).unwrap();
            let v = sample(24);
            assert_eq!(a.rotate(&v), b.rotate(&v));
        }
    }

    #[test]
    fn test_distinct_seeds_differ() {
        let a = Rotator::new(RotatorType::FastHadamard, 32, 1).unwrap();
        let b = Rotator::new(RotatorType::FastHadamard, 32, 2).unwrap();
        let v = sample(32);
        assert_ne!(a.rotate(&v), b.rotate(&v));
    }
}
