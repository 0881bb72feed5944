//! 1-bit + residual quantization over rotated vectors.
//!
//! Each rotated vector becomes one fixed-width code:
//!
//! ```text
//! cluster   u32 le     nearest centroid (0 without clustering)
//! signs     ⌈D/8⌉ B    bit i set when residual[i] >= 0
//! ex codes  ⌈D·ex/8⌉ B ex_bits magnitude levels per dimension
//! scale     f32 le     max |residual| (mean when ex_bits = 0)
//! ```
//!
//! Decoding reproduces an approximation of the rotated vector (centroid
//! added back), which the distance calculator scores with the plain FP32
//! kernels.

use crate::error::{Error, Result};
use crate::hnsw::level::xorshift64;
use crate::kernels::scalar::squared_l2_f32;

/// Codec for rotated vectors.
#[derive(Debug, Clone)]
pub struct RabitqQuantizer {
    padded_dim: usize,
    ex_bits: u8,
    /// Centroids in rotated space; empty means no clustering.
    centroids: Vec<Vec<f32>>,
}

impl RabitqQuantizer {
    /// Creates a codec without centroids.
    pub fn new(padded_dim: usize, ex_bits: u8) -> Result<Self> {
        if padded_dim == 0 {
            return Err(Error::InvalidArgument("padded dimension must be >= 1".into()));
        }
        if ex_bits > 8 {
            return Err(Error::InvalidArgument(format!(
                "ex_bits must be <= 8, got {ex_bits}"
            )));
        }
        Ok(Self {
            padded_dim,
            ex_bits,
            centroids: Vec::new(),
        })
    }

    /// Rotated-space dimension.
    #[must_use]
    pub fn padded_dim(&self) -> usize {
        self.padded_dim
    }

    /// Residual bits per dimension.
    #[must_use]
    pub fn ex_bits(&self) -> u8 {
        self.ex_bits
    }

    /// Current centroids.
    #[must_use]
    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    /// Installs trained centroids.
    pub fn set_centroids(&mut self, centroids: Vec<Vec<f32>>) -> Result<()> {
        for centroid in &centroids {
            if centroid.len() != self.padded_dim {
                return Err(Error::Mismatch(format!(
                    "centroid has {} dims, expected {}",
                    centroid.len(),
                    self.padded_dim
                )));
            }
        }
        self.centroids = centroids;
        Ok(())
    }

    /// Sign-bit bytes per code.
    #[must_use]
    pub fn sign_bytes(&self) -> usize {
        self.padded_dim.div_ceil(8)
    }

    /// Residual-code bytes per code.
    #[must_use]
    pub fn ex_bytes(&self) -> usize {
        (self.padded_dim * usize::from(self.ex_bits)).div_ceil(8)
    }

    /// Total code width.
    #[must_use]
    pub fn code_bytes(&self) -> usize {
        4 + self.sign_bytes() + self.ex_bytes() + 4
    }

    fn nearest_centroid(&self, rotated: &[f32]) -> u32 {
        let mut best = 0u32;
        let mut best_dist = f32::MAX;
        for (i, centroid) in self.centroids.iter().enumerate() {
            let dist = squared_l2_f32(rotated, centroid);
            if dist < best_dist {
                best_dist = dist;
                #[allow(clippy::cast_possible_truncation)]
                {
                    best = i as u32;
                }
            }
        }
        best
    }

    /// Encodes one rotated vector.
    ///
    /// # Panics
    ///
    /// Panics when `rotated` is not `padded_dim` elements.
    #[must_use]
    pub fn encode(&self, rotated: &[f32]) -> Vec<u8> {
        assert_eq!(rotated.len(), self.padded_dim, "quantizer input dimension");
        let cluster = if self.centroids.is_empty() {
            0u32
        } else {
            self.nearest_centroid(rotated)
        };
        let residual: Vec<f32> = if self.centroids.is_empty() {
            rotated.to_vec()
        } else {
            rotated
                .iter()
                .zip(self.centroids[cluster as usize].iter())
                .map(|(v, c)| v - c)
                .collect()
        };

        let mut code = vec![0u8; self.code_bytes()];
        code[0..4].copy_from_slice(&cluster.to_le_bytes());

        let sign_base = 4;
        for (i, &value) in residual.iter().enumerate() {
            if value >= 0.0 {
                code[sign_base + i / 8] |= 1 << (i % 8);
            }
        }

        let scale;
        if self.ex_bits == 0 {
            #[allow(clippy::cast_precision_loss)]
            let mean =
                residual.iter().map(|v| v.abs()).sum::<f32>() / self.padded_dim as f32;
            scale = mean;
        } else {
            let max_abs = residual.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            scale = max_abs;
            if max_abs > 0.0 {
                let levels = f32::from((1u16 << self.ex_bits) - 1);
                let ex_base = sign_base + self.sign_bytes();
                for (i, &value) in residual.iter().enumerate() {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let level = ((value.abs() / max_abs) * levels).round().min(levels) as u32;
                    write_bits(
                        &mut code[ex_base..],
                        i * usize::from(self.ex_bits),
                        usize::from(self.ex_bits),
                        level,
                    );
                }
            }
        }

        let scale_base = self.code_bytes() - 4;
        code[scale_base..scale_base + 4].copy_from_slice(&scale.to_le_bytes());
        code
    }

    /// Decodes a code to its rotated-space approximation.
    ///
    /// # Panics
    ///
    /// Panics when `code` is shorter than `code_bytes()`.
    #[must_use]
    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        assert!(code.len() >= self.code_bytes(), "code truncated");
        let cluster = u32::from_le_bytes([code[0], code[1], code[2], code[3]]) as usize;
        let scale_base = self.code_bytes() - 4;
        let scale = f32::from_le_bytes([
            code[scale_base],
            code[scale_base + 1],
            code[scale_base + 2],
            code[scale_base + 3],
        ]);

        let sign_base = 4;
        let ex_base = sign_base + self.sign_bytes();
        let levels = f32::from((1u16 << self.ex_bits) - 1);

        let mut out = Vec::with_capacity(self.padded_dim);
        for i in 0..self.padded_dim {
            let sign = if (code[sign_base + i / 8] >> (i % 8)) & 1 == 1 {
                1.0f32
            } else {
                -1.0f32
            };
            let magnitude = if self.ex_bits == 0 || scale == 0.0 {
                scale
            } else {
                #[allow(clippy::cast_precision_loss)]
                let level = read_bits(
                    &code[ex_base..],
                    i * usize::from(self.ex_bits),
                    usize::from(self.ex_bits),
                ) as f32;
                level / levels * scale
            };
            out.push(sign * magnitude);
        }

        if !self.centroids.is_empty() {
            if let Some(centroid) = self.centroids.get(cluster) {
                for (value, c) in out.iter_mut().zip(centroid.iter()) {
                    *value += c;
                }
            }
        }
        out
    }
}

fn write_bits(buf: &mut [u8], bit_offset: usize, bits: usize, value: u32) {
    for b in 0..bits {
        if (value >> b) & 1 == 1 {
            let pos = bit_offset + b;
            buf[pos / 8] |= 1 << (pos % 8);
        }
    }
}

fn read_bits(buf: &[u8], bit_offset: usize, bits: usize) -> u32 {
    let mut value = 0u32;
    for b in 0..bits {
        let pos = bit_offset + b;
        if (buf[pos / 8] >> (pos % 8)) & 1 == 1 {
            value |= 1 << b;
        }
    }
    value
}

/// Lloyd k-means over rotated samples; deterministic for a seed.
///
/// Empty clusters keep their previous centroid.
#[must_use]
pub fn train_centroids(
    samples: &[Vec<f32>],
    k: usize,
    iterations: usize,
    seed: u64,
) -> Vec<Vec<f32>> {
    if samples.is_empty() || k == 0 {
        return Vec::new();
    }
    let dim = samples[0].len();
    let k = k.min(samples.len());

    // Seeded distinct picks for initialization.
    let mut state = if seed == 0 { 1 } else { seed };
    let mut chosen: Vec<usize> = Vec::with_capacity(k);
    while chosen.len() < k {
        state = xorshift64(state);
        #[allow(clippy::cast_possible_truncation)]
        let pick = (state % samples.len() as u64) as usize;
        if !chosen.contains(&pick) {
            chosen.push(pick);
        }
    }
    let mut centroids: Vec<Vec<f32>> = chosen.iter().map(|&i| samples[i].clone()).collect();

    let mut assignment = vec![0usize; samples.len()];
    for _ in 0..iterations {
        for (i, sample) in samples.iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f32::MAX;
            for (c, centroid) in centroids.iter().enumerate() {
                let dist = squared_l2_f32(sample, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            assignment[i] = best;
        }
        let mut sums = vec![vec![0.0f32; dim]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (sample, &cluster) in samples.iter().zip(assignment.iter()) {
            counts[cluster] += 1;
            for (slot, value) in sums[cluster].iter_mut().zip(sample.iter()) {
                *slot += value;
            }
        }
        for (c, (sum, &count)) in sums.iter().zip(counts.iter()).enumerate() {
            if count > 0 {
                #[allow(clippy::cast_precision_loss)]
                let inv = 1.0 / count as f32;
                for (slot, value) in centroids[c].iter_mut().zip(sum.iter()) {
                    *slot = value * inv;
                }
            }
        }
    }
    centroids
}
