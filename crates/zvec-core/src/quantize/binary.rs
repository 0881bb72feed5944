//! One-bit threshold quantization packed into u32 words.
//!
//! Values at or above the threshold map to bit 1, below to bit 0. Decoding
//! maps bit 1 to `1.0` and bit 0 to `-1.0`.

/// 1-bit quantizer with a configurable threshold (default 0).
#[derive(Debug, Clone, Copy)]
pub struct BinaryQuantizer {
    threshold: f32,
}

impl Default for BinaryQuantizer {
    fn default() -> Self {
        Self { threshold: 0.0 }
    }
}

impl BinaryQuantizer {
    /// Creates a quantizer with threshold `theta`.
    #[must_use]
    pub fn with_threshold(theta: f32) -> Self {
        Self { threshold: theta }
    }

    /// Returns the threshold.
    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Number of u32 words needed for `dim` bits.
    #[must_use]
    pub fn encoded_words(dim: usize) -> usize {
        dim.div_ceil(32)
    }

    /// Encodes `input` into little-endian u32 words.
    ///
    /// # Panics
    ///
    /// Panics if `out` holds fewer than `encoded_words(input.len())` words.
    pub fn encode(&self, input: &[f32], out: &mut [u32]) {
        assert!(out.len() >= Self::encoded_words(input.len()));
        for word in out.iter_mut().take(Self::encoded_words(input.len())) {
            *word = 0;
        }
        for (i, &value) in input.iter().enumerate() {
            if value >= self.threshold {
                out[i >> 5] |= 1 << (i & 31);
            }
        }
    }

    /// Decodes `dim` bits into `out`: bit 1 becomes `1.0`, bit 0 `-1.0`.
    ///
    /// # Panics
    ///
    /// Panics if `input` holds fewer than `encoded_words(dim)` words or
    /// `out` fewer than `dim` floats.
    pub fn decode(&self, input: &[u32], dim: usize, out: &mut [f32]) {
        assert!(input.len() >= Self::encoded_words(dim));
        assert!(out.len() >= dim);
        for (i, slot) in out.iter_mut().enumerate().take(dim) {
            let bit = (input[i >> 5] >> (i & 31)) & 1;
            *slot = if bit == 1 { 1.0 } else { -1.0 };
        }
    }

    /// Encodes into a freshly allocated byte buffer (little-endian words).
    #[must_use]
    pub fn encode_to_bytes(&self, input: &[f32]) -> Vec<u8> {
        let mut words = vec![0u32; Self::encoded_words(input.len())];
        self.encode(input, &mut words);
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}
