//! Element types stored inside vector records.
//!
//! A vector is a contiguous run of `dimension` elements of one
//! [`ElementType`]. INT4 packs two elements per byte; BINARY32 packs 32
//! one-bit elements per `u32` word.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Primary key type. `0` is the tombstone sentinel.
pub type Key = u64;

/// Dense node identifier inside one index.
pub type NodeId = u32;

/// Sentinel key marking a deleted or unassigned slot.
pub const INVALID_KEY: Key = 0;

/// Sentinel node id.
pub const INVALID_NODE: NodeId = u32::MAX;

/// Element type of a stored vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementType {
    /// 32-bit IEEE float.
    Fp32 = 0,
    /// 16-bit IEEE half float.
    Fp16 = 1,
    /// bfloat16.
    Bf16 = 2,
    /// Signed 8-bit integer code.
    Int8 = 3,
    /// Signed 4-bit integer code, packed two per byte.
    Int4 = 4,
    /// One bit per dimension, packed into little-endian u32 words.
    Binary32 = 5,
}

impl ElementType {
    /// Parses the on-disk discriminant.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Fp32),
            1 => Ok(Self::Fp16),
            2 => Ok(Self::Bf16),
            3 => Ok(Self::Int8),
            4 => Ok(Self::Int4),
            5 => Ok(Self::Binary32),
            other => Err(Error::InvalidFormat(format!(
                "unknown element type discriminant {other}"
            ))),
        }
    }

    /// Returns the number of bytes one vector of `dimension` elements
    /// occupies, including packing.
    #[must_use]
    pub fn vector_bytes(self, dimension: usize) -> usize {
        match self {
            Self::Fp32 => dimension * 4,
            Self::Fp16 | Self::Bf16 => dimension * 2,
            Self::Int8 => dimension,
            Self::Int4 => dimension.div_ceil(2),
            Self::Binary32 => dimension.div_ceil(32) * 4,
        }
    }

    /// Bits consumed per element.
    #[must_use]
    pub fn bits_per_element(self) -> usize {
        match self {
            Self::Fp32 => 32,
            Self::Fp16 | Self::Bf16 => 16,
            Self::Int8 => 8,
            Self::Int4 => 4,
            Self::Binary32 => 1,
        }
    }

    /// Canonical lowercase name, used in meta blobs and logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
            Self::Int8 => "int8",
            Self::Int4 => "int4",
            Self::Binary32 => "binary32",
        }
    }

    /// Parses a canonical name.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "fp32" => Ok(Self::Fp32),
            "fp16" => Ok(Self::Fp16),
            "bf16" => Ok(Self::Bf16),
            "int8" => Ok(Self::Int8),
            "int4" => Ok(Self::Int4),
            "binary32" => Ok(Self::Binary32),
            other => Err(Error::InvalidArgument(format!(
                "unknown element type '{other}'"
            ))),
        }
    }
}

/// Aligns `size` up to the next multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Encodes caller-supplied f32 values into `element` record bytes.
///
/// Integer element types expect values already in code space and clamp
/// them to their range; BINARY32 thresholds at zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_vector(element: ElementType, values: &[f32]) -> Vec<u8> {
    use crate::quantize::BinaryQuantizer;

    match element {
        ElementType::Fp32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ElementType::Fp16 => values
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect(),
        ElementType::Bf16 => values
            .iter()
            .flat_map(|v| half::bf16::from_f32(*v).to_le_bytes())
            .collect(),
        ElementType::Int8 => values
            .iter()
            .map(|v| {
                #[allow(clippy::cast_possible_truncation)]
                let code = v.round().clamp(-128.0, 127.0) as i8;
                code.to_le_bytes()[0]
            })
            .collect(),
        ElementType::Int4 => {
            let mut out = vec![0u8; ElementType::Int4.vector_bytes(values.len())];
            for (i, v) in values.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let code = v.round().clamp(0.0, 15.0) as u8;
                if i % 2 == 0 {
                    out[i / 2] |= code;
                } else {
                    out[i / 2] |= code << 4;
                }
            }
            out
        }
        ElementType::Binary32 => BinaryQuantizer::default().encode_to_bytes(values),
    }
}

/// Decodes `dimension` elements of `element` record bytes into f32 values.
#[must_use]
pub fn decode_vector(element: ElementType, bytes: &[u8], dimension: usize) -> Vec<f32> {
    match element {
        ElementType::Fp32 => bytes
            .chunks_exact(4)
            .take(dimension)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        ElementType::Fp16 => bytes
            .chunks_exact(2)
            .take(dimension)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        ElementType::Bf16 => bytes
            .chunks_exact(2)
            .take(dimension)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        #[allow(clippy::cast_possible_wrap)]
        ElementType::Int8 => bytes
            .iter()
            .take(dimension)
            .map(|&b| f32::from(b as i8))
            .collect(),
        ElementType::Int4 => (0..dimension)
            .map(|i| {
                let byte = bytes[i / 2];
                let code = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
                f32::from(code)
            })
            .collect(),
        ElementType::Binary32 => (0..dimension)
            .map(|i| {
                let word = u32::from_le_bytes([
                    bytes[(i / 32) * 4],
                    bytes[(i / 32) * 4 + 1],
                    bytes[(i / 32) * 4 + 2],
                    bytes[(i / 32) * 4 + 3],
                ]);
                if (word >> (i & 31)) & 1 == 1 {
                    1.0
                } else {
                    -1.0
                }
            })
            .collect(),
    }
}
