//! HNSW segment names and the fixed-layout header codec.

use crate::element::{align_up, ElementType, NodeId};
use crate::error::{Error, Result};

/// Header segment.
pub const SEG_HEADER: &str = "hnsw.header";
/// Key column segment.
pub const SEG_KEYS: &str = "hnsw.keys";
/// Vector rows segment.
pub const SEG_VECTORS: &str = "hnsw.vectors";
/// Level-0 neighbor slots segment.
pub const SEG_NEIGHBORS_L0: &str = "hnsw.neighbors.L0";
/// Upper-level neighbor buffer segment.
pub const SEG_NEIGHBORS_UPPER: &str = "hnsw.neighbors.Lk";
/// Per-node upper index segment.
pub const SEG_NEIGHBORS_INDEX: &str = "hnsw.neighbors.index";
/// Index meta blob segment.
pub const SEG_META: &str = "index.meta";
/// Metric parameter blob segment.
pub const SEG_METRIC: &str = "metric.params";
/// RaBitQ converter segment.
pub const SEG_RABITQ: &str = "rabitq.converter";

const HEADER_MAGIC: u32 = u32::from_le_bytes(*b"HNSW");
const HEADER_VERSION: u32 = 1;
/// Encoded header size.
pub const HEADER_LEN: usize = 128;
const METRIC_NAME_FIELD: usize = 62;

/// Bytes per entry in the upper-level neighbor index: `offset u64`,
/// `level u8`, 7 bytes of padding to keep offsets naturally aligned.
pub const NEIGHBOR_INDEX_ENTRY: usize = 16;

/// Computes the node stride for a vector payload.
///
/// Rows are 32-byte aligned; a stride that lands on a multiple of 1024 is
/// bumped once more because cache-aliased rows degrade build throughput.
#[must_use]
pub fn node_stride(vector_bytes: usize) -> usize {
    let mut stride = align_up(vector_bytes, 32);
    if stride % 1024 == 0 {
        stride = align_up(stride + 1, 32);
    }
    stride
}

/// Level-0 neighbor slot stride: `count u32` plus `m0` node ids.
#[must_use]
pub fn neighbor_stride_l0(m0: usize) -> usize {
    4 + 4 * m0
}

/// Upper-level neighbor slot stride: `count u32` plus `m` node ids.
#[must_use]
pub fn neighbor_stride_upper(m: usize) -> usize {
    4 + 4 * m
}

/// Fixed-layout header dumped once per index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HnswHeader {
    /// Element type of stored vectors.
    pub element: ElementType,
    /// Metric name (parameters live in the metric blob).
    pub metric_name: String,
    /// Caller-facing dimension.
    pub dimension: u32,
    /// Stored dimension (includes injected MIPS lanes).
    pub storage_dimension: u32,
    /// Upper-level degree bound.
    pub m: u32,
    /// Level-0 degree bound.
    pub m0: u32,
    /// Construction frontier bound the graph was built with.
    pub ef_construction: u32,
    /// Number of assigned nodes (tombstones included).
    pub doc_count: u32,
    /// Entry point node.
    pub ep_node: NodeId,
    /// Entry point level.
    pub ep_level: u32,
    /// Vector row stride.
    pub node_stride: u32,
    /// Level-0 slot stride.
    pub neighbor_stride_l0: u32,
    /// Upper-level slot stride.
    pub neighbor_stride_upper: u32,
}

impl HnswHeader {
    /// Encodes into the fixed 128-byte layout.
    pub fn encode(&self) -> Result<[u8; HEADER_LEN]> {
        if self.metric_name.len() > METRIC_NAME_FIELD {
            return Err(Error::InvalidArgument(format!(
                "metric name too long: {}",
                self.metric_name.len()
            )));
        }
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        out[8] = self.element as u8;
        #[allow(clippy::cast_possible_truncation)]
        let name_len = self.metric_name.len() as u16;
        out[10..12].copy_from_slice(&name_len.to_le_bytes());
        out[12..12 + self.metric_name.len()].copy_from_slice(self.metric_name.as_bytes());

        let fields = [
            self.dimension,
            self.storage_dimension,
            self.m,
            self.m0,
            self.ef_construction,
            self.doc_count,
            self.ep_node,
            self.ep_level,
            self.node_stride,
            self.neighbor_stride_l0,
            self.neighbor_stride_upper,
        ];
        let mut pos = 12 + METRIC_NAME_FIELD; // 74
        pos = align_up(pos, 4); // 76
        for field in fields {
            out[pos..pos + 4].copy_from_slice(&field.to_le_bytes());
            pos += 4;
        }
        Ok(out)
    }

    /// Decodes and validates a header segment.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidFormat(format!(
                "header segment too small: {} bytes",
                bytes.len()
            )));
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != HEADER_MAGIC {
            return Err(Error::InvalidFormat("bad hnsw header magic".into()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != HEADER_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported hnsw header version {version}"
            )));
        }
        let element = ElementType::from_u8(bytes[8])?;
        let name_len = u16::from_le_bytes([bytes[10], bytes[11]]) as usize;
        if name_len > METRIC_NAME_FIELD {
            return Err(Error::InvalidFormat("metric name overflows header".into()));
        }
        let metric_name = std::str::from_utf8(&bytes[12..12 + name_len])
            .map_err(|_| Error::InvalidFormat("metric name is not utf-8".into()))?
            .to_string();

        let mut pos = align_up(12 + METRIC_NAME_FIELD, 4);
        let mut next = || {
            let v = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
            pos += 4;
            v
        };
        Ok(Self {
            element,
            metric_name,
            dimension: next(),
            storage_dimension: next(),
            m: next(),
            m0: next(),
            ef_construction: next(),
            doc_count: next(),
            ep_node: next(),
            ep_level: next(),
            node_stride: next(),
            neighbor_stride_l0: next(),
            neighbor_stride_upper: next(),
        })
    }
}
