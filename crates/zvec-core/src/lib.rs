//! # zvec-core
//!
//! Embeddable approximate-nearest-neighbor engine.
//!
//! zvec-core ingests high-dimensional vectors, builds graph indexes over
//! them, persists everything into a single chunk-backed container file,
//! and serves top-k similarity queries.
//!
//! ## Features
//!
//! - **HNSW index family**: concurrent graph construction, read-only
//!   mmap search, and a RaBitQ-compressed variant with exact reranking
//! - **Typed distance kernels**: FP32/FP16/BF16/INT8/INT4/binary elements
//!   with runtime SIMD dispatch (AVX-512, AVX2, NEON, scalar reference)
//! - **Metrics**: inner product, squared Euclidean, cosine, MIPS lift,
//!   quantized-integer wrapping
//! - **Chunk store**: one container file of named, checksummed segments,
//!   memory-mapped or resident
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use zvec_core::{ElementType, Index, ParamMap, QueryParams};
//!
//! fn main() -> zvec_core::Result<()> {
//!     let index = Index::create(
//!         "hnsw",
//!         ElementType::Fp32,
//!         64,
//!         "inner_product",
//!         &ParamMap::new(),
//!     )?;
//!
//!     index.add(7, &vec![0.1; 64])?;
//!
//!     let hits = index.search(&vec![0.1; 64], QueryParams::default())?;
//!     assert_eq!(hits[0].key, 7);
//!
//!     index.dump("./docs.zvi")?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
// Clippy lints configured in workspace Cargo.toml [workspace.lints.clippy]

pub mod config;
pub mod context;
#[cfg(test)]
mod context_tests;
pub mod element;
pub mod error;
pub mod features;
pub mod flat;
pub mod hnsw;
pub mod index;
pub mod kernels;
pub mod metric;
pub mod ordered;
pub mod quantize;
pub mod rabitq;
pub mod store;

pub use config::{
    AccessAdvice, HnswBuilderOptions, HnswSearcherOptions, OpenOptions, ParamMap, StorageKind,
    ZvecConfig,
};
pub use context::{CancelToken, GroupFn, KeyFilter, QueryParams, SearchContext, SearchHit};
pub use element::{ElementType, Key, NodeId, INVALID_KEY, INVALID_NODE};
pub use error::{to_code, Error, Result};
pub use features::FeaturesView;
pub use hnsw::{HnswBuilder, HnswSearcher};
pub use index::{registered_algorithms, Index, IndexMeta, IndexStats};
pub use kernels::{isa_level, IsaLevel, Tile};
pub use metric::{registered_metrics, Metric};
pub use rabitq::{RabitqParams, VectorProvider};
pub use store::{ByteView, Chunk, ChunkType, IndexStore, MemoryQuota};
