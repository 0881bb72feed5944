//! RaBitQ variant: HNSW over rotated, 1-bit-plus-residual codes.
//!
//! Vectors are rotated by a seeded orthonormal transform and quantized to
//! compact codes at add time; graph traversal scores estimated distances
//! by decoding codes on the fly. A reranking pass recomputes exact
//! distances over the final candidates from the original vectors, fetched
//! through a [`VectorProvider`] backed by the chunk store (or supplied by
//! the embedder).

pub mod quantizer;
pub mod rotator;

pub use quantizer::{train_centroids, RabitqQuantizer};
pub use rotator::{Rotator, RotatorType};

use std::io::Write;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{HnswBuilderOptions, HnswSearcherOptions, ParamMap};
use crate::context::SearchContext;
use crate::element::{ElementType, Key, NodeId};
use crate::error::{Error, Result};
use crate::hnsw::calc::DistCalc;
use crate::hnsw::level::xorshift64;
use crate::hnsw::meta::SEG_RABITQ;
use crate::hnsw::{HnswBuilder, HnswSearcher, SearcherEntity};
use crate::kernels::{kernel_set, KernelMetric, KernelSet};
use crate::metric::{Metric, INNER_PRODUCT, SQUARED_EUCLIDEAN};
use crate::store::{ByteView, ChunkType, ContainerWriter, IndexStore, MemoryQuota};

/// Original (unrotated) vectors kept for reranking.
pub const SEG_RABITQ_RAW: &str = "rabitq.raw_vectors";

const CONVERTER_HEADER_LEN: usize = 32;
const ROTATOR_BLOB_LEN: usize = 8;

/// Supplies original vectors for exact reranking.
pub trait VectorProvider: Send + Sync {
    /// Fetches the original vector stored under `key`.
    fn vector(&self, key: Key) -> Result<Vec<f32>>;
}

/// RaBitQ construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RabitqParams {
    /// Residual bits per dimension.
    pub ex_bits: u8,
    /// Optional k-means centroid count; `0` disables clustering.
    pub num_clusters: u32,
    /// Rotator flavor.
    pub rotator_type: RotatorType,
    /// Lloyd iterations for `train`.
    pub train_iterations: usize,
    /// Reservoir capacity for training samples.
    pub sample_capacity: usize,
}

impl Default for RabitqParams {
    fn default() -> Self {
        Self {
            ex_bits: 4,
            num_clusters: 0,
            rotator_type: RotatorType::FastHadamard,
            train_iterations: 10,
            sample_capacity: 8192,
        }
    }
}

impl RabitqParams {
    /// Parses parameters from the dotted-key map.
    pub fn from_params(params: &ParamMap) -> Result<Self> {
        let defaults = Self::default();
        let parse = |key: &str| -> Option<&String> { params.get(key) };
        let ex_bits = match parse("rabitq.ex_bits") {
            None => defaults.ex_bits,
            Some(raw) => raw.parse().map_err(|_| {
                Error::InvalidArgument(format!("bad value '{raw}' for rabitq.ex_bits"))
            })?,
        };
        let num_clusters = match parse("rabitq.num_clusters") {
            None => defaults.num_clusters,
            Some(raw) => raw.parse().map_err(|_| {
                Error::InvalidArgument(format!("bad value '{raw}' for rabitq.num_clusters"))
            })?,
        };
        let rotator_type = match parse("rabitq.rotator_type") {
            None => defaults.rotator_type,
            Some(raw) => RotatorType::parse(raw)?,
        };
        let train_iterations = match parse("rabitq.train_iterations") {
            None => defaults.train_iterations,
            Some(raw) => raw.parse().map_err(|_| {
                Error::InvalidArgument(format!(
                    "bad value '{raw}' for rabitq.train_iterations"
                ))
            })?,
        };
        if ex_bits > 8 {
            return Err(Error::InvalidArgument(format!(
                "rabitq.ex_bits must be <= 8, got {ex_bits}"
            )));
        }
        Ok(Self {
            ex_bits,
            num_clusters,
            rotator_type,
            train_iterations,
            sample_capacity: defaults.sample_capacity,
        })
    }
}

/// Seeded fixed-capacity reservoir sample.
struct Reservoir<T> {
    capacity: usize,
    seen: u64,
    state: u64,
    items: Vec<T>,
}

impl<T> Reservoir<T> {
    fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            seen: 0,
            state: if seed == 0 { 1 } else { seed },
            items: Vec::new(),
        }
    }

    fn offer(&mut self, item: T) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        self.state = xorshift64(self.state);
        #[allow(clippy::cast_possible_truncation)]
        let slot = (self.state % self.seen) as usize;
        if slot < self.capacity {
            self.items[slot] = item;
        }
    }

    fn items(&self) -> &[T] {
        &self.items
    }
}

fn origin_kernel_metric(metric: &Metric) -> Result<KernelMetric> {
    match metric.name() {
        INNER_PRODUCT => Ok(KernelMetric::InnerProduct),
        SQUARED_EUCLIDEAN => Ok(KernelMetric::SquaredEuclidean),
        other => Err(Error::Unsupported(format!(
            "rabitq does not support metric '{other}'"
        ))),
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

/// Estimated-distance calculator over codes.
struct RabitqCalc {
    quantizer: Arc<RwLock<RabitqQuantizer>>,
    kernels: &'static KernelSet,
    padded_dim: usize,
}

impl DistCalc for RabitqCalc {
    fn query_distance(&self, query: &[u8], record: &[u8]) -> f32 {
        let decoded = self.quantizer.read().decode(record);
        (self.kernels.distance)(query, bytemuck::cast_slice(&decoded), self.padded_dim)
    }

    fn record_distance(&self, a: &[u8], b: &[u8]) -> f32 {
        let quantizer = self.quantizer.read();
        let da = quantizer.decode(a);
        let db = quantizer.decode(b);
        (self.kernels.distance)(
            bytemuck::cast_slice(&da),
            bytemuck::cast_slice(&db),
            self.padded_dim,
        )
    }
}

// =============================================================================
// Converter segment codec
// =============================================================================

fn encode_converter(rotator: &Rotator, quantizer: &RabitqQuantizer) -> Vec<u8> {
    let padded_dim = rotator.padded_dim();
    #[allow(clippy::cast_possible_truncation)]
    let num_clusters = quantizer.centroids().len() as u32;
    let mut out = Vec::with_capacity(
        CONVERTER_HEADER_LEN + ROTATOR_BLOB_LEN + num_clusters as usize * padded_dim * 4,
    );
    #[allow(clippy::cast_possible_truncation)]
    {
        out.extend_from_slice(&num_clusters.to_le_bytes());
        out.extend_from_slice(&(rotator.dim() as u32).to_le_bytes());
        out.extend_from_slice(&(padded_dim as u32).to_le_bytes());
        out.extend_from_slice(&(ROTATOR_BLOB_LEN as u32).to_le_bytes());
    }
    out.push(quantizer.ex_bits());
    out.push(rotator.kind() as u8);
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&[0u8; 12]); // reserve
    out.extend_from_slice(&rotator.seed().to_le_bytes());
    for centroid in quantizer.centroids() {
        for value in centroid {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

struct ConverterState {
    rotator: Rotator,
    quantizer: RabitqQuantizer,
}

fn decode_converter(bytes: &[u8]) -> Result<ConverterState> {
    if bytes.len() < CONVERTER_HEADER_LEN + ROTATOR_BLOB_LEN {
        return Err(Error::InvalidFormat("rabitq converter truncated".into()));
    }
    let num_clusters = u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes"));
    let dim = u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes")) as usize;
    let padded_dim = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes")) as usize;
    let rotator_size = u32::from_le_bytes(bytes[12..16].try_into().expect("4 bytes")) as usize;
    let ex_bits = bytes[16];
    let rotator_type = RotatorType::from_u8(bytes[17])?;
    if rotator_size != ROTATOR_BLOB_LEN {
        return Err(Error::InvalidFormat(format!(
            "unexpected rotator blob size {rotator_size}"
        )));
    }
    let seed = u64::from_le_bytes(
        bytes[CONVERTER_HEADER_LEN..CONVERTER_HEADER_LEN + 8]
            .try_into()
            .expect("8 bytes"),
    );

    let rotator = Rotator::new(rotator_type, dim, seed)?;
    if rotator.padded_dim() != padded_dim {
        return Err(Error::InvalidFormat(format!(
            "rotator dims disagree: stored {padded_dim}, derived {}",
            rotator.padded_dim()
        )));
    }
    let mut quantizer = RabitqQuantizer::new(padded_dim, ex_bits)?;

    let centroid_base = CONVERTER_HEADER_LEN + ROTATOR_BLOB_LEN;
    let expected = num_clusters as usize * padded_dim * 4;
    if bytes.len() < centroid_base + expected {
        return Err(Error::InvalidFormat("rabitq centroids truncated".into()));
    }
    if num_clusters > 0 {
        let mut centroids = Vec::with_capacity(num_clusters as usize);
        for c in 0..num_clusters as usize {
            let base = centroid_base + c * padded_dim * 4;
            let centroid: Vec<f32> = (0..padded_dim)
                .map(|i| {
                    let off = base + i * 4;
                    f32::from_le_bytes([
                        bytes[off],
                        bytes[off + 1],
                        bytes[off + 2],
                        bytes[off + 3],
                    ])
                })
                .collect();
            centroids.push(centroid);
        }
        quantizer.set_centroids(centroids)?;
    }

    Ok(ConverterState { rotator, quantizer })
}

// =============================================================================
// Build mode
// =============================================================================

/// Build-mode RaBitQ index.
pub struct RabitqBuilder {
    inner: HnswBuilder,
    rotator: Rotator,
    quantizer: Arc<RwLock<RabitqQuantizer>>,
    params: RabitqParams,
    dimension: usize,
    origin_kernels: &'static KernelSet,
    raws: RwLock<Vec<u8>>,
    sample: Mutex<Reservoir<Vec<f32>>>,
    provider: RwLock<Option<Arc<dyn VectorProvider>>>,
}

impl std::fmt::Debug for RabitqBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabitqBuilder")
            .field("params", &self.params)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl RabitqBuilder {
    /// Creates an empty RaBitQ builder.
    pub fn new(
        metric: Metric,
        dimension: usize,
        options: HnswBuilderOptions,
        params: RabitqParams,
        quota: Arc<MemoryQuota>,
    ) -> Result<Self> {
        if metric.element() != ElementType::Fp32 {
            return Err(Error::Unsupported(
                "rabitq requires fp32 source vectors".into(),
            ));
        }
        let origin = origin_kernel_metric(&metric)?;
        let origin_kernels = kernel_set(ElementType::Fp32, origin)?;

        let rotator = Rotator::new(params.rotator_type, dimension, options.seed)?;
        let padded_dim = rotator.padded_dim();
        let quantizer = Arc::new(RwLock::new(RabitqQuantizer::new(
            padded_dim,
            params.ex_bits,
        )?));
        let code_bytes = quantizer.read().code_bytes();

        let calc = Arc::new(RabitqCalc {
            quantizer: Arc::clone(&quantizer),
            kernels: origin_kernels,
            padded_dim,
        });
        let seed = options.seed;
        let inner = HnswBuilder::with_parts(
            metric,
            dimension,
            padded_dim,
            code_bytes,
            options,
            quota,
            calc,
        )?;

        Ok(Self {
            inner,
            rotator,
            quantizer,
            params,
            dimension,
            origin_kernels,
            raws: RwLock::new(Vec::new()),
            sample: Mutex::new(Reservoir::new(params.sample_capacity, seed)),
            provider: RwLock::new(None),
        })
    }

    /// Replaces the rerank vector source.
    pub fn set_vector_provider(&self, provider: Arc<dyn VectorProvider>) {
        *self.provider.write() = Some(provider);
    }

    /// Number of assigned nodes.
    #[must_use]
    pub fn doc_count(&self) -> u32 {
        self.inner.doc_count()
    }

    /// Number of live keys.
    #[must_use]
    pub fn live_count(&self) -> u64 {
        self.inner.live_count()
    }

    /// Caller-facing dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Inserts one vector under `key`.
    pub fn add(&self, key: Key, vector: &[f32]) -> Result<NodeId> {
        if vector.len() != self.dimension {
            return Err(Error::Mismatch(format!(
                "vector has {} dims, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        let rotated = self.rotator.rotate(vector);
        self.sample.lock().offer(rotated.clone());
        let code = self.quantizer.read().encode(&rotated);
        let node = self.inner.add_record_with_ef(
            key,
            &code,
            self.inner.options().ef_construction,
        )?;

        let row = self.dimension * 4;
        let mut raws = self.raws.write();
        let need = (node as usize + 1) * row;
        if raws.len() < need {
            raws.resize(need, 0);
        }
        raws[node as usize * row..need].copy_from_slice(&f32_bytes(vector));
        Ok(node)
    }

    /// Trains centroids from the reservoir sample and re-encodes every
    /// stored code against them. A no-op when clustering is disabled.
    pub fn train(&self) -> Result<()> {
        if self.params.num_clusters == 0 {
            return Ok(());
        }
        let sample = self.sample.lock();
        if sample.items().is_empty() {
            return Err(Error::InvalidArgument(
                "rabitq train requires at least one added vector".into(),
            ));
        }
        let centroids = train_centroids(
            sample.items(),
            self.params.num_clusters as usize,
            self.params.train_iterations,
            self.inner.options().seed,
        );
        drop(sample);
        self.quantizer.write().set_centroids(centroids)?;

        // Refresh codes under the trained codebook.
        let row = self.dimension * 4;
        let raws = self.raws.read();
        let quantizer = self.quantizer.read();
        for node in 0..self.inner.doc_count() {
            let base = node as usize * row;
            let original: Vec<f32> = raws[base..base + row]
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let code = quantizer.encode(&self.rotator.rotate(&original));
            self.inner.entity().rewrite_vector(node, &code);
        }
        tracing::info!(
            clusters = self.params.num_clusters,
            docs = self.inner.doc_count(),
            "rabitq centroids trained and codes refreshed"
        );
        Ok(())
    }

    fn original_of_key(&self, key: Key) -> Result<Vec<f32>> {
        if let Some(provider) = self.provider.read().as_ref() {
            return provider.vector(key);
        }
        let node = self
            .inner
            .node_of_key(key)
            .ok_or_else(|| Error::NoExist(format!("key {key} not present")))?;
        let row = self.dimension * 4;
        let raws = self.raws.read();
        let base = node as usize * row;
        let slice = raws
            .get(base..base + row)
            .ok_or_else(|| Error::NoExist(format!("vector for key {key} not yet visible")))?;
        Ok(slice
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Runs one query: estimated traversal, then exact rerank.
    pub fn search_into(
        &self,
        ctx: &mut SearchContext,
        query_index: usize,
        query: &[f32],
        brute_force_threshold: usize,
    ) -> Result<()> {
        if query.len() != self.dimension {
            return Err(Error::Mismatch(format!(
                "query has {} dims, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        let rotated = self.rotator.rotate(query);
        let rotated_bytes = f32_bytes(&rotated);
        self.inner
            .search_prepared(ctx, query_index, &rotated_bytes, brute_force_threshold)?;

        let query_bytes = f32_bytes(query);
        ctx.rescore(query_index, |hit| {
            let original = self.original_of_key(hit.key)?;
            Ok((self.origin_kernels.distance)(
                &query_bytes,
                &f32_bytes(&original),
                self.dimension,
            ))
        })?;
        if ctx.fetch_vector() {
            let row = self.dimension * 4;
            let raws = self.raws.read();
            ctx.attach_vectors(query_index, |node| {
                let base = node as usize * row;
                raws.get(base..base + row).map(<[u8]>::to_vec)
            });
        }
        Ok(())
    }

    /// Tombstones `key`.
    pub fn mark_deleted(&self, key: Key) -> Result<()> {
        self.inner.mark_deleted(key)
    }

    /// Original vector stored under `key`.
    pub fn vector_of_key(&self, key: Key) -> Result<Vec<u8>> {
        Ok(f32_bytes(&self.original_of_key(key)?))
    }

    /// Dumps graph, converter, and raw-vector segments.
    pub fn dump<W: Write>(&self, writer: &mut ContainerWriter<W>) -> Result<()> {
        self.inner.dump(writer)?;
        let converter = {
            let quantizer = self.quantizer.read();
            encode_converter(&self.rotator, &quantizer)
        };
        writer.write_segment(SEG_RABITQ, ChunkType::Converter, &converter)?;
        writer.write_segment(SEG_RABITQ_RAW, ChunkType::Vectors, &self.raws.read())?;
        Ok(())
    }
}

// =============================================================================
// Search mode
// =============================================================================

/// Search-mode RaBitQ index.
pub struct RabitqSearcher {
    inner: HnswSearcher,
    rotator: Rotator,
    dimension: usize,
    origin_kernels: &'static KernelSet,
    raws: ByteView,
    provider: RwLock<Option<Arc<dyn VectorProvider>>>,
}

impl RabitqSearcher {
    /// Loads a dumped RaBitQ index from its container.
    pub fn load(store: &IndexStore, metric: Metric, options: HnswSearcherOptions) -> Result<Self> {
        let origin = origin_kernel_metric(&metric)?;
        let origin_kernels = kernel_set(ElementType::Fp32, origin)?;

        if !store.has_segment(SEG_RABITQ) {
            return Err(Error::InvalidFormat(
                "container has no rabitq converter segment".into(),
            ));
        }
        let converter_bytes = store.get_chunk(SEG_RABITQ, 0).pin()?;
        let state = decode_converter(&converter_bytes)?;
        drop(converter_bytes);

        let mut entity = SearcherEntity::load(store)?;
        entity.override_record_bytes(state.quantizer.code_bytes())?;
        let dimension = entity.header().dimension as usize;
        if state.rotator.dim() != dimension {
            return Err(Error::InvalidFormat(format!(
                "rotator dimension {} disagrees with header {}",
                state.rotator.dim(),
                dimension
            )));
        }

        let padded_dim = state.rotator.padded_dim();
        let quantizer = Arc::new(RwLock::new(state.quantizer));
        let calc = Arc::new(RabitqCalc {
            quantizer: Arc::clone(&quantizer),
            kernels: kernel_set(ElementType::Fp32, origin)?,
            padded_dim,
        });
        let inner = HnswSearcher::with_calc(metric, entity, options, calc)?;

        if !store.has_segment(SEG_RABITQ_RAW) {
            return Err(Error::InvalidFormat(
                "container has no rabitq raw-vector segment".into(),
            ));
        }
        let raws = store.get_chunk(SEG_RABITQ_RAW, 0).pin()?;

        Ok(Self {
            inner,
            rotator: state.rotator,
            dimension,
            origin_kernels,
            raws,
            provider: RwLock::new(None),
        })
    }

    /// Replaces the rerank vector source.
    pub fn set_vector_provider(&self, provider: Arc<dyn VectorProvider>) {
        *self.provider.write() = Some(provider);
    }

    /// Underlying entity.
    #[must_use]
    pub fn entity(&self) -> &SearcherEntity {
        self.inner.entity()
    }

    /// Caller-facing dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn raw_row(&self, node: NodeId) -> &[u8] {
        let row = self.dimension * 4;
        &self.raws[node as usize * row..(node as usize + 1) * row]
    }

    fn original_of_key(&self, key: Key) -> Result<Vec<f32>> {
        if let Some(provider) = self.provider.read().as_ref() {
            return provider.vector(key);
        }
        let node = self
            .entity()
            .node_of_key(key)
            .ok_or_else(|| Error::NoExist(format!("key {key} not present")))?;
        Ok(self
            .raw_row(node)
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Runs one query: estimated traversal, then exact rerank.
    pub fn search_into(
        &self,
        ctx: &mut SearchContext,
        query_index: usize,
        query: &[f32],
    ) -> Result<()> {
        if query.len() != self.dimension {
            return Err(Error::Mismatch(format!(
                "query has {} dims, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        let rotated = self.rotator.rotate(query);
        let rotated_bytes = f32_bytes(&rotated);
        self.inner.search_prepared(ctx, query_index, &rotated_bytes)?;

        let query_bytes = f32_bytes(query);
        ctx.rescore(query_index, |hit| {
            let original = self.original_of_key(hit.key)?;
            Ok((self.origin_kernels.distance)(
                &query_bytes,
                &f32_bytes(&original),
                self.dimension,
            ))
        })?;
        if ctx.fetch_vector() {
            ctx.attach_vectors(query_index, |node| Some(self.raw_row(node).to_vec()));
        }
        Ok(())
    }

    /// Exact retrieval by keys, returning original vector bytes.
    #[must_use]
    pub fn search_by_keys(&self, keys: &[Key]) -> Vec<Option<(NodeId, Vec<u8>)>> {
        keys.iter()
            .map(|&key| {
                self.entity()
                    .node_of_key(key)
                    .map(|node| (node, self.raw_row(node).to_vec()))
            })
            .collect()
    }

    /// Tombstones `key`.
    pub fn mark_deleted(&self, key: Key) -> Result<()> {
        self.inner.mark_deleted(key)
    }
}

#[cfg(test)]
mod rabitq_tests;
