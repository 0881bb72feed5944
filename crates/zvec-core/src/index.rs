//! The public `Index` facade.
//!
//! One `Index` wraps a concrete algorithm behind a closed enum: the HNSW
//! graph, its RaBitQ variant, or the exact flat scan. Algorithm names are
//! resolved through a table built at startup; `ivf` and `flat_sparse` are
//! reserved but not built. Every operation returns `Result`; embedders
//! that speak integer codes use [`crate::error::to_code`], which maps
//! success to `0` and failures to their `§6.4`-style negative code.

use std::collections::HashMap;
use std::io::BufWriter;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::config::{HnswBuilderOptions, HnswSearcherOptions, OpenOptions, ParamMap};
use crate::context::{QueryParams, SearchContext, SearchHit};
use crate::element::{ElementType, Key};
use crate::error::{Error, Result};
use crate::features::FeaturesView;
use crate::flat::{FlatBuilder, FlatSearcher};
use crate::hnsw::meta::{SEG_META, SEG_METRIC, SEG_VECTORS};
use crate::hnsw::{HnswBuilder, HnswSearcher, SearcherEntity};
use crate::kernels::isa_level;
use crate::metric::{Metric, MetricMeta};
use crate::rabitq::{RabitqBuilder, RabitqParams, RabitqSearcher};
use crate::store::{ChunkType, ContainerWriter, IndexStore, SegmentInfo};

/// HNSW graph index.
pub const ALGO_HNSW: &str = "hnsw";
/// HNSW over RaBitQ codes.
pub const ALGO_HNSW_RABITQ: &str = "hnsw_rabitq";
/// Exact flat scan.
pub const ALGO_FLAT: &str = "flat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Hnsw,
    HnswRabitq,
    Flat,
    Reserved,
}

fn algorithm_table() -> &'static HashMap<&'static str, Algorithm> {
    static TABLE: OnceLock<HashMap<&'static str, Algorithm>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        table.insert(ALGO_HNSW, Algorithm::Hnsw);
        table.insert(ALGO_HNSW_RABITQ, Algorithm::HnswRabitq);
        table.insert(ALGO_FLAT, Algorithm::Flat);
        table.insert("ivf", Algorithm::Reserved);
        table.insert("flat_sparse", Algorithm::Reserved);
        table
    })
}

fn resolve_algorithm(name: &str) -> Result<Algorithm> {
    match algorithm_table().get(name) {
        Some(Algorithm::Reserved) => Err(Error::NotImplemented(format!(
            "algorithm '{name}' is reserved but not built"
        ))),
        Some(algorithm) => Ok(*algorithm),
        None => Err(Error::Unsupported(format!("unknown algorithm '{name}'"))),
    }
}

/// Persistent identity of an index, stored in the `index.meta` blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Algorithm name.
    pub algorithm: String,
    /// Element type of caller vectors.
    pub element: ElementType,
    /// Caller-facing dimension.
    pub dimension: u32,
    /// Metric identity.
    pub metric: MetricMeta,
}

/// Aggregate statistics for `stats()`.
#[derive(Debug, Clone)]
pub struct IndexStats {
    /// Algorithm name.
    pub algorithm: String,
    /// Assigned nodes, tombstones included.
    pub doc_count: u64,
    /// Live (searchable) keys.
    pub live_count: u64,
    /// Tombstoned nodes.
    pub tombstone_count: u64,
    /// Entry point level (graph algorithms).
    pub entry_point_level: u32,
    /// Per-segment sizes for loaded containers.
    pub segments: Vec<SegmentInfo>,
    /// Kernel dispatch level.
    pub isa: &'static str,
}

enum IndexState {
    HnswBuild(HnswBuilder),
    HnswSearch(HnswSearcher),
    RabitqBuild(Box<RabitqBuilder>),
    RabitqSearch(Box<RabitqSearcher>),
    FlatBuild(FlatBuilder),
    FlatSearch(FlatSearcher),
    Closed,
}

/// A logical vector index.
pub struct Index {
    meta: IndexMeta,
    state: IndexState,
    searcher_options: HnswSearcherOptions,
    store: Option<IndexStore>,
    read_only: bool,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("meta", &self.meta)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Index {
    /// Creates an empty build-mode index.
    pub fn create(
        algorithm: &str,
        element: ElementType,
        dimension: usize,
        metric_name: &str,
        params: &ParamMap,
    ) -> Result<Self> {
        let resolved = resolve_algorithm(algorithm)?;
        let metric = Metric::create(metric_name, element, params)?;
        let builder_options = HnswBuilderOptions::from_params(params)?;
        let searcher_options = HnswSearcherOptions::from_params(params)?;

        let store = IndexStore::create_memory(builder_options.memory_limit_bytes);
        let quota = store.quota();

        let state = match resolved {
            Algorithm::Hnsw => IndexState::HnswBuild(HnswBuilder::new(
                metric.clone(),
                dimension,
                builder_options,
                quota,
            )?),
            Algorithm::HnswRabitq => {
                let rabitq_params = RabitqParams::from_params(params)?;
                IndexState::RabitqBuild(Box::new(RabitqBuilder::new(
                    metric.clone(),
                    dimension,
                    builder_options,
                    rabitq_params,
                    quota,
                )?))
            }
            Algorithm::Flat => IndexState::FlatBuild(FlatBuilder::new(
                metric.clone(),
                dimension,
                &builder_options,
                quota,
            )?),
            Algorithm::Reserved => unreachable!("rejected by resolve_algorithm"),
        };

        tracing::info!(
            algorithm,
            element = element.name(),
            dimension,
            metric = metric_name,
            "index created"
        );
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            meta: IndexMeta {
                algorithm: algorithm.to_string(),
                element,
                dimension: dimension as u32,
                metric: metric.meta().clone(),
            },
            state,
            searcher_options,
            store: Some(store),
            read_only: false,
        })
    }

    /// Opens a dumped index container.
    ///
    /// Structural corruption surfaces as `Io`, and the handle stays
    /// closed.
    pub fn open<P: AsRef<Path>>(
        path: P,
        options: OpenOptions,
        params: &ParamMap,
    ) -> Result<Self> {
        Self::open_inner(path.as_ref(), options, params).map_err(|err| match err {
            Error::InvalidFormat(message) => Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                message,
            )),
            other => other,
        })
    }

    fn open_inner(path: &Path, options: OpenOptions, params: &ParamMap) -> Result<Self> {
        let store = IndexStore::open(path, options)?;
        if !store.has_segment(SEG_META) {
            return Err(Error::InvalidFormat("container has no index meta".into()));
        }
        let meta_bytes = store.get_chunk(SEG_META, 0).pin()?;
        let meta: IndexMeta = bincode::deserialize(&meta_bytes)
            .map_err(|e| Error::InvalidFormat(format!("index meta blob: {e}")))?;
        drop(meta_bytes);

        let algorithm = resolve_algorithm(&meta.algorithm)?;
        let metric = Metric::from_meta(&meta.metric, meta.element)?;
        let searcher_options = HnswSearcherOptions::from_params(params)?;

        let state = match algorithm {
            Algorithm::Hnsw => {
                let entity = SearcherEntity::load(&store)?;
                IndexState::HnswSearch(HnswSearcher::new(metric, entity, searcher_options)?)
            }
            Algorithm::HnswRabitq => IndexState::RabitqSearch(Box::new(RabitqSearcher::load(
                &store,
                metric,
                searcher_options,
            )?)),
            Algorithm::Flat => {
                IndexState::FlatSearch(FlatSearcher::load(&store, metric, searcher_options)?)
            }
            Algorithm::Reserved => unreachable!("rejected by resolve_algorithm"),
        };

        tracing::info!(
            path = %path.display(),
            algorithm = meta.algorithm,
            read_only = options.read_only,
            "index opened"
        );
        Ok(Self {
            meta,
            state,
            searcher_options,
            store: Some(store),
            read_only: options.read_only,
        })
    }

    /// Closes the index; further operations fail with `InvalidArgument`.
    pub fn close(&mut self) {
        self.state = IndexState::Closed;
        self.store = None;
    }

    /// Persistent identity.
    #[must_use]
    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    /// True when the handle was opened read-only.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    fn closed_error() -> Error {
        Error::InvalidArgument("index is closed".into())
    }

    /// Inserts one vector.
    pub fn add(&self, key: Key, vector: &[f32]) -> Result<()> {
        match &self.state {
            IndexState::HnswBuild(builder) => builder.add(key, vector).map(|_| ()),
            IndexState::RabitqBuild(builder) => builder.add(key, vector).map(|_| ()),
            IndexState::FlatBuild(builder) => builder.add(key, vector).map(|_| ()),
            IndexState::Closed => Err(Self::closed_error()),
            _ => Err(Error::Unsupported(
                "add is not available on a loaded index".into(),
            )),
        }
    }

    /// Inserts a batch in parallel where the algorithm supports it.
    pub fn add_batch(&self, items: &[(Key, Vec<f32>)]) -> Vec<Result<()>> {
        match &self.state {
            IndexState::HnswBuild(builder) => builder
                .add_batch(items)
                .into_iter()
                .map(|r| r.map(|_| ()))
                .collect(),
            _ => items
                .iter()
                .map(|(key, vector)| self.add(*key, vector))
                .collect(),
        }
    }

    /// Tombstones `key`.
    pub fn remove(&self, key: Key) -> Result<()> {
        match &self.state {
            IndexState::HnswBuild(builder) => builder.mark_deleted(key),
            IndexState::HnswSearch(searcher) => searcher.mark_deleted(key),
            IndexState::RabitqBuild(builder) => builder.mark_deleted(key),
            IndexState::RabitqSearch(searcher) => searcher.mark_deleted(key),
            IndexState::FlatBuild(builder) => builder.mark_deleted(key),
            IndexState::FlatSearch(searcher) => searcher.mark_deleted(key),
            IndexState::Closed => Err(Self::closed_error()),
        }
    }

    /// Trains the index where the algorithm requires it.
    ///
    /// A no-op `Ok` for HNSW and flat; RaBitQ trains its centroid
    /// codebook.
    pub fn train(&self) -> Result<()> {
        match &self.state {
            IndexState::RabitqBuild(builder) => builder.train(),
            IndexState::HnswBuild(_) | IndexState::FlatBuild(_) => Ok(()),
            IndexState::Closed => Err(Self::closed_error()),
            _ => Err(Error::Unsupported(
                "train is not available on a loaded index".into(),
            )),
        }
    }

    /// Runs one query and returns its hits sorted ascending by score.
    pub fn search(&self, query: &[f32], params: QueryParams) -> Result<Vec<SearchHit>> {
        let mut ctx = SearchContext::new(params)?;
        self.search_with_context(&mut ctx, 0, query)?;
        Ok(ctx.into_results().into_iter().next().unwrap_or_default())
    }

    /// Runs one query of a batch into an existing context.
    pub fn search_with_context(
        &self,
        ctx: &mut SearchContext,
        query_index: usize,
        query: &[f32],
    ) -> Result<()> {
        match &self.state {
            IndexState::HnswBuild(builder) => builder.search_into(
                ctx,
                query_index,
                query,
                self.searcher_options.brute_force_threshold,
            ),
            IndexState::HnswSearch(searcher) => searcher.search_into(ctx, query_index, query),
            IndexState::RabitqBuild(builder) => builder.search_into(
                ctx,
                query_index,
                query,
                self.searcher_options.brute_force_threshold,
            ),
            IndexState::RabitqSearch(searcher) => searcher.search_into(ctx, query_index, query),
            IndexState::FlatBuild(builder) => builder.search_into(ctx, query_index, query),
            IndexState::FlatSearch(searcher) => searcher.search_into(ctx, query_index, query),
            IndexState::Closed => Err(Self::closed_error()),
        }
    }

    /// Exact retrieval: stored bytes per requested key, `None` per miss.
    pub fn search_by_keys(&self, keys: &[Key]) -> Result<Vec<Option<Vec<u8>>>> {
        match &self.state {
            IndexState::HnswBuild(builder) => Ok(keys
                .iter()
                .map(|&key| builder.vector_of_key(key).ok())
                .collect()),
            IndexState::HnswSearch(searcher) => Ok(searcher
                .search_by_keys(keys)
                .into_iter()
                .map(|found| found.map(|(_, bytes)| bytes))
                .collect()),
            IndexState::RabitqBuild(builder) => Ok(keys
                .iter()
                .map(|&key| builder.vector_of_key(key).ok())
                .collect()),
            IndexState::RabitqSearch(searcher) => Ok(searcher
                .search_by_keys(keys)
                .into_iter()
                .map(|found| found.map(|(_, bytes)| bytes))
                .collect()),
            IndexState::FlatBuild(builder) => Ok(keys
                .iter()
                .map(|&key| builder.vector_of_key(key).ok())
                .collect()),
            IndexState::FlatSearch(searcher) => Ok(searcher
                .search_by_keys(keys)
                .into_iter()
                .map(|found| found.map(|(_, bytes)| bytes))
                .collect()),
            IndexState::Closed => Err(Self::closed_error()),
        }
    }

    /// Number of live (searchable) documents.
    #[must_use]
    pub fn get_doc_count(&self) -> u64 {
        match &self.state {
            IndexState::HnswBuild(builder) => builder.live_count(),
            IndexState::HnswSearch(searcher) => searcher.entity().live_count(),
            IndexState::RabitqBuild(builder) => builder.live_count(),
            IndexState::RabitqSearch(searcher) => searcher.entity().live_count(),
            IndexState::FlatBuild(builder) => builder.live_count(),
            IndexState::FlatSearch(searcher) => searcher.entity().live_count(),
            IndexState::Closed => 0,
        }
    }

    /// Writes the index into a container file at `path`.
    pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        match &self.state {
            IndexState::HnswBuild(_)
            | IndexState::RabitqBuild(_)
            | IndexState::FlatBuild(_) => {
                let file = std::fs::File::create(path)?;
                let mut writer = ContainerWriter::new(BufWriter::new(file));
                match &self.state {
                    IndexState::HnswBuild(builder) => builder.dump(&mut writer)?,
                    IndexState::RabitqBuild(builder) => builder.dump(&mut writer)?,
                    IndexState::FlatBuild(builder) => builder.dump(&mut writer)?,
                    _ => unreachable!("outer match covers build states"),
                }
                let meta_blob = bincode::serialize(&self.meta)
                    .map_err(|e| Error::Internal(format!("meta blob: {e}")))?;
                writer.write_segment(SEG_META, ChunkType::Meta, &meta_blob)?;
                let metric_blob = bincode::serialize(&self.meta.metric)
                    .map_err(|e| Error::Internal(format!("metric blob: {e}")))?;
                writer.write_segment(SEG_METRIC, ChunkType::Metric, &metric_blob)?;
                writer.finish()?;
                tracing::info!(path = %path.display(), "index dumped");
                Ok(())
            }
            IndexState::Closed => Err(Self::closed_error()),
            _ => {
                // A loaded container copies its segments through the store.
                let store = self
                    .store
                    .as_ref()
                    .ok_or_else(|| Error::Internal("loaded index lost its store".into()))?;
                store.dump_to(path)
            }
        }
    }

    /// Read-only typed view over the stored vector rows of a loaded
    /// plain-vector index.
    pub fn features(&self) -> Result<FeaturesView> {
        let entity = match &self.state {
            IndexState::HnswSearch(searcher) => searcher.entity(),
            IndexState::FlatSearch(searcher) => searcher.entity(),
            IndexState::Closed => return Err(Self::closed_error()),
            _ => {
                return Err(Error::Unsupported(
                    "features view requires a loaded plain-vector index".into(),
                ))
            }
        };
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::Internal("loaded index lost its store".into()))?;
        let header = entity.header();
        FeaturesView::new(
            store.get_chunk(SEG_VECTORS, 0).pin()?,
            header.element,
            header.storage_dimension as usize,
            header.node_stride as usize,
            header.doc_count as usize,
        )
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let (doc_count, live_count, entry_point_level) = match &self.state {
            IndexState::HnswBuild(builder) => (
                u64::from(builder.doc_count()),
                builder.live_count(),
                u32::from(builder.entry_point().level),
            ),
            IndexState::HnswSearch(searcher) => (
                u64::from(searcher.entity().doc_count()),
                searcher.entity().live_count(),
                searcher.entity().header().ep_level,
            ),
            IndexState::RabitqBuild(builder) => {
                (u64::from(builder.doc_count()), builder.live_count(), 0)
            }
            IndexState::RabitqSearch(searcher) => (
                u64::from(searcher.entity().doc_count()),
                searcher.entity().live_count(),
                searcher.entity().header().ep_level,
            ),
            IndexState::FlatBuild(builder) => {
                (u64::from(builder.doc_count()), builder.live_count(), 0)
            }
            IndexState::FlatSearch(searcher) => (
                u64::from(searcher.entity().doc_count()),
                searcher.entity().live_count(),
                0,
            ),
            IndexState::Closed => (0, 0, 0),
        };
        IndexStats {
            algorithm: self.meta.algorithm.clone(),
            doc_count,
            live_count,
            tombstone_count: doc_count - live_count,
            entry_point_level,
            segments: self.store.as_ref().map(IndexStore::directory).unwrap_or_default(),
            isa: isa_level().name(),
        }
    }
}

/// Names of all registered algorithms, reserved ones included.
#[must_use]
pub fn registered_algorithms() -> Vec<&'static str> {
    let mut names: Vec<_> = algorithm_table().keys().copied().collect();
    names.sort_unstable();
    names
}
