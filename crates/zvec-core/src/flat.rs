//! Exact flat index: the non-graph sibling of the HNSW family.
//!
//! Records share the HNSW entity layout with every node at level 0 and no
//! edges, so a flat container loads through the same segments and the
//! searcher side is simply the HNSW searcher pinned to its linear-scan
//! path. Searches are exact by construction.

use std::io::Write;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::{HnswBuilderOptions, HnswSearcherOptions};
use crate::context::SearchContext;
use crate::element::{encode_vector, Key, NodeId, INVALID_KEY, INVALID_NODE};
use crate::error::{Error, Result};
use crate::hnsw::calc::{DistCalc, KernelCalc};
use crate::hnsw::{BuilderEntity, HnswSearcher, SearcherEntity};
use crate::metric::Metric;
use crate::store::{ContainerWriter, IndexStore, MemoryQuota};

/// Build-mode exact index.
pub struct FlatBuilder {
    metric: Metric,
    dimension: usize,
    entity: BuilderEntity,
    calc: KernelCalc,
    key_map: DashMap<Key, NodeId>,
    allow_duplicate_keys: bool,
}

impl FlatBuilder {
    /// Creates an empty flat index.
    pub fn new(
        metric: Metric,
        dimension: usize,
        options: &HnswBuilderOptions,
        quota: Arc<MemoryQuota>,
    ) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidArgument("dimension must be >= 1".into()));
        }
        quota.set_limit(options.memory_limit_bytes);
        let storage_dimension = metric.storage_dimension(dimension);
        // Minimal neighbor slots; flat nodes never link.
        let entity = BuilderEntity::new(metric.element(), storage_dimension, 1, 1, quota);
        let calc = KernelCalc::new(metric.kernels(), storage_dimension);
        Ok(Self {
            metric,
            dimension,
            entity,
            calc,
            key_map: DashMap::new(),
            allow_duplicate_keys: options.allow_duplicate_keys,
        })
    }

    /// Number of assigned rows, tombstones included.
    #[must_use]
    pub fn doc_count(&self) -> u32 {
        self.entity.doc_count()
    }

    /// Number of live keys.
    #[must_use]
    pub fn live_count(&self) -> u64 {
        self.key_map.len() as u64
    }

    /// Caller-facing dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Appends one vector under `key`.
    pub fn add(&self, key: Key, vector: &[f32]) -> Result<NodeId> {
        if key == INVALID_KEY {
            return Err(Error::InvalidArgument("key 0 is reserved".into()));
        }
        if vector.len() != self.dimension {
            return Err(Error::Mismatch(format!(
                "vector has {} dims, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        if !self.allow_duplicate_keys && self.key_map.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("key {key} already present")));
        }
        let mut values = vector.to_vec();
        self.metric.store_preprocess(&mut values)?;
        let record = encode_vector(self.metric.element(), &values);
        let node = self.entity.add_vector(0, key, &record)?;
        self.key_map.insert(key, node);
        Ok(node)
    }

    /// Tombstones `key`.
    pub fn mark_deleted(&self, key: Key) -> Result<()> {
        let Some((_, node)) = self.key_map.remove(&key) else {
            return Err(Error::NoExist(format!("key {key} not present")));
        };
        self.entity.set_key(node, INVALID_KEY);
        Ok(())
    }

    /// Record bytes stored under `key`.
    pub fn vector_of_key(&self, key: Key) -> Result<Vec<u8>> {
        let node = self
            .key_map
            .get(&key)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::NoExist(format!("key {key} not present")))?;
        Ok(self.entity.vector_copy(node))
    }

    /// Exact scan into `ctx`, filling output slot `query_index`.
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
        let mut values = query.to_vec();
        self.metric.query_preprocess(&mut values)?;
        let bytes = encode_vector(self.metric.element(), &values);

        let doc_count = self.entity.doc_count();
        if doc_count == 0 || ctx.topk() == 0 {
            ctx.topk_to_result(query_index);
            return Ok(());
        }

        let stride = self.entity.node_stride();
        let mut scores = [0.0f32; 8];
        let mut node: u32 = 0;
        while node < doc_count {
            ctx.check_interrupt()?;
            let remaining = (doc_count - node) as usize;
            let lanes = remaining.min(8);
            self.entity.with_vector_buffer(|buffer| {
                self.calc.query_batch(
                    &bytes,
                    &buffer[node as usize * stride..],
                    stride,
                    &mut scores[..lanes],
                );
            });
            for (lane, &score) in scores.iter().enumerate().take(lanes) {
                #[allow(clippy::cast_possible_truncation)]
                let candidate = node + lane as u32;
                let key = self.entity.key(candidate);
                if key == INVALID_KEY {
                    continue;
                }
                ctx.push(key, score, candidate);
            }
            #[allow(clippy::cast_possible_truncation)]
            {
                node += lanes as u32;
            }
        }

        ctx.topk_to_result(query_index);
        if ctx.fetch_vector() {
            ctx.attach_vectors(query_index, |node| Some(self.entity.vector_copy(node)));
        }
        Ok(())
    }

    /// Dumps the flat container (HNSW-compatible segments, no edges).
    pub fn dump<W: Write>(&self, writer: &mut ContainerWriter<W>) -> Result<()> {
        self.entity
            .dump(writer, self.metric.name(), self.dimension, 0, INVALID_NODE, 0)
    }
}

/// Search-mode exact index: the HNSW searcher pinned to linear scans.
pub struct FlatSearcher {
    inner: HnswSearcher,
}

impl FlatSearcher {
    /// Loads a flat container.
    pub fn load(store: &IndexStore, metric: Metric, options: HnswSearcherOptions) -> Result<Self> {
        let entity = SearcherEntity::load(store)?;
        let inner = HnswSearcher::new(
            metric,
            entity,
            HnswSearcherOptions {
                brute_force_threshold: usize::MAX,
                ..options
            },
        )?;
        Ok(Self { inner })
    }

    /// Underlying entity.
    #[must_use]
    pub fn entity(&self) -> &SearcherEntity {
        self.inner.entity()
    }

    /// Caller-facing dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    /// Exact scan into `ctx`.
    pub fn search_into(
        &self,
        ctx: &mut SearchContext,
        query_index: usize,
        query: &[f32],
    ) -> Result<()> {
        self.inner.search_into(ctx, query_index, query)
    }

    /// Exact retrieval by keys.
    #[must_use]
    pub fn search_by_keys(&self, keys: &[Key]) -> Vec<Option<(NodeId, Vec<u8>)>> {
        self.inner.search_by_keys(keys)
    }

    /// Tombstones `key`.
    pub fn mark_deleted(&self, key: Key) -> Result<()> {
        self.inner.mark_deleted(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OpenOptions, ParamMap};
    use crate::context::QueryParams;
    use crate::element::ElementType;

    fn sample_builder() -> FlatBuilder {
        let metric = Metric::create(
            crate::metric::SQUARED_EUCLIDEAN,
            ElementType::Fp32,
            &ParamMap::new(),
        )
        .unwrap();
        FlatBuilder::new(
            metric,
            4,
            &HnswBuilderOptions::default(),
            Arc::new(MemoryQuota::new(0)),
        )
        .unwrap()
    }

    #[test]
    fn test_exact_search_orders_by_distance() {
        let builder = sample_builder();
        builder.add(1, &[0.0, 0.0, 0.0, 0.0]).unwrap();
        builder.add(2, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        builder.add(3, &[2.0, 0.0, 0.0, 0.0]).unwrap();

        let mut ctx = SearchContext::new(QueryParams {
            topk: 3,
            ..QueryParams::default()
        })
        .unwrap();
        builder.search_into(&mut ctx, 0, &[0.9, 0.0, 0.0, 0.0]).unwrap();
        let keys: Vec<u64> = ctx.result(0).iter().map(|h| h.key).collect();
        assert_eq!(keys, vec![2, 1, 3]);
    }

    #[test]
    fn test_flat_round_trip() {
        let builder = sample_builder();
        for i in 1..=20u64 {
            builder
                .add(i, &[i as f32, 0.0, 0.0, 0.0])
                .unwrap();
        }
        builder.mark_deleted(5).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.zvi");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ContainerWriter::new(std::io::BufWriter::new(file));
        builder.dump(&mut writer).unwrap();
        writer.finish().unwrap();

        let store = IndexStore::open(&path, OpenOptions::read_only()).unwrap();
        let metric = Metric::create(
            crate::metric::SQUARED_EUCLIDEAN,
            ElementType::Fp32,
            &ParamMap::new(),
        )
        .unwrap();
        let searcher =
            FlatSearcher::load(&store, metric, HnswSearcherOptions::default()).unwrap();

        let mut ctx = SearchContext::new(QueryParams {
            topk: 2,
            ..QueryParams::default()
        })
        .unwrap();
        searcher.search_into(&mut ctx, 0, &[5.2, 0.0, 0.0, 0.0]).unwrap();
        let keys: Vec<u64> = ctx.result(0).iter().map(|h| h.key).collect();
        // Key 5 is tombstoned; neighbors win.
        assert_eq!(keys, vec![6, 4]);

        let found = searcher.search_by_keys(&[4, 5]);
        assert!(found[0].is_some());
        assert!(found[1].is_none());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let builder = sample_builder();
        builder.add(9, &[0.0; 4]).unwrap();
        assert_eq!(builder.add(9, &[1.0; 4]).unwrap_err().code(), -1009);
    }
}
