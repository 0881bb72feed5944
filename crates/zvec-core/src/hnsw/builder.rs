//! Concurrent HNSW construction.
//!
//! Inserts run in parallel: the entry point sits behind one
//! reader-writer lock, neighbor-list mutation behind a bucketed array of
//! node locks, and a thread never holds two node locks at once. Level
//! draws come from the seeded generator, and all distance ties break
//! toward the smaller node id so serialized rebuilds reproduce the same
//! graph.

use std::collections::BinaryHeap;
use std::io::Write;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use super::calc::{DistCalc, KernelCalc};
use super::entity::BuilderEntity;
use super::level::LevelGenerator;
use super::visited::VisitedPool;
use crate::config::HnswBuilderOptions;
use crate::context::SearchContext;
use crate::element::{encode_vector, Key, NodeId, INVALID_KEY, INVALID_NODE};
use crate::error::{Error, Result};
use crate::metric::Metric;
use crate::ordered::{Candidate, FrontierEntry};
use crate::store::{ContainerWriter, MemoryQuota};

const NODE_LOCK_BUCKETS: usize = 1024;

/// Entry point snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    /// Top node, `INVALID_NODE` while empty.
    pub node: NodeId,
    /// Its assigned level.
    pub level: u8,
}

/// Build-mode HNSW index.
pub struct HnswBuilder {
    options: HnswBuilderOptions,
    metric: Metric,
    dimension: usize,
    entity: BuilderEntity,
    calc: Arc<dyn DistCalc>,
    levels: LevelGenerator,
    ep: RwLock<EntryPoint>,
    node_locks: Vec<Mutex<()>>,
    key_map: DashMap<Key, NodeId>,
    visited: VisitedPool,
}

impl HnswBuilder {
    /// Creates an empty builder over plain vector records.
    pub fn new(
        metric: Metric,
        dimension: usize,
        options: HnswBuilderOptions,
        quota: Arc<MemoryQuota>,
    ) -> Result<Self> {
        let storage_dimension = metric.storage_dimension(dimension);
        let record_bytes = metric.element().vector_bytes(storage_dimension);
        let calc = Arc::new(KernelCalc::new(metric.kernels(), storage_dimension));
        Self::with_parts(metric, dimension, storage_dimension, record_bytes, options, quota, calc)
    }

    /// Creates a builder with an explicit record layout and calculator;
    /// the RaBitQ variant stores codes instead of raw vectors.
    pub(crate) fn with_parts(
        metric: Metric,
        dimension: usize,
        storage_dimension: usize,
        record_bytes: usize,
        options: HnswBuilderOptions,
        quota: Arc<MemoryQuota>,
        calc: Arc<dyn DistCalc>,
    ) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidArgument("dimension must be >= 1".into()));
        }
        quota.set_limit(options.memory_limit_bytes);
        let entity = BuilderEntity::with_record_bytes(
            metric.element(),
            storage_dimension,
            record_bytes,
            options.m,
            options.m0,
            quota,
        );
        let levels = LevelGenerator::new(options.seed, options.level_mult(), options.max_level);
        Ok(Self {
            options,
            metric,
            dimension,
            entity,
            calc,
            levels,
            ep: RwLock::new(EntryPoint {
                node: INVALID_NODE,
                level: 0,
            }),
            node_locks: (0..NODE_LOCK_BUCKETS).map(|_| Mutex::new(())).collect(),
            key_map: DashMap::new(),
            visited: VisitedPool::new(),
        })
    }

    /// Builder options.
    #[must_use]
    pub fn options(&self) -> &HnswBuilderOptions {
        &self.options
    }

    /// Bound metric.
    #[must_use]
    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Caller-facing dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Build-mode entity.
    pub(crate) fn entity(&self) -> &BuilderEntity {
        &self.entity
    }

    /// Number of assigned nodes, tombstones included.
    #[must_use]
    pub fn doc_count(&self) -> u32 {
        self.entity.doc_count()
    }

    /// Number of live keys.
    #[must_use]
    pub fn live_count(&self) -> u64 {
        self.key_map.len() as u64
    }

    /// Current entry point.
    #[must_use]
    pub fn entry_point(&self) -> EntryPoint {
        *self.ep.read()
    }

    /// Node currently holding `key`.
    #[must_use]
    pub fn node_of_key(&self, key: Key) -> Option<NodeId> {
        self.key_map.get(&key).map(|entry| *entry.value())
    }

    /// Pre-sizes the entity for `docs` nodes.
    pub fn reserve(&self, docs: usize) -> Result<()> {
        self.entity.reserve(docs)
    }

    fn node_lock(&self, node: NodeId) -> &Mutex<()> {
        &self.node_locks[node as usize % NODE_LOCK_BUCKETS]
    }

    #[inline]
    fn record_dist(&self, reference: &[u8], node: NodeId) -> f32 {
        self.entity
            .with_vector(node, |v| self.calc.record_distance(reference, v))
    }

    #[inline]
    fn query_dist(&self, query: &[u8], node: NodeId) -> f32 {
        self.entity
            .with_vector(node, |v| self.calc.query_distance(query, v))
    }

    /// Inserts one vector under `key` and returns its node id.
    pub fn add(&self, key: Key, vector: &[f32]) -> Result<NodeId> {
        self.add_with_ef(key, vector, self.options.ef_construction)
    }

    /// Inserts with an explicit construction frontier bound.
    pub fn add_with_ef(&self, key: Key, vector: &[f32], ef: usize) -> Result<NodeId> {
        if vector.len() != self.dimension {
            return Err(Error::Mismatch(format!(
                "vector has {} dims, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        let mut values = vector.to_vec();
        self.metric.store_preprocess(&mut values)?;
        let record = encode_vector(self.metric.element(), &values);
        self.add_record_with_ef(key, &record, ef)
    }

    /// Inserts an already-encoded record.
    pub(crate) fn add_record_with_ef(&self, key: Key, record: &[u8], ef: usize) -> Result<NodeId> {
        if key == INVALID_KEY {
            return Err(Error::InvalidArgument("key 0 is reserved".into()));
        }

        let mut claimed = false;
        if !self.options.allow_duplicate_keys {
            use dashmap::mapref::entry::Entry;
            match self.key_map.entry(key) {
                Entry::Occupied(_) => {
                    return Err(Error::AlreadyExists(format!("key {key} already present")))
                }
                Entry::Vacant(slot) => {
                    slot.insert(INVALID_NODE);
                    claimed = true;
                }
            }
        }

        let result = (|| {
            let level = self.levels.draw();
            let node = self.entity.add_vector(level, key, record)?;
            self.insert_into_graph(node, level, record, ef.max(1))?;
            Ok(node)
        })();

        match &result {
            Ok(node) => {
                self.key_map.insert(key, *node);
            }
            Err(_) if claimed => {
                self.key_map.remove(&key);
            }
            Err(_) => {}
        }
        result
    }

    /// Inserts a batch in parallel, returning per-item results in order.
    pub fn add_batch(&self, items: &[(Key, Vec<f32>)]) -> Vec<Result<NodeId>> {
        let threads = self.options.thread_count.max(1);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build();
        match pool {
            Ok(pool) => pool.install(|| {
                items
                    .par_iter()
                    .map(|(key, vector)| self.add(*key, vector))
                    .collect()
            }),
            Err(_) => items.iter().map(|(key, vector)| self.add(*key, vector)).collect(),
        }
    }

    fn insert_into_graph(&self, node: NodeId, level: u8, record: &[u8], ef: usize) -> Result<()> {
        let mut ep = *self.ep.read();
        if ep.node == INVALID_NODE {
            let mut guard = self.ep.write();
            if guard.node == INVALID_NODE {
                *guard = EntryPoint { node, level };
                return Ok(());
            }
            ep = *guard;
        }

        let dist = |n: NodeId| self.record_dist(record, n);

        // Greedy descent over levels above the new node's level.
        let mut current = ep.node;
        if ep.level > level {
            for lvl in ((level + 1)..=ep.level).rev() {
                current = self.greedy_descend(&dist, current, lvl);
            }
        }

        // Layered ef-search and symmetric connection.
        let top = level.min(ep.level);
        for lvl in (0..=top).rev() {
            let candidates = self.search_level(&dist, current, ef, lvl, None)?;
            let max_conn = self.entity.max_degree(lvl);
            let selected = self.select_neighbors(&candidates, max_conn);
            let ids: Vec<NodeId> = selected.iter().map(|c| c.node).collect();
            {
                let _guard = self.node_lock(node).lock();
                self.entity.set_neighbors(lvl, node, &ids);
            }
            for &neighbor in &ids {
                self.connect(node, neighbor, lvl, max_conn);
            }
            if let Some(best) = candidates.first() {
                current = best.node;
            }
        }

        if level > ep.level {
            let mut guard = self.ep.write();
            if level > guard.level || guard.node == INVALID_NODE {
                *guard = EntryPoint { node, level };
            }
        }
        Ok(())
    }

    fn greedy_descend(&self, dist: &dyn Fn(NodeId) -> f32, entry: NodeId, level: u8) -> NodeId {
        let mut best = entry;
        let mut best_dist = dist(best);
        loop {
            let mut improved = false;
            for neighbor in self.entity.neighbors_copy(level, best) {
                let d = dist(neighbor);
                if d < best_dist || (d == best_dist && neighbor < best) {
                    best = neighbor;
                    best_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return best;
            }
        }
    }

    /// Ef-bounded best-first search at one level, ascending result order.
    fn search_level(
        &self,
        dist: &dyn Fn(NodeId) -> f32,
        entry: NodeId,
        ef: usize,
        level: u8,
        interrupt: Option<&SearchContext>,
    ) -> Result<Vec<Candidate>> {
        let doc_count = self.entity.doc_count() as usize;
        let mut visited = self.visited.acquire(doc_count);

        let mut frontier = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        let entry_dist = dist(entry);
        visited.insert(entry);
        frontier.push(FrontierEntry(Candidate::new(entry_dist, entry)));
        results.push(Candidate::new(entry_dist, entry));

        while let Some(FrontierEntry(candidate)) = frontier.pop() {
            if let Some(ctx) = interrupt {
                if let Err(err) = ctx.check_interrupt() {
                    self.visited.release(visited);
                    return Err(err);
                }
            }
            let worst = results.peek().map_or(f32::MAX, |c| c.dist);
            if results.len() >= ef && candidate.dist > worst {
                break;
            }
            for neighbor in self.entity.neighbors_copy(level, candidate.node) {
                if neighbor as usize >= doc_count || !visited.insert(neighbor) {
                    continue;
                }
                let d = dist(neighbor);
                let worst = results.peek().map_or(f32::MAX, |c| c.dist);
                if results.len() < ef || d < worst {
                    let entry = Candidate::new(d, neighbor);
                    frontier.push(FrontierEntry(entry));
                    results.push(entry);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        self.visited.release(visited);
        Ok(results.into_sorted_vec())
    }

    /// Diversity-preserving pruning: keep a candidate only when no kept
    /// neighbor sits closer to it than the pivot does. Candidate
    /// distances are to the pivot and ascending.
    fn select_neighbors(&self, candidates: &[Candidate], max_neighbors: usize) -> Vec<Candidate> {
        let mut selected: Vec<Candidate> = Vec::with_capacity(max_neighbors.min(candidates.len()));
        let mut selected_vectors: Vec<Vec<u8>> = Vec::with_capacity(selected.capacity());

        for &candidate in candidates {
            if selected.len() >= max_neighbors {
                break;
            }
            let vector = self.entity.vector_copy(candidate.node);
            let diverse = selected_vectors.iter().all(|kept| {
                self.calc.record_distance(&vector, kept) >= candidate.dist
            });
            if diverse {
                selected.push(candidate);
                selected_vectors.push(vector);
            }
        }
        selected
    }

    /// Adds the symmetric edge `neighbor -> node`.
    ///
    /// The heuristic is re-run on the whole union so every stored list is
    /// a fixed point of the pruning rule; the union write also enforces
    /// the degree bound.
    fn connect(&self, node: NodeId, neighbor: NodeId, level: u8, max_conn: usize) {
        let _guard = self.node_lock(neighbor).lock();
        let list = self.entity.neighbors_copy(level, neighbor);
        if list.contains(&node) {
            return;
        }

        let pivot = self.entity.vector_copy(neighbor);
        let mut candidates: Vec<Candidate> = list
            .iter()
            .chain(std::iter::once(&node))
            .map(|&id| Candidate::new(self.record_dist(&pivot, id), id))
            .collect();
        candidates.sort_unstable();
        let pruned = self.select_neighbors(&candidates, max_conn);
        let ids: Vec<NodeId> = pruned.iter().map(|c| c.node).collect();
        self.entity.set_neighbors(level, neighbor, &ids);
    }

    /// Asserts that re-running the pruning heuristic over a node's stored
    /// neighbor lists reproduces them.
    #[cfg(test)]
    pub(crate) fn assert_heuristic_fixed_point(&self, node: NodeId) {
        let pivot = self.entity.vector_copy(node);
        for level in 0..=self.entity.level(node) {
            let stored = self.entity.neighbors_copy(level, node);
            if stored.is_empty() {
                continue;
            }
            let mut candidates: Vec<Candidate> = stored
                .iter()
                .map(|&id| Candidate::new(self.record_dist(&pivot, id), id))
                .collect();
            candidates.sort_unstable();
            let reselected: Vec<NodeId> = self
                .select_neighbors(&candidates, self.entity.max_degree(level))
                .iter()
                .map(|c| c.node)
                .collect();
            assert_eq!(
                reselected,
                candidates.iter().map(|c| c.node).collect::<Vec<_>>(),
                "node {node} level {level} is not heuristic-stable"
            );
        }
    }

    /// Tombstones `key`; edges stay in place.
    pub fn mark_deleted(&self, key: Key) -> Result<()> {
        let Some((_, node)) = self.key_map.remove(&key) else {
            return Err(Error::NoExist(format!("key {key} not present")));
        };
        self.entity.set_key(node, INVALID_KEY);
        Ok(())
    }

    /// Serves a search directly from the build-mode entity.
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
        let mut values = query.to_vec();
        self.metric.query_preprocess(&mut values)?;
        let bytes = encode_vector(self.metric.element(), &values);
        self.search_prepared(ctx, query_index, &bytes, brute_force_threshold)
    }

    /// Serves a search whose query is already in prepared byte form.
    pub(crate) fn search_prepared(
        &self,
        ctx: &mut SearchContext,
        query_index: usize,
        query: &[u8],
        brute_force_threshold: usize,
    ) -> Result<()> {
        let doc_count = self.entity.doc_count();
        if doc_count == 0 || ctx.topk() == 0 {
            ctx.topk_to_result(query_index);
            return Ok(());
        }

        if (doc_count as usize) <= brute_force_threshold {
            self.brute_force_into(ctx, query)?;
        } else {
            self.graph_search_into(ctx, query)?;
        }

        ctx.topk_to_result(query_index);
        if ctx.fetch_vector() {
            ctx.attach_vectors(query_index, |node| Some(self.entity.vector_copy(node)));
        }
        Ok(())
    }

    fn graph_search_into(&self, ctx: &mut SearchContext, query: &[u8]) -> Result<()> {
        let ep = *self.ep.read();
        if ep.node == INVALID_NODE {
            return Ok(());
        }
        let dist = |n: NodeId| self.query_dist(query, n);
        let mut current = ep.node;
        for lvl in (1..=ep.level).rev() {
            current = self.greedy_descend(&dist, current, lvl);
        }
        let candidates = self.search_level(&dist, current, ctx.ef(), 0, Some(ctx))?;
        for candidate in candidates {
            let key = self.entity.key(candidate.node);
            if key == INVALID_KEY {
                continue;
            }
            ctx.push(key, candidate.dist, candidate.node);
        }
        Ok(())
    }

    fn brute_force_into(&self, ctx: &mut SearchContext, query: &[u8]) -> Result<()> {
        let doc_count = self.entity.doc_count();
        let stride = self.entity.node_stride();
        let mut scores = [0.0f32; 8];

        let mut node: u32 = 0;
        while node < doc_count {
            ctx.check_interrupt()?;
            let remaining = (doc_count - node) as usize;
            let lanes = remaining.min(8);
            self.entity.with_vector_buffer(|buffer| {
                self.calc.query_batch(
                    query,
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
        Ok(())
    }

    /// Returns the stored record bytes under `key`.
    pub fn vector_of_key(&self, key: Key) -> Result<Vec<u8>> {
        let node = self
            .node_of_key(key)
            .ok_or_else(|| Error::NoExist(format!("key {key} not present")))?;
        Ok(self.entity.vector_copy(node))
    }

    /// Dumps the graph through `writer` (header, keys, vectors,
    /// neighbors, index), leaving meta segments to the caller.
    pub fn dump<W: Write>(&self, writer: &mut ContainerWriter<W>) -> Result<()> {
        let ep = *self.ep.read();
        let ep_node = ep.node;
        let ep_level = if ep.node == INVALID_NODE { 0 } else { u32::from(ep.level) };
        self.entity.dump(
            writer,
            self.metric.name(),
            self.dimension,
            self.options.ef_construction,
            ep_node,
            ep_level,
        )?;
        tracing::info!(
            docs = self.doc_count(),
            ep = ep_node,
            ep_level,
            "hnsw graph dumped"
        );
        Ok(())
    }
}
