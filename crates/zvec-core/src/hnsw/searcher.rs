//! Read-only search over a loaded HNSW entity.
//!
//! The searcher never blocks: the entity is immutable after load apart
//! from key tombstoning, and the entry point is fixed in the header.
//! Small corpora and high-selectivity filters fall back to linear scans
//! that use the tile batch kernels; both paths produce identical ordering
//! rules, so they agree on the top-k set over the full dataset.

use std::collections::BinaryHeap;
use std::sync::Arc;

use super::calc::{DistCalc, KernelCalc};
use super::entity::SearcherEntity;
use super::visited::VisitedPool;
use crate::config::HnswSearcherOptions;
use crate::context::{KeyFilter, SearchContext};
use crate::element::{encode_vector, Key, NodeId, INVALID_KEY, INVALID_NODE};
use crate::error::{Error, Result};
use crate::kernels::prefetch;
use crate::metric::Metric;
use crate::ordered::{Candidate, FrontierEntry};

/// Search-mode HNSW index.
pub struct HnswSearcher {
    metric: Metric,
    options: HnswSearcherOptions,
    entity: SearcherEntity,
    calc: Arc<dyn DistCalc>,
    visited: VisitedPool,
}

impl HnswSearcher {
    /// Wraps a loaded entity with kernel-backed scoring.
    pub fn new(metric: Metric, entity: SearcherEntity, options: HnswSearcherOptions) -> Result<Self> {
        let storage_dimension = entity.header().storage_dimension as usize;
        let calc = Arc::new(KernelCalc::new(metric.kernels(), storage_dimension));
        Self::with_calc(metric, entity, options, calc)
    }

    /// Wraps a loaded entity with an explicit calculator (code-backed
    /// variants).
    pub(crate) fn with_calc(
        metric: Metric,
        entity: SearcherEntity,
        options: HnswSearcherOptions,
        calc: Arc<dyn DistCalc>,
    ) -> Result<Self> {
        if metric.name() != entity.header().metric_name {
            return Err(Error::Mismatch(format!(
                "metric '{}' does not match stored '{}'",
                metric.name(),
                entity.header().metric_name
            )));
        }
        Ok(Self {
            metric,
            options,
            entity,
            calc,
            visited: VisitedPool::new(),
        })
    }

    /// Underlying entity.
    #[must_use]
    pub fn entity(&self) -> &SearcherEntity {
        &self.entity
    }

    /// Bound metric.
    #[must_use]
    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Searcher options.
    #[must_use]
    pub fn options(&self) -> &HnswSearcherOptions {
        &self.options
    }

    /// Caller-facing dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.entity.header().dimension as usize
    }

    #[inline]
    fn distance_to_node(&self, query: &[u8], node: NodeId) -> f32 {
        self.calc.query_distance(query, self.entity.vector(node))
    }

    /// Runs one query into `ctx`, filling output slot `query_index`.
    pub fn search_into(
        &self,
        ctx: &mut SearchContext,
        query_index: usize,
        query: &[f32],
    ) -> Result<()> {
        if query.len() != self.dimension() {
            return Err(Error::Mismatch(format!(
                "query has {} dims, index expects {}",
                query.len(),
                self.dimension()
            )));
        }
        let mut values = query.to_vec();
        self.metric.query_preprocess(&mut values)?;
        let bytes = encode_vector(self.metric.element(), &values);
        self.search_prepared(ctx, query_index, &bytes)
    }

    /// Serves a search whose query is already in prepared byte form.
    pub(crate) fn search_prepared(
        &self,
        ctx: &mut SearchContext,
        query_index: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let live = self.entity.live_count();
        if self.entity.doc_count() == 0 || live == 0 || ctx.topk() == 0 {
            ctx.topk_to_result(query_index);
            return Ok(());
        }

        if self.should_scan_keys(ctx, live) {
            self.scan_filtered_keys(ctx, bytes)?;
        } else if live <= self.options.brute_force_threshold as u64 {
            self.brute_force_into(ctx, bytes)?;
        } else {
            self.graph_search_into(ctx, bytes)?;
        }

        ctx.topk_to_result(query_index);
        if ctx.fetch_vector() {
            ctx.attach_vectors(query_index, |node| Some(self.entity.vector(node).to_vec()));
        }
        Ok(())
    }

    /// A narrow allow-set filter is cheaper to score directly than to
    /// reach through the graph.
    fn should_scan_keys(&self, ctx: &SearchContext, live: u64) -> bool {
        let ratio = self.options.invert_to_forward_scan_ratio;
        if ratio <= 0.0 {
            return false;
        }
        match ctx.filter() {
            Some(KeyFilter::Allow(allowed)) => {
                #[allow(clippy::cast_precision_loss)]
                let bound = (live as f64) * f64::from(ratio);
                (allowed.len() as f64) <= bound
            }
            _ => false,
        }
    }

    fn scan_filtered_keys(&self, ctx: &mut SearchContext, query: &[u8]) -> Result<()> {
        let Some(KeyFilter::Allow(allowed)) = ctx.filter().cloned() else {
            return Ok(());
        };
        for key in allowed.iter() {
            ctx.check_interrupt()?;
            if let Some(node) = self.entity.node_of_key(key) {
                let dist = self.distance_to_node(query, node);
                ctx.push(key, dist, node);
            }
        }
        Ok(())
    }

    fn graph_search_into(&self, ctx: &mut SearchContext, query: &[u8]) -> Result<()> {
        let header = self.entity.header();
        let ep = header.ep_node;
        if ep == INVALID_NODE {
            return Ok(());
        }

        let mut current = ep;
        let mut level = u8::try_from(header.ep_level.min(255)).expect("bounded");
        while level >= 1 {
            current = self.greedy_descend(query, current, level);
            level -= 1;
        }

        let candidates = self.search_bottom_layer(ctx, query, current)?;
        for candidate in candidates {
            let key = self.entity.key(candidate.node);
            if key == INVALID_KEY {
                continue;
            }
            ctx.push(key, candidate.dist, candidate.node);
        }
        Ok(())
    }

    fn greedy_descend(&self, query: &[u8], entry: NodeId, level: u8) -> NodeId {
        let mut best = entry;
        let mut best_dist = self.distance_to_node(query, best);
        loop {
            let mut improved = false;
            for neighbor in self.entity.neighbors_copy(level, best) {
                let dist = self.distance_to_node(query, neighbor);
                if dist < best_dist || (dist == best_dist && neighbor < best) {
                    best = neighbor;
                    best_dist = dist;
                    improved = true;
                }
            }
            if !improved {
                return best;
            }
        }
    }

    /// Ef-bounded best-first search at level 0.
    ///
    /// The results heap only admits live nodes that pass the filter;
    /// traversal still crosses tombstoned and filtered-out nodes.
    fn search_bottom_layer(
        &self,
        ctx: &SearchContext,
        query: &[u8],
        entry: NodeId,
    ) -> Result<Vec<Candidate>> {
        let doc_count = self.entity.doc_count() as usize;
        // The configured searcher default is a floor under the per-query ef.
        let ef = ctx.ef().max(self.options.ef_search);
        let mut visited = self.visited.acquire(doc_count);

        let mut frontier = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        let entry_dist = self.distance_to_node(query, entry);
        visited.insert(entry);
        frontier.push(FrontierEntry(Candidate::new(entry_dist, entry)));
        if self.admissible(ctx, entry) {
            results.push(Candidate::new(entry_dist, entry));
        }

        let run = (|| -> Result<()> {
            while let Some(FrontierEntry(candidate)) = frontier.pop() {
                ctx.check_interrupt()?;
                let worst = results.peek().map_or(f32::MAX, |c| c.dist);
                if results.len() >= ef && candidate.dist > worst {
                    break;
                }
                let neighbors = self.entity.neighbors_copy(0, candidate.node);
                for (i, &neighbor) in neighbors.iter().enumerate() {
                    if i + 1 < neighbors.len() {
                        prefetch(self.entity.vector_rows_from(neighbors[i + 1]));
                    }
                    if !visited.insert(neighbor) {
                        continue;
                    }
                    let dist = self.distance_to_node(query, neighbor);
                    let worst = results.peek().map_or(f32::MAX, |c| c.dist);
                    if results.len() < ef || dist < worst {
                        frontier.push(FrontierEntry(Candidate::new(dist, neighbor)));
                        if self.admissible(ctx, neighbor) {
                            results.push(Candidate::new(dist, neighbor));
                            if results.len() > ef {
                                results.pop();
                            }
                        }
                    }
                }
            }
            Ok(())
        })();

        self.visited.release(visited);
        run?;
        Ok(results.into_sorted_vec())
    }

    /// Live and filter-accepted nodes may enter the results heap.
    fn admissible(&self, ctx: &SearchContext, node: NodeId) -> bool {
        let key = self.entity.key(node);
        if key == INVALID_KEY {
            return false;
        }
        ctx.filter().is_none_or(|filter| filter.accepts(key))
    }

    /// Linear scan over every node with tile batch scoring.
    fn brute_force_into(&self, ctx: &mut SearchContext, query: &[u8]) -> Result<()> {
        let doc_count = self.entity.doc_count();
        let stride = self.entity.header().node_stride as usize;
        let mut scores = [0.0f32; 8];

        let mut node: u32 = 0;
        while node < doc_count {
            ctx.check_interrupt()?;
            let remaining = (doc_count - node) as usize;
            let lanes = remaining.min(8);
            self.calc.query_batch(
                query,
                self.entity.vector_rows_from(node),
                stride,
                &mut scores[..lanes],
            );
            for (lane, &score) in scores.iter().enumerate().take(lanes) {
                #[allow(clippy::cast_possible_truncation)]
                let candidate = node + lane as u32;
                let key = self.entity.key(candidate);
                if key == INVALID_KEY {
                    continue;
                }
                ctx.push(key, score, candidate);
            }
            node += lanes as u32;
        }
        Ok(())
    }

    /// Exact retrieval by keys: one hit per found key, `None` per miss.
    ///
    /// Large requests scan the key column once instead of probing the map
    /// per key.
    pub fn search_by_keys(&self, keys: &[Key]) -> Vec<Option<(NodeId, Vec<u8>)>> {
        let live = self.entity.live_count();
        #[allow(clippy::cast_precision_loss)]
        let scan = live > 0
            && self.options.brute_force_by_keys_ratio > 0.0
            && (keys.len() as f64)
                >= (live as f64) * f64::from(self.options.brute_force_by_keys_ratio);

        if scan {
            let mut wanted: rustc_hash::FxHashMap<Key, usize> =
                rustc_hash::FxHashMap::default();
            for (i, &key) in keys.iter().enumerate() {
                wanted.insert(key, i);
            }
            let mut out: Vec<Option<(NodeId, Vec<u8>)>> = vec![None; keys.len()];
            self.entity.for_each_live(|key, node| {
                if let Some(&slot) = wanted.get(&key) {
                    out[slot] = Some((node, self.entity.vector(node).to_vec()));
                }
            });
            out
        } else {
            keys.iter()
                .map(|&key| {
                    self.entity
                        .node_of_key(key)
                        .map(|node| (node, self.entity.vector(node).to_vec()))
                })
                .collect()
        }
    }

    /// Tombstones `key`.
    pub fn mark_deleted(&self, key: Key) -> Result<()> {
        self.entity.mark_deleted(key)
    }
}
