//! Per-query search state.
//!
//! One [`SearchContext`] carries everything a single search (or a batch of
//! searches) accumulates: the bounded top-k heap, optional per-group
//! heaps, the key filter, cancellation state, and the output slots.
//! Searchers push scored candidates; the context owns result shaping.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use roaring::RoaringTreemap;
use rustc_hash::FxHashMap;

use crate::element::{Key, NodeId};
use crate::error::{Error, Result};
use crate::ordered::OrderedFloat;

/// Query parameters for the HNSW index family.
#[derive(Clone)]
pub struct QueryParams {
    /// Number of hits to return. `0` yields an empty result.
    pub topk: u32,
    /// Frontier bound; the effective value is `max(ef_search, topk)`.
    pub ef_search: u32,
    /// Attach raw vector bytes to each hit.
    pub fetch_vector: bool,
    /// Optional key filter.
    pub filter: Option<KeyFilter>,
    /// Optional key → group mapping.
    pub group_by: Option<GroupFn>,
    /// Per-group result cap; must be >= 1 when `group_by` is set.
    pub group_topk: u32,
    /// Number of groups to keep.
    pub group_num: u32,
    /// Search deadline relative to the call, in microseconds.
    pub deadline_micros: Option<u64>,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            topk: 10,
            ef_search: 32,
            fetch_vector: false,
            filter: None,
            group_by: None,
            group_topk: 1,
            group_num: 0,
            deadline_micros: None,
        }
    }
}

impl std::fmt::Debug for QueryParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryParams")
            .field("topk", &self.topk)
            .field("ef_search", &self.ef_search)
            .field("fetch_vector", &self.fetch_vector)
            .field("group_topk", &self.group_topk)
            .field("group_num", &self.group_num)
            .finish_non_exhaustive()
    }
}

/// Key → group mapping used by grouped top-k.
pub type GroupFn = Arc<dyn Fn(Key) -> u64 + Send + Sync>;

/// Key filter evaluated before a candidate may enter the results.
#[derive(Clone)]
pub enum KeyFilter {
    /// Arbitrary predicate; `true` keeps the key.
    Predicate(Arc<dyn Fn(Key) -> bool + Send + Sync>),
    /// Only keys in the set are kept.
    Allow(Arc<RoaringTreemap>),
    /// Keys in the set are rejected.
    Deny(Arc<RoaringTreemap>),
}

impl KeyFilter {
    /// True when `key` may enter the results.
    #[must_use]
    pub fn accepts(&self, key: Key) -> bool {
        match self {
            Self::Predicate(f) => f(key),
            Self::Allow(set) => set.contains(key),
            Self::Deny(set) => !set.contains(key),
        }
    }
}

impl std::fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Predicate(_) => f.write_str("KeyFilter::Predicate"),
            Self::Allow(set) => write!(f, "KeyFilter::Allow({} keys)", set.len()),
            Self::Deny(set) => write!(f, "KeyFilter::Deny({} keys)", set.len()),
        }
    }
}

/// One scored hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Primary key.
    pub key: Key,
    /// Distance (larger is worse).
    pub score: f32,
    /// Node id inside the index.
    pub node: NodeId,
    /// Raw vector bytes when `fetch_vector` was set.
    pub vector: Option<Vec<u8>>,
}

/// Heap entry ordered by score, tie-broken by key.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry {
    score: f32,
    key: Key,
    node: NodeId,
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Token for cooperative cancellation of in-flight searches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True when cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Per-query state shared by every searcher.
#[derive(Debug)]
pub struct SearchContext {
    params: QueryParams,
    heap: BinaryHeap<HeapEntry>,
    groups: Option<FxHashMap<u64, BinaryHeap<HeapEntry>>>,
    cancel: Option<CancelToken>,
    deadline: Option<Instant>,
    results: Vec<Vec<SearchHit>>,
}

impl SearchContext {
    /// Creates a context for `params`, validating them.
    pub fn new(params: QueryParams) -> Result<Self> {
        if params.group_by.is_some() {
            if params.group_topk == 0 {
                return Err(Error::InvalidArgument(
                    "group_topk must be >= 1 when group_by is set".into(),
                ));
            }
            if params.group_num == 0 {
                return Err(Error::InvalidArgument(
                    "group_num must be >= 1 when group_by is set".into(),
                ));
            }
        }
        let deadline = params
            .deadline_micros
            .map(|micros| Instant::now() + Duration::from_micros(micros));
        let groups = params.group_by.as_ref().map(|_| FxHashMap::default());
        Ok(Self {
            params,
            heap: BinaryHeap::new(),
            groups,
            cancel: None,
            deadline,
            results: Vec::new(),
        })
    }

    /// Attaches a cancellation token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Query parameters.
    #[must_use]
    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    /// Requested top-k.
    #[must_use]
    pub fn topk(&self) -> usize {
        self.params.topk as usize
    }

    /// Effective frontier bound for graph search.
    #[must_use]
    pub fn ef(&self) -> usize {
        (self.params.ef_search.max(self.params.topk)) as usize
    }

    /// Key filter, if any.
    #[must_use]
    pub fn filter(&self) -> Option<&KeyFilter> {
        self.params.filter.as_ref()
    }

    /// Group mapping, if any.
    #[must_use]
    pub fn group_by(&self) -> Option<&GroupFn> {
        self.params.group_by.as_ref()
    }

    /// Per-group cap.
    #[must_use]
    pub fn group_topk(&self) -> usize {
        self.params.group_topk as usize
    }

    /// Number of groups to keep.
    #[must_use]
    pub fn group_num(&self) -> usize {
        self.params.group_num as usize
    }

    /// True when hits should carry their vector bytes.
    #[must_use]
    pub fn fetch_vector(&self) -> bool {
        self.params.fetch_vector
    }

    /// Clears accumulated state for a fresh query, keeping parameters but
    /// overriding `topk`.
    pub fn reset(&mut self, topk: u32) {
        self.params.topk = topk;
        self.heap.clear();
        if let Some(groups) = &mut self.groups {
            groups.clear();
        }
    }

    /// Fails when the query was cancelled or its deadline passed.
    ///
    /// Searchers call this at the head of each outer loop and at tile
    /// boundaries in brute-force scans.
    pub fn check_interrupt(&self) -> Result<()> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    /// Worst score currently kept, when the plain top-k heap is full.
    #[must_use]
    pub fn worst_score(&self) -> Option<f32> {
        if self.heap.len() >= self.topk() {
            self.heap.peek().map(|e| e.score)
        } else {
            None
        }
    }

    /// Offers one scored candidate.
    ///
    /// The filter is consulted first; full heaps discard candidates whose
    /// score is not better than the kept worst.
    pub fn push(&mut self, key: Key, score: f32, node: NodeId) {
        if let Some(filter) = &self.params.filter {
            if !filter.accepts(key) {
                return;
            }
        }
        let entry = HeapEntry { score, key, node };

        if let (Some(groups), Some(group_by)) = (&mut self.groups, &self.params.group_by) {
            let group = group_by(key);
            let heap = groups.entry(group).or_default();
            let cap = self.params.group_topk as usize;
            if heap.len() < cap {
                heap.push(entry);
            } else if let Some(worst) = heap.peek() {
                if entry < *worst {
                    heap.pop();
                    heap.push(entry);
                }
            }
            return;
        }

        let cap = self.topk();
        if cap == 0 {
            return;
        }
        if self.heap.len() < cap {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            if entry < *worst {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    /// Drains accumulated hits into the output slot for query
    /// `query_index` of the batch, sorted ascending.
    pub fn topk_to_result(&mut self, query_index: usize) {
        let hits = if self.groups.is_some() {
            self.drain_groups()
        } else {
            let mut entries = std::mem::take(&mut self.heap).into_sorted_vec();
            entries.truncate(self.topk());
            entries.into_iter().map(entry_to_hit).collect()
        };

        if self.results.len() <= query_index {
            self.results.resize_with(query_index + 1, Vec::new);
        }
        self.results[query_index] = hits;
    }

    fn drain_groups(&mut self) -> Vec<SearchHit> {
        let Some(groups) = &mut self.groups else {
            return Vec::new();
        };
        // Rank groups by their best (smallest) score.
        let mut ranked: Vec<(u64, Vec<HeapEntry>)> = groups
            .drain()
            .map(|(group, heap)| (group, heap.into_sorted_vec()))
            .collect();
        ranked.sort_by(|a, b| {
            let best_a = a.1.first().expect("group heaps are never empty");
            let best_b = b.1.first().expect("group heaps are never empty");
            best_a.cmp(best_b).then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(self.params.group_num as usize);

        ranked
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .map(entry_to_hit)
            .collect()
    }

    /// Output slot for query `query_index`.
    #[must_use]
    pub fn result(&self, query_index: usize) -> &[SearchHit] {
        self.results.get(query_index).map_or(&[], Vec::as_slice)
    }

    /// All output slots.
    #[must_use]
    pub fn results(&self) -> &[Vec<SearchHit>] {
        &self.results
    }

    /// Takes ownership of the output slots.
    #[must_use]
    pub fn into_results(self) -> Vec<Vec<SearchHit>> {
        self.results
    }

    /// Attaches vector bytes to already-drained hits.
    pub fn attach_vectors<F>(&mut self, query_index: usize, mut fetch: F)
    where
        F: FnMut(NodeId) -> Option<Vec<u8>>,
    {
        if let Some(slot) = self.results.get_mut(query_index) {
            for hit in slot.iter_mut() {
                hit.vector = fetch(hit.node);
            }
        }
    }

    /// Re-scores already-drained hits and re-sorts the slot ascending.
    ///
    /// Used by reranking passes that replace estimated distances with
    /// exact ones.
    pub fn rescore<F>(&mut self, query_index: usize, mut score: F) -> Result<()>
    where
        F: FnMut(&SearchHit) -> Result<f32>,
    {
        if let Some(slot) = self.results.get_mut(query_index) {
            for hit in slot.iter_mut() {
                hit.score = score(hit)?;
            }
            slot.sort_by_key(|hit| (OrderedFloat(hit.score), hit.key));
        }
        Ok(())
    }
}

fn entry_to_hit(entry: HeapEntry) -> SearchHit {
    SearchHit {
        key: entry.key,
        score: entry.score,
        node: entry.node,
        vector: None,
    }
}
