//! In-memory and chunk-backed HNSW entities.
//!
//! [`BuilderEntity`] grows append-only buffers during build; its byte
//! layout is exactly what `dump` writes out, so [`SearcherEntity`] simply
//! re-materializes the same addressing over pinned chunks.
//!
//! Layout per node:
//! - vectors: `node * node_stride`, payload then zero padding
//! - keys: `node * 8`
//! - level-0 neighbors: `node * (4 + 4 * M0)` as `(count, ids...)`
//! - upper levels: per-node `(offset, level)` index into a shared buffer
//!   of `(4 + 4 * M)` slots, one per level in `[1, level]`

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use roaring::RoaringTreemap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::meta::{
    neighbor_stride_l0, neighbor_stride_upper, node_stride, HnswHeader, NEIGHBOR_INDEX_ENTRY,
    SEG_HEADER, SEG_KEYS, SEG_NEIGHBORS_INDEX, SEG_NEIGHBORS_L0, SEG_NEIGHBORS_UPPER, SEG_VECTORS,
};
use crate::element::{ElementType, Key, NodeId, INVALID_KEY};
use crate::error::{Error, Result};
use crate::store::{ByteView, Chunk, ChunkType, ContainerWriter, IndexStore, MemoryQuota};

/// Neighbor ids copied out of one slot.
pub type NeighborList = SmallVec<[NodeId; 64]>;

#[derive(Debug, Clone, Copy)]
struct NodeIndexEntry {
    upper_offset: u64,
    level: u8,
}

/// Growable entity used while building.
pub struct BuilderEntity {
    element: ElementType,
    storage_dimension: usize,
    vector_bytes: usize,
    node_stride: usize,
    padding: usize,
    m: usize,
    m0: usize,
    stride_l0: usize,
    stride_upper: usize,

    vectors: RwLock<Vec<u8>>,
    keys: RwLock<Vec<Key>>,
    neighbors0: RwLock<Vec<u8>>,
    upper: RwLock<Vec<u8>>,
    node_index: RwLock<Vec<NodeIndexEntry>>,
    /// Serializes appends so node ids stay aligned across all buffers.
    append_lock: Mutex<()>,
    doc_count: AtomicU32,
    quota: Arc<MemoryQuota>,
}

impl BuilderEntity {
    /// Creates an empty entity over plain vector records.
    #[must_use]
    pub fn new(
        element: ElementType,
        storage_dimension: usize,
        m: usize,
        m0: usize,
        quota: Arc<MemoryQuota>,
    ) -> Self {
        let vector_bytes = element.vector_bytes(storage_dimension);
        Self::with_record_bytes(element, storage_dimension, vector_bytes, m, m0, quota)
    }

    /// Creates an entity whose records are `record_bytes` wide regardless
    /// of the element type (code-backed variants).
    #[must_use]
    pub fn with_record_bytes(
        element: ElementType,
        storage_dimension: usize,
        record_bytes: usize,
        m: usize,
        m0: usize,
        quota: Arc<MemoryQuota>,
    ) -> Self {
        let vector_bytes = record_bytes;
        let stride = node_stride(vector_bytes);
        Self {
            element,
            storage_dimension,
            vector_bytes,
            node_stride: stride,
            padding: stride - vector_bytes,
            m,
            m0,
            stride_l0: neighbor_stride_l0(m0),
            stride_upper: neighbor_stride_upper(m),
            vectors: RwLock::new(Vec::new()),
            keys: RwLock::new(Vec::new()),
            neighbors0: RwLock::new(Vec::new()),
            upper: RwLock::new(Vec::new()),
            node_index: RwLock::new(Vec::new()),
            append_lock: Mutex::new(()),
            doc_count: AtomicU32::new(0),
            quota,
        }
    }

    /// Bytes a level-`level` node consumes across all buffers.
    fn node_cost(&self, level: u8) -> usize {
        self.node_stride
            + std::mem::size_of::<Key>()
            + self.stride_l0
            + NEIGHBOR_INDEX_ENTRY
            + usize::from(level) * self.stride_upper
    }

    /// Pre-sizes buffers for `docs` nodes, checking the quota first.
    pub fn reserve(&self, docs: usize) -> Result<()> {
        let limit = self.quota.limit();
        let estimated = docs * self.node_cost(0);
        if limit > 0 && estimated > limit {
            return Err(Error::OutOfMemory(format!(
                "reserve of {docs} docs needs {estimated} bytes, limit {limit}"
            )));
        }
        self.vectors.write().reserve(docs * self.node_stride);
        self.keys.write().reserve(docs);
        self.neighbors0.write().reserve(docs * self.stride_l0);
        self.node_index.write().reserve(docs);
        Ok(())
    }

    /// Appends a node record with empty neighbor lists.
    ///
    /// The doc-count increment is the last write; a node id is observable
    /// only after its vector, key, and slots are in place.
    pub fn add_vector(&self, level: u8, key: Key, vector: &[u8]) -> Result<NodeId> {
        if vector.len() != self.vector_bytes {
            return Err(Error::Mismatch(format!(
                "vector is {} bytes, expected {}",
                vector.len(),
                self.vector_bytes
            )));
        }
        self.quota.try_reserve(self.node_cost(level))?;

        // One appender at a time; the same node id must index every
        // buffer. Readers are unaffected (each buffer has its own lock).
        let _append = self.append_lock.lock();
        let node;
        {
            let mut vectors = self.vectors.write();
            node = u32::try_from(vectors.len() / self.node_stride)
                .map_err(|_| Error::OutOfMemory("node id space exhausted".into()))?;
            vectors.extend_from_slice(vector);
            vectors.extend(std::iter::repeat_n(0u8, self.padding));
        }
        self.keys.write().push(key);
        {
            let mut neighbors0 = self.neighbors0.write();
            neighbors0.extend(std::iter::repeat_n(0u8, self.stride_l0));
        }
        {
            let mut upper = self.upper.write();
            let mut node_index = self.node_index.write();
            node_index.push(NodeIndexEntry {
                upper_offset: upper.len() as u64,
                level,
            });
            upper.extend(std::iter::repeat_n(
                0u8,
                usize::from(level) * self.stride_upper,
            ));
        }
        self.doc_count.fetch_add(1, Ordering::Release);
        Ok(node)
    }

    /// Number of assigned nodes.
    #[must_use]
    pub fn doc_count(&self) -> u32 {
        self.doc_count.load(Ordering::Acquire)
    }

    /// Element type of stored vectors.
    #[must_use]
    pub fn element(&self) -> ElementType {
        self.element
    }

    /// Stored dimension.
    #[must_use]
    pub fn storage_dimension(&self) -> usize {
        self.storage_dimension
    }

    /// Vector row stride.
    #[must_use]
    pub fn node_stride(&self) -> usize {
        self.node_stride
    }

    /// Degree bound at `level`.
    #[must_use]
    pub fn max_degree(&self, level: u8) -> usize {
        if level == 0 {
            self.m0
        } else {
            self.m
        }
    }

    /// Key of `node`.
    #[must_use]
    pub fn key(&self, node: NodeId) -> Key {
        self.keys.read()[node as usize]
    }

    /// Overwrites the key of `node` (tombstoning writes `INVALID_KEY`).
    pub fn set_key(&self, node: NodeId, key: Key) {
        self.keys.write()[node as usize] = key;
    }

    /// Assigned level of `node`.
    #[must_use]
    pub fn level(&self, node: NodeId) -> u8 {
        self.node_index.read()[node as usize].level
    }

    /// Copies the vector bytes of `node`.
    #[must_use]
    pub fn vector_copy(&self, node: NodeId) -> Vec<u8> {
        let vectors = self.vectors.read();
        let start = node as usize * self.node_stride;
        vectors[start..start + self.vector_bytes].to_vec()
    }

    /// Runs `f` over the vector bytes of `node` without copying.
    pub fn with_vector<R>(&self, node: NodeId, f: impl FnOnce(&[u8]) -> R) -> R {
        let vectors = self.vectors.read();
        let start = node as usize * self.node_stride;
        f(&vectors[start..start + self.vector_bytes])
    }

    /// Runs `f` over the whole vector buffer (contiguous rows at
    /// `node_stride`); used by brute-force tile scans during build.
    pub fn with_vector_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.vectors.read())
    }

    /// Overwrites the record bytes of `node` in place.
    ///
    /// # Panics
    ///
    /// Panics when `record` is not exactly one record wide.
    pub fn rewrite_vector(&self, node: NodeId, record: &[u8]) {
        assert_eq!(record.len(), self.vector_bytes);
        let mut vectors = self.vectors.write();
        let start = node as usize * self.node_stride;
        vectors[start..start + self.vector_bytes].copy_from_slice(record);
    }

    fn upper_slot_offset(&self, node: NodeId, level: u8) -> Option<usize> {
        let index = self.node_index.read();
        let entry = index.get(node as usize)?;
        if level == 0 || level > entry.level {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        Some(entry.upper_offset as usize + usize::from(level - 1) * self.stride_upper)
    }

    /// Copies the neighbor ids of `node` at `level`.
    ///
    /// A level above the node's assigned level reads as empty.
    #[must_use]
    pub fn neighbors_copy(&self, level: u8, node: NodeId) -> NeighborList {
        if level == 0 {
            let neighbors0 = self.neighbors0.read();
            decode_slot(&neighbors0[node as usize * self.stride_l0..], self.m0)
        } else {
            match self.upper_slot_offset(node, level) {
                Some(offset) => {
                    let upper = self.upper.read();
                    decode_slot(&upper[offset..], self.m)
                }
                None => NeighborList::new(),
            }
        }
    }

    /// Rewrites the whole neighbor slot of `node` at `level`.
    ///
    /// # Panics
    ///
    /// Panics when `ids` exceeds the level's degree bound or the level is
    /// above the node's assigned level.
    pub fn set_neighbors(&self, level: u8, node: NodeId, ids: &[NodeId]) {
        let cap = self.max_degree(level);
        assert!(ids.len() <= cap, "{} neighbors exceed cap {cap}", ids.len());
        if level == 0 {
            let mut neighbors0 = self.neighbors0.write();
            encode_slot(&mut neighbors0[node as usize * self.stride_l0..], ids);
        } else {
            let offset = self
                .upper_slot_offset(node, level)
                .expect("level above assigned level");
            let mut upper = self.upper.write();
            encode_slot(&mut upper[offset..], ids);
        }
    }

    /// Dumps all segments through `writer`, header first.
    pub fn dump<W: Write>(
        &self,
        writer: &mut ContainerWriter<W>,
        metric_name: &str,
        dimension: usize,
        ef_construction: usize,
        ep_node: NodeId,
        ep_level: u32,
    ) -> Result<()> {
        let doc_count = self.doc_count();
        #[allow(clippy::cast_possible_truncation)]
        let header = HnswHeader {
            element: self.element,
            metric_name: metric_name.to_string(),
            dimension: dimension as u32,
            storage_dimension: self.storage_dimension as u32,
            m: self.m as u32,
            m0: self.m0 as u32,
            ef_construction: ef_construction as u32,
            doc_count,
            ep_node,
            ep_level,
            node_stride: self.node_stride as u32,
            neighbor_stride_l0: self.stride_l0 as u32,
            neighbor_stride_upper: self.stride_upper as u32,
        };
        writer.write_segment(SEG_HEADER, ChunkType::Header, &header.encode()?)?;

        let keys = self.keys.read();
        let mut key_bytes = Vec::with_capacity(keys.len() * 8);
        for key in keys.iter() {
            key_bytes.extend_from_slice(&key.to_le_bytes());
        }
        writer.write_segment(SEG_KEYS, ChunkType::Keys, &key_bytes)?;
        drop(keys);

        writer.write_segment(SEG_VECTORS, ChunkType::Vectors, &self.vectors.read())?;
        writer.write_segment(SEG_NEIGHBORS_L0, ChunkType::NeighborsL0, &self.neighbors0.read())?;
        writer.write_segment(SEG_NEIGHBORS_UPPER, ChunkType::NeighborsUpper, &self.upper.read())?;

        let node_index = self.node_index.read();
        let mut index_bytes = Vec::with_capacity(node_index.len() * NEIGHBOR_INDEX_ENTRY);
        for entry in node_index.iter() {
            index_bytes.extend_from_slice(&entry.upper_offset.to_le_bytes());
            index_bytes.push(entry.level);
            index_bytes.extend_from_slice(&[0u8; 7]);
        }
        writer.write_segment(SEG_NEIGHBORS_INDEX, ChunkType::NeighborsIndex, &index_bytes)?;
        Ok(())
    }
}

fn decode_slot(slot: &[u8], cap: usize) -> NeighborList {
    let count = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as usize;
    let count = count.min(cap);
    let mut ids = NeighborList::with_capacity(count);
    for i in 0..count {
        let off = 4 + i * 4;
        ids.push(u32::from_le_bytes([
            slot[off],
            slot[off + 1],
            slot[off + 2],
            slot[off + 3],
        ]));
    }
    ids
}

fn encode_slot(slot: &mut [u8], ids: &[NodeId]) {
    #[allow(clippy::cast_possible_truncation)]
    slot[0..4].copy_from_slice(&(ids.len() as u32).to_le_bytes());
    for (i, id) in ids.iter().enumerate() {
        let off = 4 + i * 4;
        slot[off..off + 4].copy_from_slice(&id.to_le_bytes());
    }
}

/// Read-only entity over a loaded container.
///
/// The key chunk is deliberately not pinned: tombstoning writes through
/// it on writable containers, and reads copy eight bytes at a time.
pub struct SearcherEntity {
    header: HnswHeader,
    record_bytes: usize,
    vectors: ByteView,
    neighbors0: ByteView,
    upper: ByteView,
    node_index: ByteView,
    keys_chunk: Chunk,
    writable: bool,
    tombstones: RwLock<RoaringTreemap>,
    key_map: RwLock<FxHashMap<Key, NodeId>>,
}

impl SearcherEntity {
    /// Re-materializes an entity from a loaded store.
    pub fn load(store: &IndexStore) -> Result<Self> {
        for segment in [
            SEG_HEADER,
            SEG_KEYS,
            SEG_VECTORS,
            SEG_NEIGHBORS_L0,
            SEG_NEIGHBORS_UPPER,
            SEG_NEIGHBORS_INDEX,
        ] {
            if !store.has_segment(segment) {
                return Err(Error::InvalidFormat(format!(
                    "container is missing segment '{segment}'"
                )));
            }
        }

        let header_chunk = store.get_chunk(SEG_HEADER, 0);
        let header = HnswHeader::decode(&header_chunk.pin()?)?;

        let doc_count = header.doc_count as usize;
        let keys_chunk = store.get_chunk(SEG_KEYS, 0);
        if keys_chunk.len() < doc_count * 8 {
            return Err(Error::InvalidFormat("key segment truncated".into()));
        }
        let vectors = store.get_chunk(SEG_VECTORS, 0).pin()?;
        if doc_count > 0 && vectors.len() < doc_count * header.node_stride as usize {
            return Err(Error::InvalidFormat("vector segment truncated".into()));
        }
        let neighbors0 = store.get_chunk(SEG_NEIGHBORS_L0, 0).pin()?;
        if neighbors0.len() < doc_count * header.neighbor_stride_l0 as usize {
            return Err(Error::InvalidFormat("level-0 neighbor segment truncated".into()));
        }
        let node_index = store.get_chunk(SEG_NEIGHBORS_INDEX, 0).pin()?;
        if node_index.len() < doc_count * NEIGHBOR_INDEX_ENTRY {
            return Err(Error::InvalidFormat("neighbor index segment truncated".into()));
        }
        let upper = store.get_chunk(SEG_NEIGHBORS_UPPER, 0).pin()?;

        let record_bytes = header
            .element
            .vector_bytes(header.storage_dimension as usize)
            .min(header.node_stride as usize);
        let entity = Self {
            header,
            record_bytes,
            vectors,
            neighbors0,
            upper,
            node_index,
            keys_chunk,
            writable: !store.read_only(),
            tombstones: RwLock::new(RoaringTreemap::new()),
            key_map: RwLock::new(FxHashMap::default()),
        };

        let mut key_map =
            FxHashMap::with_capacity_and_hasher(doc_count, rustc_hash::FxBuildHasher);
        #[allow(clippy::cast_possible_truncation)]
        for node in 0..entity.header.doc_count {
            let key = entity.key_raw(node)?;
            if key != INVALID_KEY {
                key_map.insert(key, node);
            }
        }
        *entity.key_map.write() = key_map;
        Ok(entity)
    }

    /// Parsed header.
    #[must_use]
    pub fn header(&self) -> &HnswHeader {
        &self.header
    }

    /// Number of assigned nodes, tombstones included.
    #[must_use]
    pub fn doc_count(&self) -> u32 {
        self.header.doc_count
    }

    /// Number of live (non-tombstoned) keys.
    #[must_use]
    pub fn live_count(&self) -> u64 {
        self.key_map.read().len() as u64
    }

    /// Raw key bytes of `node`, ignoring the tombstone overlay.
    fn key_raw(&self, node: NodeId) -> Result<Key> {
        let mut buf = [0u8; 8];
        self.keys_chunk.read(node as usize * 8, &mut buf)?;
        Ok(Key::from_le_bytes(buf))
    }

    /// Key of `node`; tombstoned nodes read as `INVALID_KEY`.
    #[must_use]
    pub fn key(&self, node: NodeId) -> Key {
        let Ok(key) = self.key_raw(node) else {
            return INVALID_KEY;
        };
        if key != INVALID_KEY && self.tombstones.read().contains(key) {
            return INVALID_KEY;
        }
        key
    }

    /// Assigned level of `node`.
    #[must_use]
    pub fn level(&self, node: NodeId) -> u8 {
        self.node_index[node as usize * NEIGHBOR_INDEX_ENTRY + 8]
    }

    /// Record width in bytes; wider than the element math only for
    /// code-backed layouts.
    #[must_use]
    pub fn record_bytes(&self) -> usize {
        self.record_bytes
    }

    /// Replaces the record width (code-backed variants derive it from
    /// their converter header).
    pub fn override_record_bytes(&mut self, record_bytes: usize) -> Result<()> {
        if record_bytes > self.header.node_stride as usize {
            return Err(Error::InvalidFormat(format!(
                "record width {record_bytes} exceeds node stride {}",
                self.header.node_stride
            )));
        }
        self.record_bytes = record_bytes;
        Ok(())
    }

    /// Vector bytes of `node`.
    #[must_use]
    pub fn vector(&self, node: NodeId) -> &[u8] {
        let stride = self.header.node_stride as usize;
        &self.vectors[node as usize * stride..node as usize * stride + self.record_bytes]
    }

    /// Contiguous vector rows starting at `node`.
    #[must_use]
    pub fn vector_rows_from(&self, node: NodeId) -> &[u8] {
        &self.vectors[node as usize * self.header.node_stride as usize..]
    }

    /// Copies the neighbor ids of `node` at `level`.
    #[must_use]
    pub fn neighbors_copy(&self, level: u8, node: NodeId) -> NeighborList {
        if level == 0 {
            let stride = self.header.neighbor_stride_l0 as usize;
            decode_slot(
                &self.neighbors0[node as usize * stride..],
                self.header.m0 as usize,
            )
        } else {
            if level > self.level(node) {
                return NeighborList::new();
            }
            let base = node as usize * NEIGHBOR_INDEX_ENTRY;
            let offset = u64::from_le_bytes(
                self.node_index[base..base + 8].try_into().expect("8 bytes"),
            );
            #[allow(clippy::cast_possible_truncation)]
            let slot = offset as usize
                + usize::from(level - 1) * self.header.neighbor_stride_upper as usize;
            if slot + self.header.neighbor_stride_upper as usize > self.upper.len() {
                // Missing upper slot reads as end-of-level.
                return NeighborList::new();
            }
            decode_slot(&self.upper[slot..], self.header.m as usize)
        }
    }

    /// Looks up the node holding `key`.
    #[must_use]
    pub fn node_of_key(&self, key: Key) -> Option<NodeId> {
        self.key_map.read().get(&key).copied()
    }

    /// Tombstones `key`: the node stays traversable but never surfaces in
    /// results. Writable containers clear the stored key bytes; read-only
    /// containers keep an in-memory overlay.
    pub fn mark_deleted(&self, key: Key) -> Result<()> {
        let node = self
            .node_of_key(key)
            .ok_or_else(|| Error::NoExist(format!("key {key} not present")))?;
        if self.writable {
            self.keys_chunk
                .write(node as usize * 8, &INVALID_KEY.to_le_bytes())?;
        } else {
            self.tombstones.write().insert(key);
        }
        self.key_map.write().remove(&key);
        Ok(())
    }

    /// Iterates live `(key, node)` pairs.
    pub fn for_each_live(&self, mut f: impl FnMut(Key, NodeId)) {
        for (&key, &node) in self.key_map.read().iter() {
            f(key, node);
        }
    }
}

#[cfg(test)]
mod entity_tests {
    use super::*;

    fn quota() -> Arc<MemoryQuota> {
        Arc::new(MemoryQuota::new(0))
    }

    fn sample_entity() -> BuilderEntity {
        BuilderEntity::new(ElementType::Fp32, 4, 4, 8, quota())
    }

    fn vec_bytes(seed: f32) -> Vec<u8> {
        (0..4)
            .map(|i| seed + i as f32)
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_add_vector_assigns_dense_ids() {
        let entity = sample_entity();
        let a = entity.add_vector(0, 10, &vec_bytes(0.0)).unwrap();
        let b = entity.add_vector(2, 20, &vec_bytes(1.0)).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(entity.doc_count(), 2);
        assert_eq!(entity.key(1), 20);
        assert_eq!(entity.level(1), 2);
        assert_eq!(entity.vector_copy(0), vec_bytes(0.0));
    }

    #[test]
    fn test_neighbors_round_trip_all_levels() {
        let entity = sample_entity();
        entity.add_vector(2, 1, &vec_bytes(0.0)).unwrap();
        entity.add_vector(1, 2, &vec_bytes(1.0)).unwrap();

        entity.set_neighbors(0, 0, &[1, 2, 3]);
        entity.set_neighbors(1, 0, &[4]);
        entity.set_neighbors(2, 0, &[5, 6]);

        assert_eq!(entity.neighbors_copy(0, 0).as_slice(), &[1, 2, 3]);
        assert_eq!(entity.neighbors_copy(1, 0).as_slice(), &[4]);
        assert_eq!(entity.neighbors_copy(2, 0).as_slice(), &[5, 6]);
        // Level above assignment is empty.
        assert!(entity.neighbors_copy(2, 1).is_empty());
        // Rewrites replace the slot.
        entity.set_neighbors(0, 0, &[9]);
        assert_eq!(entity.neighbors_copy(0, 0).as_slice(), &[9]);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let entity = sample_entity();
        let err = entity.add_vector(0, 1, &[0u8; 4]).unwrap_err();
        assert_eq!(err.code(), -1002);
    }

    #[test]
    fn test_quota_refuses_add() {
        let quota = Arc::new(MemoryQuota::new(64));
        let entity = BuilderEntity::new(ElementType::Fp32, 4, 4, 8, quota);
        let err = entity.add_vector(0, 1, &vec_bytes(0.0)).unwrap_err();
        assert_eq!(err.code(), -1003);
    }

    #[test]
    fn test_dump_and_reload_round_trip() {
        let entity = sample_entity();
        entity.add_vector(1, 11, &vec_bytes(0.0)).unwrap();
        entity.add_vector(0, 22, &vec_bytes(4.0)).unwrap();
        entity.set_neighbors(0, 0, &[1]);
        entity.set_neighbors(0, 1, &[0]);
        entity.set_neighbors(1, 0, &[]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entity.zvi");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ContainerWriter::new(std::io::BufWriter::new(file));
        entity
            .dump(&mut writer, "squared_euclidean", 4, 100, 0, 1)
            .unwrap();
        writer.finish().unwrap();

        let store =
            IndexStore::open(&path, crate::config::OpenOptions::read_only()).unwrap();
        let loaded = SearcherEntity::load(&store).unwrap();
        assert_eq!(loaded.doc_count(), 2);
        assert_eq!(loaded.key(0), 11);
        assert_eq!(loaded.key(1), 22);
        assert_eq!(loaded.level(0), 1);
        assert_eq!(loaded.vector(1), vec_bytes(4.0).as_slice());
        assert_eq!(loaded.neighbors_copy(0, 0).as_slice(), &[1]);
        assert_eq!(loaded.neighbors_copy(0, 1).as_slice(), &[0]);
        assert!(loaded.neighbors_copy(1, 0).is_empty());
        assert_eq!(loaded.node_of_key(22), Some(1));
    }

    #[test]
    fn test_tombstone_overlay_on_read_only() {
        let entity = sample_entity();
        entity.add_vector(0, 5, &vec_bytes(0.0)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entity.zvi");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ContainerWriter::new(std::io::BufWriter::new(file));
        entity
            .dump(&mut writer, "inner_product", 4, 100, 0, 0)
            .unwrap();
        writer.finish().unwrap();

        let store =
            IndexStore::open(&path, crate::config::OpenOptions::read_only()).unwrap();
        let loaded = SearcherEntity::load(&store).unwrap();
        loaded.mark_deleted(5).unwrap();
        assert_eq!(loaded.key(0), INVALID_KEY);
        assert_eq!(loaded.node_of_key(5), None);
        assert_eq!(loaded.live_count(), 0);
        // Unknown keys fail.
        assert_eq!(loaded.mark_deleted(99).unwrap_err().code(), -1004);
    }
}
