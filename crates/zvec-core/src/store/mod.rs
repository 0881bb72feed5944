//! Chunk store: the container behind every index.
//!
//! A store maps segment names to chunk lists. In MEMORY mode chunks are
//! anonymous RAM and the store starts empty; in MMAP mode the store is
//! opened from a container file and every directory entry becomes one
//! mapped chunk. Writer-mode stores hold an exclusive advisory lock on the
//! backing file. Memory accounting for the whole index funnels through the
//! store's [`MemoryQuota`].

mod chunk;
pub mod format;
mod lock;

pub use chunk::{ByteView, Chunk};
pub use format::{ChunkType, ContainerWriter, DirectoryEntry};
pub use lock::FileLock;

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use memmap2::{Mmap, MmapOptions, MmapRaw};
use parking_lot::RwLock;

use crate::config::{AccessAdvice, OpenOptions, StorageKind};
use crate::error::{Error, Result};

/// Shared memory accounting for one index.
///
/// Builder entities and chunk allocation both reserve against the same
/// quota, so the store is the single place that can refuse an `add` for
/// memory reasons.
#[derive(Debug)]
pub struct MemoryQuota {
    limit: AtomicUsize,
    used: AtomicUsize,
}

impl MemoryQuota {
    /// Creates a quota; `0` means unlimited.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            used: AtomicUsize::new(0),
        }
    }

    /// Replaces the limit.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Current limit; `0` means unlimited.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Reserves `bytes`, failing with `OutOfMemory` past the limit.
    pub fn try_reserve(&self, bytes: usize) -> Result<()> {
        let limit = self.limit();
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if limit > 0 && next > limit {
                tracing::warn!(requested = bytes, used = current, limit, "memory quota refused");
                return Err(Error::OutOfMemory(format!(
                    "quota exceeded: {next} > {limit} bytes"
                )));
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns `bytes` to the quota.
    pub fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes.min(self.used()), Ordering::Relaxed);
    }
}

/// Summary of one segment for `directory()` listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment name.
    pub name: String,
    /// Logical kind of its chunks.
    pub type_tag: ChunkType,
    /// Total bytes across the chunk list.
    pub length: u64,
    /// Number of chunks.
    pub chunk_count: usize,
}

struct Segment {
    type_tag: ChunkType,
    chunks: Vec<Chunk>,
}

enum Backing {
    Anonymous,
    Mapped(Arc<Mmap>),
    MappedRaw(Arc<MmapRaw>),
}

/// One logical index container.
pub struct IndexStore {
    path: Option<PathBuf>,
    read_only: bool,
    backing: Backing,
    segments: RwLock<IndexMap<String, Segment>>,
    quota: Arc<MemoryQuota>,
    _lock: Option<FileLock>,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl IndexStore {
    /// Creates an empty anonymous store for build mode.
    #[must_use]
    pub fn create_memory(memory_limit_bytes: usize) -> Self {
        Self {
            path: None,
            read_only: false,
            backing: Backing::Anonymous,
            segments: RwLock::new(IndexMap::new()),
            quota: Arc::new(MemoryQuota::new(memory_limit_bytes)),
            _lock: None,
        }
    }

    /// Opens a container file and materializes its segments as chunks.
    pub fn open<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        if options.storage == StorageKind::Memory {
            return Self::open_into_memory(path, options);
        }

        let file = File::options()
            .read(true)
            .write(!options.read_only)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let lock = if options.read_only {
            None
        } else {
            Some(FileLock::exclusive(&file)?)
        };

        let (backing, entries) = if options.read_only {
            let mut mmap_options = MmapOptions::new();
            if options.populate {
                mmap_options.populate();
            }
            // SAFETY: the mapping is over a regular file we just opened;
            // writer-mode stores are excluded by the advisory lock.
            let map = unsafe { mmap_options.map(&file)? };
            #[cfg(unix)]
            advise_map(&map, options.advise);
            let map = Arc::new(map);
            let entries = Self::load_directory(&map, file_len, options.verify_checksums)?;
            (Backing::Mapped(map), entries)
        } else {
            let map = MmapOptions::new().map_raw(&file)?;
            // SAFETY: the raw mapping spans the whole file; open holds the
            // only reference while the directory is parsed.
            let data = unsafe {
                std::slice::from_raw_parts(map.as_ptr(), usize::try_from(file_len).map_err(invalid_range)?)
            };
            let entries = Self::load_directory(data, file_len, options.verify_checksums)?;
            (Backing::MappedRaw(Arc::new(map)), entries)
        };

        let mut segments = IndexMap::new();
        for entry in &entries {
            let range = usize::try_from(entry.offset).map_err(invalid_range)?
                ..usize::try_from(entry.offset + entry.length).map_err(invalid_range)?;
            let chunk = match &backing {
                Backing::Mapped(map) => Chunk::new_mapped(entry.type_tag, Arc::clone(map), range),
                Backing::MappedRaw(map) => {
                    Chunk::new_mapped_raw(entry.type_tag, Arc::clone(map), range)
                }
                Backing::Anonymous => unreachable!("mmap open has a mapping"),
            };
            segments.insert(
                entry.name.clone(),
                Segment {
                    type_tag: entry.type_tag,
                    chunks: vec![chunk],
                },
            );
        }

        tracing::debug!(
            path = %path.display(),
            segments = segments.len(),
            read_only = options.read_only,
            "container opened"
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            read_only: options.read_only,
            backing,
            segments: RwLock::new(segments),
            quota: Arc::new(MemoryQuota::new(0)),
            _lock: lock,
        })
    }

    /// Opens a container fully into anonymous RAM.
    fn open_into_memory(path: &Path, options: OpenOptions) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let entries = Self::load_directory(&bytes, bytes.len() as u64, options.verify_checksums)?;
        let store = Self::create_memory(0);
        {
            let mut segments = store.segments.write();
            for entry in &entries {
                let range = usize::try_from(entry.offset).map_err(invalid_range)?
                    ..usize::try_from(entry.offset + entry.length).map_err(invalid_range)?;
                let chunk = Chunk::new_ram(entry.type_tag, range.len());
                chunk.write(0, &bytes[range])?;
                segments.insert(
                    entry.name.clone(),
                    Segment {
                        type_tag: entry.type_tag,
                        chunks: vec![chunk],
                    },
                );
            }
        }
        Ok(Self {
            path: Some(path.to_path_buf()),
            read_only: options.read_only,
            ..store
        })
    }

    fn load_directory(
        data: &[u8],
        file_len: u64,
        verify_checksums: bool,
    ) -> Result<Vec<DirectoryEntry>> {
        let len = usize::try_from(file_len).map_err(invalid_range)?;
        if len < format::FOOTER_LEN {
            return Err(Error::InvalidFormat(format!(
                "container too small: {len} bytes"
            )));
        }
        let (dir_offset, dir_length) = format::decode_footer(&data[len - format::FOOTER_LEN..len])?;
        let dir_start = usize::try_from(dir_offset).map_err(invalid_range)?;
        let dir_end = dir_start
            .checked_add(usize::try_from(dir_length).map_err(invalid_range)?)
            .filter(|&end| end <= len - format::FOOTER_LEN)
            .ok_or_else(|| Error::InvalidFormat("directory range out of bounds".into()))?;
        let entries = format::decode_directory(&data[dir_start..dir_end])?;

        for entry in &entries {
            let end = entry
                .offset
                .checked_add(entry.length)
                .filter(|&end| end <= dir_offset)
                .ok_or_else(|| {
                    Error::InvalidFormat(format!("segment '{}' out of bounds", entry.name))
                })?;
            if verify_checksums {
                let start = usize::try_from(entry.offset).map_err(invalid_range)?;
                let stop = usize::try_from(end).map_err(invalid_range)?;
                let computed = crc32c::crc32c(&data[start..stop]);
                if computed != entry.crc32c {
                    return Err(Error::InvalidFormat(format!(
                        "segment '{}' checksum mismatch",
                        entry.name
                    )));
                }
            }
        }
        Ok(entries)
    }

    /// Shared memory quota.
    #[must_use]
    pub fn quota(&self) -> Arc<MemoryQuota> {
        Arc::clone(&self.quota)
    }

    /// Backing path, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True when writes are refused.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Grows `segment` by one chunk of `size` bytes and returns its handle.
    ///
    /// Only anonymous stores allocate; mapped containers are fixed.
    pub fn alloc_chunk(&self, segment: &str, type_tag: ChunkType, size: usize) -> Result<Chunk> {
        if !matches!(self.backing, Backing::Anonymous) {
            return Err(Error::Unsupported(
                "cannot allocate chunks in a mapped container".into(),
            ));
        }
        self.quota.try_reserve(size)?;
        let chunk = Chunk::new_ram(type_tag, size);
        let mut segments = self.segments.write();
        let entry = segments.entry(segment.to_string()).or_insert_with(|| Segment {
            type_tag,
            chunks: Vec::new(),
        });
        if entry.type_tag != type_tag {
            self.quota.release(size);
            return Err(Error::Mismatch(format!(
                "segment '{segment}' already holds {:?} chunks",
                entry.type_tag
            )));
        }
        entry.chunks.push(chunk.clone());
        Ok(chunk)
    }

    /// Returns the chunk at `ordinal` within `segment`.
    ///
    /// # Panics
    ///
    /// Panics when the segment or ordinal does not exist; loaders check
    /// `has_segment` first.
    #[must_use]
    pub fn get_chunk(&self, segment: &str, ordinal: usize) -> Chunk {
        let segments = self.segments.read();
        let entry = segments
            .get(segment)
            .unwrap_or_else(|| panic!("missing segment '{segment}'"));
        entry
            .chunks
            .get(ordinal)
            .unwrap_or_else(|| panic!("segment '{segment}' has no chunk {ordinal}"))
            .clone()
    }

    /// Returns the chunk if present.
    #[must_use]
    pub fn try_get_chunk(&self, segment: &str, ordinal: usize) -> Option<Chunk> {
        let segments = self.segments.read();
        segments.get(segment)?.chunks.get(ordinal).cloned()
    }

    /// True when `segment` exists.
    #[must_use]
    pub fn has_segment(&self, segment: &str) -> bool {
        self.segments.read().contains_key(segment)
    }

    /// Number of chunks in `segment` (0 when absent).
    #[must_use]
    pub fn chunk_count(&self, segment: &str) -> usize {
        self.segments
            .read()
            .get(segment)
            .map_or(0, |s| s.chunks.len())
    }

    /// Enumerates segments in insertion order.
    #[must_use]
    pub fn directory(&self) -> Vec<SegmentInfo> {
        self.segments
            .read()
            .iter()
            .map(|(name, segment)| SegmentInfo {
                name: name.clone(),
                type_tag: segment.type_tag,
                length: segment.chunks.iter().map(|c| c.len() as u64).sum(),
                chunk_count: segment.chunks.len(),
            })
            .collect()
    }

    /// Syncs mapped chunks to disk; no-op for anonymous stores.
    pub fn flush(&self) -> Result<()> {
        if let Backing::MappedRaw(map) = &self.backing {
            map.flush()?;
        }
        Ok(())
    }

    /// Writes every segment into a fresh container at `path`.
    ///
    /// Multi-chunk segments are concatenated into one directory entry.
    pub fn dump_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = ContainerWriter::new(BufWriter::new(file));
        let segments = self.segments.read();
        for (name, segment) in segments.iter() {
            let total: usize = segment.chunks.iter().map(Chunk::len).sum();
            let mut bytes = Vec::with_capacity(total);
            for chunk in &segment.chunks {
                let view = chunk.pin()?;
                bytes.extend_from_slice(&view);
            }
            writer.write_segment(name, segment.type_tag, &bytes)?;
        }
        writer.finish()?;
        tracing::info!(path = %path.as_ref().display(), "container dumped");
        Ok(())
    }
}

fn invalid_range<E: std::fmt::Display>(err: E) -> Error {
    Error::InvalidFormat(format!("segment range invalid: {err}"))
}

#[cfg(unix)]
fn advise_map(map: &Mmap, advice: AccessAdvice) {
    let advice = match advice {
        AccessAdvice::Normal => return,
        AccessAdvice::Random => memmap2::Advice::Random,
        AccessAdvice::Sequential => memmap2::Advice::Sequential,
    };
    if let Err(err) = map.advise(advice) {
        // EAGAIN here is transient and harmless; the mapping still works.
        tracing::debug!(error = %err, "madvise failed");
    }
}

#[cfg(test)]
mod store_tests;
