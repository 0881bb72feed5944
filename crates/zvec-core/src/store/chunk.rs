//! Chunks and pinned byte views.
//!
//! A chunk is one fixed-size byte run owned by the store: resident RAM in
//! build mode, a window of the container mapping after load. Handles are
//! cheap clones; [`ByteView`] pins a chunk's bytes for as long as the view
//! lives, which blocks truncation and remapping underneath readers.

use std::ops::Range;
use std::sync::Arc;

use memmap2::{Mmap, MmapRaw};
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock};

use super::format::ChunkType;
use crate::error::{Error, Result};

enum ChunkData {
    /// Fixed-capacity resident buffer (build mode).
    Ram(Arc<RwLock<Box<[u8]>>>),
    /// Read-only window of a shared container mapping.
    Mapped { map: Arc<Mmap>, range: Range<usize> },
    /// Writable window of a shared raw container mapping. The store's
    /// single-writer discipline keeps concurrent writers off the same
    /// range; views over one segment are never mixed with writes to it.
    MappedRaw {
        map: Arc<MmapRaw>,
        range: Range<usize>,
    },
}

/// Reference-counted handle to one chunk.
#[derive(Clone)]
pub struct Chunk {
    inner: Arc<ChunkInner>,
}

struct ChunkInner {
    type_tag: ChunkType,
    len: usize,
    data: ChunkData,
}

impl Chunk {
    pub(super) fn new_ram(type_tag: ChunkType, size: usize) -> Self {
        Self {
            inner: Arc::new(ChunkInner {
                type_tag,
                len: size,
                data: ChunkData::Ram(Arc::new(RwLock::new(
                    vec![0u8; size].into_boxed_slice(),
                ))),
            }),
        }
    }

    pub(super) fn new_mapped(type_tag: ChunkType, map: Arc<Mmap>, range: Range<usize>) -> Self {
        let len = range.len();
        Self {
            inner: Arc::new(ChunkInner {
                type_tag,
                len,
                data: ChunkData::Mapped { map, range },
            }),
        }
    }

    pub(super) fn new_mapped_raw(
        type_tag: ChunkType,
        map: Arc<MmapRaw>,
        range: Range<usize>,
    ) -> Self {
        let len = range.len();
        Self {
            inner: Arc::new(ChunkInner {
                type_tag,
                len,
                data: ChunkData::MappedRaw { map, range },
            }),
        }
    }

    /// Logical kind recorded at allocation.
    #[must_use]
    pub fn type_tag(&self) -> ChunkType {
        self.inner.type_tag
    }

    /// Chunk size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// True when the chunk is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.inner.len) {
            return Err(Error::InvalidArgument(format!(
                "chunk range {offset}+{len} exceeds size {}",
                self.inner.len
            )));
        }
        Ok(())
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        match &self.inner.data {
            ChunkData::Ram(buf) => {
                dst.copy_from_slice(&buf.read()[offset..offset + dst.len()]);
            }
            ChunkData::Mapped { map, range } => {
                let base = range.start + offset;
                dst.copy_from_slice(&map[base..base + dst.len()]);
            }
            ChunkData::MappedRaw { map, range } => {
                let base = range.start + offset;
                // SAFETY: range checked above; the mapping outlives the
                // Arc and `base + len` stays inside it.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        map.as_ptr().add(base),
                        dst.as_mut_ptr(),
                        dst.len(),
                    );
                }
            }
        }
        Ok(())
    }

    /// Writes `src` at `offset`.
    ///
    /// Fails with `Unsupported` on read-only mapped chunks.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        match &self.inner.data {
            ChunkData::Ram(buf) => {
                buf.write()[offset..offset + src.len()].copy_from_slice(src);
                Ok(())
            }
            ChunkData::Mapped { .. } => Err(Error::Unsupported(
                "chunk is mapped read-only".into(),
            )),
            ChunkData::MappedRaw { map, range } => {
                let base = range.start + offset;
                // SAFETY: range checked above; the store's advisory lock
                // admits one writer per container.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.as_ptr(),
                        map.as_mut_ptr().add(base),
                        src.len(),
                    );
                }
                Ok(())
            }
        }
    }

    /// Returns a pinned view of `len` bytes starting at `offset`.
    ///
    /// The view keeps the chunk's backing alive; RAM chunks additionally
    /// hold a read lock so their buffer cannot be mutated underneath it.
    pub fn as_bytes(&self, offset: usize, len: usize) -> Result<ByteView> {
        self.check_range(offset, len)?;
        Ok(match &self.inner.data {
            ChunkData::Ram(buf) => ByteView {
                owner: ViewOwner::Ram(RwLock::read_arc(buf)),
                offset,
                len,
            },
            ChunkData::Mapped { map, range } => ByteView {
                owner: ViewOwner::Map(Arc::clone(map)),
                offset: range.start + offset,
                len,
            },
            ChunkData::MappedRaw { map, range } => ByteView {
                owner: ViewOwner::MapRaw(Arc::clone(map)),
                offset: range.start + offset,
                len,
            },
        })
    }

    /// Pins the whole chunk.
    pub fn pin(&self) -> Result<ByteView> {
        self.as_bytes(0, self.inner.len)
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("type_tag", &self.inner.type_tag)
            .field("len", &self.inner.len)
            .finish_non_exhaustive()
    }
}

enum ViewOwner {
    Map(Arc<Mmap>),
    MapRaw(Arc<MmapRaw>),
    Ram(ArcRwLockReadGuard<RawRwLock, Box<[u8]>>),
}

/// Pinned borrow of chunk bytes.
///
/// Dereferences to `&[u8]`. While any view is alive its chunk's backing
/// cannot go away: RAM buffers are held under a read lock, mappings under
/// a reference count. Views over writable mappings must not overlap
/// ranges that are concurrently written; the entities uphold this by
/// never pinning the one segment they tombstone into.
pub struct ByteView {
    owner: ViewOwner,
    offset: usize,
    len: usize,
}

impl ByteView {
    /// View length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::ops::Deref for ByteView {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match &self.owner {
            ViewOwner::Map(map) => &map[self.offset..self.offset + self.len],
            ViewOwner::MapRaw(map) => {
                // SAFETY: offset/len were validated against the chunk
                // range at construction and the mapping is pinned by the
                // Arc for the view's lifetime.
                unsafe { std::slice::from_raw_parts(map.as_ptr().add(self.offset), self.len) }
            }
            ViewOwner::Ram(guard) => &guard[self.offset..self.offset + self.len],
        }
    }
}

impl AsRef<[u8]> for ByteView {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_chunk_read_write() {
        let chunk = Chunk::new_ram(ChunkType::Blob, 16);
        chunk.write(4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        chunk.read(4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let chunk = Chunk::new_ram(ChunkType::Blob, 8);
        assert!(chunk.write(6, &[0; 4]).is_err());
        let mut buf = [0u8; 4];
        assert!(chunk.read(usize::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_pinned_view_sees_writes() {
        let chunk = Chunk::new_ram(ChunkType::Vectors, 8);
        chunk.write(0, &[9; 8]).unwrap();
        let view = chunk.as_bytes(2, 4).unwrap();
        assert_eq!(&*view, &[9, 9, 9, 9]);
        assert_eq!(view.len(), 4);
    }

    #[test]
    fn test_clone_shares_bytes() {
        let chunk = Chunk::new_ram(ChunkType::Keys, 8);
        let other = chunk.clone();
        chunk.write(0, &[7; 8]).unwrap();
        let mut out = [0u8; 8];
        other.read(0, &mut out).unwrap();
        assert_eq!(out, [7; 8]);
    }
}
