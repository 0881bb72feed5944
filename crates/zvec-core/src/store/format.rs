//! Container file format: segments, directory, footer.
//!
//! A container is `[segment bytes...] [directory] [footer]`. Every segment
//! starts on an 8-byte boundary with zero padding in between. The footer
//! is a fixed 32-byte trailer:
//!
//! ```text
//! magic       "ZVECIDX\0"   8 bytes
//! version     u32 le        currently 1
//! dir_offset  u64 le        absolute
//! dir_length  u64 le
//! crc32c      u32 le        over the 28 preceding footer bytes
//! ```
//!
//! The directory is `u32 count`, then per entry: `u16 name_len`, name
//! bytes, `u64 offset`, `u64 length`, `u32 type_tag`, `u32 crc32c` of the
//! segment bytes.

use std::io::Write;

use crate::element::align_up;
use crate::error::{Error, Result};

/// Container magic.
pub const MAGIC: [u8; 8] = *b"ZVECIDX\0";

/// Container format version.
pub const FORMAT_VERSION: u32 = 1;

/// Footer size in bytes.
pub const FOOTER_LEN: usize = 32;

/// Segment alignment.
pub const SEGMENT_ALIGN: usize = 8;

/// Logical kind of a chunk, recorded per directory entry and checked by
/// consumers on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChunkType {
    /// Uncategorized blob.
    Blob = 0,
    /// Index header.
    Header = 1,
    /// Key column.
    Keys = 2,
    /// Vector rows.
    Vectors = 3,
    /// Level-0 neighbor slots.
    NeighborsL0 = 4,
    /// Upper-level neighbor buffer.
    NeighborsUpper = 5,
    /// Per-node upper-level index.
    NeighborsIndex = 6,
    /// RaBitQ converter (header + rotator + centroids).
    Converter = 7,
    /// Index meta blob.
    Meta = 8,
    /// Metric parameter blob.
    Metric = 9,
}

impl ChunkType {
    /// Parses the on-disk tag.
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Blob),
            1 => Ok(Self::Header),
            2 => Ok(Self::Keys),
            3 => Ok(Self::Vectors),
            4 => Ok(Self::NeighborsL0),
            5 => Ok(Self::NeighborsUpper),
            6 => Ok(Self::NeighborsIndex),
            7 => Ok(Self::Converter),
            8 => Ok(Self::Meta),
            9 => Ok(Self::Metric),
            other => Err(Error::InvalidFormat(format!("unknown chunk type {other}"))),
        }
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Segment name.
    pub name: String,
    /// Absolute byte offset of the segment.
    pub offset: u64,
    /// Segment length in bytes.
    pub length: u64,
    /// Logical kind.
    pub type_tag: ChunkType,
    /// crc32c of the segment bytes.
    pub crc32c: u32,
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or_else(|| Error::InvalidFormat("directory truncated".into()))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or_else(|| Error::InvalidFormat("directory truncated".into()))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(buf: &[u8], pos: usize) -> Result<u64> {
    let bytes = buf
        .get(pos..pos + 8)
        .ok_or_else(|| Error::InvalidFormat("directory truncated".into()))?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Encodes a directory.
#[must_use]
pub fn encode_directory(entries: &[DirectoryEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
        out.extend_from_slice(entry.name.as_bytes());
        out.extend_from_slice(&entry.offset.to_le_bytes());
        out.extend_from_slice(&entry.length.to_le_bytes());
        out.extend_from_slice(&(entry.type_tag as u32).to_le_bytes());
        out.extend_from_slice(&entry.crc32c.to_le_bytes());
    }
    out
}

/// Decodes a directory blob.
pub fn decode_directory(buf: &[u8]) -> Result<Vec<DirectoryEntry>> {
    let count = read_u32(buf, 0)? as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        let name_len = read_u16(buf, pos)? as usize;
        pos += 2;
        let name_bytes = buf
            .get(pos..pos + name_len)
            .ok_or_else(|| Error::InvalidFormat("directory truncated".into()))?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| Error::InvalidFormat("segment name is not utf-8".into()))?
            .to_string();
        pos += name_len;
        let offset = read_u64(buf, pos)?;
        pos += 8;
        let length = read_u64(buf, pos)?;
        pos += 8;
        let type_tag = ChunkType::from_u32(read_u32(buf, pos)?)?;
        pos += 4;
        let crc = read_u32(buf, pos)?;
        pos += 4;
        entries.push(DirectoryEntry {
            name,
            offset,
            length,
            type_tag,
            crc32c: crc,
        });
    }
    Ok(entries)
}

/// Encodes the 32-byte footer.
#[must_use]
pub fn encode_footer(directory_offset: u64, directory_length: u64) -> [u8; FOOTER_LEN] {
    let mut footer = [0u8; FOOTER_LEN];
    footer[0..8].copy_from_slice(&MAGIC);
    footer[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    footer[12..20].copy_from_slice(&directory_offset.to_le_bytes());
    footer[20..28].copy_from_slice(&directory_length.to_le_bytes());
    let crc = crc32c::crc32c(&footer[0..28]);
    footer[28..32].copy_from_slice(&crc.to_le_bytes());
    footer
}

/// Decodes and validates a footer, returning `(dir_offset, dir_length)`.
pub fn decode_footer(footer: &[u8]) -> Result<(u64, u64)> {
    if footer.len() != FOOTER_LEN {
        return Err(Error::InvalidFormat(format!(
            "footer must be {FOOTER_LEN} bytes, got {}",
            footer.len()
        )));
    }
    if footer[0..8] != MAGIC {
        return Err(Error::InvalidFormat("bad container magic".into()));
    }
    let version = u32::from_le_bytes([footer[8], footer[9], footer[10], footer[11]]);
    if version != FORMAT_VERSION {
        return Err(Error::InvalidFormat(format!(
            "unsupported container version {version}"
        )));
    }
    let stored_crc = u32::from_le_bytes([footer[28], footer[29], footer[30], footer[31]]);
    let computed = crc32c::crc32c(&footer[0..28]);
    if stored_crc != computed {
        return Err(Error::InvalidFormat(format!(
            "footer checksum mismatch: stored {stored_crc:#x}, computed {computed:#x}"
        )));
    }
    let dir_offset = u64::from_le_bytes(footer[12..20].try_into().expect("slice length"));
    let dir_length = u64::from_le_bytes(footer[20..28].try_into().expect("slice length"));
    Ok((dir_offset, dir_length))
}

/// Sequential container writer used by dump paths.
///
/// Segments are written in call order; `finish` appends the directory and
/// footer and flushes the sink.
pub struct ContainerWriter<W: Write> {
    sink: W,
    position: u64,
    entries: Vec<DirectoryEntry>,
}

impl<W: Write> ContainerWriter<W> {
    /// Wraps a sink positioned at byte 0.
    #[must_use]
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            position: 0,
            entries: Vec::new(),
        }
    }

    /// Appends one segment, padding to the 8-byte boundary first.
    pub fn write_segment(&mut self, name: &str, type_tag: ChunkType, bytes: &[u8]) -> Result<()> {
        if name.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidArgument(format!(
                "segment name too long: {}",
                name.len()
            )));
        }
        self.pad_to_alignment()?;
        let offset = self.position;
        self.sink.write_all(bytes)?;
        self.position += bytes.len() as u64;
        self.entries.push(DirectoryEntry {
            name: name.to_string(),
            offset,
            length: bytes.len() as u64,
            type_tag,
            crc32c: crc32c::crc32c(bytes),
        });
        tracing::debug!(
            segment = name,
            offset,
            length = bytes.len(),
            "container segment written"
        );
        Ok(())
    }

    /// Writes the directory and footer, consuming the writer.
    pub fn finish(mut self) -> Result<W> {
        self.pad_to_alignment()?;
        let dir_offset = self.position;
        let directory = encode_directory(&self.entries);
        self.sink.write_all(&directory)?;
        let footer = encode_footer(dir_offset, directory.len() as u64);
        self.sink.write_all(&footer)?;
        self.sink.flush()?;
        Ok(self.sink)
    }

    fn pad_to_alignment(&mut self) -> Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let aligned = align_up(self.position as usize, SEGMENT_ALIGN) as u64;
        if aligned > self.position {
            let padding = [0u8; SEGMENT_ALIGN];
            #[allow(clippy::cast_possible_truncation)]
            self.sink
                .write_all(&padding[..(aligned - self.position) as usize])?;
            self.position = aligned;
        }
        Ok(())
    }
}
