//! Archive index: where every record lives
//!
//! The header points at the index; the index lists the offset of each
//! record. Data blocks appear in the order they were stored, which is the
//! block numbering table entries refer to.
//!
//! ```text
//! "INDX" u32 | count u16 | crc32 u32 | entry*    (version 1)
//! "IDX2" u32 | count u64 | crc32 u32 | entry*    (version 2)
//! entry := block_type u32 | data_type u16 | offset u64
//! ```

use crate::error::{ArchiveError, Result};
use crate::fields::FieldReader;
use crate::io::{ArchiveFile, ArchiveStream};
use tracing::debug;

pub const INDEX_V1_ID: u32 = u32::from_le_bytes(*b"INDX");
pub const INDEX_V2_ID: u32 = u32::from_le_bytes(*b"IDX2");
pub const INDEX_ENTRY_SIZE: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    DataBlock,
    DedupTable,
    TapeFiles,
    TapePartitions,
    /// Record this implementation does not know; skipped on open
    Unknown(u32),
}

impl BlockType {
    pub fn id(self) -> u32 {
        match self {
            BlockType::DataBlock => u32::from_le_bytes(*b"DBLK"),
            BlockType::DedupTable => u32::from_le_bytes(*b"DDT*"),
            BlockType::TapeFiles => u32::from_le_bytes(*b"TFLE"),
            BlockType::TapePartitions => u32::from_le_bytes(*b"TPRT"),
            BlockType::Unknown(id) => id,
        }
    }

    pub fn from_id(id: u32) -> Self {
        match &id.to_le_bytes() {
            b"DBLK" => BlockType::DataBlock,
            b"DDT*" => BlockType::DedupTable,
            b"TFLE" => BlockType::TapeFiles,
            b"TPRT" => BlockType::TapePartitions,
            _ => BlockType::Unknown(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub block_type: BlockType,
    pub data_type: u16,
    pub offset: u64,
}

/// Width of the entry counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexVersion {
    Narrow,
    Wide,
}

impl IndexVersion {
    fn id(self) -> u32 {
        match self {
            IndexVersion::Narrow => INDEX_V1_ID,
            IndexVersion::Wide => INDEX_V2_ID,
        }
    }

    fn header_len(self) -> usize {
        match self {
            IndexVersion::Narrow => 4 + 2 + 4,
            IndexVersion::Wide => 4 + 8 + 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block_type: BlockType, data_type: u16, offset: u64) {
        self.entries.push(IndexEntry {
            block_type,
            data_type,
            offset,
        });
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last record of `block_type`; later records supersede earlier ones
    pub fn find(&self, block_type: BlockType) -> Option<&IndexEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.block_type == block_type)
    }

    pub fn of_type(&self, block_type: BlockType) -> impl Iterator<Item = &IndexEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.block_type == block_type)
    }

    pub fn encode(&self, version: IndexVersion) -> Result<Vec<u8>> {
        if version == IndexVersion::Narrow && self.entries.len() > u16::MAX as usize {
            return Err(ArchiveError::InvalidConfig(format!(
                "{} index entries do not fit a version 1 index",
                self.entries.len()
            )));
        }

        let mut body = Vec::with_capacity(self.entries.len() * INDEX_ENTRY_SIZE);
        for entry in &self.entries {
            body.extend_from_slice(&entry.block_type.id().to_le_bytes());
            body.extend_from_slice(&entry.data_type.to_le_bytes());
            body.extend_from_slice(&entry.offset.to_le_bytes());
        }

        let mut out = Vec::with_capacity(version.header_len() + body.len());
        out.extend_from_slice(&version.id().to_le_bytes());
        match version {
            IndexVersion::Narrow => out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes()),
            IndexVersion::Wide => out.extend_from_slice(&(self.entries.len() as u64).to_le_bytes()),
        }
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Read the index at `offset`.
    ///
    /// `narrow_header` is true for version 1 images, which can only carry a
    /// version 1 index. Version 2 images accept either.
    pub fn read<S: ArchiveStream>(
        file: &mut ArchiveFile<S>,
        offset: u64,
        narrow_header: bool,
    ) -> Result<Self> {
        let id_bytes = file.read_at(offset, 4, "index identifier")?;
        let id = u32::from_le_bytes([id_bytes[0], id_bytes[1], id_bytes[2], id_bytes[3]]);
        let version = match id {
            INDEX_V1_ID => IndexVersion::Narrow,
            INDEX_V2_ID if !narrow_header => IndexVersion::Wide,
            INDEX_V2_ID => {
                return Err(ArchiveError::CorruptIndex(
                    "version 1 image carries a 64-bit index".to_string(),
                ))
            }
            other => {
                return Err(ArchiveError::CorruptIndex(format!(
                    "expected index identifier, found 0x{other:08x}"
                )))
            }
        };

        let header = file.read_at(offset, version.header_len(), "index header")?;
        let mut reader = FieldReader::new(&header[4..], "index header");
        let count = match version {
            IndexVersion::Narrow => reader.u16()? as u64,
            IndexVersion::Wide => reader.u64()?,
        };
        let crc = reader.u32()?;

        let body_offset = offset + version.header_len() as u64;
        let available = file.end().saturating_sub(body_offset);
        let needed = count.saturating_mul(INDEX_ENTRY_SIZE as u64);
        if needed > available {
            return Err(ArchiveError::Truncated {
                what: "index entries",
                needed,
                available,
            });
        }

        let body = file.read_at(body_offset, needed as usize, "index entries")?;
        let computed = crc32fast::hash(&body);
        if computed != crc {
            return Err(ArchiveError::CorruptIndex(format!(
                "index crc mismatch: stored {crc:08x}, computed {computed:08x}"
            )));
        }

        let mut reader = FieldReader::new(&body, "index entry");
        let mut index = Index::new();
        for _ in 0..count {
            let block_type = BlockType::from_id(reader.u32()?);
            let data_type = reader.u16()?;
            let offset = reader.u64()?;
            if let BlockType::Unknown(id) = block_type {
                debug!("Skipping unknown index record 0x{:08x} at {}", id, offset);
            }
            index.push(block_type, data_type, offset);
        }

        debug!("Read {:?} index with {} entries at {}", version, count, offset);
        Ok(index)
    }
}
