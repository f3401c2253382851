//! Compressed data block records and the append-only block table
//!
//! ```text
//! offset  size  field
//!      0     4  identifier "DBLK"
//!      4     2  data type (user data, or the shared zero block)
//!      6     1  codec tag
//!      7     4  sector size (bytes of user data per sector)
//!     11     4  uncompressed length
//!     15     4  payload length
//!     19     4  crc32 of the uncompressed bytes
//!     23     5  codec properties
//!     28     -  payload
//! ```
//!
//! Blocks are never rewritten once appended. Sectors deduplicating to a
//! block share it; reference counts track how many table entries point at
//! each block.

use crate::codec::{self, CodecTag, EncodedBlock, LZMA_PROPERTIES_LEN};
use crate::error::{ArchiveError, Result};
use crate::fields::FieldReader;

pub const DATA_BLOCK_ID: u32 = u32::from_le_bytes(*b"DBLK");
pub const BLOCK_HEADER_SIZE: usize = 28;
pub const DATA_TYPE_USER: u16 = 1;
/// One all-zero sector shared by every zero sector of its size
pub const DATA_TYPE_ZERO: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub data_type: u16,
    pub codec: u8,
    pub sector_size: u32,
    pub length: u32,
    pub payload_length: u32,
    pub crc32: u32,
    pub properties: [u8; LZMA_PROPERTIES_LEN],
}

impl BlockHeader {
    pub fn sector_count(&self) -> u32 {
        if self.sector_size == 0 {
            0
        } else {
            self.length / self.sector_size
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&DATA_BLOCK_ID.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.data_type.to_le_bytes());
        bytes[6] = self.codec;
        bytes[7..11].copy_from_slice(&self.sector_size.to_le_bytes());
        bytes[11..15].copy_from_slice(&self.length.to_le_bytes());
        bytes[15..19].copy_from_slice(&self.payload_length.to_le_bytes());
        bytes[19..23].copy_from_slice(&self.crc32.to_le_bytes());
        bytes[23..28].copy_from_slice(&self.properties);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(bytes, "block header");
        let identifier = reader.u32()?;
        if identifier != DATA_BLOCK_ID {
            return Err(ArchiveError::CorruptBlock(format!(
                "expected data block identifier, found 0x{identifier:08x}"
            )));
        }

        let header = BlockHeader {
            data_type: reader.u16()?,
            codec: reader.u8()?,
            sector_size: reader.u32()?,
            length: reader.u32()?,
            payload_length: reader.u32()?,
            crc32: reader.u32()?,
            properties: reader.array()?,
        };

        if header.sector_size == 0 || header.length % header.sector_size != 0 {
            return Err(ArchiveError::CorruptBlock(format!(
                "block length {} is not a multiple of sector size {}",
                header.length, header.sector_size
            )));
        }

        Ok(header)
    }
}

/// Serialize a freshly compressed block into its on-disk record
pub fn encode_record(
    encoded: &EncodedBlock,
    raw: &[u8],
    sector_size: u32,
    data_type: u16,
) -> Result<(BlockHeader, Vec<u8>)> {
    let header = BlockHeader {
        data_type,
        codec: encoded.tag as u8,
        sector_size,
        length: record_len(raw.len(), "block")?,
        payload_length: record_len(encoded.payload.len(), "block payload")?,
        crc32: crc32fast::hash(raw),
        properties: encoded.properties,
    };

    let mut record = Vec::with_capacity(BLOCK_HEADER_SIZE + encoded.payload.len());
    record.extend_from_slice(&header.to_bytes());
    record.extend_from_slice(&encoded.payload);
    Ok((header, record))
}

fn record_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        ArchiveError::InvalidConfig(format!("{what} of {len} bytes does not fit a block record"))
    })
}

/// Decompress a payload read back for `header`, verifying length and crc
pub fn decode_payload(header: &BlockHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let data = codec::decompress(
        header.codec,
        &header.properties,
        payload,
        header.length as usize,
    )?;

    let crc = crc32fast::hash(&data);
    if crc != header.crc32 {
        return Err(ArchiveError::CorruptBlock(format!(
            "crc mismatch: stored {:08x}, computed {:08x}",
            header.crc32, crc
        )));
    }
    Ok(data)
}

/// Where a stored block lives and what it holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub offset: u64,
    pub header: BlockHeader,
    /// Set when the stored header could not be read; every read of the
    /// block reports it
    pub fault: Option<String>,
}

impl BlockRecord {
    pub fn new(offset: u64, header: BlockHeader) -> Self {
        BlockRecord {
            offset,
            header,
            fault: None,
        }
    }

    /// Placeholder for a block whose header is unreadable
    pub fn damaged(offset: u64, fault: String) -> Self {
        BlockRecord {
            offset,
            header: BlockHeader {
                data_type: DATA_TYPE_USER,
                codec: CodecTag::None as u8,
                sector_size: 0,
                length: 0,
                payload_length: 0,
                crc32: 0,
                properties: [0; LZMA_PROPERTIES_LEN],
            },
            fault: Some(fault),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.fault.is_none() && self.header.data_type == DATA_TYPE_ZERO
    }

    pub fn sector_count(&self) -> u32 {
        self.header.sector_count()
    }

    pub fn codec(&self) -> Option<CodecTag> {
        CodecTag::from_u8(self.header.codec)
    }

    pub fn stored_len(&self) -> u64 {
        BLOCK_HEADER_SIZE as u64 + self.header.payload_length as u64
    }
}

/// Append-only table of stored blocks with per-block reference counts
#[derive(Debug, Default)]
pub struct BlockTable {
    records: Vec<BlockRecord>,
    references: Vec<u64>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block that has been durably appended; returns its index
    pub fn push(&mut self, record: BlockRecord) -> u64 {
        self.records.push(record);
        self.references.push(0);
        (self.records.len() - 1) as u64
    }

    pub fn get(&self, index: u64) -> Option<&BlockRecord> {
        self.records.get(index as usize)
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[BlockRecord] {
        &self.records
    }

    pub fn acquire(&mut self, index: u64) {
        if let Some(count) = self.references.get_mut(index as usize) {
            *count += 1;
        }
    }

    pub fn release(&mut self, index: u64) {
        if let Some(count) = self.references.get_mut(index as usize) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn references(&self, index: u64) -> u64 {
        self.references.get(index as usize).copied().unwrap_or(0)
    }

    /// Blocks no table entry points at any more
    pub fn unreferenced(&self) -> usize {
        self.references.iter().filter(|&&count| count == 0).count()
    }

    pub fn live_references(&self) -> u64 {
        self.references.iter().sum()
    }

    pub fn zero_blocks(&self) -> usize {
        self.records.iter().filter(|r| r.is_zero()).count()
    }

    pub fn stored_bytes(&self) -> u64 {
        self.records.iter().map(BlockRecord::stored_len).sum()
    }

    pub fn uncompressed_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.header.length as u64).sum()
    }
}
