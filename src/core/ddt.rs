//! Deduplication table
//!
//! One entry per logical sector, dense over `0..sector_count`. An entry
//! either points at a slot inside a stored block (directly, or as an alias
//! of content first written by another sector) or is unallocated and reads
//! back as zeros. Optical entries also carry the sector's fix-ups, which
//! are never shared.
//!
//! On disk the table is a single record:
//!
//! ```text
//! offset  size  field
//!      0     4  identifier "DDT*"
//!      4     1  encoding (0 raw, 1 zstd)
//!      5     1  default sector kind
//!      6     1  subchannel flag
//!      7     1  block shift
//!      8     4  sector size
//!     12     8  sector count
//!     20     4  media type
//!     24     8  raw entry bytes
//!     32     8  stored entry bytes
//!     40     4  crc32 of the raw entry bytes
//!     44     -  stored entry bytes
//! ```
//!
//! Each raw entry is `reference u8 | kind u8 | [block u64 | slot u32] |
//! fixup_count u8 | fixup*`, where a fix-up is its 32-bit word followed by
//! `len u16 | bytes` for inline fix-ups.

use crate::error::{ArchiveError, Result};
use crate::fields::FieldReader;
use crate::fixup::{Fixup, FixupKind, FixupWord};
use crate::sector::{MediaGeometry, SectorKind, SectorLayout};
use std::io::Read;

pub const DDT_ID: u32 = u32::from_le_bytes(*b"DDT*");
pub const DDT_HEADER_SIZE: usize = 44;

const ENCODING_RAW: u8 = 0;
const ENCODING_ZSTD: u8 = 1;
const ZSTD_LEVEL: i32 = 3;

const REF_UNALLOCATED: u8 = 0;
const REF_DIRECT: u8 = 1;
const REF_ALIAS: u8 = 2;

/// Largest block is 2^12 sectors
pub const MAX_BLOCK_SHIFT: u8 = 12;

/// Smallest possible encoded entry: unallocated, no fix-ups
const MIN_ENTRY_LEN: u64 = 3;

/// Slot `slot` of stored block `block`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockLocator {
    pub block: u64,
    pub slot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    Unallocated,
    /// Sector content was first stored by this entry
    Direct(BlockLocator),
    /// Sector content was already stored by another entry
    Alias(BlockLocator),
}

impl Reference {
    fn tag(self) -> u8 {
        match self {
            Reference::Unallocated => REF_UNALLOCATED,
            Reference::Direct(_) => REF_DIRECT,
            Reference::Alias(_) => REF_ALIAS,
        }
    }

    pub fn locator(self) -> Option<BlockLocator> {
        match self {
            Reference::Unallocated => None,
            Reference::Direct(locator) | Reference::Alias(locator) => Some(locator),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdtEntry {
    pub reference: Reference,
    pub kind: SectorKind,
    pub fixups: Vec<Fixup>,
}

impl DdtEntry {
    pub fn unallocated(kind: SectorKind) -> Self {
        DdtEntry {
            reference: Reference::Unallocated,
            kind,
            fixups: Vec::new(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.reference != Reference::Unallocated
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.reference.tag());
        out.push(self.kind as u8);
        if let Some(locator) = self.reference.locator() {
            out.extend_from_slice(&locator.block.to_le_bytes());
            out.extend_from_slice(&locator.slot.to_le_bytes());
        }

        out.push(self.fixups.len() as u8);
        for fixup in &self.fixups {
            out.extend_from_slice(&fixup.word.raw().to_le_bytes());
            if matches!(fixup.word.kind(), Ok(FixupKind::Inline)) {
                out.extend_from_slice(&(fixup.inline.len() as u16).to_le_bytes());
                out.extend_from_slice(&fixup.inline);
            }
        }
    }

    fn decode_from(reader: &mut FieldReader<'_>) -> Result<Self> {
        let tag = reader.u8()?;
        let kind = SectorKind::from_u8(reader.u8()?)?;

        let reference = match tag {
            REF_UNALLOCATED => Reference::Unallocated,
            REF_DIRECT | REF_ALIAS => {
                let locator = BlockLocator {
                    block: reader.u64()?,
                    slot: reader.u32()?,
                };
                if tag == REF_DIRECT {
                    Reference::Direct(locator)
                } else {
                    Reference::Alias(locator)
                }
            }
            other => {
                return Err(ArchiveError::CorruptIndex(format!(
                    "unknown entry reference tag {other}"
                )))
            }
        };

        let count = reader.u8()? as usize;
        let mut fixups = Vec::with_capacity(count);
        for _ in 0..count {
            let word = FixupWord::from_raw(reader.u32()?);
            let inline = match word.kind()? {
                FixupKind::Inline => {
                    let len = reader.u16()? as usize;
                    reader.bytes(len)?.to_vec()
                }
                _ => Vec::new(),
            };
            fixups.push(Fixup { word, inline });
        }

        Ok(DdtEntry {
            reference,
            kind,
            fixups,
        })
    }
}

/// What a sector currently maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// Never written; reads back as zeros
    Unallocated,
    /// Written but its block has not been stored yet
    Pending { slot: u32 },
    /// Stored in a block; `alias` when the content was shared with an
    /// earlier write
    Stored { locator: BlockLocator, alias: bool },
}

/// Fixed-size header of the on-disk table record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdtRecordHeader {
    pub encoding: u8,
    pub geometry: MediaGeometry,
    pub block_shift: u8,
    pub raw_len: u64,
    pub stored_len: u64,
    pub crc32: u32,
}

impl DdtRecordHeader {
    pub fn to_bytes(&self) -> [u8; DDT_HEADER_SIZE] {
        let mut bytes = [0u8; DDT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&DDT_ID.to_le_bytes());
        bytes[4] = self.encoding;
        bytes[5] = self.geometry.kind as u8;
        bytes[6] = self.geometry.subchannel as u8;
        bytes[7] = self.block_shift;
        bytes[8..12].copy_from_slice(&self.geometry.sector_size.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.geometry.sector_count.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.geometry.media_type.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.raw_len.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.stored_len.to_le_bytes());
        bytes[40..44].copy_from_slice(&self.crc32.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(bytes, "deduplication table header");
        let identifier = reader.u32()?;
        if identifier != DDT_ID {
            return Err(ArchiveError::CorruptIndex(format!(
                "expected deduplication table identifier, found 0x{identifier:08x}"
            )));
        }

        let encoding = reader.u8()?;
        let kind = SectorKind::from_u8(reader.u8()?)?;
        let subchannel = reader.u8()? != 0;
        let block_shift = reader.u8()?;
        let sector_size = reader.u32()?;
        let sector_count = reader.u64()?;
        let media_type = reader.u32()?;

        let header = DdtRecordHeader {
            encoding,
            geometry: MediaGeometry {
                sector_count,
                kind,
                sector_size,
                subchannel,
                media_type,
            },
            block_shift,
            raw_len: reader.u64()?,
            stored_len: reader.u64()?,
            crc32: reader.u32()?,
        };

        if header.encoding != ENCODING_RAW && header.encoding != ENCODING_ZSTD {
            return Err(ArchiveError::CorruptIndex(format!(
                "unknown table encoding {}",
                header.encoding
            )));
        }
        if header.block_shift > MAX_BLOCK_SHIFT {
            return Err(ArchiveError::CorruptIndex(format!(
                "block shift {} above {MAX_BLOCK_SHIFT}",
                header.block_shift
            )));
        }
        if header.encoding == ENCODING_RAW && header.raw_len != header.stored_len {
            return Err(ArchiveError::CorruptIndex(format!(
                "uncompressed table declares {} bytes but stores {}",
                header.raw_len, header.stored_len
            )));
        }
        if header.geometry.sector_count.saturating_mul(MIN_ENTRY_LEN) > header.raw_len {
            return Err(ArchiveError::CorruptIndex(format!(
                "{} entries cannot fit in {} bytes",
                header.geometry.sector_count, header.raw_len
            )));
        }

        Ok(header)
    }
}

/// The in-memory table
#[derive(Debug, Clone)]
pub struct Ddt {
    geometry: MediaGeometry,
    block_shift: u8,
    entries: Vec<DdtEntry>,
}

impl Ddt {
    /// Table with every sector unallocated
    pub fn new(geometry: MediaGeometry, block_shift: u8) -> Self {
        let entries = vec![DdtEntry::unallocated(geometry.kind); geometry.sector_count as usize];
        Ddt {
            geometry,
            block_shift,
            entries,
        }
    }

    pub fn geometry(&self) -> &MediaGeometry {
        &self.geometry
    }

    pub fn block_shift(&self) -> u8 {
        self.block_shift
    }

    pub fn sectors_per_block(&self) -> usize {
        1 << self.block_shift
    }

    pub fn sector_count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn layout(&self, kind: SectorKind) -> SectorLayout {
        self.geometry.layout(kind)
    }

    pub fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.sector_count() {
            return Err(ArchiveError::SectorOutOfRange {
                index,
                count: self.sector_count(),
            });
        }
        Ok(())
    }

    pub fn get(&self, index: u64) -> Result<&DdtEntry> {
        self.check_index(index)?;
        Ok(&self.entries[index as usize])
    }

    /// Overwrite an entry, returning the one it replaced
    pub fn replace(&mut self, index: u64, entry: DdtEntry) -> Result<DdtEntry> {
        self.check_index(index)?;
        Ok(std::mem::replace(&mut self.entries[index as usize], entry))
    }

    pub fn entries(&self) -> &[DdtEntry] {
        &self.entries
    }

    pub fn allocated(&self) -> u64 {
        self.entries.iter().filter(|e| e.is_allocated()).count() as u64
    }

    /// Serialize the whole table as one record
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(self.entries.len() * 16);
        for entry in &self.entries {
            entry.encode_into(&mut raw);
        }

        let compressed = zstd::bulk::compress(&raw, ZSTD_LEVEL).map_err(ArchiveError::Io)?;
        let (encoding, stored) = if compressed.len() < raw.len() {
            (ENCODING_ZSTD, compressed)
        } else {
            (ENCODING_RAW, raw.clone())
        };

        let header = DdtRecordHeader {
            encoding,
            geometry: self.geometry.clone(),
            block_shift: self.block_shift,
            raw_len: raw.len() as u64,
            stored_len: stored.len() as u64,
            crc32: crc32fast::hash(&raw),
        };

        let mut record = Vec::with_capacity(DDT_HEADER_SIZE + stored.len());
        record.extend_from_slice(&header.to_bytes());
        record.extend_from_slice(&stored);
        Ok(record)
    }

    /// Rebuild a table from its record header and stored entry bytes
    pub fn decode(header: &DdtRecordHeader, stored: &[u8]) -> Result<Self> {
        let raw = match header.encoding {
            ENCODING_ZSTD => {
                let mut raw = Vec::new();
                zstd::stream::read::Decoder::new(stored)?
                    .take(header.raw_len.saturating_add(1))
                    .read_to_end(&mut raw)
                    .map_err(|e| ArchiveError::CorruptIndex(format!("table stream: {e}")))?;
                raw
            }
            _ => stored.to_vec(),
        };

        if raw.len() as u64 != header.raw_len {
            return Err(ArchiveError::CorruptIndex(format!(
                "table decoded to {} bytes, expected {}",
                raw.len(),
                header.raw_len
            )));
        }
        let crc = crc32fast::hash(&raw);
        if crc != header.crc32 {
            return Err(ArchiveError::CorruptIndex(format!(
                "table crc mismatch: stored {:08x}, computed {:08x}",
                header.crc32, crc
            )));
        }

        let mut reader = FieldReader::new(&raw, "deduplication table entry");
        let mut entries = Vec::with_capacity(header.geometry.sector_count as usize);
        for index in 0..header.geometry.sector_count {
            let entry = DdtEntry::decode_from(&mut reader).map_err(|e| match e {
                ArchiveError::Truncated { .. } => {
                    ArchiveError::CorruptIndex(format!("entry {index}: {e}"))
                }
                other => other,
            })?;
            entries.push(entry);
        }
        if !reader.is_empty() {
            return Err(ArchiveError::CorruptIndex(format!(
                "{} trailing bytes after the last table entry",
                reader.remaining()
            )));
        }

        Ok(Ddt {
            geometry: header.geometry.clone(),
            block_shift: header.block_shift,
            entries,
        })
    }
}
