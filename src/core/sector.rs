//! Sector kinds and the layout of their raw bytes
//!
//! A raw sector is split into regions. Exactly one region holds user data,
//! which is what gets deduplicated and stored in compressed blocks. The
//! other regions are fix-ups: bytes whose value depends on where the sector
//! sits on the medium and that are kept inline in the sector's table entry.
//!
//! ```text
//! CdMode1   [prefix 16][user 2048][suffix 288]([subchannel 96])
//! CdMode2   [prefix 16][user 2336]            ([subchannel 96])
//! CdAudio   [user 2352]                       ([subchannel 96])
//! Data      [user sector_size]
//! ```

use crate::error::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

pub const CD_RAW_SECTOR: usize = 2352;
pub const CD_PREFIX: usize = 16;
pub const CD_MODE1_USER: usize = 2048;
pub const CD_MODE1_SUFFIX: usize = 288;
pub const CD_MODE2_USER: usize = 2336;
pub const CD_SUBCHANNEL: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SectorKind {
    /// Plain sector, every byte is user data
    Data = 0,
    /// Raw CD-ROM mode 1 sector
    CdMode1 = 1,
    /// Raw CD-ROM mode 2 sector
    CdMode2 = 2,
    /// Redbook digital audio
    CdAudio = 3,
}

impl SectorKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SectorKind::Data),
            1 => Ok(SectorKind::CdMode1),
            2 => Ok(SectorKind::CdMode2),
            3 => Ok(SectorKind::CdAudio),
            other => Err(ArchiveError::CorruptIndex(format!(
                "unknown sector kind {other}"
            ))),
        }
    }

    pub fn is_optical(self) -> bool {
        !matches!(self, SectorKind::Data)
    }

    pub fn is_audio(self) -> bool {
        matches!(self, SectorKind::CdAudio)
    }
}

/// What a region of a raw sector holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionRole {
    Prefix,
    UserData,
    Suffix,
    Subchannel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub role: RegionRole,
    pub range: Range<usize>,
}

/// Byte layout of one raw sector of a given kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorLayout {
    pub kind: SectorKind,
    pub regions: Vec<Region>,
}

impl SectorLayout {
    /// Layout for `kind`.
    ///
    /// `data_size` only applies to plain data sectors; `subchannel` only to
    /// optical ones.
    pub fn new(kind: SectorKind, data_size: usize, subchannel: bool) -> Self {
        let mut parts: Vec<(RegionRole, usize)> = match kind {
            SectorKind::Data => vec![(RegionRole::UserData, data_size)],
            SectorKind::CdMode1 => vec![
                (RegionRole::Prefix, CD_PREFIX),
                (RegionRole::UserData, CD_MODE1_USER),
                (RegionRole::Suffix, CD_MODE1_SUFFIX),
            ],
            SectorKind::CdMode2 => vec![
                (RegionRole::Prefix, CD_PREFIX),
                (RegionRole::UserData, CD_MODE2_USER),
            ],
            SectorKind::CdAudio => vec![(RegionRole::UserData, CD_RAW_SECTOR)],
        };

        if subchannel && kind.is_optical() {
            parts.push((RegionRole::Subchannel, CD_SUBCHANNEL));
        }

        let mut offset = 0;
        let regions = parts
            .into_iter()
            .map(|(role, len)| {
                let range = offset..offset + len;
                offset += len;
                Region { role, range }
            })
            .collect();

        SectorLayout { kind, regions }
    }

    /// Total raw sector length
    pub fn raw_len(&self) -> usize {
        self.regions.last().map(|r| r.range.end).unwrap_or(0)
    }

    pub fn user_range(&self) -> Range<usize> {
        self.regions
            .iter()
            .find(|r| r.role == RegionRole::UserData)
            .map(|r| r.range.clone())
            .unwrap_or(0..0)
    }

    pub fn user_len(&self) -> usize {
        self.user_range().len()
    }

    /// Regions stored as fix-ups, in on-disk order
    pub fn fixup_regions(&self) -> impl Iterator<Item = &Region> {
        self.regions
            .iter()
            .filter(|r| r.role != RegionRole::UserData)
    }
}

/// Shape of the medium being archived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaGeometry {
    pub sector_count: u64,
    /// Kind used by `write_sector` and for unwritten sectors
    pub kind: SectorKind,
    /// Size of plain data sectors
    pub sector_size: u32,
    /// Optical sectors carry 96 trailing subchannel bytes
    #[serde(default)]
    pub subchannel: bool,
    #[serde(default)]
    pub media_type: u32,
}

impl MediaGeometry {
    /// Hard disk style geometry: `sector_count` plain sectors of `sector_size`
    pub fn block_device(sector_count: u64, sector_size: u32) -> Self {
        MediaGeometry {
            sector_count,
            kind: SectorKind::Data,
            sector_size,
            subchannel: false,
            media_type: 0,
        }
    }

    /// Optical disc of `sector_count` raw sectors of `kind`
    pub fn optical(sector_count: u64, kind: SectorKind, subchannel: bool) -> Self {
        MediaGeometry {
            sector_count,
            kind,
            sector_size: CD_RAW_SECTOR as u32,
            subchannel,
            media_type: 0,
        }
    }

    pub fn layout(&self, kind: SectorKind) -> SectorLayout {
        SectorLayout::new(kind, self.sector_size as usize, self.subchannel)
    }

    pub fn default_layout(&self) -> SectorLayout {
        self.layout(self.kind)
    }

    /// Check the geometry can be stored in blocks of `2^block_shift` sectors
    pub fn validate(&self, block_shift: u8) -> Result<()> {
        if self.sector_count == 0 {
            return Err(ArchiveError::InvalidConfig(
                "sector count must be at least 1".to_string(),
            ));
        }
        if self.kind == SectorKind::Data && self.sector_size == 0 {
            return Err(ArchiveError::InvalidConfig(
                "data sectors need a non-zero sector size".to_string(),
            ));
        }

        // Block lengths are recorded as u32; any kind may be written
        let widest = u64::from(self.sector_size).max(CD_RAW_SECTOR as u64);
        let span = widest.checked_shl(u32::from(block_shift)).unwrap_or(u64::MAX);
        if span > u64::from(u32::MAX) {
            return Err(ArchiveError::InvalidConfig(format!(
                "{}-byte sectors in blocks of 2^{} exceed the 4 GiB block limit",
                self.sector_size, block_shift
            )));
        }
        Ok(())
    }
}
