//! Position-dependent fix-up bytes of optical sectors
//!
//! Sync patterns, headers, EDC/ECC and subchannel bytes differ for every
//! physical sector even when the user data is identical, so they never take
//! part in deduplication. Each fix-up region is described by a 32-bit word:
//!
//! ```text
//!  31      24 23                      0
//! +----------+-------------------------+
//! |   kind   |  position (frame addr)  |
//! +----------+-------------------------+
//!  FIXUP_KIND_MASK  FIXUP_POSITION_MASK
//! ```
//!
//! The position is the absolute frame address of the sector (LBA + 150).
//! Prefixes that follow the standard sync + MSF header layout are rebuilt
//! from the word alone; anything else is kept verbatim next to the word.

use crate::error::{ArchiveError, Result};
use crate::sector::{RegionRole, SectorLayout, CD_PREFIX};

pub const FIXUP_KIND_MASK: u32 = 0xFF00_0000;
pub const FIXUP_POSITION_MASK: u32 = 0x00FF_FFFF;
const KIND_SHIFT: u32 = 24;

/// Frames before LBA 0 (the two-second lead-in pregap)
pub const LEAD_IN_FRAMES: u64 = 150;

pub const CD_SYNC: [u8; 12] = [
    0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FixupKind {
    /// Region reads back as zeros
    NotDumped = 0x10,
    /// Standard mode 1 sync + header, rebuilt from the position
    Mode1Prefix = 0x20,
    /// Standard mode 2 sync + header, rebuilt from the position
    Mode2Prefix = 0x30,
    /// Bytes stored verbatim in the entry
    Inline = 0x80,
}

impl FixupKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(FixupKind::NotDumped),
            0x20 => Some(FixupKind::Mode1Prefix),
            0x30 => Some(FixupKind::Mode2Prefix),
            0x80 => Some(FixupKind::Inline),
            _ => None,
        }
    }

    fn prefix_mode(self) -> Option<u8> {
        match self {
            FixupKind::Mode1Prefix => Some(1),
            FixupKind::Mode2Prefix => Some(2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixupWord(u32);

impl FixupWord {
    pub fn new(kind: FixupKind, position: u32) -> Self {
        FixupWord(((kind as u32) << KIND_SHIFT) | (position & FIXUP_POSITION_MASK))
    }

    pub fn from_raw(raw: u32) -> Self {
        FixupWord(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn kind(self) -> Result<FixupKind> {
        let tag = ((self.0 & FIXUP_KIND_MASK) >> KIND_SHIFT) as u8;
        FixupKind::from_u8(tag)
            .ok_or_else(|| ArchiveError::CorruptIndex(format!("unknown fix-up kind 0x{tag:02x}")))
    }

    pub fn position(self) -> u32 {
        self.0 & FIXUP_POSITION_MASK
    }
}

/// One fix-up region of one sector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixup {
    pub word: FixupWord,
    /// Verbatim bytes, only for `FixupKind::Inline`
    pub inline: Vec<u8>,
}

impl Fixup {
    /// Describe `bytes`, the contents of a `role` region of the sector at
    /// frame address `address`.
    pub fn capture(role: RegionRole, bytes: &[u8], address: u64) -> Self {
        let position = (address.min(FIXUP_POSITION_MASK as u64)) as u32;

        if bytes.iter().all(|&b| b == 0) {
            return Fixup {
                word: FixupWord::new(FixupKind::NotDumped, position),
                inline: Vec::new(),
            };
        }

        if role == RegionRole::Prefix && bytes.len() == CD_PREFIX {
            for kind in [FixupKind::Mode1Prefix, FixupKind::Mode2Prefix] {
                if let Some(expected) = regenerate_prefix(kind, address) {
                    if expected[..] == bytes[..] {
                        return Fixup {
                            word: FixupWord::new(kind, position),
                            inline: Vec::new(),
                        };
                    }
                }
            }
        }

        Fixup {
            word: FixupWord::new(FixupKind::Inline, position),
            inline: bytes.to_vec(),
        }
    }

    /// Write the region's bytes into `out`, which spans exactly the region.
    pub fn restore(&self, out: &mut [u8]) -> Result<()> {
        let kind = self.word.kind()?;
        match kind {
            FixupKind::NotDumped => out.fill(0),
            FixupKind::Mode1Prefix | FixupKind::Mode2Prefix => {
                if out.len() != CD_PREFIX {
                    return Err(ArchiveError::CorruptIndex(format!(
                        "prefix fix-up applied to a {}-byte region",
                        out.len()
                    )));
                }
                let prefix = regenerate_prefix(kind, self.word.position() as u64).ok_or_else(
                    || {
                        ArchiveError::CorruptIndex(format!(
                            "frame address {} has no MSF form",
                            self.word.position()
                        ))
                    },
                )?;
                out.copy_from_slice(&prefix);
            }
            FixupKind::Inline => {
                if self.inline.len() != out.len() {
                    return Err(ArchiveError::CorruptIndex(format!(
                        "inline fix-up holds {} bytes for a {}-byte region",
                        self.inline.len(),
                        out.len()
                    )));
                }
                out.copy_from_slice(&self.inline);
            }
        }
        Ok(())
    }
}

fn to_bcd(value: u64) -> u8 {
    (((value / 10) << 4) | (value % 10)) as u8
}

/// Sync pattern plus BCD MSF header for the sector at `address`.
///
/// `None` when the address has no two-digit MSF form or `kind` is not a
/// prefix kind.
pub fn regenerate_prefix(kind: FixupKind, address: u64) -> Option<[u8; CD_PREFIX]> {
    let mode = kind.prefix_mode()?;
    let minutes = address / (60 * 75);
    if minutes > 99 {
        return None;
    }
    let seconds = (address / 75) % 60;
    let frames = address % 75;

    let mut prefix = [0u8; CD_PREFIX];
    prefix[..12].copy_from_slice(&CD_SYNC);
    prefix[12] = to_bcd(minutes);
    prefix[13] = to_bcd(seconds);
    prefix[14] = to_bcd(frames);
    prefix[15] = mode;
    Some(prefix)
}

/// Split a raw sector into its user data and fix-ups.
///
/// `raw` must be exactly `layout.raw_len()` bytes.
pub fn split<'a>(layout: &SectorLayout, raw: &'a [u8], sector_index: u64) -> (&'a [u8], Vec<Fixup>) {
    let address = sector_index + LEAD_IN_FRAMES;
    let fixups = layout
        .fixup_regions()
        .map(|region| Fixup::capture(region.role, &raw[region.range.clone()], address))
        .collect();
    (&raw[layout.user_range()], fixups)
}

/// Reassemble a raw sector from user data and its fix-ups
pub fn assemble(layout: &SectorLayout, user: &[u8], fixups: &[Fixup]) -> Result<Vec<u8>> {
    let fixup_regions: Vec<_> = layout.fixup_regions().collect();
    if fixup_regions.len() != fixups.len() {
        return Err(ArchiveError::CorruptIndex(format!(
            "{:?} sector expects {} fix-ups, entry has {}",
            layout.kind,
            fixup_regions.len(),
            fixups.len()
        )));
    }
    if user.len() != layout.user_len() {
        return Err(ArchiveError::CorruptBlock(format!(
            "user data is {} bytes, {:?} sector holds {}",
            user.len(),
            layout.kind,
            layout.user_len()
        )));
    }

    let mut raw = vec![0u8; layout.raw_len()];
    raw[layout.user_range()].copy_from_slice(user);
    for (region, fixup) in fixup_regions.into_iter().zip(fixups) {
        fixup.restore(&mut raw[region.range.clone()])?;
    }
    Ok(raw)
}
