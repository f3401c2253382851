//! Archive header and format identification
//!
//! The header is the first `HEADER_SIZE` bytes of every archive:
//!
//! ```text
//! offset  size  field
//!      0     8  magic (u64, "DICMFRMT" legacy or "AARUFRMT" current)
//!      8    64  application name (32 UTF-16LE code units, zero padded)
//!     72     1  image format major version
//!     73     1  image format minor version
//!     74     1  application major version
//!     75     1  application minor version
//!     76     4  media type
//!     80     8  index offset (0 until the archive is finalized)
//!     88     8  creation time (unix seconds)
//!     96     8  last written time (unix seconds)
//! ```

use crate::error::{ArchiveError, Result};
use crate::fields::FieldReader;
use chrono::{DateTime, TimeZone, Utc};
use std::io::{Read, Seek, SeekFrom};

/// "DICMFRMT" read as a little-endian u64
pub const LEGACY_MAGIC: u64 = 0x544D_5246_4D43_4944;
/// "AARUFRMT" read as a little-endian u64
pub const CURRENT_MAGIC: u64 = 0x544D_5246_5552_4141;

/// Version 1 images carry a 16-bit index entry counter.
pub const VERSION_NARROW_INDEX: u8 = 1;
/// Version 2 widened the index entry counter to 64 bits.
pub const VERSION_MAJOR: u8 = 2;
pub const VERSION_MINOR: u8 = 0;

pub const HEADER_SIZE: usize = 104;
const APPLICATION_UNITS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub magic: u64,
    pub application: String,
    pub image_major: u8,
    pub image_minor: u8,
    pub application_major: u8,
    pub application_minor: u8,
    pub media_type: u32,
    pub index_offset: u64,
    pub creation_time: i64,
    pub last_written_time: i64,
}

impl ArchiveHeader {
    /// Header for a freshly created archive.
    pub fn new(application: &str, application_major: u8, application_minor: u8) -> Self {
        let now = Utc::now().timestamp();
        ArchiveHeader {
            magic: CURRENT_MAGIC,
            application: application.to_string(),
            image_major: VERSION_MAJOR,
            image_minor: VERSION_MINOR,
            application_major,
            application_minor,
            media_type: 0,
            index_offset: 0,
            creation_time: now,
            last_written_time: now,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.magic == LEGACY_MAGIC
    }

    /// Images written before version 2 use a 16-bit index entry counter.
    pub fn has_narrow_index(&self) -> bool {
        self.image_major <= VERSION_NARROW_INDEX
    }

    pub fn is_finalized(&self) -> bool {
        self.index_offset != 0
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.creation_time, 0).single()
    }

    pub fn last_written(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.last_written_time, 0).single()
    }

    /// Check the magic and the major-version ceiling
    pub fn validate(&self) -> Result<()> {
        if self.magic != LEGACY_MAGIC && self.magic != CURRENT_MAGIC {
            return Err(ArchiveError::NotThisFormat);
        }

        if self.image_major > VERSION_MAJOR {
            return Err(ArchiveError::UnsupportedVersion {
                major: self.image_major,
                minor: self.image_minor,
            });
        }

        Ok(())
    }

    /// Regenerate the header for a finalize pass.
    ///
    /// Whatever was opened, the rewritten header carries the current magic
    /// and format version.
    pub fn regenerate(&mut self, index_offset: u64) {
        self.magic = CURRENT_MAGIC;
        self.image_major = VERSION_MAJOR;
        self.image_minor = VERSION_MINOR;
        self.index_offset = index_offset;
        self.last_written_time = Utc::now().timestamp();
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.magic.to_le_bytes());

        for (i, unit) in self
            .application
            .encode_utf16()
            .take(APPLICATION_UNITS)
            .enumerate()
        {
            let at = 8 + i * 2;
            bytes[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        }

        bytes[72] = self.image_major;
        bytes[73] = self.image_minor;
        bytes[74] = self.application_major;
        bytes[75] = self.application_minor;
        bytes[76..80].copy_from_slice(&self.media_type.to_le_bytes());
        bytes[80..88].copy_from_slice(&self.index_offset.to_le_bytes());
        bytes[88..96].copy_from_slice(&self.creation_time.to_le_bytes());
        bytes[96..104].copy_from_slice(&self.last_written_time.to_le_bytes());
        bytes
    }

    /// Parse a header without validating it.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(bytes, "archive header");
        let magic = reader.u64()?;

        let raw_name = reader.bytes(APPLICATION_UNITS * 2)?;
        let units: Vec<u16> = raw_name
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();
        let application = String::from_utf16_lossy(&units);

        Ok(ArchiveHeader {
            magic,
            application,
            image_major: reader.u8()?,
            image_minor: reader.u8()?,
            application_major: reader.u8()?,
            application_minor: reader.u8()?,
            media_type: reader.u32()?,
            index_offset: reader.u64()?,
            creation_time: reader.i64()?,
            last_written_time: reader.i64()?,
        })
    }

    /// Parse and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = Self::parse(bytes)?;
        header.validate()?;
        Ok(header)
    }
}

/// Raw and parsed header of a stream that passed identification
#[derive(Debug, Clone)]
pub struct Identified {
    pub raw: [u8; HEADER_SIZE],
    pub header: ArchiveHeader,
}

/// Read and validate the header at the start of `stream`.
///
/// Returns `None` for anything that is not a readable archive: a stream
/// shorter than one header, an unknown magic, or a major version above the
/// supported ceiling. Never fails.
pub fn probe<R: Read + Seek + ?Sized>(stream: &mut R) -> Option<Identified> {
    stream.seek(SeekFrom::Start(0)).ok()?;

    let mut raw = [0u8; HEADER_SIZE];
    stream.read_exact(&mut raw).ok()?;

    let header = ArchiveHeader::from_bytes(&raw).ok()?;
    Some(Identified { raw, header })
}

/// True if `stream` holds an archive this implementation can read
pub fn identify<R: Read + Seek + ?Sized>(stream: &mut R) -> bool {
    probe(stream).is_some()
}
