//! # aaruformat-rs - Deduplicated Media Image Archives
//!
//! `aaruformat-rs` stores sector-level images of hard disks, optical discs
//! and tapes in a single compressed, deduplicated file:
//!
//! - **Deduplication**: identical sector content is stored once, the
//!   all-zero sector is shared per sector size
//! - **Optical fix-ups**: regenerable CD sector framing (sync, header, EDC
//!   and ECC) is split from the user data so two discs with the same
//!   payload still deduplicate
//! - **Compression**: LZMA for data blocks, a lossless audio codec for
//!   CD-DA blocks
//! - **Bounded block cache** for fast random reads
//! - **Tape metadata**: file and partition extents
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aaruformat_rs::{Archive, ArchiveConfig, MediaGeometry, Result};
//!
//! # fn main() -> Result<()> {
//! let geometry = MediaGeometry::block_device(2048, 512);
//! let archive = Archive::create_file("disk.aif", geometry, ArchiveConfig::default())?;
//!
//! archive.write_sector(0, &[0x55; 512])?;
//! let sector = archive.read_sector(0)?;
//! assert_eq!(sector, vec![0x55; 512]);
//!
//! // Writes the table and index; dropping the handle would do the same
//! archive.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Builder
//!
//! ```rust,no_run
//! use aaruformat_rs::{ArchiveBuilder, Result, SectorKind};
//!
//! # fn main() -> Result<()> {
//! let archive = ArchiveBuilder::new()
//!     .optical(333_000, SectorKind::CdMode1, false)
//!     .block_shift(6)
//!     .cache_bytes(64 * 1024 * 1024)
//!     .application("imager", 1, 0)
//!     .build_file("disc.aif")?;
//!
//! let stats = archive.stats();
//! println!("{} blocks stored", stats.blocks);
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{
    archive, block, cache, codec, config, ddt, error, fields, fixup, header, index, io, sector,
    tape, writer,
};

pub use crate::core::{
    archive::{Archive, ArchiveStats},
    cache::CacheStats,
    codec::CodecTag,
    config::ArchiveConfig,
    ddt::{BlockLocator, Resolved},
    error::{ArchiveError, Result},
    header::{identify, probe, ArchiveHeader, Identified},
    io::ArchiveStream,
    sector::{MediaGeometry, SectorKind},
    tape::{TapeFile, TapePartition},
};

use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

/// Builder for new archives
///
/// # Examples
///
/// ```rust,no_run
/// use aaruformat_rs::ArchiveBuilder;
/// use std::io::Cursor;
///
/// # fn main() -> aaruformat_rs::Result<()> {
/// let archive = ArchiveBuilder::new()
///     .block_device(1024, 4096)
///     .deduplication(false)
///     .build(Cursor::new(Vec::new()))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    geometry: Option<MediaGeometry>,
    config: ArchiveConfig,
    tape: bool,
}

impl ArchiveBuilder {
    /// Create a new ArchiveBuilder with default settings
    pub fn new() -> Self {
        ArchiveBuilder {
            geometry: None,
            config: ArchiveConfig::default(),
            tape: false,
        }
    }

    /// Set the media geometry
    pub fn geometry(mut self, geometry: MediaGeometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Plain sectors of `sector_size` bytes
    pub fn block_device(self, sector_count: u64, sector_size: u32) -> Self {
        self.geometry(MediaGeometry::block_device(sector_count, sector_size))
    }

    /// Raw optical sectors of `kind`
    pub fn optical(self, sector_count: u64, kind: SectorKind, subchannel: bool) -> Self {
        self.geometry(MediaGeometry::optical(sector_count, kind, subchannel))
    }

    /// Media type code recorded in the header (requires a geometry first)
    pub fn media_type(mut self, media_type: u32) -> Self {
        if let Some(geometry) = self.geometry.as_mut() {
            geometry.media_type = media_type;
        }
        self
    }

    /// Replace every setting at once, e.g. from a TOML file
    pub fn config(mut self, config: ArchiveConfig) -> Self {
        self.config = config;
        self
    }

    pub fn block_shift(mut self, block_shift: u8) -> Self {
        self.config.block_shift = block_shift;
        self
    }

    pub fn cache_bytes(mut self, cache_bytes: usize) -> Self {
        self.config.cache_bytes = cache_bytes;
        self
    }

    pub fn cache_entries(mut self, cache_entries: usize) -> Self {
        self.config.cache_entries = cache_entries;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compress = enabled;
        self
    }

    pub fn deduplication(mut self, enabled: bool) -> Self {
        self.config.deduplicate = enabled;
        self
    }

    /// Creator recorded in the header
    pub fn application<S: Into<String>>(mut self, name: S, major: u8, minor: u8) -> Self {
        self.config.application = name.into();
        self.config.application_major = major;
        self.config.application_minor = minor;
        self
    }

    /// Start the archive in tape mode
    pub fn tape(mut self) -> Self {
        self.tape = true;
        self
    }

    /// Build the archive in `stream`
    pub fn build<S: ArchiveStream>(self, stream: S) -> Result<Archive<S>> {
        let (geometry, tape) = self.take_geometry()?;
        let archive = Archive::create(stream, geometry, self.config)?;
        Self::finish(archive, tape)
    }

    /// Build the archive in a new file at `path`
    pub fn build_file<P: AsRef<Path>>(self, path: P) -> Result<Archive<File>> {
        let (geometry, tape) = self.take_geometry()?;
        info!("Building archive at {:?}", path.as_ref());
        let archive = Archive::create_file(path, geometry, self.config)?;
        Self::finish(archive, tape)
    }

    fn take_geometry(&self) -> Result<(MediaGeometry, bool)> {
        let geometry = self
            .geometry
            .clone()
            .ok_or_else(|| ArchiveError::InvalidConfig("geometry must be set".to_string()))?;
        Ok((geometry, self.tape))
    }

    fn finish<S: ArchiveStream>(archive: Archive<S>, tape: bool) -> Result<Archive<S>> {
        if tape {
            archive.enable_tape_mode();
            debug!("Archive built in tape mode");
        }
        Ok(archive)
    }
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_builder_requires_geometry() {
        let result = ArchiveBuilder::new().build(Cursor::new(Vec::new()));
        assert!(matches!(result, Err(ArchiveError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_settings_reach_archive() -> Result<()> {
        let archive = ArchiveBuilder::new()
            .block_device(16, 512)
            .media_type(42)
            .block_shift(2)
            .cache_entries(8)
            .deduplication(false)
            .application("builder-test", 3, 1)
            .build(Cursor::new(Vec::new()))?;

        assert_eq!(archive.sectors_per_block(), 4);
        assert_eq!(archive.geometry().media_type, 42);
        assert!(!archive.config().deduplicate);
        assert_eq!(archive.header().application, "builder-test");
        assert_eq!(archive.header().application_major, 3);
        Ok(())
    }

    #[test]
    fn test_builder_tape_mode() -> Result<()> {
        let archive = ArchiveBuilder::new()
            .block_device(16, 512)
            .tape()
            .build(Cursor::new(Vec::new()))?;
        assert!(archive.is_tape());
        Ok(())
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        let result = ArchiveBuilder::new()
            .block_device(16, 512)
            .block_shift(20)
            .build(Cursor::new(Vec::new()));
        assert!(matches!(result, Err(ArchiveError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_file() -> Result<()> {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("built.aif");

        let archive = ArchiveBuilder::new().block_device(4, 512).build_file(&path)?;
        archive.write_sector(2, &[9u8; 512])?;
        archive.close()?;

        let mut file = File::open(&path).unwrap();
        assert!(identify(&mut file));
        let reopened = Archive::open_file(&path)?;
        assert_eq!(reopened.read_sector(2)?, vec![9u8; 512]);
        Ok(())
    }
}
