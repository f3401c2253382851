//! Archive configuration

use crate::codec::CodecConfig;
use crate::ddt::MAX_BLOCK_SHIFT;
use crate::error::{ArchiveError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CACHE_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_CACHE_ENTRIES: usize = 1024;
pub const DEFAULT_BLOCK_SHIFT: u8 = 4;

/// Settings for creating or opening an archive.
///
/// Every field has a default, so a TOML document only needs the keys it
/// changes:
///
/// ```toml
/// cache_bytes = 67108864
/// block_shift = 6
/// application = "imager"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Byte budget of the decoded block cache
    pub cache_bytes: usize,

    /// Maximum number of cached blocks
    pub cache_entries: usize,

    /// Sectors per block is `2^block_shift`
    pub block_shift: u8,

    /// LZMA preset, 0..=9
    pub lzma_preset: u32,

    /// Store every block uncompressed when false
    pub compress: bool,

    /// Alias identical sector content when true. The all-zero sector is
    /// always aliased.
    pub deduplicate: bool,

    /// Keep a compressed payload only when it is smaller than
    /// `min_ratio` of the raw bytes
    pub min_ratio: f32,

    /// Creator recorded in the header
    pub application: String,
    pub application_major: u8,
    pub application_minor: u8,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            cache_bytes: DEFAULT_CACHE_BYTES,
            cache_entries: DEFAULT_CACHE_ENTRIES,
            block_shift: DEFAULT_BLOCK_SHIFT,
            lzma_preset: 6,
            compress: true,
            deduplicate: true,
            min_ratio: 0.95,
            application: env!("CARGO_PKG_NAME").to_string(),
            application_major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            application_minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        }
    }
}

impl ArchiveConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ArchiveConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ArchiveError::InvalidConfig(format!("cannot serialize config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_shift > MAX_BLOCK_SHIFT {
            return Err(ArchiveError::InvalidConfig(format!(
                "block_shift {} above {}",
                self.block_shift, MAX_BLOCK_SHIFT
            )));
        }
        if self.lzma_preset > 9 {
            return Err(ArchiveError::InvalidConfig(format!(
                "lzma_preset {} outside 0..=9",
                self.lzma_preset
            )));
        }
        if !(self.min_ratio > 0.0 && self.min_ratio <= 1.0) {
            return Err(ArchiveError::InvalidConfig(format!(
                "min_ratio {} outside (0, 1]",
                self.min_ratio
            )));
        }
        Ok(())
    }

    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            enabled: self.compress,
            lzma_preset: self.lzma_preset,
            min_ratio: self.min_ratio,
        }
    }
}
