use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Not an archive of this format")]
    NotThisFormat,

    #[error("Truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: u64,
        available: u64,
    },

    #[error("Unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Corrupt block: {0}")]
    CorruptBlock(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sector {index} out of range (archive holds {count} sectors)")]
    SectorOutOfRange { index: u64, count: u64 },

    #[error("Invalid sector length: expected {expected} bytes, got {actual}")]
    InvalidSectorLength { expected: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    Serialization(#[from] toml::de::Error),

    #[error("Archive is not in tape mode")]
    NotTape,

    #[error("Invalid tape extent: first block {first} is after last block {last}")]
    InvalidTapeExtent { first: u64, last: u64 },
}

impl ArchiveError {
    /// True for errors confined to a single sector or block.
    ///
    /// Callers extracting data from damaged images can skip the sector and
    /// keep reading.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ArchiveError::CorruptIndex(_) | ArchiveError::CorruptBlock(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Fail with `Truncated` unless `bytes` holds at least `needed` bytes.
pub(crate) fn ensure_len(bytes: &[u8], needed: usize, what: &'static str) -> Result<()> {
    if bytes.len() < needed {
        return Err(ArchiveError::Truncated {
            what,
            needed: needed as u64,
            available: bytes.len() as u64,
        });
    }
    Ok(())
}
