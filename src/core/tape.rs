//! Tape file and partition registry
//!
//! Tape images describe which block ranges make up each file and each
//! partition. Files are keyed by `(partition, file)`, partitions by their
//! number; adding a record whose key already exists replaces the old one
//! and moves it to the end.

use crate::error::{ArchiveError, Result};
use crate::fields::FieldReader;
use crate::io::{ArchiveFile, ArchiveStream};

pub const TAPE_FILES_ID: u32 = u32::from_le_bytes(*b"TFLE");
pub const TAPE_PARTITIONS_ID: u32 = u32::from_le_bytes(*b"TPRT");

const RECORD_HEADER_SIZE: usize = 8;
const FILE_SIZE: usize = 25;
const PARTITION_SIZE: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeFile {
    pub file: u64,
    pub partition: u8,
    pub first_block: u64,
    pub last_block: u64,
}

impl TapeFile {
    fn key(&self) -> (u8, u64) {
        (self.partition, self.file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapePartition {
    pub number: u8,
    pub first_block: u64,
    pub last_block: u64,
}

fn check_extent(first: u64, last: u64) -> Result<()> {
    if first > last {
        return Err(ArchiveError::InvalidTapeExtent { first, last });
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct TapeRegistry {
    enabled: bool,
    files: Vec<TapeFile>,
    partitions: Vec<TapePartition>,
}

impl TapeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Switch tape mode on. Both collections start empty; enabling an
    /// already enabled registry changes nothing.
    pub fn enable(&mut self) {
        if !self.enabled {
            self.files.clear();
            self.partitions.clear();
            self.enabled = true;
        }
    }

    pub fn add_file(&mut self, file: TapeFile) -> Result<()> {
        if !self.enabled {
            return Err(ArchiveError::NotTape);
        }
        check_extent(file.first_block, file.last_block)?;

        let key = file.key();
        self.files.retain(|existing| existing.key() != key);
        self.files.push(file);
        Ok(())
    }

    pub fn add_partition(&mut self, partition: TapePartition) -> Result<()> {
        if !self.enabled {
            return Err(ArchiveError::NotTape);
        }
        check_extent(partition.first_block, partition.last_block)?;

        self.partitions
            .retain(|existing| existing.number != partition.number);
        self.partitions.push(partition);
        Ok(())
    }

    pub fn files(&self) -> &[TapeFile] {
        &self.files
    }

    pub fn partitions(&self) -> &[TapePartition] {
        &self.partitions
    }

    pub fn encode_files(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + self.files.len() * FILE_SIZE);
        out.extend_from_slice(&TAPE_FILES_ID.to_le_bytes());
        out.extend_from_slice(&(self.files.len() as u32).to_le_bytes());
        for file in &self.files {
            out.extend_from_slice(&file.file.to_le_bytes());
            out.push(file.partition);
            out.extend_from_slice(&file.first_block.to_le_bytes());
            out.extend_from_slice(&file.last_block.to_le_bytes());
        }
        out
    }

    pub fn encode_partitions(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(RECORD_HEADER_SIZE + self.partitions.len() * PARTITION_SIZE);
        out.extend_from_slice(&TAPE_PARTITIONS_ID.to_le_bytes());
        out.extend_from_slice(&(self.partitions.len() as u32).to_le_bytes());
        for partition in &self.partitions {
            out.push(partition.number);
            out.extend_from_slice(&partition.first_block.to_le_bytes());
            out.extend_from_slice(&partition.last_block.to_le_bytes());
        }
        out
    }

    /// Load a registry from stored records. Either record may be absent;
    /// the registry is enabled when at least one is present.
    pub fn read<S: ArchiveStream>(
        file: &mut ArchiveFile<S>,
        files_at: Option<u64>,
        partitions_at: Option<u64>,
    ) -> Result<Self> {
        let mut registry = TapeRegistry::new();
        if files_at.is_none() && partitions_at.is_none() {
            return Ok(registry);
        }
        registry.enable();

        if let Some(offset) = files_at {
            let body = read_record(file, offset, TAPE_FILES_ID, FILE_SIZE, "tape file record")?;
            let mut reader = FieldReader::new(&body, "tape file record");
            while !reader.is_empty() {
                let entry = TapeFile {
                    file: reader.u64()?,
                    partition: reader.u8()?,
                    first_block: reader.u64()?,
                    last_block: reader.u64()?,
                };
                registry.add_file(entry).map_err(as_corrupt)?;
            }
        }

        if let Some(offset) = partitions_at {
            let body = read_record(
                file,
                offset,
                TAPE_PARTITIONS_ID,
                PARTITION_SIZE,
                "tape partition record",
            )?;
            let mut reader = FieldReader::new(&body, "tape partition record");
            while !reader.is_empty() {
                let entry = TapePartition {
                    number: reader.u8()?,
                    first_block: reader.u64()?,
                    last_block: reader.u64()?,
                };
                registry.add_partition(entry).map_err(as_corrupt)?;
            }
        }

        Ok(registry)
    }
}

fn as_corrupt(error: ArchiveError) -> ArchiveError {
    ArchiveError::CorruptIndex(format!("stored tape record: {error}"))
}

fn read_record<S: ArchiveStream>(
    file: &mut ArchiveFile<S>,
    offset: u64,
    id: u32,
    entry_size: usize,
    what: &'static str,
) -> Result<Vec<u8>> {
    let header = file.read_at(offset, RECORD_HEADER_SIZE, what)?;
    let mut reader = FieldReader::new(&header, what);
    let found = reader.u32()?;
    if found != id {
        return Err(ArchiveError::CorruptIndex(format!(
            "{what}: expected identifier 0x{id:08x}, found 0x{found:08x}"
        )));
    }

    let count = reader.u32()? as u64;
    let body_offset = offset + RECORD_HEADER_SIZE as u64;
    let needed = count * entry_size as u64;
    let available = file.end().saturating_sub(body_offset);
    if needed > available {
        return Err(ArchiveError::Truncated {
            what,
            needed,
            available,
        });
    }
    file.read_at(body_offset, needed as usize, what)
}
