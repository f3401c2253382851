//! Corruption detection tests
//!
//! Damage to a block must fail only the sectors stored in it; damage to
//! the index or table must fail the open.

use aaruformat_rs::core::block::BLOCK_HEADER_SIZE;
use aaruformat_rs::core::header::HEADER_SIZE;
use aaruformat_rs::core::index::{BlockType, Index};
use aaruformat_rs::core::io::ArchiveFile;
use aaruformat_rs::{Archive, ArchiveConfig, ArchiveError, ArchiveHeader, MediaGeometry};
use std::io::Cursor;

fn sector(seed: u8) -> Vec<u8> {
    (0..512).map(|i| seed ^ (i as u8).wrapping_mul(3)).collect()
}

/// Four sectors, one block each, in write order
fn four_blocks() -> Vec<u8> {
    let archive = Archive::create(
        Cursor::new(Vec::new()),
        MediaGeometry::block_device(4, 512),
        ArchiveConfig {
            block_shift: 0,
            ..Default::default()
        },
    )
    .unwrap();
    for index in 0..4u64 {
        archive.write_sector(index, &sector(index as u8 + 1)).unwrap();
    }
    archive.close().unwrap().into_inner()
}

fn record_offset(bytes: &[u8], block_type: BlockType) -> u64 {
    let header = ArchiveHeader::parse(&bytes[..HEADER_SIZE]).unwrap();
    let mut file = ArchiveFile::new(Cursor::new(bytes.to_vec()), bytes.len() as u64);
    let index = Index::read(&mut file, header.index_offset, false).unwrap();
    index.find(block_type).unwrap().offset
}

#[test]
fn test_damaged_payload_fails_only_its_sector() {
    let mut bytes = four_blocks();
    let first_payload = HEADER_SIZE + BLOCK_HEADER_SIZE;
    bytes[first_payload + 4] ^= 0x5A;

    let archive = Archive::open(Cursor::new(bytes)).unwrap();
    match archive.read_sector(0) {
        Err(ArchiveError::CorruptBlock(_)) => {}
        other => panic!("expected CorruptBlock, got {:?}", other.map(|d| d.len())),
    }
    for index in 1..4u64 {
        assert_eq!(archive.read_sector(index).unwrap(), sector(index as u8 + 1));
    }

    // Still failing on a second attempt; nothing bad was cached
    assert!(archive.read_sector(0).unwrap_err().is_corruption());
}

#[test]
fn test_damaged_block_header_fails_only_its_sector() {
    let mut bytes = four_blocks();
    // Last data block listed holds sector 3
    let last_block = record_offset(&bytes, BlockType::DataBlock) as usize;
    bytes[last_block] = b'X';

    let archive = Archive::open(Cursor::new(bytes)).unwrap();
    assert!(archive.read_sector(3).unwrap_err().is_corruption());
    assert_eq!(archive.read_sector(2).unwrap(), sector(3));
}

#[test]
fn test_damaged_table_fails_open() {
    let mut bytes = four_blocks();
    // Inside the stored entries, past the 44-byte record header
    let table = record_offset(&bytes, BlockType::DedupTable) as usize;
    bytes[table + 50] ^= 0xFF;

    let error = Archive::open(Cursor::new(bytes)).err().unwrap();
    assert!(matches!(error, ArchiveError::CorruptIndex(_)), "{error}");
}

#[test]
fn test_damaged_index_fails_open() {
    let mut bytes = four_blocks();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;

    let error = Archive::open(Cursor::new(bytes)).err().unwrap();
    assert!(matches!(error, ArchiveError::CorruptIndex(_)), "{error}");
}

#[test]
fn test_truncated_archive_fails_open() {
    let mut bytes = four_blocks();
    bytes.truncate(bytes.len() - 20);

    let error = Archive::open(Cursor::new(bytes)).err().unwrap();
    assert!(matches!(error, ArchiveError::Truncated { .. }), "{error}");
}

#[test]
fn test_index_offset_past_end_fails_open() {
    let mut bytes = four_blocks();
    let mut header = ArchiveHeader::parse(&bytes[..HEADER_SIZE]).unwrap();
    header.index_offset = bytes.len() as u64 + 4096;
    bytes[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

    let error = Archive::open(Cursor::new(bytes)).err().unwrap();
    assert!(matches!(error, ArchiveError::Truncated { .. }), "{error}");
}

#[test]
fn test_corrupt_file_on_disk() {
    let temp = tempfile::NamedTempFile::new().unwrap();
    let mut bytes = four_blocks();
    bytes[HEADER_SIZE + BLOCK_HEADER_SIZE] ^= 0xFF;
    std::fs::write(temp.path(), &bytes).unwrap();

    let archive = Archive::open_file(temp.path()).unwrap();
    assert!(archive.read_sector(0).unwrap_err().is_corruption());
    assert_eq!(archive.read_sector(1).unwrap(), sector(2));
}
