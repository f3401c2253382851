//! Tape file and partition metadata tests

use aaruformat_rs::{
    Archive, ArchiveConfig, ArchiveError, ArchiveHeader, MediaGeometry, Result, TapeFile,
    TapePartition,
};
use std::io::Cursor;

fn tape_archive() -> Result<Archive<Cursor<Vec<u8>>>> {
    let archive = Archive::create(
        Cursor::new(Vec::new()),
        MediaGeometry::block_device(1000, 512),
        ArchiveConfig::default(),
    )?;
    archive.enable_tape_mode();
    Ok(archive)
}

fn file(partition: u8, file: u64, first_block: u64, last_block: u64) -> TapeFile {
    TapeFile {
        file,
        partition,
        first_block,
        last_block,
    }
}

#[test]
fn test_disk_archive_rejects_tape_records() -> Result<()> {
    let archive = Archive::create(
        Cursor::new(Vec::new()),
        MediaGeometry::block_device(10, 512),
        ArchiveConfig::default(),
    )?;
    assert!(!archive.is_tape());
    assert!(matches!(
        archive.add_file(file(0, 0, 0, 9)),
        Err(ArchiveError::NotTape)
    ));
    assert!(matches!(
        archive.add_partition(TapePartition {
            number: 0,
            first_block: 0,
            last_block: 9
        }),
        Err(ArchiveError::NotTape)
    ));
    Ok(())
}

#[test]
fn test_upsert_replaces_same_identity() -> Result<()> {
    let archive = tape_archive()?;
    archive.add_file(file(0, 1, 0, 99))?;
    archive.add_file(file(0, 2, 100, 199))?;
    archive.add_file(file(1, 1, 0, 49))?;
    archive.add_file(file(0, 1, 0, 149))?;

    let files = archive.tape_files();
    assert_eq!(files.len(), 3);
    assert_eq!(files.last(), Some(&file(0, 1, 0, 149)));
    assert!(files.contains(&file(1, 1, 0, 49)));
    Ok(())
}

#[test]
fn test_inverted_extent_is_rejected() -> Result<()> {
    let archive = tape_archive()?;
    assert!(matches!(
        archive.add_file(file(0, 0, 50, 10)),
        Err(ArchiveError::InvalidTapeExtent { first: 50, last: 10 })
    ));
    assert!(archive.tape_files().is_empty());
    Ok(())
}

#[test]
fn test_enabling_twice_keeps_records() -> Result<()> {
    let archive = tape_archive()?;
    archive.add_partition(TapePartition {
        number: 0,
        first_block: 0,
        last_block: 999,
    })?;
    archive.enable_tape_mode();
    assert_eq!(archive.tape_partitions().len(), 1);
    Ok(())
}

#[test]
fn test_tape_metadata_persists() -> Result<()> {
    let archive = tape_archive()?;
    archive.write_sector(0, &[0xAAu8; 512])?;
    archive.add_partition(TapePartition {
        number: 0,
        first_block: 0,
        last_block: 499,
    })?;
    archive.add_partition(TapePartition {
        number: 1,
        first_block: 500,
        last_block: 999,
    })?;
    archive.add_file(file(0, 0, 0, 249))?;
    archive.add_file(file(0, 1, 250, 499))?;
    archive.add_file(file(1, 0, 500, 999))?;
    let expected_files = archive.tape_files();
    let expected_partitions = archive.tape_partitions();

    let archive = Archive::open(archive.close()?)?;
    assert!(archive.is_tape());
    assert_eq!(archive.tape_files(), expected_files);
    assert_eq!(archive.tape_partitions(), expected_partitions);
    assert_eq!(archive.read_sector(0)?, vec![0xAAu8; 512]);

    // Updating a reopened archive keeps the other records
    archive.add_file(file(1, 0, 500, 899))?;
    let archive = Archive::open(archive.close()?)?;
    let files = archive.tape_files();
    assert_eq!(files.len(), 3);
    assert_eq!(files.last(), Some(&file(1, 0, 500, 899)));
    Ok(())
}

#[test]
fn test_empty_tape_survives_reopen() -> Result<()> {
    let archive = tape_archive()?;
    let archive = Archive::open(archive.close()?)?;
    assert!(archive.is_tape());
    assert!(archive.tape_files().is_empty());
    Ok(())
}

#[test]
fn test_reading_tape_archive_does_not_rewrite_it() -> Result<()> {
    let archive = tape_archive()?;
    archive.add_file(file(0, 0, 0, 9))?;
    let bytes = archive.close()?.into_inner();

    let archive = Archive::open(Cursor::new(bytes.clone()))?;
    archive.enable_tape_mode();
    assert!(!archive.is_dirty());
    let after = archive.close()?.into_inner();
    assert_eq!(after, bytes);

    let header = ArchiveHeader::parse(&after).unwrap();
    assert!(header.is_finalized());
    Ok(())
}
