//! Optical sector tests
//!
//! Position-dependent framing must never stop identical payloads from
//! being shared, and must come back byte for byte.

use aaruformat_rs::core::fixup::{regenerate_prefix, FixupKind, LEAD_IN_FRAMES};
use aaruformat_rs::{Archive, ArchiveConfig, MediaGeometry, Result, SectorKind};
use std::io::Cursor;

fn mode1_sector(lba: u64, payload_seed: u8) -> Vec<u8> {
    let mut raw = Vec::with_capacity(2352);
    raw.extend_from_slice(&regenerate_prefix(FixupKind::Mode1Prefix, lba + LEAD_IN_FRAMES).unwrap());
    raw.extend((0..2048).map(|i| payload_seed.wrapping_add((i % 199) as u8)));
    // EDC/ECC differ per sector
    raw.extend((0..288).map(|i| (lba as u8).wrapping_mul(7).wrapping_add(i as u8)));
    raw
}

fn mode2_sector(lba: u64, payload_seed: u8) -> Vec<u8> {
    let mut raw = Vec::with_capacity(2352);
    raw.extend_from_slice(&regenerate_prefix(FixupKind::Mode2Prefix, lba + LEAD_IN_FRAMES).unwrap());
    raw.extend((0..2336).map(|i| payload_seed.wrapping_add((i % 97) as u8)));
    raw
}

fn audio_sector(seed: u16) -> Vec<u8> {
    (0..588u16)
        .flat_map(|i| {
            let left = ((i.wrapping_mul(37).wrapping_add(seed)) % 2000) as i16 - 1000;
            let right = left / 2;
            let mut frame = left.to_le_bytes().to_vec();
            frame.extend_from_slice(&right.to_le_bytes());
            frame
        })
        .collect()
}

fn config() -> ArchiveConfig {
    ArchiveConfig {
        block_shift: 0,
        ..Default::default()
    }
}

#[test]
fn test_same_payload_at_different_addresses_is_shared() -> Result<()> {
    let geometry = MediaGeometry::optical(1000, SectorKind::CdMode1, false);
    let archive = Archive::create(Cursor::new(Vec::new()), geometry, config())?;

    let first = mode1_sector(10, 3);
    let second = mode1_sector(700, 3);
    assert_ne!(first, second);

    archive.write_sector(10, &first)?;
    archive.write_sector(700, &second)?;

    let stats = archive.stats();
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.dedup_hits, 1);

    assert_eq!(archive.read_sector(10)?, first);
    assert_eq!(archive.read_sector(700)?, second);
    assert_eq!(archive.read_user_data(700)?, first[16..16 + 2048].to_vec());

    let archive = Archive::open(archive.close()?)?;
    assert_eq!(archive.read_sector(10)?, first);
    assert_eq!(archive.read_sector(700)?, second);
    Ok(())
}

#[test]
fn test_nonstandard_prefix_is_kept_verbatim() -> Result<()> {
    let geometry = MediaGeometry::optical(100, SectorKind::CdMode1, false);
    let archive = Archive::create(Cursor::new(Vec::new()), geometry, config())?;

    // Header claims an address other than the sector's own
    let mut odd = mode1_sector(5, 8);
    odd[..16].copy_from_slice(&regenerate_prefix(FixupKind::Mode1Prefix, 9999).unwrap());
    archive.write_sector(5, &odd)?;

    let archive = Archive::open(archive.close()?)?;
    assert_eq!(archive.read_sector(5)?, odd);
    Ok(())
}

#[test]
fn test_unread_framing_is_zero_filled() -> Result<()> {
    let geometry = MediaGeometry::optical(10, SectorKind::CdMode1, false);
    let archive = Archive::create(Cursor::new(Vec::new()), geometry, config())?;

    let mut sector = mode1_sector(2, 1);
    sector[..16].fill(0);
    sector[2064..].fill(0);
    archive.write_sector(2, &sector)?;
    assert_eq!(archive.read_sector(2)?, sector);
    Ok(())
}

#[test]
fn test_mixed_kinds_on_one_disc() -> Result<()> {
    let geometry = MediaGeometry::optical(50, SectorKind::CdMode1, false);
    let archive = Archive::create(
        Cursor::new(Vec::new()),
        geometry,
        ArchiveConfig {
            block_shift: 2,
            ..Default::default()
        },
    )?;

    let data = mode1_sector(0, 1);
    let xa = mode2_sector(1, 2);
    let audio = audio_sector(5);

    archive.write_sector(0, &data)?;
    archive.write_sector_as(1, SectorKind::CdMode2, &xa)?;
    archive.write_sector_as(2, SectorKind::CdAudio, &audio)?;
    archive.write_sector(3, &mode1_sector(3, 9))?;

    // Different shapes never share a block
    archive.flush()?;
    assert!(archive.stats().blocks >= 3);

    let archive = Archive::open(archive.close()?)?;
    assert_eq!(archive.read_sector(0)?, data);
    assert_eq!(archive.read_sector(1)?, xa);
    assert_eq!(archive.read_sector(2)?, audio);
    assert_eq!(archive.read_sector(3)?, mode1_sector(3, 9));
    Ok(())
}

#[test]
fn test_audio_track_round_trip() -> Result<()> {
    let geometry = MediaGeometry::optical(64, SectorKind::CdAudio, false);
    let archive = Archive::create(Cursor::new(Vec::new()), geometry, ArchiveConfig::default())?;
    for index in 0..64u64 {
        archive.write_sector(index, &audio_sector(index as u16 * 11))?;
    }
    archive.flush()?;
    assert!(archive.stats().compression_ratio() < 1.0);

    let archive = Archive::open(archive.close()?)?;
    for index in 0..64u64 {
        assert_eq!(archive.read_sector(index)?, audio_sector(index as u16 * 11));
    }
    Ok(())
}

#[test]
fn test_subchannel_travels_with_sector() -> Result<()> {
    let geometry = MediaGeometry::optical(20, SectorKind::CdMode1, true);
    let archive = Archive::create(Cursor::new(Vec::new()), geometry, config())?;

    let mut first = mode1_sector(4, 6);
    first.extend((0..96).map(|i| i as u8));
    let mut second = mode1_sector(9, 6);
    second.extend((0..96).map(|i| 255 - i as u8));

    archive.write_sector(4, &first)?;
    archive.write_sector(9, &second)?;
    assert_eq!(archive.stats().blocks, 1);

    let archive = Archive::open(archive.close()?)?;
    assert_eq!(archive.read_sector(4)?, first);
    assert_eq!(archive.read_sector(9)?, second);
    assert_eq!(archive.read_sector(0)?.len(), 2352 + 96);
    Ok(())
}
