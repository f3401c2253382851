//! Concurrent readers and a writer sharing one archive handle

use aaruformat_rs::{Archive, ArchiveConfig, MediaGeometry};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SECTORS: u64 = 256;

fn content(index: u64, generation: u8) -> Vec<u8> {
    let mut data = vec![generation; 512];
    data[..8].copy_from_slice(&index.to_le_bytes());
    data
}

#[test]
fn test_10_readers_1_writer() {
    let archive = Arc::new(
        Archive::create(
            Cursor::new(Vec::new()),
            MediaGeometry::block_device(SECTORS, 512),
            ArchiveConfig {
                block_shift: 3,
                cache_entries: 8,
                ..Default::default()
            },
        )
        .unwrap(),
    );

    for index in 0..SECTORS {
        archive.write_sector(index, &content(index, 1)).unwrap();
    }
    archive.flush().unwrap();

    let reads = Arc::new(AtomicU64::new(0));
    let handles: Vec<_> = (0..11)
        .map(|thread_id| {
            let archive = Arc::clone(&archive);
            let reads = Arc::clone(&reads);
            std::thread::spawn(move || {
                if thread_id == 0 {
                    for index in 0..SECTORS {
                        archive.write_sector(index, &content(index, 2)).unwrap();
                    }
                } else {
                    for _ in 0..2000 {
                        let index = rand::random::<u64>() % SECTORS;
                        let data = archive.read_sector(index).unwrap();
                        // Either generation, never a torn or foreign sector
                        assert_eq!(&data[..8], &index.to_le_bytes());
                        assert!(data[8..].iter().all(|&b| b == data[8]));
                        assert!(data[8] == 1 || data[8] == 2);
                        reads.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(reads.load(Ordering::Relaxed), 10 * 2000);
    for index in 0..SECTORS {
        assert_eq!(archive.read_sector(index).unwrap(), content(index, 2));
    }
}

#[test]
fn test_concurrent_writers_are_serialized() {
    let archive = Arc::new(
        Archive::create(
            Cursor::new(Vec::new()),
            MediaGeometry::block_device(400, 512),
            ArchiveConfig::default(),
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..4u64)
        .map(|thread_id| {
            let archive = Arc::clone(&archive);
            std::thread::spawn(move || {
                for i in 0..100 {
                    let index = thread_id * 100 + i;
                    archive.write_sector(index, &content(index, 7)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let archive = Arc::try_unwrap(archive).ok().unwrap();
    let archive = Archive::open(archive.close().unwrap()).unwrap();
    for index in 0..400 {
        assert_eq!(archive.read_sector(index).unwrap(), content(index, 7));
    }
}

#[test]
fn test_readers_on_reopened_file() {
    let temp = tempfile::NamedTempFile::new().unwrap();
    {
        let archive = Archive::create_file(
            temp.path(),
            MediaGeometry::block_device(SECTORS, 512),
            ArchiveConfig::default(),
        )
        .unwrap();
        for index in 0..SECTORS {
            archive.write_sector(index, &content(index, 3)).unwrap();
        }
        archive.close().unwrap();
    }

    let archive = Arc::new(Archive::open_file(temp.path()).unwrap());
    let handles: Vec<_> = (0..8u64)
        .map(|thread_id| {
            let archive = Arc::clone(&archive);
            std::thread::spawn(move || {
                for step in 0..SECTORS {
                    let index = (step * 7 + thread_id * 31) % SECTORS;
                    assert_eq!(archive.read_sector(index).unwrap(), content(index, 3));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(archive.stats().cache.hits > 0);
}
