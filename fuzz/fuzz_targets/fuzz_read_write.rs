#![no_main]
use aaruformat_rs::{Archive, ArchiveConfig, MediaGeometry};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

const SECTORS: u64 = 32;
const SECTOR: usize = 128;

#[derive(Debug, Arbitrary)]
enum Op {
    Write { index: u8, fill: u8, vary: bool },
    Read { index: u8 },
    Flush,
    Reopen,
}

fuzz_target!(|input: (u8, Vec<Op>)| {
    let (shift, ops) = input;
    let config = ArchiveConfig {
        block_shift: shift % 5,
        ..Default::default()
    };

    let mut archive = Archive::create(
        Cursor::new(Vec::new()),
        MediaGeometry::block_device(SECTORS, SECTOR as u32),
        config,
    )
    .unwrap();
    let mut model = vec![vec![0u8; SECTOR]; SECTORS as usize];

    for op in ops.into_iter().take(256) {
        match op {
            Op::Write { index, fill, vary } => {
                let index = index as u64 % SECTORS;
                let data: Vec<u8> = (0..SECTOR)
                    .map(|i| if vary { fill ^ i as u8 } else { fill })
                    .collect();
                archive.write_sector(index, &data).unwrap();
                model[index as usize] = data;
            }
            Op::Read { index } => {
                let index = index as u64 % SECTORS;
                assert_eq!(archive.read_sector(index).unwrap(), model[index as usize]);
            }
            Op::Flush => archive.flush().unwrap(),
            Op::Reopen => {
                let stream = archive.close().unwrap();
                archive = Archive::open(stream).unwrap();
            }
        }
    }

    for (index, expected) in model.iter().enumerate() {
        assert_eq!(&archive.read_sector(index as u64).unwrap(), expected);
    }
});
