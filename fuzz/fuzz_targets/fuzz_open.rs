#![no_main]
use aaruformat_rs::{identify, Archive};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

// Arbitrary bytes must be rejected with an error, never a panic
fuzz_target!(|data: &[u8]| {
    let _ = identify(&mut Cursor::new(data));

    let archive = match Archive::open(Cursor::new(data.to_vec())) {
        Ok(archive) => archive,
        Err(_) => return,
    };

    let sectors = archive.sector_count().min(64);
    for index in 0..sectors {
        let _ = archive.resolve(index);
        let _ = archive.read_sector(index);
    }
    let _ = archive.stats();
    let _ = archive.tape_files();
});
