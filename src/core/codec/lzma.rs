//! Generic lossless codec: raw LZMA1 streams
//!
//! liblzma's "alone" container starts with 13 bytes: the 5-byte property
//! blob (lc/lp/pb byte + little-endian dictionary size) followed by an 8-byte
//! uncompressed size. Blocks keep the property blob in their record header
//! and drop the size, which the record already carries; the stream is
//! always written with an end marker so the size field can be re-created as
//! "unknown" when decoding.

use super::LZMA_PROPERTIES_LEN;
use crate::error::{ArchiveError, Result};
use std::io::Read;
use xz2::read::{XzDecoder, XzEncoder};
use xz2::stream::{LzmaOptions, Stream};

const ALONE_HEADER_LEN: usize = LZMA_PROPERTIES_LEN + 8;
const UNKNOWN_SIZE: [u8; 8] = [0xFF; 8];
const MIN_DICTIONARY: usize = 4096;
const MAX_DICTIONARY: usize = 1 << 26;

fn dictionary_size(len: usize) -> u32 {
    len.next_power_of_two().clamp(MIN_DICTIONARY, MAX_DICTIONARY) as u32
}

/// Compress `data`, returning the property blob and the raw LZMA payload
pub fn compress(data: &[u8], preset: u32) -> Result<([u8; LZMA_PROPERTIES_LEN], Vec<u8>)> {
    let mut options = LzmaOptions::new_preset(preset)
        .map_err(|e| ArchiveError::InvalidConfig(format!("LZMA preset {preset}: {e}")))?;
    // Blocks are small; a dictionary larger than the block only costs memory
    options.dict_size(dictionary_size(data.len()));
    let stream = Stream::new_lzma_encoder(&options)
        .map_err(|e| ArchiveError::InvalidConfig(format!("LZMA encoder setup failed: {e}")))?;

    let mut encoded = Vec::with_capacity(data.len() / 2 + ALONE_HEADER_LEN);
    XzEncoder::new_stream(data, stream).read_to_end(&mut encoded)?;

    if encoded.len() < ALONE_HEADER_LEN {
        return Err(ArchiveError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "LZMA encoder produced no header",
        )));
    }

    let mut properties = [0u8; LZMA_PROPERTIES_LEN];
    properties.copy_from_slice(&encoded[..LZMA_PROPERTIES_LEN]);
    let payload = encoded.split_off(ALONE_HEADER_LEN);
    Ok((properties, payload))
}

/// Decompress a payload produced by [`compress`]
pub fn decompress(
    properties: &[u8; LZMA_PROPERTIES_LEN],
    payload: &[u8],
    expected_len: usize,
) -> Result<Vec<u8>> {
    let stream = Stream::new_lzma_decoder(u64::MAX)
        .map_err(|e| ArchiveError::CorruptBlock(format!("LZMA decoder setup failed: {e}")))?;

    let input = (&properties[..]).chain(&UNKNOWN_SIZE[..]).chain(payload);
    let mut decoder = XzDecoder::new_stream(input, stream);

    // One byte of slack so an over-long stream is seen as a length mismatch
    let mut out = Vec::with_capacity(expected_len);
    (&mut decoder)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ArchiveError::CorruptBlock(format!("LZMA stream: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data = b"Lempel-Ziv-Markov chain ".repeat(200);
        let (properties, payload) = compress(&data, 6).unwrap();
        assert!(payload.len() < data.len());

        let decoded = decompress(&properties, &payload, data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_properties_describe_dictionary() {
        let (properties, _) = compress(&[1u8; 20_000], 6).unwrap();
        // lc=3, lp=0, pb=2 encodes as (pb * 5 + lp) * 9 + lc
        assert_eq!(properties[0], 93);
        let dict = u32::from_le_bytes([properties[1], properties[2], properties[3], properties[4]]);
        assert_eq!(dict, 32768);
    }

    #[test]
    fn test_garbage_payload_is_corrupt() {
        let (properties, _) = compress(b"seed", 6).unwrap();
        let result = decompress(&properties, &[0xFF; 32], 1024);
        assert!(matches!(result, Err(ArchiveError::CorruptBlock(_))));
    }

    #[test]
    fn test_invalid_preset() {
        assert!(matches!(
            compress(b"data", 42),
            Err(ArchiveError::InvalidConfig(_))
        ));
    }
}
