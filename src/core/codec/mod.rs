//! Block codec dispatch
//!
//! Every stored block is compressed with exactly one codec, recorded as a
//! tag in the block record:
//!
//! - `None`: bytes stored as-is
//! - `Lzma`: generic lossless byte codec, with a 5-byte property blob
//! - `Audio`: sample-aware lossless codec for redbook audio
//!
//! Compression is only kept when it pays for itself; a payload that does
//! not shrink below `min_ratio` of the input is stored with `None`.

pub mod audio;
pub mod lzma;

use crate::error::{ArchiveError, Result};
use crate::sector::SectorKind;

pub const LZMA_PROPERTIES_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecTag {
    None = 0,
    Lzma = 1,
    Audio = 2,
}

impl CodecTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CodecTag::None),
            1 => Some(CodecTag::Lzma),
            2 => Some(CodecTag::Audio),
            _ => None,
        }
    }
}

/// Codec settings
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Store everything uncompressed when false
    pub enabled: bool,

    /// liblzma preset level, 0..=9
    pub lzma_preset: u32,

    /// Keep a compressed payload only if `compressed / raw` is below this
    pub min_ratio: f32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            enabled: true,
            lzma_preset: 6,
            min_ratio: 0.95,
        }
    }
}

impl CodecConfig {
    /// Config that stores every block uncompressed
    pub fn none() -> Self {
        CodecConfig {
            enabled: false,
            ..Default::default()
        }
    }
}

/// A compressed block ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlock {
    pub tag: CodecTag,
    /// Meaningful only for `Lzma`; zeros otherwise
    pub properties: [u8; LZMA_PROPERTIES_LEN],
    pub payload: Vec<u8>,
}

impl EncodedBlock {
    fn stored(data: &[u8]) -> Self {
        EncodedBlock {
            tag: CodecTag::None,
            properties: [0; LZMA_PROPERTIES_LEN],
            payload: data.to_vec(),
        }
    }
}

/// Codec a block of `kind` sectors would be compressed with
pub fn select(kind: SectorKind, len: usize) -> CodecTag {
    if kind.is_audio() && len % audio::BYTES_PER_SAMPLE_PAIR == 0 {
        CodecTag::Audio
    } else {
        CodecTag::Lzma
    }
}

/// Compress a run of sectors' user data
pub fn compress(data: &[u8], kind: SectorKind, config: &CodecConfig) -> Result<EncodedBlock> {
    if !config.enabled || data.is_empty() {
        return Ok(EncodedBlock::stored(data));
    }

    let encoded = match select(kind, data.len()) {
        CodecTag::Audio => EncodedBlock {
            tag: CodecTag::Audio,
            properties: [0; LZMA_PROPERTIES_LEN],
            payload: audio::encode(data)?,
        },
        _ => {
            let (properties, payload) = lzma::compress(data, config.lzma_preset)?;
            EncodedBlock {
                tag: CodecTag::Lzma,
                properties,
                payload,
            }
        }
    };

    let ratio = encoded.payload.len() as f32 / data.len() as f32;
    if ratio < config.min_ratio {
        Ok(encoded)
    } else {
        Ok(EncodedBlock::stored(data))
    }
}

/// Decompress a block payload.
///
/// Fails with `CorruptBlock` for an unknown tag, a malformed payload, or a
/// result that is not exactly `expected_len` bytes.
pub fn decompress(
    tag: u8,
    properties: &[u8; LZMA_PROPERTIES_LEN],
    payload: &[u8],
    expected_len: usize,
) -> Result<Vec<u8>> {
    let codec = CodecTag::from_u8(tag)
        .ok_or_else(|| ArchiveError::CorruptBlock(format!("unknown codec tag {tag}")))?;

    let data = match codec {
        CodecTag::None => payload.to_vec(),
        CodecTag::Lzma => lzma::decompress(properties, payload, expected_len)?,
        CodecTag::Audio => audio::decode(payload, expected_len)?,
    };

    if data.len() != expected_len {
        return Err(ArchiveError::CorruptBlock(format!(
            "{:?} block decoded to {} bytes, expected {}",
            codec,
            data.len(),
            expected_len
        )));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(data: &[u8], kind: SectorKind, config: &CodecConfig) -> EncodedBlock {
        let block = compress(data, kind, config).unwrap();
        let decoded = decompress(block.tag as u8, &block.properties, &block.payload, data.len())
            .unwrap();
        assert_eq!(decoded, data);
        block
    }

    #[test]
    fn test_tag_conversion() {
        assert_eq!(CodecTag::from_u8(0), Some(CodecTag::None));
        assert_eq!(CodecTag::from_u8(1), Some(CodecTag::Lzma));
        assert_eq!(CodecTag::from_u8(2), Some(CodecTag::Audio));
        assert_eq!(CodecTag::from_u8(99), None);
    }

    #[test]
    fn test_data_uses_generic_codec() {
        let data = b"sector payload ".repeat(200);
        let block = round_trip(&data, SectorKind::Data, &CodecConfig::default());
        assert_eq!(block.tag, CodecTag::Lzma);
        assert!(block.payload.len() < data.len());
    }

    #[test]
    fn test_audio_uses_audio_codec() {
        let mut pcm = Vec::new();
        for i in 0..audio::SAMPLES_PER_SECTOR * 2 {
            let sample = ((i as f64 * 0.05).sin() * 8000.0) as i16;
            pcm.extend_from_slice(&sample.to_le_bytes());
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        let block = round_trip(&pcm, SectorKind::CdAudio, &CodecConfig::default());
        assert_eq!(block.tag, CodecTag::Audio);
        assert_eq!(block.properties, [0; LZMA_PROPERTIES_LEN]);
    }

    #[test]
    fn test_incompressible_falls_back_to_none() {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let block = round_trip(&data, SectorKind::Data, &CodecConfig::default());
        assert_eq!(block.tag, CodecTag::None);
    }

    #[test]
    fn test_disabled_config_stores_raw() {
        let data = vec![7u8; 1024];
        let block = round_trip(&data, SectorKind::Data, &CodecConfig::none());
        assert_eq!(block.tag, CodecTag::None);
        assert_eq!(block.payload, data);
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        let data = vec![1u8; 512];
        let block = compress(&data, SectorKind::Data, &CodecConfig::default()).unwrap();
        let result = decompress(block.tag as u8, &block.properties, &block.payload, 1024);
        assert!(matches!(result, Err(ArchiveError::CorruptBlock(_))));

        let result = decompress(CodecTag::None as u8, &[0; 5], &data, 511);
        assert!(matches!(result, Err(ArchiveError::CorruptBlock(_))));
    }

    #[test]
    fn test_unknown_tag_is_corrupt() {
        let result = decompress(7, &[0; 5], b"abc", 3);
        assert!(matches!(result, Err(ArchiveError::CorruptBlock(_))));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn fast() -> CodecConfig {
            CodecConfig {
                lzma_preset: 0,
                ..Default::default()
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn prop_data_round_trips(data in prop::collection::vec(any::<u8>(), 1..4096)) {
                let block = compress(&data, SectorKind::Data, &fast()).unwrap();
                let decoded =
                    decompress(block.tag as u8, &block.properties, &block.payload, data.len())
                        .unwrap();
                prop_assert_eq!(decoded, data);
            }

            #[test]
            fn prop_audio_round_trips(samples in prop::collection::vec(any::<i16>(), 2..4000)) {
                let pcm: Vec<u8> = samples
                    .chunks_exact(2)
                    .flat_map(|pair| pair.iter().flat_map(|s| s.to_le_bytes()))
                    .collect();
                let block = compress(&pcm, SectorKind::CdAudio, &fast()).unwrap();
                prop_assert_ne!(block.tag, CodecTag::Lzma);
                let decoded =
                    decompress(block.tag as u8, &block.properties, &block.payload, pcm.len())
                        .unwrap();
                prop_assert_eq!(decoded, pcm);
            }
        }
    }
}
