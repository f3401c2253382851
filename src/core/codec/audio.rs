//! Lossless codec for redbook audio
//!
//! Redbook sectors hold 588 interleaved stereo frames of signed 16-bit
//! little-endian samples. The stream is cut into frames of between
//! [`MIN_FRAME_SAMPLES`] and [`MAX_FRAME_SAMPLES`] samples; each channel of
//! each frame is coded as a subframe:
//!
//! - constant: every sample equal, stored once
//! - fixed(order 0..=4): polynomial predictor with `order` verbatim warm-up
//!   samples, residuals Rice coded with a per-subframe parameter
//!
//! ```text
//! stream   := frame_samples:16 frame*
//! frame    := subframe(left) subframe(right)
//! subframe := type:3 ( value:16 | warmup:16*order rice_k:5 rice* )
//! rice     := quotient as zeros, a one bit, k low bits
//! ```
//!
//! Short frames cost predictor warm-up and parameter overhead; frames past
//! the maximum stop improving prediction and only delay decoding.

use crate::error::{ArchiveError, Result};

pub const MIN_FRAME_SAMPLES: usize = 256;
pub const MAX_FRAME_SAMPLES: usize = 4608;
/// Stereo sample pairs in one 2352-byte redbook sector
pub const SAMPLES_PER_SECTOR: usize = 588;
pub const BYTES_PER_SAMPLE_PAIR: usize = 4;

const MAX_ORDER: usize = 4;
const MAX_RICE_PARAM: u32 = 24;
const TYPE_CONSTANT: u64 = 0;

/// Frame length for a block of `total_samples` sample pairs
pub fn frame_samples_for(total_samples: usize) -> usize {
    total_samples.clamp(MIN_FRAME_SAMPLES, MAX_FRAME_SAMPLES)
}

/// Encode interleaved 16-bit stereo PCM with the default frame policy
pub fn encode(pcm: &[u8]) -> Result<Vec<u8>> {
    encode_with_frame(pcm, frame_samples_for(pcm.len() / BYTES_PER_SAMPLE_PAIR))
}

/// Encode with an explicit frame length
pub fn encode_with_frame(pcm: &[u8], frame_samples: usize) -> Result<Vec<u8>> {
    if !(MIN_FRAME_SAMPLES..=MAX_FRAME_SAMPLES).contains(&frame_samples) {
        return Err(ArchiveError::InvalidConfig(format!(
            "audio frame of {frame_samples} samples outside {MIN_FRAME_SAMPLES}..={MAX_FRAME_SAMPLES}"
        )));
    }
    if pcm.len() % BYTES_PER_SAMPLE_PAIR != 0 {
        return Err(ArchiveError::InvalidConfig(format!(
            "{} bytes is not a whole number of stereo samples",
            pcm.len()
        )));
    }

    let mut writer = BitWriter::with_capacity(pcm.len() / 2);
    writer.write(frame_samples as u64, 16);

    let mut left = Vec::with_capacity(frame_samples);
    let mut right = Vec::with_capacity(frame_samples);
    for frame in pcm.chunks(frame_samples * BYTES_PER_SAMPLE_PAIR) {
        left.clear();
        right.clear();
        for pair in frame.chunks_exact(BYTES_PER_SAMPLE_PAIR) {
            left.push(i16::from_le_bytes([pair[0], pair[1]]) as i64);
            right.push(i16::from_le_bytes([pair[2], pair[3]]) as i64);
        }
        encode_subframe(&mut writer, &left);
        encode_subframe(&mut writer, &right);
    }

    Ok(writer.finish())
}

/// Decode a stream back to `expected_len` bytes of PCM
pub fn decode(payload: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    if expected_len % BYTES_PER_SAMPLE_PAIR != 0 {
        return Err(ArchiveError::CorruptBlock(format!(
            "audio block length {expected_len} is not a whole number of stereo samples"
        )));
    }

    let mut reader = BitReader::new(payload);
    let frame_samples = reader.read(16)? as usize;
    if frame_samples == 0 {
        return Err(ArchiveError::CorruptBlock(
            "audio stream declares empty frames".to_string(),
        ));
    }

    let mut remaining = expected_len / BYTES_PER_SAMPLE_PAIR;
    let mut out = Vec::with_capacity(expected_len);
    while remaining > 0 {
        let count = remaining.min(frame_samples);
        let left = decode_subframe(&mut reader, count)?;
        let right = decode_subframe(&mut reader, count)?;
        for (l, r) in left.iter().zip(&right) {
            out.extend_from_slice(&l.to_le_bytes());
            out.extend_from_slice(&r.to_le_bytes());
        }
        remaining -= count;
    }

    Ok(out)
}

fn predict(history: &[i64], i: usize, order: usize) -> i64 {
    match order {
        0 => 0,
        1 => history[i - 1],
        2 => 2 * history[i - 1] - history[i - 2],
        3 => 3 * history[i - 1] - 3 * history[i - 2] + history[i - 3],
        _ => 4 * history[i - 1] - 6 * history[i - 2] + 4 * history[i - 3] - history[i - 4],
    }
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn residuals(samples: &[i64], order: usize) -> Vec<u64> {
    (order..samples.len())
        .map(|i| zigzag(samples[i] - predict(samples, i, order)))
        .collect()
}

/// Rice parameter with the smallest coded size, and that size in bits
fn best_rice_param(values: &[u64]) -> (u32, u64) {
    (0..=MAX_RICE_PARAM)
        .map(|k| {
            let bits: u64 = values.iter().map(|&u| (u >> k) + 1 + k as u64).sum();
            (k, bits)
        })
        .min_by_key(|&(_, bits)| bits)
        .unwrap_or((0, 0))
}

fn encode_subframe(writer: &mut BitWriter, samples: &[i64]) {
    if let Some(&first) = samples.first() {
        if samples.iter().all(|&s| s == first) {
            writer.write(TYPE_CONSTANT, 3);
            writer.write(first as u16 as u64, 16);
            return;
        }
    }

    let order = (0..=MAX_ORDER.min(samples.len()))
        .min_by_key(|&order| {
            let (_, bits) = best_rice_param(&residuals(samples, order));
            bits + 16 * order as u64
        })
        .unwrap_or(0);

    let coded = residuals(samples, order);
    let (k, _) = best_rice_param(&coded);

    writer.write(1 + order as u64, 3);
    for &warmup in &samples[..order] {
        writer.write(warmup as u16 as u64, 16);
    }
    writer.write(k as u64, 5);
    for &value in &coded {
        writer.write_unary(value >> k);
        writer.write(value, k);
    }
}

fn decode_subframe(reader: &mut BitReader<'_>, count: usize) -> Result<Vec<i16>> {
    let subframe_type = reader.read(3)?;
    if subframe_type == TYPE_CONSTANT {
        let value = reader.read(16)? as u16 as i16;
        return Ok(vec![value; count]);
    }

    let order = (subframe_type - 1) as usize;
    if order > MAX_ORDER {
        return Err(ArchiveError::CorruptBlock(format!(
            "unknown audio subframe type {subframe_type}"
        )));
    }
    if order > count {
        return Err(ArchiveError::CorruptBlock(format!(
            "predictor order {order} exceeds a {count}-sample frame"
        )));
    }

    let mut history: Vec<i64> = Vec::with_capacity(count);
    for _ in 0..order {
        history.push(reader.read(16)? as u16 as i16 as i64);
    }

    let k = reader.read(5)? as u32;
    if k > MAX_RICE_PARAM {
        return Err(ArchiveError::CorruptBlock(format!("rice parameter {k} out of range")));
    }

    for i in order..count {
        let quotient = reader.read_unary()?;
        let value = (quotient << k) | reader.read(k)?;
        let sample = predict(&history, i, order) + unzigzag(value);
        if sample < i16::MIN as i64 || sample > i16::MAX as i64 {
            return Err(ArchiveError::CorruptBlock(format!(
                "decoded sample {sample} does not fit 16 bits"
            )));
        }
        history.push(sample);
    }

    Ok(history.into_iter().map(|s| s as i16).collect())
}

/// MSB-first bit packer
struct BitWriter {
    bytes: Vec<u8>,
    acc: u64,
    bits: u32,
}

impl BitWriter {
    fn with_capacity(capacity: usize) -> Self {
        BitWriter {
            bytes: Vec::with_capacity(capacity),
            acc: 0,
            bits: 0,
        }
    }

    /// Append the low `count` bits of `value`, `count` <= 32
    fn write(&mut self, value: u64, count: u32) {
        if count == 0 {
            return;
        }
        let mask = (1u64 << count) - 1;
        self.acc = (self.acc << count) | (value & mask);
        self.bits += count;
        while self.bits >= 8 {
            self.bits -= 8;
            self.bytes.push((self.acc >> self.bits) as u8);
        }
        self.acc &= (1u64 << self.bits) - 1;
    }

    fn write_unary(&mut self, mut zeros: u64) {
        while zeros >= 32 {
            self.write(0, 32);
            zeros -= 32;
        }
        self.write(1, zeros as u32 + 1);
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bits > 0 {
            self.bytes.push((self.acc << (8 - self.bits)) as u8);
        }
        self.bytes
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BitReader { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<u64> {
        let byte = self.data.get(self.pos / 8).ok_or_else(|| {
            ArchiveError::CorruptBlock("audio stream ended early".to_string())
        })?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit as u64)
    }

    fn read(&mut self, count: u32) -> Result<u64> {
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Ok(value)
    }

    fn read_unary(&mut self) -> Result<u64> {
        let mut zeros = 0u64;
        while self.read_bit()? == 0 {
            zeros += 1;
        }
        Ok(zeros)
    }
}
