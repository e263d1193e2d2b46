//! Raw bit extraction: a pure, deterministic transform from samples to bits.
//!
//! Each sample contributes the XOR of the `lsb_count` low bits of its
//! calibrated code. With `decimation = d`, `d` consecutive contributions of the
//! same channel are XOR-folded into one [`RawBit`], which lowers the
//! correlation between neighbouring bits of a band-limited oscillator.
//! No statistical judgement happens here.

use serde::Serialize;

use crate::channel::{CHANNEL_COUNT, Channel};
use crate::config::ExtractorConfig;
use crate::sampler::Sample;

/// One raw entropy bit with provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RawBit {
    /// 0 or 1.
    pub bit: u8,
    pub channel: Channel,
    /// Timestamp of the last sample folded into this bit.
    pub timestamp_ns: u64,
    /// Health epoch of `channel` after the tests saw this bit.
    pub epoch: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct FoldWindow {
    acc: u8,
    filled: u32,
}

/// Stateful LSB extractor with per-channel decimation windows.
#[derive(Debug, Clone)]
pub struct BitExtractor {
    mask: u64,
    decimation: u32,
    windows: [FoldWindow; CHANNEL_COUNT],
}

impl BitExtractor {
    pub fn new(config: &ExtractorConfig) -> Self {
        let lsb = u32::from(config.lsb_count.clamp(1, 32));
        Self {
            mask: (1u64 << lsb) - 1,
            decimation: config.decimation.max(1),
            windows: [FoldWindow::default(); CHANNEL_COUNT],
        }
    }

    /// Parity of the selected low bits of a calibrated code.
    fn sample_bit(&self, raw_code: i64) -> u8 {
        ((raw_code as u64 & self.mask).count_ones() & 1) as u8
    }

    /// Feed one sample; returns a bit once the channel's window is full.
    pub fn push(&mut self, sample: &Sample) -> Option<RawBit> {
        let bit = self.sample_bit(sample.raw_code);
        let window = &mut self.windows[sample.channel.index()];
        window.acc ^= bit;
        window.filled += 1;
        if window.filled < self.decimation {
            return None;
        }
        let out = RawBit {
            bit: window.acc,
            channel: sample.channel,
            timestamp_ns: sample.timestamp_ns,
            epoch: 0,
        };
        *window = FoldWindow::default();
        Some(out)
    }

    /// Drop partially filled windows (e.g. after a channel re-arm).
    pub fn reset(&mut self) {
        self.windows = [FoldWindow::default(); CHANNEL_COUNT];
    }

    pub fn reset_channel(&mut self, channel: Channel) {
        self.windows[channel.index()] = FoldWindow::default();
    }
}

/// Extract every bit from a sample sequence with a fresh extractor.
pub fn extract_all(config: &ExtractorConfig, samples: &[Sample]) -> Vec<RawBit> {
    let mut extractor = BitExtractor::new(config);
    samples.iter().filter_map(|s| extractor.push(s)).collect()
}

/// Pack bits MSB-first into bytes; a trailing partial byte is zero-padded.
pub fn pack_bits(bits: impl IntoIterator<Item = u8>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut byte = 0u8;
    let mut n = 0;
    for bit in bits {
        byte = (byte << 1) | (bit & 1);
        n += 1;
        if n == 8 {
            out.push(byte);
            byte = 0;
            n = 0;
        }
    }
    if n > 0 {
        out.push(byte << (8 - n));
    }
    out
}
