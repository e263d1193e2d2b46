//! SHA-256 conditioning of health-gated raw bits.
//!
//! This module is the single gateway between the raw bitstream and output:
//! nothing reaches the pool without passing through [`Conditioner`].
//!
//! ```text
//! RawBit → health gate → N_in bits buffered → SHA-256 counter mode → ConditionedBlock
//! ```
//!
//! Each block is `SHA-256(state ‖ sequence ‖ packed_bits ‖ counter)` for
//! `counter = 0, 1, …` until the output size is reached. The chaining state is
//! seeded from OS entropy (or a caller seed for reproducible tests) and is
//! advanced after every block; it never appears in output.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::channel::{CHANNEL_COUNT, Channel};
use crate::config::PipelineConfig;
use crate::error::Error;
use crate::extractor::{RawBit, pack_bits};
use crate::health::HealthBoard;
use crate::sampler::timestamp_ns;

/// Raw bits needed for one block: `ceil((out_bits + margin_bits) / h_min)`.
pub fn input_bits_required(out_bits: usize, margin_bits: u32, h_min: f64) -> usize {
    ((out_bits as f64 + f64::from(margin_bits)) / h_min).ceil() as usize
}

/// One conditioned output block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionedBlock {
    pub sequence: u64,
    pub bytes: Vec<u8>,
    pub raw_bits_consumed: usize,
    /// Raw bits contributed by each channel, indexed by [`Channel::index`].
    pub channel_mix: [u32; CHANNEL_COUNT],
    pub produced_at_ns: u64,
}

impl ConditionedBlock {
    pub fn mix(&self, channel: Channel) -> u32 {
        self.channel_mix[channel.index()]
    }
}

/// Counters shared with diagnostics.
#[derive(Debug, Default)]
pub struct ConditionerStats {
    pub(crate) bits_accepted: AtomicU64,
    pub(crate) bits_rejected: AtomicU64,
    pub(crate) blocks_produced: AtomicU64,
    pub(crate) partial_bits_discarded: AtomicU64,
    pub(crate) starvation_episodes: AtomicU64,
    pub(crate) backpressure_waits: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConditionerCounts {
    pub bits_accepted: u64,
    pub bits_rejected: u64,
    pub blocks_produced: u64,
    pub partial_bits_discarded: u64,
    pub starvation_episodes: u64,
    pub backpressure_waits: u64,
}

impl ConditionerStats {
    pub fn snapshot(&self) -> ConditionerCounts {
        ConditionerCounts {
            bits_accepted: self.bits_accepted.load(Ordering::Relaxed),
            bits_rejected: self.bits_rejected.load(Ordering::Relaxed),
            blocks_produced: self.blocks_produced.load(Ordering::Relaxed),
            partial_bits_discarded: self.partial_bits_discarded.load(Ordering::Relaxed),
            starvation_episodes: self.starvation_episodes.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
        }
    }
}

/// Accumulates gated raw bits and emits fixed-size blocks.
pub struct Conditioner {
    board: Arc<HealthBoard>,
    input_bits: usize,
    output_bytes: usize,
    state: [u8; 32],
    sequence: u64,
    pending: Vec<u8>,
    mix: [u32; CHANNEL_COUNT],
    stats: Arc<ConditionerStats>,
}

impl Conditioner {
    /// Build a conditioner reading gate decisions from `board`.
    ///
    /// With `seed = None` the chaining state is drawn from the OS CSPRNG.
    pub fn new(
        config: &PipelineConfig,
        board: Arc<HealthBoard>,
        seed: Option<&[u8]>,
    ) -> Result<Self, Error> {
        let state = {
            let mut h = Sha256::new();
            h.update(b"chaosentropy-conditioner-v1");
            match seed {
                Some(s) => h.update(s),
                None => {
                    let mut os_random = [0u8; 32];
                    getrandom::fill(&mut os_random)
                        .map_err(|e| Error::Startup(format!("OS CSPRNG unavailable: {e}")))?;
                    h.update(os_random);
                }
            }
            let digest: [u8; 32] = h.finalize().into();
            digest
        };
        let input_bits = config.conditioner_input_bits();
        Ok(Self {
            board,
            input_bits,
            output_bytes: config.conditioner.output_block_bytes,
            state,
            sequence: 0,
            pending: Vec::with_capacity(input_bits),
            mix: [0; CHANNEL_COUNT],
            stats: Arc::new(ConditionerStats::default()),
        })
    }

    /// N_in: raw bits consumed per block.
    pub fn input_bits(&self) -> usize {
        self.input_bits
    }

    pub fn pending_bits(&self) -> usize {
        self.pending.len()
    }

    /// Sequence number the next block will carry.
    pub fn next_sequence(&self) -> u64 {
        self.sequence
    }

    pub fn stats(&self) -> Arc<ConditionerStats> {
        Arc::clone(&self.stats)
    }

    /// Feed one raw bit through the health gate.
    ///
    /// Returns a block once N_in accepted bits have accumulated.
    pub fn push_bit(&mut self, bit: &RawBit) -> Option<ConditionedBlock> {
        if !self.board.admits(bit) {
            self.stats.bits_rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.stats.bits_accepted.fetch_add(1, Ordering::Relaxed);
        self.pending.push(bit.bit & 1);
        self.mix[bit.channel.index()] += 1;
        if self.pending.len() < self.input_bits {
            return None;
        }
        Some(self.emit())
    }

    /// Drop a partially filled input buffer. Returns the number of bits lost.
    pub fn discard_partial(&mut self) -> usize {
        let n = self.pending.len();
        if n > 0 {
            log::info!("discarding {n} buffered raw bits (< {} needed)", self.input_bits);
            self.stats
                .partial_bits_discarded
                .fetch_add(n as u64, Ordering::Relaxed);
        }
        self.pending.clear();
        self.mix = [0; CHANNEL_COUNT];
        n
    }

    fn emit(&mut self) -> ConditionedBlock {
        let packed = pack_bits(self.pending.iter().copied());
        let sequence = self.sequence;

        let mut bytes = Vec::with_capacity(self.output_bytes.div_ceil(32) * 32);
        let mut counter: u64 = 0;
        while bytes.len() < self.output_bytes {
            let mut h = Sha256::new();
            h.update(self.state);
            h.update(sequence.to_le_bytes());
            h.update(&packed);
            h.update(counter.to_le_bytes());
            let digest: [u8; 32] = h.finalize().into();
            bytes.extend_from_slice(&digest);
            counter += 1;
        }
        bytes.truncate(self.output_bytes);

        let mut h = Sha256::new();
        h.update(b"chain");
        h.update(self.state);
        h.update(sequence.to_le_bytes());
        h.update(&packed);
        self.state = h.finalize().into();

        let block = ConditionedBlock {
            sequence,
            bytes,
            raw_bits_consumed: self.pending.len(),
            channel_mix: self.mix,
            produced_at_ns: timestamp_ns(),
        };
        self.sequence += 1;
        self.pending.clear();
        self.mix = [0; CHANNEL_COUNT];
        self.stats.blocks_produced.fetch_add(1, Ordering::Relaxed);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{GlobalHaltPolicy, HealthEngine, HealthParams};

    fn engine() -> HealthEngine {
        HealthEngine::new(HealthParams {
            rct_cutoff: 8,
            apt_window: 1024,
            apt_cutoff: 1023,
            policy: GlobalHaltPolicy::Majority,
            enabled: Channel::ALL.to_vec(),
        })
    }

    fn bit(channel: Channel, b: u8) -> RawBit {
        RawBit {
            bit: b,
            channel,
            timestamp_ns: 0,
            epoch: 0,
        }
    }

    fn conditioner(board: Arc<HealthBoard>) -> Conditioner {
        Conditioner::new(&PipelineConfig::default(), board, Some(b"test-seed")).unwrap()
    }

    /// Feed round-robin alternating bits until one block comes out.
    fn fill_block(c: &mut Conditioner, channels: &[Channel]) -> ConditionedBlock {
        (0..)
            .find_map(|i: usize| c.push_bit(&bit(channels[i % channels.len()], ((i / 4) % 2) as u8)))
            .unwrap()
    }

    #[test]
    fn test_input_bits_required() {
        assert_eq!(input_bits_required(256, 64, 0.5), 640);
        assert_eq!(input_bits_required(256, 64, 1.0), 320);
        assert_eq!(input_bits_required(256, 0, 0.7), 366);
    }

    #[test]
    fn test_block_consumes_exactly_n_in() {
        let mut c = conditioner(engine().board());
        assert_eq!(c.input_bits(), 640);
        for i in 0..639 {
            assert!(c.push_bit(&bit(Channel::ALL[i % 4], (i % 2) as u8)).is_none());
        }
        let block = c.push_bit(&bit(Channel::RcRelaxation, 1)).unwrap();
        assert_eq!(block.raw_bits_consumed, 640);
        assert_eq!(block.bytes.len(), 32);
        assert_eq!(block.channel_mix.iter().sum::<u32>(), 640);
        assert_eq!(block.mix(Channel::Chua), 160);
        assert_eq!(c.pending_bits(), 0);
    }

    #[test]
    fn test_sequences_are_gapless() {
        let mut c = conditioner(engine().board());
        let seqs: Vec<u64> = (0..5).map(|_| fill_block(&mut c, &Channel::ALL).sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(c.stats().snapshot().blocks_produced, 5);
    }

    #[test]
    fn test_same_seed_same_output_and_state_chains() {
        let mut a = conditioner(engine().board());
        let mut b = conditioner(engine().board());
        let a0 = fill_block(&mut a, &Channel::ALL);
        let b0 = fill_block(&mut b, &Channel::ALL);
        assert_eq!(a0.bytes, b0.bytes);
        // Identical input bits, different chained state: different output.
        let a1 = fill_block(&mut a, &Channel::ALL);
        assert_ne!(a0.bytes, a1.bytes);
    }

    #[test]
    fn test_os_seeded_conditioners_differ() {
        let config = PipelineConfig::default();
        let mut a = Conditioner::new(&config, engine().board(), None).unwrap();
        let mut b = Conditioner::new(&config, engine().board(), None).unwrap();
        assert_ne!(
            fill_block(&mut a, &Channel::ALL).bytes,
            fill_block(&mut b, &Channel::ALL).bytes
        );
    }

    #[test]
    fn test_large_output_block() {
        let mut config = PipelineConfig::default();
        config.conditioner.output_block_bytes = 100;
        let mut c = Conditioner::new(&config, engine().board(), Some(b"x")).unwrap();
        assert_eq!(c.input_bits(), ((800.0 + 64.0) / 0.5) as usize);
        let block = fill_block(&mut c, &Channel::ALL);
        assert_eq!(block.bytes.len(), 100);
    }

    #[test]
    fn test_halted_channel_bits_rejected_others_flow() {
        let mut engine = engine();
        let mut c = conditioner(engine.board());
        for _ in 0..8 {
            engine.observe(&bit(Channel::Rossler, 1));
        }
        assert!(engine.board().is_halted(Channel::Rossler));

        let block = fill_block(&mut c, &Channel::ALL);
        assert_eq!(block.mix(Channel::Rossler), 0);
        assert!(block.mix(Channel::Chua) > 0);
        assert!(block.mix(Channel::Lorenz) > 0);
        assert!(block.mix(Channel::RcRelaxation) > 0);
        assert_eq!(block.raw_bits_consumed, 640);
        assert!(c.stats().snapshot().bits_rejected > 0);
    }

    #[test]
    fn test_bits_queued_across_halt_stay_rejected_after_rearm() {
        let mut engine = engine();
        let board = engine.board();
        let mut c = conditioner(engine.board());

        let mut queued = Vec::new();
        for _ in 0..100 {
            let mut b = bit(Channel::Chua, 1);
            engine.observe_and_stamp(&mut b);
            queued.push(b);
        }
        assert!(board.is_halted(Channel::Chua));

        board.request_rearm(Channel::Chua);
        assert_eq!(engine.apply_rearm_requests(), vec![Channel::Chua]);
        assert!(board.accepts(Channel::Chua));

        for b in &queued {
            assert!(c.push_bit(b).is_none());
        }
        assert_eq!(c.pending_bits(), 0);
        assert_eq!(c.stats().snapshot().bits_accepted, 0);
        assert_eq!(c.stats().snapshot().bits_rejected, 100);

        let mut fresh = bit(Channel::Chua, 0);
        engine.observe_and_stamp(&mut fresh);
        c.push_bit(&fresh);
        assert_eq!(c.pending_bits(), 1);
    }

    #[test]
    fn test_global_halt_rejects_everything() {
        let mut engine = engine();
        let mut c = conditioner(engine.board());
        for ch in [Channel::Chua, Channel::Lorenz, Channel::Rossler] {
            for _ in 0..8 {
                engine.observe(&bit(ch, 0));
            }
        }
        assert_eq!(engine.board().status().label(), "halted");
        for i in 0..2000 {
            assert!(c.push_bit(&bit(Channel::RcRelaxation, (i % 2) as u8)).is_none());
        }
        assert_eq!(c.pending_bits(), 0);
    }

    #[test]
    fn test_discard_partial_counts_bits() {
        let mut c = conditioner(engine().board());
        for i in 0..100 {
            c.push_bit(&bit(Channel::Chua, (i % 2) as u8));
        }
        assert_eq!(c.discard_partial(), 100);
        assert_eq!(c.stats().snapshot().partial_bits_discarded, 100);
        let block = fill_block(&mut c, &Channel::ALL);
        assert_eq!(block.sequence, 0);
        assert_eq!(block.raw_bits_consumed, 640);
    }
}
