//! Source selector: multiplexes the four channels into one sample stream.
//!
//! Rotation is smooth weighted round-robin. With equal weights that reduces
//! to the fixed order Chua → Lorenz → Rössler → RC. Each slot samples with
//! its own timeout, so a slow or dead channel costs at most one timeout per
//! rotation and never stalls the others.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::channel::{CHANNEL_COUNT, Channel};
use crate::config::{SamplerConfig, SelectorConfig};
use crate::error::AcquisitionError;
use crate::sampler::{Sample, Sampler};

/// Per-channel slot accounting, shared with diagnostics.
#[derive(Debug, Default)]
pub struct SlotCounters {
    samples: AtomicU64,
    misses: AtomicU64,
    consecutive_misses: AtomicU32,
}

/// Snapshot of one channel's slot counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SlotCounts {
    pub samples: u64,
    pub misses: u64,
    pub consecutive_misses: u32,
}

/// Selector statistics readable from any thread.
#[derive(Debug, Default)]
pub struct SelectorStats {
    channels: [SlotCounters; CHANNEL_COUNT],
}

impl SelectorStats {
    pub fn get(&self, channel: Channel) -> SlotCounts {
        let c = &self.channels[channel.index()];
        SlotCounts {
            samples: c.samples.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            consecutive_misses: c.consecutive_misses.load(Ordering::Relaxed),
        }
    }

    pub fn total_samples(&self) -> u64 {
        Channel::ALL.iter().map(|&ch| self.get(ch).samples).sum()
    }
}

/// Paces rotation slots to a fixed rate without catching up on overruns.
struct Pacer {
    interval: Duration,
    next: Instant,
}

impl Pacer {
    fn new(rate_hz: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / rate_hz),
            next: Instant::now(),
        }
    }

    fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
            self.next += self.interval;
        } else {
            self.next = now + self.interval;
        }
    }
}

/// Round-robin / weighted multiplexer over a [`Sampler`].
pub struct SourceSelector {
    sampler: Box<dyn Sampler>,
    rotation: Vec<(Channel, i64)>,
    current: Vec<i64>,
    total_weight: i64,
    timeout: Duration,
    pacer: Option<Pacer>,
    stats: Arc<SelectorStats>,
}

impl SourceSelector {
    pub fn new(sampler: Box<dyn Sampler>, selector: &SelectorConfig, sampling: &SamplerConfig) -> Self {
        let rotation: Vec<(Channel, i64)> = Channel::ALL
            .into_iter()
            .map(|ch| (ch, selector.weights.get(ch) as i64))
            .filter(|&(_, w)| w > 0)
            .collect();
        let total_weight = rotation.iter().map(|&(_, w)| w).sum();
        let pacer = (sampling.sample_rate_hz > 0.0).then(|| Pacer::new(sampling.sample_rate_hz));
        Self {
            sampler,
            current: vec![0; rotation.len()],
            rotation,
            total_weight,
            timeout: sampling.timeout(),
            pacer,
            stats: Arc::new(SelectorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SelectorStats> {
        Arc::clone(&self.stats)
    }

    /// Channels taking part in the rotation.
    pub fn channels(&self) -> Vec<Channel> {
        self.rotation.iter().map(|&(ch, _)| ch).collect()
    }

    pub fn consecutive_misses(&self, channel: Channel) -> u32 {
        self.stats.get(channel).consecutive_misses
    }

    /// Channel owning the next slot (smooth weighted round-robin).
    fn advance(&mut self) -> Channel {
        let mut best = 0;
        for (i, &(_, weight)) in self.rotation.iter().enumerate() {
            self.current[i] += weight;
            if self.current[i] > self.current[best] {
                best = i;
            }
        }
        self.current[best] -= self.total_weight;
        self.rotation[best].0
    }

    /// Sample the next slot in the rotation.
    ///
    /// A failed slot is counted against its channel and returned as an error;
    /// the caller moves on to the next slot. [`AcquisitionError::Exhausted`]
    /// means the source as a whole has ended.
    pub fn next(&mut self) -> Result<Sample, AcquisitionError> {
        let channel = self.advance();
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.wait();
        }
        let counters = &self.stats.channels[channel.index()];
        match self.sampler.sample(channel, self.timeout) {
            Ok(sample) => {
                counters.samples.fetch_add(1, Ordering::Relaxed);
                counters.consecutive_misses.store(0, Ordering::Relaxed);
                Ok(sample)
            }
            Err(AcquisitionError::Exhausted) => Err(AcquisitionError::Exhausted),
            Err(e) => {
                counters.misses.fetch_add(1, Ordering::Relaxed);
                counters.consecutive_misses.fetch_add(1, Ordering::Relaxed);
                log::debug!("slot skipped: {e}");
                Err(e)
            }
        }
    }
}
