//! Pull-based diagnostics.
//!
//! A [`DiagnosticsHandle`] is cheap to clone and only reads shared counters;
//! taking a snapshot never blocks a pipeline stage for longer than a single
//! status read.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::channel::Channel;
use crate::conditioning::{ConditionerCounts, ConditionerStats};
use crate::health::{ChannelState, ChannelTestCounters, HealthBoard, HealthEvent, HealthStatus};
use crate::pool::{EntropyPool, PoolStats};
use crate::publisher::{PublisherCounts, PublisherStats};
use crate::sampler::timestamp_ns;
use crate::selector::SelectorStats;

/// Test parameters in effect, echoed in every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TestParameters {
    pub h_min: f64,
    pub rct_cutoff: u32,
    pub apt_window: u32,
    pub apt_cutoff: u32,
    pub conditioner_input_bits: usize,
    pub output_block_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelDiagnostics {
    pub channel: Channel,
    pub enabled: bool,
    pub state: ChannelState,
    pub samples: u64,
    pub misses: u64,
    pub consecutive_misses: u32,
    pub tests: ChannelTestCounters,
    /// Fraction of ones among tested bits.
    pub ones_fraction: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Rates {
    pub samples_per_sec: f64,
    pub raw_bits_per_sec: f64,
    pub blocks_per_sec: f64,
    pub published_per_sec: f64,
}

/// Point-in-time view of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub version: &'static str,
    pub taken_at_ns: u64,
    pub uptime_secs: f64,
    pub running: bool,
    pub status: HealthStatus,
    pub parameters: TestParameters,
    pub channels: Vec<ChannelDiagnostics>,
    pub rates: Rates,
    pub conditioner: ConditionerCounts,
    pub pool: PoolStats,
    pub publisher: PublisherCounts,
    pub recent_events: Vec<HealthEvent>,
}

impl DiagnosticsSnapshot {
    pub fn channel(&self, channel: Channel) -> Option<&ChannelDiagnostics> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

struct Sources {
    board: Arc<HealthBoard>,
    selector: Arc<SelectorStats>,
    conditioner: Arc<ConditionerStats>,
    pool: Arc<EntropyPool>,
    publisher: Arc<PublisherStats>,
    running: Arc<AtomicBool>,
    enabled: Vec<Channel>,
    parameters: TestParameters,
    started: Instant,
}

/// Read-only access to pipeline state, plus operator re-arm.
#[derive(Clone)]
pub struct DiagnosticsHandle {
    inner: Arc<Sources>,
}

impl DiagnosticsHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        board: Arc<HealthBoard>,
        selector: Arc<SelectorStats>,
        conditioner: Arc<ConditionerStats>,
        pool: Arc<EntropyPool>,
        publisher: Arc<PublisherStats>,
        running: Arc<AtomicBool>,
        enabled: Vec<Channel>,
        parameters: TestParameters,
    ) -> Self {
        Self {
            inner: Arc::new(Sources {
                board,
                selector,
                conditioner,
                pool,
                publisher,
                running,
                enabled,
                parameters,
                started: Instant::now(),
            }),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.board.status()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn request_rearm(&self, channel: Channel) {
        log::info!("{channel}: re-arm requested");
        self.inner.board.request_rearm(channel);
    }

    pub fn request_rearm_all(&self) {
        log::info!("re-arm requested for all channels");
        self.inner.board.request_rearm_all();
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let s = &self.inner;
        let uptime = s.started.elapsed().as_secs_f64();
        let per_sec = |n: u64| if uptime > 0.0 { n as f64 / uptime } else { 0.0 };

        let channels: Vec<ChannelDiagnostics> = Channel::ALL
            .into_iter()
            .map(|ch| {
                let slots = s.selector.get(ch);
                let tests = s.board.counters(ch);
                ChannelDiagnostics {
                    channel: ch,
                    enabled: s.enabled.contains(&ch),
                    state: s.board.channel_state(ch),
                    samples: slots.samples,
                    misses: slots.misses,
                    consecutive_misses: slots.consecutive_misses,
                    tests,
                    ones_fraction: if tests.bits_tested == 0 {
                        0.0
                    } else {
                        tests.ones as f64 / tests.bits_tested as f64
                    },
                }
            })
            .collect();

        let conditioner = s.conditioner.snapshot();
        let publisher = s.publisher.snapshot();
        let raw_bits: u64 = channels.iter().map(|c| c.tests.bits_tested).sum();
        let rates = Rates {
            samples_per_sec: per_sec(s.selector.total_samples()),
            raw_bits_per_sec: per_sec(raw_bits),
            blocks_per_sec: per_sec(conditioner.blocks_produced),
            published_per_sec: per_sec(publisher.published),
        };

        DiagnosticsSnapshot {
            version: crate::VERSION,
            taken_at_ns: timestamp_ns(),
            uptime_secs: uptime,
            running: self.is_running(),
            status: s.board.status(),
            parameters: s.parameters,
            channels,
            rates,
            conditioner,
            pool: s.pool.stats(),
            publisher,
            recent_events: s.board.recent_events(),
        }
    }
}
