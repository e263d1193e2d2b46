//! Continuous health tests on the raw bitstream.
//!
//! Two tests run per channel on every raw bit:
//!
//! - **Repetition Count Test**: a run of `C = 1 + ceil(cutoff_factor / H)`
//!   identical symbols halts the channel.
//! - **Adaptive Proportion Test**: in each window of `W` symbols, the
//!   window-initial symbol may occur at most `cutoff` times, where `cutoff` is
//!   the binomial `1 - 2^-cutoff_factor` quantile for `p = 2^-H`.
//!
//! [`HealthEngine`] is the only writer of health state. Everyone else holds an
//! `Arc<HealthBoard>` and reads. Operator re-arm requests are posted to the
//! board and applied by the engine on its next step, so the single-writer
//! discipline holds without a global lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use statrs::distribution::{Binomial, DiscreteCDF};

use crate::channel::{CHANNEL_COUNT, Channel};
use crate::config::PipelineConfig;
use crate::error::HealthTestFailure;
use crate::extractor::RawBit;
use crate::sampler::timestamp_ns;

/// Health events kept for the diagnostics snapshot.
const RECENT_EVENTS: usize = 64;

/// Undelivered health events held for the publisher; oldest go first.
pub const PENDING_EVENTS: usize = 256;

// ---------------------------------------------------------------------------
// Cutoffs
// ---------------------------------------------------------------------------

/// Repetition Count Test cutoff: `1 + ceil(cutoff_factor / h_min)`.
pub fn rct_cutoff(h_min: f64, cutoff_factor: f64) -> u32 {
    1 + (cutoff_factor / h_min).ceil() as u32
}

/// Adaptive Proportion Test cutoff: the largest count of the window-initial
/// symbol that is still accepted in a window of `window` symbols.
///
/// Smallest `k` with `P[Binomial(window, 2^-h_min) <= k] >= 1 - 2^-cutoff_factor`.
pub fn apt_cutoff(window: u32, h_min: f64, cutoff_factor: f64) -> u32 {
    let p = 2f64.powf(-h_min);
    let alpha = 2f64.powf(-cutoff_factor);
    let Ok(dist) = Binomial::new(p, u64::from(window)) else {
        return window;
    };
    let start = (p * f64::from(window)).floor() as u32;
    (start..=window)
        .find(|&k| dist.cdf(u64::from(k)) >= 1.0 - alpha)
        .unwrap_or(window)
        .min(window - 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Repetition Count Test state for one channel.
#[derive(Debug, Clone)]
pub struct RepetitionCountTest {
    cutoff: u32,
    last: Option<u8>,
    run: u32,
    max_run: u32,
}

impl RepetitionCountTest {
    pub fn new(cutoff: u32) -> Self {
        Self {
            cutoff,
            last: None,
            run: 0,
            max_run: 0,
        }
    }

    /// Feed one symbol. `Err(run)` once the run reaches the cutoff.
    pub fn observe(&mut self, symbol: u8) -> Result<(), u32> {
        if self.last == Some(symbol) {
            self.run += 1;
        } else {
            self.last = Some(symbol);
            self.run = 1;
        }
        self.max_run = self.max_run.max(self.run);
        if self.run >= self.cutoff {
            Err(self.run)
        } else {
            Ok(())
        }
    }

    pub fn cutoff(&self) -> u32 {
        self.cutoff
    }

    pub fn run(&self) -> u32 {
        self.run
    }

    pub fn max_run(&self) -> u32 {
        self.max_run
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.cutoff);
    }
}

/// Adaptive Proportion Test state for one channel.
#[derive(Debug, Clone)]
pub struct AdaptiveProportionTest {
    window: u32,
    cutoff: u32,
    first: u8,
    count: u32,
    seen: u32,
    max_count: u32,
}

impl AdaptiveProportionTest {
    pub fn new(window: u32, cutoff: u32) -> Self {
        Self {
            window,
            cutoff,
            first: 0,
            count: 0,
            seen: 0,
            max_count: 0,
        }
    }

    /// Feed one symbol. `Err(count)` as soon as the window-initial symbol has
    /// been seen more than `cutoff` times in the current window.
    pub fn observe(&mut self, symbol: u8) -> Result<(), u32> {
        if self.seen == 0 {
            self.first = symbol;
            self.count = 1;
        } else if symbol == self.first {
            self.count += 1;
        }
        self.seen += 1;
        self.max_count = self.max_count.max(self.count);

        let verdict = if self.count > self.cutoff {
            Err(self.count)
        } else {
            Ok(())
        };
        if self.seen == self.window {
            self.seen = 0;
        }
        verdict
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn cutoff(&self) -> u32 {
        self.cutoff
    }

    /// Count of the window-initial symbol in the current window.
    pub fn count(&self) -> u32 {
        if self.seen == 0 { 0 } else { self.count }
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.window, self.cutoff);
    }
}

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

/// What to do globally once channels halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalHaltPolicy {
    /// Halt globally when strictly more than half of the enabled channels are halted.
    #[default]
    Majority,
    /// Halt globally only when every enabled channel is halted.
    All,
}

/// Process-wide health status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded { channel: Channel, reason: String },
    Halted { channel: Channel, reason: String },
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded { .. } => "degraded",
            Self::Halted { .. } => "halted",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Degraded { channel, reason } => write!(f, "degraded ({channel}: {reason})"),
            Self::Halted { channel, reason } => write!(f, "halted ({channel}: {reason})"),
        }
    }
}

/// Health state of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Ok,
    Halted { reason: String },
}

impl ChannelState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Halted { .. } => "halted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    Channel,
    Global,
}

/// A health-state transition, published on the health topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthEvent {
    pub scope: EventScope,
    pub channel: Option<Channel>,
    pub old_state: String,
    pub new_state: String,
    pub reason: String,
    pub timestamp_ns: u64,
}

/// Test counters of one channel, as seen by diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelTestCounters {
    pub bits_tested: u64,
    pub ones: u64,
    pub rct_run: u32,
    pub rct_max_run: u32,
    pub apt_count: u32,
    pub apt_max_count: u32,
    pub halts: u64,
}

#[derive(Debug, Default)]
struct AtomicTestCounters {
    bits_tested: AtomicU64,
    ones: AtomicU64,
    rct_run: AtomicU32,
    rct_max_run: AtomicU32,
    apt_count: AtomicU32,
    apt_max_count: AtomicU32,
    halts: AtomicU64,
}

impl AtomicTestCounters {
    fn load(&self) -> ChannelTestCounters {
        ChannelTestCounters {
            bits_tested: self.bits_tested.load(Ordering::Relaxed),
            ones: self.ones.load(Ordering::Relaxed),
            rct_run: self.rct_run.load(Ordering::Relaxed),
            rct_max_run: self.rct_max_run.load(Ordering::Relaxed),
            apt_count: self.apt_count.load(Ordering::Relaxed),
            apt_max_count: self.apt_max_count.load(Ordering::Relaxed),
            halts: self.halts.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared board
// ---------------------------------------------------------------------------

/// Single-writer, multi-reader health state shared across the pipeline.
#[derive(Debug)]
pub struct HealthBoard {
    status: RwLock<HealthStatus>,
    global_halted: AtomicBool,
    halted: [AtomicBool; CHANNEL_COUNT],
    epochs: [AtomicU32; CHANNEL_COUNT],
    states: RwLock<[ChannelState; CHANNEL_COUNT]>,
    counters: [AtomicTestCounters; CHANNEL_COUNT],
    rearm_pending: AtomicBool,
    rearm_requests: [AtomicBool; CHANNEL_COUNT],
    pending_events: Mutex<VecDeque<HealthEvent>>,
    pending_overflow: AtomicU64,
    recent_events: Mutex<VecDeque<HealthEvent>>,
}

impl HealthBoard {
    fn new() -> Self {
        Self {
            status: RwLock::new(HealthStatus::Ok),
            global_halted: AtomicBool::new(false),
            halted: Default::default(),
            epochs: Default::default(),
            states: RwLock::new(Default::default()),
            counters: Default::default(),
            rearm_pending: AtomicBool::new(false),
            rearm_requests: Default::default(),
            pending_events: Mutex::new(VecDeque::new()),
            pending_overflow: AtomicU64::new(0),
            recent_events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status.read().unwrap().clone()
    }

    /// Whether a raw bit from `channel` may be conditioned.
    pub fn accepts(&self, channel: Channel) -> bool {
        !self.global_halted.load(Ordering::Acquire)
            && !self.halted[channel.index()].load(Ordering::Acquire)
    }

    pub fn is_halted(&self, channel: Channel) -> bool {
        self.halted[channel.index()].load(Ordering::Acquire)
    }

    /// Bumped on every halt and re-arm of `channel`.
    pub fn epoch(&self, channel: Channel) -> u32 {
        self.epochs[channel.index()].load(Ordering::Acquire)
    }

    /// Whether `bit` passed the tests in the channel's current healthy epoch.
    ///
    /// Bits stamped before a halt or during it stay rejected after a re-arm.
    pub fn admits(&self, bit: &RawBit) -> bool {
        self.accepts(bit.channel) && bit.epoch == self.epoch(bit.channel)
    }

    pub fn channel_state(&self, channel: Channel) -> ChannelState {
        self.states.read().unwrap()[channel.index()].clone()
    }

    pub fn counters(&self, channel: Channel) -> ChannelTestCounters {
        self.counters[channel.index()].load()
    }

    /// Operator acknowledgement: re-arm `channel` on the engine's next step.
    pub fn request_rearm(&self, channel: Channel) {
        self.rearm_requests[channel.index()].store(true, Ordering::Release);
        self.rearm_pending.store(true, Ordering::Release);
    }

    pub fn request_rearm_all(&self) {
        for ch in Channel::ALL {
            self.request_rearm(ch);
        }
    }

    /// Transitions not yet handed to the publisher.
    pub fn drain_events(&self) -> Vec<HealthEvent> {
        self.pending_events.lock().unwrap().drain(..).collect()
    }

    /// Events lost to a full pending queue since the last call.
    pub fn take_overflowed(&self) -> u64 {
        self.pending_overflow.swap(0, Ordering::AcqRel)
    }

    /// The most recent transitions, oldest first.
    pub fn recent_events(&self) -> Vec<HealthEvent> {
        self.recent_events.lock().unwrap().iter().cloned().collect()
    }

    fn take_rearm_requests(&self) -> Vec<Channel> {
        if !self.rearm_pending.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }
        Channel::ALL
            .into_iter()
            .filter(|ch| self.rearm_requests[ch.index()].swap(false, Ordering::AcqRel))
            .collect()
    }

    fn record(&self, event: HealthEvent) {
        {
            let mut recent = self.recent_events.lock().unwrap();
            if recent.len() == RECENT_EVENTS {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        let mut pending = self.pending_events.lock().unwrap();
        if pending.len() == PENDING_EVENTS {
            pending.pop_front();
            self.pending_overflow.fetch_add(1, Ordering::Relaxed);
        }
        pending.push_back(event);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Test parameters for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthParams {
    pub rct_cutoff: u32,
    pub apt_window: u32,
    pub apt_cutoff: u32,
    pub policy: GlobalHaltPolicy,
    /// Channels in the rotation; only these count towards the global policy.
    pub enabled: Vec<Channel>,
}

impl HealthParams {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            rct_cutoff: config.rct_cutoff(),
            apt_window: config.health.apt_window,
            apt_cutoff: config.apt_cutoff(),
            policy: config.health.global_halt_policy,
            enabled: config.selector.weights.enabled(),
        }
    }
}

#[derive(Debug, Clone)]
struct ChannelHealth {
    rct: RepetitionCountTest,
    apt: AdaptiveProportionTest,
    halted: Option<HealthTestFailure>,
}

impl ChannelHealth {
    fn reset_tests(&mut self) {
        self.rct.reset();
        self.apt.reset();
    }
}

/// Runs the tests and owns every write to the [`HealthBoard`].
pub struct HealthEngine {
    board: Arc<HealthBoard>,
    channels: Vec<ChannelHealth>,
    params: HealthParams,
}

impl HealthEngine {
    pub fn new(params: HealthParams) -> Self {
        let template = ChannelHealth {
            rct: RepetitionCountTest::new(params.rct_cutoff),
            apt: AdaptiveProportionTest::new(params.apt_window, params.apt_cutoff),
            halted: None,
        };
        Self {
            board: Arc::new(HealthBoard::new()),
            channels: vec![template; CHANNEL_COUNT],
            params,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(HealthParams::from_config(config))
    }

    /// Read-only handle for the conditioner, publisher and diagnostics.
    pub fn board(&self) -> Arc<HealthBoard> {
        Arc::clone(&self.board)
    }

    pub fn params(&self) -> &HealthParams {
        &self.params
    }

    /// Run the tests on `bit` and stamp it with its channel's epoch.
    pub fn observe_and_stamp(&mut self, bit: &mut RawBit) -> Option<HealthTestFailure> {
        let failure = self.observe(bit);
        bit.epoch = self.board.epoch(bit.channel);
        failure
    }

    /// Run both tests on one raw bit.
    ///
    /// Bits from a halted channel are ignored: its test state stays frozen
    /// until re-armed. Returns the failure if this bit halted the channel.
    pub fn observe(&mut self, bit: &RawBit) -> Option<HealthTestFailure> {
        let idx = bit.channel.index();
        let state = &mut self.channels[idx];
        if state.halted.is_some() {
            return None;
        }

        let rct = state.rct.observe(bit.bit);
        let apt = state.apt.observe(bit.bit);

        let counters = &self.board.counters[idx];
        counters.bits_tested.fetch_add(1, Ordering::Relaxed);
        if bit.bit == 1 {
            counters.ones.fetch_add(1, Ordering::Relaxed);
        }
        counters.rct_run.store(state.rct.run(), Ordering::Relaxed);
        counters.rct_max_run.store(state.rct.max_run(), Ordering::Relaxed);
        counters.apt_count.store(state.apt.count(), Ordering::Relaxed);
        counters.apt_max_count.store(state.apt.max_count(), Ordering::Relaxed);

        let failure = match (rct, apt) {
            (Err(run), _) => HealthTestFailure::RepetitionCount {
                channel: bit.channel,
                run,
                cutoff: state.rct.cutoff(),
            },
            (Ok(()), Err(count)) => HealthTestFailure::AdaptiveProportion {
                channel: bit.channel,
                count,
                cutoff: state.apt.cutoff(),
                window: state.apt.window(),
            },
            (Ok(()), Ok(())) => return None,
        };
        self.halt(failure.clone());
        Some(failure)
    }

    /// Persistent acquisition failure reported by the sampling loop.
    pub fn report_acquisition_failure(
        &mut self,
        channel: Channel,
        misses: u32,
    ) -> Option<HealthTestFailure> {
        if self.channels[channel.index()].halted.is_some() {
            return None;
        }
        let failure = HealthTestFailure::PersistentAcquisition { channel, misses };
        self.halt(failure.clone());
        Some(failure)
    }

    /// Apply operator re-arm requests posted on the board.
    ///
    /// Returns the channels whose test state was reset.
    pub fn apply_rearm_requests(&mut self) -> Vec<Channel> {
        let requested = self.board.take_rearm_requests();
        for &channel in &requested {
            self.rearm(channel);
        }
        requested
    }

    fn rearm(&mut self, channel: Channel) {
        let idx = channel.index();
        let state = &mut self.channels[idx];
        state.reset_tests();
        let counters = &self.board.counters[idx];
        counters.rct_run.store(0, Ordering::Relaxed);
        counters.apt_count.store(0, Ordering::Relaxed);

        if state.halted.take().is_none() {
            return;
        }
        log::info!("{channel}: re-armed by operator");
        self.board.states.write().unwrap()[idx] = ChannelState::Ok;
        self.board.halted[idx].store(false, Ordering::Release);
        self.board.epochs[idx].fetch_add(1, Ordering::AcqRel);
        self.board.record(HealthEvent {
            scope: EventScope::Channel,
            channel: Some(channel),
            old_state: "halted".to_string(),
            new_state: "ok".to_string(),
            reason: "operator-rearm".to_string(),
            timestamp_ns: timestamp_ns(),
        });
        self.recompute_global(None);
    }

    fn halt(&mut self, failure: HealthTestFailure) {
        let channel = failure.channel();
        let idx = channel.index();
        let reason = failure.reason();
        log::warn!("{channel}: halted: {failure}");

        self.channels[idx].halted = Some(failure);
        self.board.counters[idx].halts.fetch_add(1, Ordering::Relaxed);
        self.board.states.write().unwrap()[idx] = ChannelState::Halted {
            reason: reason.to_string(),
        };
        self.board.halted[idx].store(true, Ordering::Release);
        self.board.epochs[idx].fetch_add(1, Ordering::AcqRel);
        self.board.record(HealthEvent {
            scope: EventScope::Channel,
            channel: Some(channel),
            old_state: "ok".to_string(),
            new_state: "halted".to_string(),
            reason: reason.to_string(),
            timestamp_ns: timestamp_ns(),
        });
        self.recompute_global(Some((channel, reason)));
    }

    /// Derive the global status from the set of halted channels.
    fn recompute_global(&mut self, cause: Option<(Channel, &'static str)>) {
        let halted: Vec<(Channel, &'static str)> = self
            .params
            .enabled
            .iter()
            .filter_map(|&ch| {
                self.channels[ch.index()]
                    .halted
                    .as_ref()
                    .map(|f| (ch, f.reason()))
            })
            .collect();
        let enabled = self.params.enabled.len();
        let globally_halted = !halted.is_empty()
            && match self.params.policy {
                GlobalHaltPolicy::Majority => halted.len() * 2 > enabled,
                GlobalHaltPolicy::All => halted.len() == enabled,
            };

        let culprit = cause
            .filter(|(ch, _)| halted.iter().any(|(h, _)| h == ch))
            .or_else(|| halted.first().copied());
        let new = match culprit {
            None => HealthStatus::Ok,
            Some((channel, reason)) if globally_halted => HealthStatus::Halted {
                channel,
                reason: reason.to_string(),
            },
            Some((channel, reason)) => HealthStatus::Degraded {
                channel,
                reason: reason.to_string(),
            },
        };

        let old = {
            let mut status = self.board.status.write().unwrap();
            std::mem::replace(&mut *status, new.clone())
        };
        self.board
            .global_halted
            .store(globally_halted, Ordering::Release);

        if old.label() != new.label() {
            if globally_halted {
                log::warn!("global health status: {new}");
            } else {
                log::info!("global health status: {new}");
            }
            let reason = match &new {
                HealthStatus::Ok => "operator-rearm".to_string(),
                HealthStatus::Degraded { reason, .. } | HealthStatus::Halted { reason, .. } => {
                    reason.clone()
                }
            };
            self.board.record(HealthEvent {
                scope: EventScope::Global,
                channel: culprit.map(|(ch, _)| ch),
                old_state: old.label().to_string(),
                new_state: new.label().to_string(),
                reason,
                timestamp_ns: timestamp_ns(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bit(channel: Channel, b: u8) -> RawBit {
        RawBit {
            bit: b,
            channel,
            timestamp_ns: 0,
            epoch: 0,
        }
    }

    fn params(rct: u32, window: u32, apt: u32) -> HealthParams {
        HealthParams {
            rct_cutoff: rct,
            apt_window: window,
            apt_cutoff: apt,
            policy: GlobalHaltPolicy::Majority,
            enabled: Channel::ALL.to_vec(),
        }
    }

    /// Alternating bits never trip either test.
    fn feed_alternating(engine: &mut HealthEngine, channel: Channel, n: usize) {
        for i in 0..n {
            assert!(engine.observe(&bit(channel, (i % 2) as u8)).is_none());
        }
    }

    fn stick(engine: &mut HealthEngine, channel: Channel) -> HealthTestFailure {
        (0..1000)
            .find_map(|_| engine.observe(&bit(channel, 1)))
            .expect("stuck channel must halt")
    }

    // -----------------------------------------------------------------------
    // Cutoffs
    // -----------------------------------------------------------------------

    #[test]
    fn test_rct_cutoff_formula() {
        assert_eq!(rct_cutoff(1.0, 30.0), 31);
        assert_eq!(rct_cutoff(0.5, 30.0), 61);
        assert_eq!(rct_cutoff(0.7, 30.0), 44);
    }

    #[test]
    fn test_apt_cutoff_full_entropy_binary() {
        // Binomial(1024, 0.5): mean 512, sd 16; the 2^-30 tail sits ~6 sd out.
        let c = apt_cutoff(1024, 1.0, 30.0);
        assert!((590..=620).contains(&c), "cutoff {c}");
    }

    #[test]
    fn test_apt_cutoff_grows_as_entropy_drops() {
        let high = apt_cutoff(1024, 1.0, 30.0);
        let low = apt_cutoff(1024, 0.5, 30.0);
        assert!(low > high);
        assert!(low < 1024);
    }

    // -----------------------------------------------------------------------
    // Repetition Count Test
    // -----------------------------------------------------------------------

    #[test]
    fn test_rct_run_below_cutoff_passes() {
        let mut rct = RepetitionCountTest::new(8);
        for _ in 0..7 {
            assert!(rct.observe(1).is_ok());
        }
        assert_eq!(rct.run(), 7);
    }

    #[test]
    fn test_rct_run_at_cutoff_fails() {
        let mut rct = RepetitionCountTest::new(8);
        for _ in 0..7 {
            rct.observe(0).unwrap();
        }
        assert_eq!(rct.observe(0), Err(8));
    }

    #[test]
    fn test_rct_symbol_change_resets_run() {
        let mut rct = RepetitionCountTest::new(3);
        for s in [1, 1, 0, 0, 1, 1, 0] {
            assert!(rct.observe(s).is_ok());
        }
        assert_eq!(rct.max_run(), 2);
    }

    #[test]
    fn test_engine_rct_boundary() {
        let c = 10;
        let mut engine = HealthEngine::new(params(c, 1024, 1023));
        // C-1 identical symbols: no halt.
        for _ in 0..c - 1 {
            assert!(engine.observe(&bit(Channel::Chua, 1)).is_none());
        }
        assert!(!engine.board().is_halted(Channel::Chua));
        // The C-th halts.
        let failure = engine.observe(&bit(Channel::Chua, 1)).unwrap();
        assert_eq!(failure.reason(), "repetition-count-exceeded");
        assert!(engine.board().is_halted(Channel::Chua));
    }

    // -----------------------------------------------------------------------
    // Adaptive Proportion Test
    // -----------------------------------------------------------------------

    /// A window starting with `ones` ones followed by zeros.
    fn apt_window(window: usize, ones: usize) -> Vec<u8> {
        (0..window).map(|i| u8::from(i < ones)).collect()
    }

    #[test]
    fn test_apt_count_at_cutoff_passes() {
        let mut apt = AdaptiveProportionTest::new(16, 8);
        for s in apt_window(16, 8) {
            assert!(apt.observe(s).is_ok());
        }
        assert_eq!(apt.max_count(), 8);
    }

    #[test]
    fn test_apt_count_above_cutoff_fails() {
        let mut apt = AdaptiveProportionTest::new(16, 7);
        let results: Vec<_> = apt_window(16, 8).into_iter().map(|s| apt.observe(s)).collect();
        assert!(results.contains(&Err(8)));
    }

    #[test]
    fn test_apt_windows_are_independent() {
        let mut apt = AdaptiveProportionTest::new(8, 5);
        // First window: 1 then seven 0s → count of `1` is 1.
        for s in [1, 0, 0, 0, 0, 0, 0, 0] {
            assert!(apt.observe(s).is_ok());
        }
        // Second window starts at 0: count of 0 is 5 → at cutoff, still ok.
        for s in [0, 1, 0, 1, 0, 1, 0, 0] {
            assert!(apt.observe(s).is_ok());
        }
        assert_eq!(apt.count(), 0);
    }

    #[test]
    fn test_engine_apt_boundary() {
        let window = 64;
        let cutoff = 40;
        // Exactly at the cutoff: no halt.
        let mut engine = HealthEngine::new(params(1000, window, cutoff));
        for s in apt_window(window as usize, cutoff as usize) {
            assert!(engine.observe(&bit(Channel::Lorenz, s)).is_none());
        }
        assert!(engine.board().status().is_ok());

        // One more occurrence: halt.
        let mut engine = HealthEngine::new(params(1000, window, cutoff));
        let failures: Vec<_> = apt_window(window as usize, cutoff as usize + 1)
            .into_iter()
            .filter_map(|s| engine.observe(&bit(Channel::Lorenz, s)))
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason(), "adaptive-proportion-exceeded");
    }

    // -----------------------------------------------------------------------
    // Global status, independence, re-arm
    // -----------------------------------------------------------------------

    #[test]
    fn test_single_halt_degrades_only() {
        let mut engine = HealthEngine::new(params(8, 1024, 1023));
        stick(&mut engine, Channel::Rossler);
        let board = engine.board();
        assert_eq!(
            board.status(),
            HealthStatus::Degraded {
                channel: Channel::Rossler,
                reason: "repetition-count-exceeded".into()
            }
        );
        assert!(!board.accepts(Channel::Rossler));
        for ch in [Channel::Chua, Channel::Lorenz, Channel::RcRelaxation] {
            assert!(board.accepts(ch));
            feed_alternating(&mut engine, ch, 100);
        }
    }

    #[test]
    fn test_majority_policy_halts_globally() {
        let mut engine = HealthEngine::new(params(8, 1024, 1023));
        stick(&mut engine, Channel::Chua);
        stick(&mut engine, Channel::Lorenz);
        assert_eq!(engine.board().status().label(), "degraded");
        stick(&mut engine, Channel::Rossler);
        let board = engine.board();
        assert_eq!(board.status().label(), "halted");
        assert!(!board.accepts(Channel::RcRelaxation));
    }

    #[test]
    fn test_all_policy_needs_every_channel() {
        let mut p = params(8, 1024, 1023);
        p.policy = GlobalHaltPolicy::All;
        let mut engine = HealthEngine::new(p);
        for ch in [Channel::Chua, Channel::Lorenz, Channel::Rossler] {
            stick(&mut engine, ch);
        }
        assert_eq!(engine.board().status().label(), "degraded");
        stick(&mut engine, Channel::RcRelaxation);
        assert_eq!(engine.board().status().label(), "halted");
    }

    #[test]
    fn test_halted_channel_stays_halted_without_rearm() {
        let mut engine = HealthEngine::new(params(8, 1024, 1023));
        stick(&mut engine, Channel::Chua);
        feed_alternating(&mut engine, Channel::Chua, 500);
        assert!(engine.board().is_halted(Channel::Chua));
    }

    #[test]
    fn test_rearm_restores_ok() {
        let mut engine = HealthEngine::new(params(8, 1024, 1023));
        let board = engine.board();
        stick(&mut engine, Channel::Chua);
        let before = board.counters(Channel::Chua).bits_tested;

        board.request_rearm(Channel::Chua);
        assert!(board.is_halted(Channel::Chua), "re-arm applies on the engine's step");
        assert_eq!(engine.apply_rearm_requests(), vec![Channel::Chua]);
        assert!(board.status().is_ok());
        assert!(board.accepts(Channel::Chua));
        assert_eq!(board.channel_state(Channel::Chua), ChannelState::Ok);

        // Test state was reset: a fresh run of C-1 passes.
        for _ in 0..7 {
            assert!(engine.observe(&bit(Channel::Chua, 1)).is_none());
        }
        assert_eq!(board.counters(Channel::Chua).bits_tested, before + 7);
        assert_eq!(board.counters(Channel::Chua).halts, 1);
        assert!(engine.apply_rearm_requests().is_empty());
    }

    #[test]
    fn test_acquisition_failure_halts_once() {
        let mut engine = HealthEngine::new(params(8, 1024, 1023));
        let f = engine
            .report_acquisition_failure(Channel::RcRelaxation, 16)
            .unwrap();
        assert_eq!(f.reason(), "acquisition-persistent-failure");
        assert!(engine.report_acquisition_failure(Channel::RcRelaxation, 17).is_none());
        assert_eq!(engine.board().counters(Channel::RcRelaxation).halts, 1);
    }

    #[test]
    fn test_events_record_transitions() {
        let mut engine = HealthEngine::new(params(8, 1024, 1023));
        let board = engine.board();
        stick(&mut engine, Channel::Lorenz);
        let events = board.drain_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].scope, EventScope::Channel);
        assert_eq!(events[0].channel, Some(Channel::Lorenz));
        assert_eq!((events[0].old_state.as_str(), events[0].new_state.as_str()), ("ok", "halted"));
        assert_eq!(events[1].scope, EventScope::Global);
        assert_eq!(events[1].new_state, "degraded");
        assert!(board.drain_events().is_empty());

        board.request_rearm_all();
        engine.apply_rearm_requests();
        let events = board.drain_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].new_state, "ok");
        assert_eq!(board.recent_events().len(), 4);
    }

    #[test]
    fn test_pending_events_bounded_when_undrained() {
        let mut engine = HealthEngine::new(params(8, 1024, 1023));
        let board = engine.board();
        for _ in 0..100 {
            stick(&mut engine, Channel::Chua);
            board.request_rearm(Channel::Chua);
            engine.apply_rearm_requests();
        }
        // halt + degraded + re-arm + ok per cycle
        let events = board.drain_events();
        assert_eq!(events.len(), PENDING_EVENTS);
        assert_eq!(board.take_overflowed(), 400 - PENDING_EVENTS as u64);
        assert_eq!(board.take_overflowed(), 0);
        assert_eq!(events.last().unwrap().reason, "operator-rearm");
    }

    #[test]
    fn test_disabled_channels_do_not_count_towards_majority() {
        let mut p = params(8, 1024, 1023);
        p.enabled = vec![Channel::Chua, Channel::Lorenz];
        let mut engine = HealthEngine::new(p);
        stick(&mut engine, Channel::Chua);
        // 1 of 2 is not a strict majority.
        assert_eq!(engine.board().status().label(), "degraded");
        stick(&mut engine, Channel::Lorenz);
        assert_eq!(engine.board().status().label(), "halted");
    }
}
