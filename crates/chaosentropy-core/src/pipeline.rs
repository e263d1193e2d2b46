//! Pipeline orchestration: three worker threads joined by bounded queues.
//!
//! ```text
//! sampling:     Selector → Extractor → HealthEngine ──raw-bit queue──┐
//! conditioning: Conditioner (health-gated) ───────── EntropyPool ──┐ │
//! publishing:   PublisherBridge → Broker                    ◄──────┘ ◄┘
//! ```
//!
//! Shutdown order: stop sampling, let the conditioner finish queued bits,
//! close the pool, let the publisher drain until the drain deadline, then
//! discard whatever is left. Every wait is bounded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::conditioning::{ConditionedBlock, Conditioner, ConditionerStats};
use crate::diagnostics::{DiagnosticsHandle, TestParameters};
use crate::error::{AcquisitionError, Error};
use crate::extractor::{BitExtractor, RawBit};
use crate::health::{HealthBoard, HealthEngine, HealthStatus};
use crate::pool::{EntropyPool, PoolError};
use crate::publisher::{Broker, PublisherBridge, PublisherStats, Step};
use crate::queue::{BoundedQueue, PopError, PushError};
use crate::sampler::Sampler;
use crate::selector::{SelectorStats, SourceSelector};

/// Poll interval for workers waiting on a queue.
const POLL: Duration = Duration::from_millis(50);

/// Run-time options that are not part of the device configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Stop sampling after this many successful samples.
    pub sample_limit: Option<u64>,
    /// Fixed conditioner seed for reproducible output. OS entropy when unset.
    pub conditioner_seed: Option<Vec<u8>>,
}

/// Counts reported once every worker has stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub samples: u64,
    pub blocks_produced: u64,
    pub blocks_published: u64,
    /// Raw bits left in the conditioner's input buffer.
    pub partial_bits_discarded: u64,
    /// Blocks never delivered (retry buffer, pool remainder, late pushes).
    pub blocks_discarded: u64,
    /// Blocks lost to retry-buffer overflow during the run.
    pub blocks_dropped: u64,
    pub final_status: HealthStatus,
    pub elapsed_secs: f64,
}

#[derive(Default)]
struct ShutdownSignal {
    stop_sampling: AtomicBool,
    drain_deadline: Mutex<Option<Instant>>,
}

impl ShutdownSignal {
    fn deadline(&self) -> Option<Instant> {
        *self.drain_deadline.lock().unwrap()
    }

    fn expired(&self) -> bool {
        self.deadline().is_some_and(|d| Instant::now() >= d)
    }
}

/// A running pipeline. Dropping it without [`shutdown`](Self::shutdown)
/// leaves the workers running until the process exits.
pub struct Pipeline {
    config: PipelineConfig,
    board: Arc<HealthBoard>,
    pool: Arc<EntropyPool>,
    selector_stats: Arc<SelectorStats>,
    conditioner_stats: Arc<ConditionerStats>,
    publisher_stats: Arc<PublisherStats>,
    diagnostics: DiagnosticsHandle,
    signal: Arc<ShutdownSignal>,
    running: Arc<AtomicBool>,
    sampler: Option<JoinHandle<u64>>,
    conditioner: Option<JoinHandle<u64>>,
    publisher: Option<JoinHandle<u64>>,
    started: Instant,
}

impl Pipeline {
    /// Validate `config`, wire up every stage and start the workers.
    pub fn start(
        config: PipelineConfig,
        sampler: Box<dyn Sampler>,
        broker: Arc<dyn Broker>,
        options: PipelineOptions,
    ) -> Result<Self, Error> {
        config.validate()?;

        let engine = HealthEngine::from_config(&config);
        let board = engine.board();
        let enabled = engine.params().enabled.clone();
        let selector = SourceSelector::new(sampler, &config.selector, &config.sampler);
        let selector_stats = selector.stats();
        let extractor = BitExtractor::new(&config.extractor);
        let conditioner = Conditioner::new(
            &config,
            Arc::clone(&board),
            options.conditioner_seed.as_deref(),
        )?;
        let conditioner_stats = conditioner.stats();
        let pool = Arc::new(EntropyPool::new(config.pool.capacity));
        let bridge = PublisherBridge::new(
            &config.publisher,
            broker,
            Arc::clone(&pool),
            Arc::clone(&board),
        );
        let publisher_stats = bridge.stats();
        let raw_queue = Arc::new(BoundedQueue::new(config.conditioner.raw_queue_capacity));
        let signal = Arc::new(ShutdownSignal::default());
        let running = Arc::new(AtomicBool::new(true));

        let parameters = TestParameters {
            h_min: config.entropy.h_min,
            rct_cutoff: config.rct_cutoff(),
            apt_window: config.health.apt_window,
            apt_cutoff: config.apt_cutoff(),
            conditioner_input_bits: conditioner.input_bits(),
            output_block_bytes: config.conditioner.output_block_bytes,
        };
        let diagnostics = DiagnosticsHandle::new(
            Arc::clone(&board),
            Arc::clone(&selector_stats),
            Arc::clone(&conditioner_stats),
            Arc::clone(&pool),
            Arc::clone(&publisher_stats),
            Arc::clone(&running),
            enabled.clone(),
            parameters,
        );

        log::info!(
            "starting pipeline: channels [{}], H_min {}, RCT cutoff {}, APT cutoff {}/{}, N_in {}",
            enabled
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(", "),
            parameters.h_min,
            parameters.rct_cutoff,
            parameters.apt_cutoff,
            parameters.apt_window,
            parameters.conditioner_input_bits,
        );

        let sampling = SamplingWorker {
            selector,
            extractor,
            engine,
            raw_queue: Arc::clone(&raw_queue),
            signal: Arc::clone(&signal),
            max_consecutive_misses: config.selector.max_consecutive_misses,
            sample_limit: options.sample_limit,
        };
        let conditioning = ConditioningWorker {
            conditioner,
            raw_queue,
            pool: Arc::clone(&pool),
            signal: Arc::clone(&signal),
            push_timeout: config.pool.push_timeout(),
            starvation_warn: Duration::from_millis(config.conditioner.starvation_warn_ms),
        };
        let publishing = PublishingWorker {
            bridge,
            signal: Arc::clone(&signal),
        };

        let sampler = spawn("chaos-sampling", move || sampling.run())?;
        let conditioner = spawn("chaos-conditioning", move || conditioning.run())?;
        let publisher = spawn("chaos-publishing", move || publishing.run())?;

        Ok(Self {
            config,
            board,
            pool,
            selector_stats,
            conditioner_stats,
            publisher_stats,
            diagnostics,
            signal,
            running,
            sampler: Some(sampler),
            conditioner: Some(conditioner),
            publisher: Some(publisher),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Shared health state (read-only, plus operator re-arm requests).
    pub fn health(&self) -> Arc<HealthBoard> {
        Arc::clone(&self.board)
    }

    pub fn pool(&self) -> Arc<EntropyPool> {
        Arc::clone(&self.pool)
    }

    pub fn diagnostics(&self) -> DiagnosticsHandle {
        self.diagnostics.clone()
    }

    /// Whether the sampling worker has stopped (source exhausted or limit hit).
    pub fn source_finished(&self) -> bool {
        self.sampler.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Wait up to `timeout` for the sampling worker to stop on its own.
    pub fn wait_for_source(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.source_finished())
    }

    /// Wait up to `timeout` until at least `n` blocks have been published.
    pub fn wait_for_published(&self, n: u64, timeout: Duration) -> bool {
        wait_until(timeout, || self.publisher_stats.snapshot().published >= n)
    }

    /// Stop all workers in order and report what was discarded.
    pub fn shutdown(mut self) -> ShutdownReport {
        log::info!("shutting down pipeline");
        self.signal.stop_sampling.store(true, Ordering::Release);
        let samples = join(self.sampler.take(), "sampling")
            .unwrap_or_else(|| self.selector_stats.total_samples());

        *self.signal.drain_deadline.lock().unwrap() =
            Some(Instant::now() + self.config.shutdown.drain_timeout());

        let late_blocks = join(self.conditioner.take(), "conditioning").unwrap_or(0);
        let publisher_discarded = join(self.publisher.take(), "publishing").unwrap_or(0);
        let leftover = self.pool.drain_remaining().len() as u64;
        self.running.store(false, Ordering::Release);

        let conditioner = self.conditioner_stats.snapshot();
        let publisher = self.publisher_stats.snapshot();
        let report = ShutdownReport {
            samples,
            blocks_produced: conditioner.blocks_produced,
            blocks_published: publisher.published,
            partial_bits_discarded: conditioner.partial_bits_discarded,
            blocks_discarded: late_blocks + publisher_discarded + leftover,
            blocks_dropped: publisher.dropped,
            final_status: self.board.status(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        };
        log::info!(
            "pipeline stopped: {} samples, {} blocks produced, {} published, {} discarded",
            report.samples,
            report.blocks_produced,
            report.blocks_published,
            report.blocks_discarded
        );
        report
    }
}

fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<u64>, Error>
where
    F: FnOnce() -> u64 + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| Error::Startup(format!("failed to spawn {name} worker: {e}")))
}

fn join(handle: Option<JoinHandle<u64>>, name: &str) -> Option<u64> {
    match handle?.join() {
        Ok(n) => Some(n),
        Err(_) => {
            log::error!("{name} worker panicked");
            None
        }
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

struct SamplingWorker {
    selector: SourceSelector,
    extractor: BitExtractor,
    engine: HealthEngine,
    raw_queue: Arc<BoundedQueue<RawBit>>,
    signal: Arc<ShutdownSignal>,
    max_consecutive_misses: u32,
    sample_limit: Option<u64>,
}

impl SamplingWorker {
    /// Returns the number of successful samples.
    fn run(mut self) -> u64 {
        let mut samples: u64 = 0;
        while !self.signal.stop_sampling.load(Ordering::Acquire) {
            for channel in self.engine.apply_rearm_requests() {
                self.extractor.reset_channel(channel);
            }
            if self.sample_limit.is_some_and(|limit| samples >= limit) {
                log::info!("sample limit reached after {samples} samples");
                break;
            }
            match self.selector.next() {
                Ok(sample) => {
                    samples += 1;
                    if let Some(mut bit) = self.extractor.push(&sample) {
                        self.engine.observe_and_stamp(&mut bit);
                        if !self.forward(bit) {
                            break;
                        }
                    }
                }
                Err(AcquisitionError::Exhausted) => {
                    log::info!("sample source exhausted after {samples} samples");
                    break;
                }
                Err(e) => {
                    let Some(channel) = e.channel() else { continue };
                    let misses = self.selector.consecutive_misses(channel);
                    if misses >= self.max_consecutive_misses {
                        self.engine.report_acquisition_failure(channel, misses);
                    }
                }
            }
        }
        self.raw_queue.close();
        samples
    }

    /// Hand a bit to the conditioner, waiting out backpressure.
    fn forward(&self, mut bit: RawBit) -> bool {
        loop {
            match self.raw_queue.push_timeout(bit, POLL) {
                Ok(()) => return true,
                Err(PushError::Full(b)) => {
                    if self.signal.stop_sampling.load(Ordering::Acquire) {
                        return false;
                    }
                    bit = b;
                }
                Err(PushError::Closed(_)) => return false,
            }
        }
    }
}

struct ConditioningWorker {
    conditioner: Conditioner,
    raw_queue: Arc<BoundedQueue<RawBit>>,
    pool: Arc<EntropyPool>,
    signal: Arc<ShutdownSignal>,
    push_timeout: Duration,
    starvation_warn: Duration,
}

impl ConditioningWorker {
    /// Returns the number of blocks discarded because the pool never freed up.
    fn run(mut self) -> u64 {
        let stats = self.conditioner.stats();
        let mut discarded = 0;
        let mut starving_since = Instant::now();
        let mut warned = false;
        loop {
            if self.signal.expired() {
                let left = self.raw_queue.drain().len();
                if left > 0 {
                    log::warn!("drain deadline passed: {left} queued raw bits discarded");
                }
                break;
            }
            match self.raw_queue.pop_timeout(POLL) {
                Ok(bit) => {
                    starving_since = Instant::now();
                    warned = false;
                    if let Some(block) = self.conditioner.push_bit(&bit) {
                        discarded += self.store(block);
                    }
                }
                Err(PopError::Empty) => {
                    let starved = starving_since.elapsed();
                    if !warned && starved >= self.starvation_warn {
                        log::warn!(
                            "conditioner starved for {starved:?} ({} of {} bits buffered); upstream may have failed",
                            self.conditioner.pending_bits(),
                            self.conditioner.input_bits()
                        );
                        stats.starvation_episodes.fetch_add(1, Ordering::Relaxed);
                        warned = true;
                    }
                }
                Err(PopError::Closed) => break,
            }
        }
        self.conditioner.discard_partial();
        self.pool.close();
        discarded
    }

    /// Push a block, holding it through backpressure. Returns 1 if it had to
    /// be discarded at shutdown.
    fn store(&self, mut block: ConditionedBlock) -> u64 {
        let stats = self.conditioner.stats();
        loop {
            match self.pool.push(block, self.push_timeout) {
                Ok(()) => return 0,
                Err(PoolError::Full(b)) => {
                    stats.backpressure_waits.fetch_add(1, Ordering::Relaxed);
                    if self.signal.expired() {
                        log::warn!("drain deadline passed: block {} discarded", b.sequence);
                        return 1;
                    }
                    block = b;
                }
                Err(PoolError::Closed(b)) => {
                    log::warn!("pool closed: block {} discarded", b.sequence);
                    return 1;
                }
            }
        }
    }
}

struct PublishingWorker {
    bridge: PublisherBridge,
    signal: Arc<ShutdownSignal>,
}

impl PublishingWorker {
    /// Returns the number of blocks discarded at shutdown.
    fn run(mut self) -> u64 {
        loop {
            if self.signal.expired() {
                log::warn!("drain deadline passed with blocks still undelivered");
                break;
            }
            if self.bridge.step(self.signal.deadline()) == Step::Finished {
                break;
            }
        }
        self.bridge.publish_health_events(self.signal.deadline());
        self.bridge.discard_remaining() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::publisher::MemoryBroker;
    use crate::sampler::{AdcSampler, ChannelFault, SyntheticAdc};

    fn start(device: SyntheticAdc, config: PipelineConfig, limit: Option<u64>) -> (Pipeline, Arc<MemoryBroker>) {
        start_with(device, config, limit, Arc::new(MemoryBroker::new()))
    }

    fn start_with(
        device: SyntheticAdc,
        config: PipelineConfig,
        limit: Option<u64>,
        broker: Arc<MemoryBroker>,
    ) -> (Pipeline, Arc<MemoryBroker>) {
        let sampler = AdcSampler::new(device, &config.sampler).unwrap();
        let pipeline = Pipeline::start(
            config,
            Box::new(sampler),
            broker.clone(),
            PipelineOptions {
                sample_limit: limit,
                conditioner_seed: Some(b"pipeline-test".to_vec()),
            },
        )
        .unwrap();
        (pipeline, broker)
    }

    #[test]
    fn test_invalid_config_rejected_at_start() {
        let mut config = PipelineConfig::default();
        config.entropy.h_min = 0.0;
        let sampler = AdcSampler::new(SyntheticAdc::new(1), &config.sampler).unwrap();
        let result = Pipeline::start(
            config,
            Box::new(sampler),
            Arc::new(MemoryBroker::new()),
            PipelineOptions::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_short_run_publishes_blocks() {
        let (pipeline, broker) = start(SyntheticAdc::new(3), PipelineConfig::default(), Some(6_400));
        assert!(pipeline.wait_for_source(Duration::from_secs(10)));
        assert!(pipeline.wait_for_published(10, Duration::from_secs(10)));
        let report = pipeline.shutdown();
        assert_eq!(report.samples, 6_400);
        assert_eq!(report.blocks_produced, 10);
        assert_eq!(report.blocks_published, 10);
        assert_eq!(report.blocks_discarded, 0);
        assert_eq!(report.partial_bits_discarded, 0);
        assert_eq!(broker.block_messages().len(), 10);
    }

    #[test]
    fn test_stuck_channel_degrades_and_diagnostics_show_it() {
        let device = SyntheticAdc::new(5).with_fault(1, ChannelFault::Stuck(0x10));
        let (pipeline, _broker) = start(device, PipelineConfig::default(), Some(20_000));
        assert!(pipeline.wait_for_source(Duration::from_secs(10)));

        let snap = pipeline.diagnostics().snapshot();
        assert_eq!(snap.status.label(), "degraded");
        let lorenz = snap.channel(Channel::Lorenz).unwrap();
        assert_eq!(lorenz.state.label(), "halted");
        assert_eq!(lorenz.tests.halts, 1);
        assert_eq!(snap.channel(Channel::Chua).unwrap().state.label(), "ok");
        assert!(!snap.recent_events.is_empty());
        assert_eq!(snap.parameters.rct_cutoff, 61);

        let report = pipeline.shutdown();
        assert_eq!(report.final_status.label(), "degraded");
    }

    #[test]
    fn test_persistent_timeouts_halt_channel() {
        let mut config = PipelineConfig::default();
        config.sampler.timeout_ms = 1;
        config.selector.max_consecutive_misses = 4;
        let device = SyntheticAdc::new(5).with_fault(3, ChannelFault::Timeout);
        let (pipeline, _broker) = start(device, config, Some(400));
        assert!(pipeline.wait_for_source(Duration::from_secs(10)));
        let board = pipeline.health();
        assert!(board.is_halted(Channel::RcRelaxation));
        assert_eq!(
            board.channel_state(Channel::RcRelaxation),
            crate::health::ChannelState::Halted {
                reason: "acquisition-persistent-failure".into()
            }
        );
        pipeline.shutdown();
    }

    #[test]
    fn test_shutdown_is_bounded_with_broker_down() {
        let mut config = PipelineConfig::default();
        config.shutdown.drain_timeout_ms = 200;
        config.publisher.backoff_base_ms = 10;
        config.publisher.backoff_cap_ms = 20;
        let broker = Arc::new(MemoryBroker::new());
        broker.set_unreachable(true);
        let (pipeline, _broker) = start_with(SyntheticAdc::new(9), config, None, broker);
        std::thread::sleep(Duration::from_millis(200));
        let t0 = Instant::now();
        let report = pipeline.shutdown();
        assert!(t0.elapsed() < Duration::from_secs(5));
        assert_eq!(report.blocks_published, 0);
        assert_eq!(
            report.blocks_produced,
            report.blocks_discarded + report.blocks_dropped
        );
    }
}
