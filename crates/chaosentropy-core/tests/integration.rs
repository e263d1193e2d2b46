//! Integration tests for chaosentropy-core.
//!
//! These run the full pipeline on synthetic and replayed ADC data:
//! sampling → extraction → health tests → conditioning → pool → broker.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chaosentropy_core::config::ExtractorConfig;
use chaosentropy_core::extractor::extract_all;
use chaosentropy_core::{
    AdcDevice, AdcSampler, Channel, ChannelFault, ConditionedBlock, EntropyPool, JsonLinesBroker,
    MemoryBroker, Pipeline, PipelineConfig, PipelineOptions, ReplayAdc, Sampler, SyntheticAdc,
};

fn options(limit: Option<u64>) -> PipelineOptions {
    PipelineOptions {
        sample_limit: limit,
        conditioner_seed: Some(b"integration".to_vec()),
    }
}

fn start(device: SyntheticAdc, config: PipelineConfig, limit: Option<u64>, broker: Arc<MemoryBroker>) -> Pipeline {
    let sampler = AdcSampler::new(device, &config.sampler).unwrap();
    Pipeline::start(config, Box::new(sampler), broker, options(limit)).unwrap()
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn end_to_end_100k_samples_equal_channels() {
    let config = PipelineConfig::default();
    assert_eq!(config.conditioner_input_bits(), 640);

    let broker = Arc::new(MemoryBroker::new());
    let pipeline = start(SyntheticAdc::new(2024), config, Some(100_000), broker.clone());
    assert!(pipeline.wait_for_source(Duration::from_secs(30)));
    assert!(pipeline.wait_for_published(156, Duration::from_secs(30)));
    let diagnostics = pipeline.diagnostics();
    let report = pipeline.shutdown();

    // 100,000 qualifying bits / 640 per block.
    assert_eq!(report.samples, 100_000);
    assert_eq!(report.blocks_produced, 156);
    assert_eq!(report.blocks_published, 156);
    assert_eq!(report.partial_bits_discarded, 100_000 - 156 * 640);
    assert_eq!(report.blocks_discarded, 0);
    assert!(report.final_status.is_ok(), "status {}", report.final_status);

    let blocks = broker.block_messages();
    let seqs: Vec<u64> = blocks.iter().map(|b| b.sequence_number).collect();
    assert_eq!(seqs, (0..156).collect::<Vec<u64>>());
    for b in &blocks {
        assert_eq!(b.raw_bits_consumed, 640);
        assert_eq!(b.block_size, 32);
        assert_eq!(b.block.len(), 64);
        assert_eq!(b.source_channel_mix.values().sum::<u32>(), 640);
    }
    assert!(broker.messages().iter().all(|m| m.topic == "chaosentropy/chaos-0/entropy/ok"));

    // Status never left OK during the run, not just at the end.
    assert!(broker.health_messages().is_empty());
    let snap = diagnostics.snapshot();
    assert!(snap.recent_events.is_empty(), "{:?}", snap.recent_events);
    assert!(snap.channels.iter().all(|c| c.tests.halts == 0));
    assert_eq!(snap.conditioner.bits_rejected, 0);
}

#[test]
fn raw_bits_are_reproducible_for_a_sample_sequence() {
    let config = PipelineConfig::default();
    let collect = || {
        let mut sampler = AdcSampler::new(SyntheticAdc::new(11), &config.sampler).unwrap();
        (0..4_000)
            .map(|i| {
                sampler
                    .sample(Channel::ALL[i % 4], Duration::from_millis(50))
                    .unwrap()
            })
            .collect::<Vec<_>>()
    };
    let extractor = ExtractorConfig {
        lsb_count: 3,
        decimation: 2,
    };
    let a = extract_all(&extractor, &collect());
    let b = extract_all(&extractor, &collect());
    assert_eq!(a.len(), 2_000);
    assert_eq!(a, b);
}

#[test]
fn halted_channel_leaves_others_contributing() {
    // Rössler (input 2) is stuck: its bits are constant and trip the RCT.
    let device = SyntheticAdc::new(7).with_fault(2, ChannelFault::Stuck(0x0123_4560));
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = start(device, PipelineConfig::default(), Some(40_000), broker.clone());
    assert!(pipeline.wait_for_source(Duration::from_secs(30)));
    let report = pipeline.shutdown();

    assert_eq!(report.final_status.label(), "degraded");
    let blocks = broker.block_messages();
    assert!(!blocks.is_empty());
    let last = blocks.last().unwrap();
    assert_eq!(last.source_channel_mix["rossler"], 0);
    for name in ["chua", "lorenz", "rc_relaxation"] {
        assert!(last.source_channel_mix[name] > 0, "{name} missing from mix");
    }
    // Sequences stay gapless across the halt.
    for (i, b) in blocks.iter().enumerate() {
        assert_eq!(b.sequence_number, i as u64);
    }
    assert!(
        broker
            .messages()
            .iter()
            .any(|m| m.topic == "chaosentropy/chaos-0/entropy/degraded")
    );
    let health = broker.health_messages();
    assert!(health.iter().any(|h| h["channel"] == "rossler"
        && h["reason"] == "repetition-count-exceeded"));
}

#[test]
fn pool_of_four_blocks_fifth_push_until_take() {
    let pool = Arc::new(EntropyPool::new(4));
    let block = |sequence| ConditionedBlock {
        sequence,
        bytes: vec![0; 32],
        raw_bits_consumed: 640,
        channel_mix: [160; 4],
        produced_at_ns: 0,
    };
    for s in 0..4 {
        pool.push(block(s), Duration::ZERO).unwrap();
    }
    let producer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.push(block(4), Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished());
    assert_eq!(pool.take(Duration::ZERO).unwrap().sequence, 0);
    producer.join().unwrap().unwrap();

    let rest: Vec<u64> = (0..4)
        .map(|_| pool.take(Duration::ZERO).unwrap().sequence)
        .collect();
    assert_eq!(rest, vec![1, 2, 3, 4]);
    assert_eq!(pool.stats().reset_drops, 0);
}

#[test]
fn publish_retries_three_failures_then_succeeds() {
    let mut config = PipelineConfig::default();
    config.publisher.backoff_base_ms = 1;
    config.publisher.backoff_cap_ms = 5;
    let broker = Arc::new(MemoryBroker::new());
    broker.fail_next(3);

    let pipeline = start(SyntheticAdc::new(3), config, Some(640), broker.clone());
    assert!(pipeline.wait_for_published(1, Duration::from_secs(10)));
    let snap = pipeline.diagnostics().snapshot();
    let report = pipeline.shutdown();

    assert_eq!(snap.publisher.published, 1);
    assert_eq!(snap.publisher.retries, 3);
    assert_eq!(snap.publisher.last_delivery_retries, 3);
    assert_eq!(report.blocks_published, 1);
    assert_eq!(broker.block_messages().len(), 1);
    assert_eq!(broker.attempts(), 4);
}

#[test]
fn operator_rearm_resets_channel() {
    let device = SyntheticAdc::new(13).with_fault(1, ChannelFault::Stuck(0));
    let broker = Arc::new(MemoryBroker::new());
    let mut config = PipelineConfig::default();
    config.sampler.sample_rate_hz = 20_000.0;
    let pipeline = start(device, config, None, broker);
    let diagnostics = pipeline.diagnostics();
    let halts = |d: &chaosentropy_core::DiagnosticsHandle| {
        d.snapshot().channel(Channel::Lorenz).unwrap().tests.halts
    };

    assert!(wait_for(Duration::from_secs(10), || halts(&diagnostics) == 1));
    assert!(pipeline.health().is_halted(Channel::Lorenz));

    // Still stuck after the re-arm, so it halts again.
    diagnostics.request_rearm(Channel::Lorenz);
    assert!(wait_for(Duration::from_secs(10), || halts(&diagnostics) == 2));
    let events = diagnostics.snapshot().recent_events;
    assert!(events.iter().any(|e| e.reason == "operator-rearm"));
    pipeline.shutdown();
}

#[test]
fn replayed_capture_runs_to_exhaustion_into_json_lines() {
    let mut device = SyntheticAdc::new(99);
    let mut capture = tempfile::NamedTempFile::new().unwrap();
    writeln!(capture, "# input,code").unwrap();
    for i in 0..(4 * 640) {
        let input = (i % 4) as u8;
        let code = device.read(input, Duration::from_millis(50)).unwrap().code;
        writeln!(capture, "{input},{code:#010x}").unwrap();
    }
    capture.flush().unwrap();

    let config = PipelineConfig::default();
    let sampler = AdcSampler::new(ReplayAdc::from_path(capture.path()).unwrap(), &config.sampler).unwrap();
    let out = tempfile::NamedTempFile::new().unwrap();
    let broker = Arc::new(JsonLinesBroker::new(out.reopen().unwrap()));
    let pipeline = Pipeline::start(config, Box::new(sampler), broker, options(None)).unwrap();
    assert!(pipeline.wait_for_source(Duration::from_secs(10)));
    assert!(pipeline.wait_for_published(4, Duration::from_secs(10)));
    let report = pipeline.shutdown();
    assert_eq!(report.samples, 2_560);
    assert_eq!(report.blocks_published, 4);

    let text = std::fs::read_to_string(out.path()).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[3]["payload"]["sequence_number"], 3);
    assert_eq!(lines[0]["topic"], "chaosentropy/chaos-0/entropy/ok");
}
