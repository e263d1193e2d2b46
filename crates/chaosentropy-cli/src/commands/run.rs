//! `chaosentropy run`: drive the full pipeline from a synthetic or replayed ADC.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chaosentropy_analysis::battery;
use chaosentropy_core::{
    AdcSampler, BlockMessage, Broker, JsonLinesBroker, MemoryBroker, Pipeline, PipelineOptions,
    ReplayAdc, Sampler, ShutdownReport, SyntheticAdc,
};

use super::{load_config, parse_duration, parse_fault};

pub struct RunCommandConfig<'a> {
    pub config_path: Option<&'a str>,
    pub replay: Option<&'a str>,
    pub seed: u64,
    pub sample_limit: Option<u64>,
    pub duration: Option<&'a str>,
    pub output: Option<&'a str>,
    pub faults: &'a [String],
    pub conditioner_seed: Option<&'a str>,
    pub serve: Option<u16>,
    pub host: &'a str,
    pub check: bool,
    pub report_path: Option<&'a str>,
}

/// Where published messages go, kept so `--check` can read them back.
enum Sink {
    Memory(Arc<MemoryBroker>),
    File(String),
    Stdout,
}

pub fn run(cmd: RunCommandConfig<'_>) {
    let config = load_config(cmd.config_path);
    let max_duration = cmd.duration.map(|d| {
        parse_duration(d).unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            std::process::exit(1);
        })
    });

    let sampler = build_sampler(&cmd, &config).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    let (broker, sink) = build_broker(cmd.output).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let options = PipelineOptions {
        sample_limit: cmd.sample_limit,
        conditioner_seed: cmd.conditioner_seed.map(|s| s.as_bytes().to_vec()),
    };
    let pipeline = match Pipeline::start(config, sampler, broker, options) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error starting pipeline: {e}");
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Warning: could not install Ctrl+C handler: {e}");
    }

    if let Some(port) = cmd.serve {
        let handle = pipeline.diagnostics();
        let host = cmd.host.to_string();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("diagnostics server: {e}");
                    return;
                }
            };
            if let Err(e) = rt.block_on(chaosentropy_server::run_server(handle, &host, port)) {
                log::error!("diagnostics server on {host}:{port}: {e}");
            }
        });
    }

    print_banner(&cmd, &pipeline, max_duration);

    let start = Instant::now();
    let diagnostics = pipeline.diagnostics();
    let mut last_print = Instant::now();
    while running.load(Ordering::SeqCst) && !pipeline.source_finished() {
        if max_duration.is_some_and(|max| start.elapsed() >= max) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
        if last_print.elapsed() >= Duration::from_secs(1) {
            let snap = diagnostics.snapshot();
            eprint!(
                "\r  {:<9} samples {:<10} blocks {:<8} published {:<8} pool {}/{}   ",
                snap.status.label(),
                snap.channels.iter().map(|c| c.samples).sum::<u64>(),
                snap.conditioner.blocks_produced,
                snap.publisher.published,
                snap.pool.occupancy,
                snap.pool.capacity,
            );
            last_print = Instant::now();
        }
    }
    eprintln!();

    let final_snapshot = diagnostics.snapshot();
    let report = pipeline.shutdown();
    print_report(&report);

    if let Some(path) = cmd.report_path {
        let json = serde_json::json!({
            "shutdown": report,
            "diagnostics": final_snapshot,
        });
        match serde_json::to_string_pretty(&json) {
            Ok(text) => match std::fs::write(path, text) {
                Ok(()) => println!("Report written to {path}"),
                Err(e) => eprintln!("Error writing report {path}: {e}"),
            },
            Err(e) => eprintln!("Error serializing report: {e}"),
        }
    }

    if cmd.check {
        match published_bytes(&sink) {
            Ok(bytes) => print_checks(&bytes),
            Err(e) => eprintln!("Cannot run checks: {e}"),
        }
    }
}

fn build_sampler(
    cmd: &RunCommandConfig<'_>,
    config: &chaosentropy_core::PipelineConfig,
) -> Result<Box<dyn Sampler>, String> {
    if let Some(path) = cmd.replay {
        if !cmd.faults.is_empty() {
            return Err("--fault only applies to the synthetic ADC".into());
        }
        let device = ReplayAdc::from_path(path).map_err(|e| format!("reading {path}: {e}"))?;
        let sampler = AdcSampler::new(device, &config.sampler).map_err(|e| e.to_string())?;
        return Ok(Box::new(sampler));
    }

    let mut device = SyntheticAdc::new(cmd.seed);
    for spec in cmd.faults {
        let (channel, fault) = parse_fault(spec)?;
        let input = config.sampler.channels.adc_input(channel);
        log::info!("injecting {fault:?} on {channel} (input {input})");
        device = device.with_fault(input, fault);
    }
    let sampler = AdcSampler::new(device, &config.sampler).map_err(|e| e.to_string())?;
    Ok(Box::new(sampler))
}

fn build_broker(output: Option<&str>) -> Result<(Arc<dyn Broker>, Sink), String> {
    match output {
        None => {
            let memory = Arc::new(MemoryBroker::new());
            let broker: Arc<dyn Broker> = memory.clone();
            Ok((broker, Sink::Memory(memory)))
        }
        Some("-") => {
            let broker: Arc<dyn Broker> = Arc::new(JsonLinesBroker::new(std::io::stdout()));
            Ok((broker, Sink::Stdout))
        }
        Some(path) => {
            let file = File::create(path).map_err(|e| format!("creating {path}: {e}"))?;
            let broker: Arc<dyn Broker> = Arc::new(JsonLinesBroker::new(BufWriter::new(file)));
            Ok((broker, Sink::File(path.to_string())))
        }
    }
}

fn print_banner(cmd: &RunCommandConfig<'_>, pipeline: &Pipeline, max_duration: Option<Duration>) {
    let config = pipeline.config();
    println!("chaosentropy v{}", chaosentropy_core::VERSION);
    match cmd.replay {
        Some(path) => println!("  Source:     replay {path}"),
        None => println!("  Source:     synthetic ADC (seed {})", cmd.seed),
    }
    println!(
        "  H_min:      {} bits/raw bit  (RCT cutoff {}, APT cutoff {}/{})",
        config.entropy.h_min,
        config.rct_cutoff(),
        config.apt_cutoff(),
        config.health.apt_window,
    );
    println!(
        "  Blocks:     {} bytes from {} raw bits",
        config.conditioner.output_block_bytes,
        config.conditioner_input_bits(),
    );
    println!(
        "  Topics:     {}/{}/entropy/{{ok,degraded}}",
        config.publisher.topic_namespace, config.publisher.device_id
    );
    match (cmd.sample_limit, max_duration) {
        (Some(n), _) => println!("  Limit:      {n} samples"),
        (None, Some(d)) => println!("  Limit:      {}s", d.as_secs()),
        (None, None) => println!("  Limit:      until Ctrl+C"),
    }
    if let Some(port) = cmd.serve {
        println!("  Diagnostics: http://{}:{port}/diagnostics", cmd.host);
    }
    println!();
}

fn print_report(report: &ShutdownReport) {
    println!("Shutdown after {:.1}s", report.elapsed_secs);
    println!("  Final status:      {}", report.final_status);
    println!("  Samples:           {}", report.samples);
    println!("  Blocks produced:   {}", report.blocks_produced);
    println!("  Blocks published:  {}", report.blocks_published);
    println!("  Blocks discarded:  {}", report.blocks_discarded);
    println!("  Blocks dropped:    {}", report.blocks_dropped);
    println!("  Partial bits lost: {}", report.partial_bits_discarded);
}

/// Concatenated block bytes of every published block, in sequence order.
fn published_bytes(sink: &Sink) -> Result<Vec<u8>, String> {
    let mut blocks: Vec<BlockMessage> = match sink {
        Sink::Memory(broker) => broker.block_messages(),
        Sink::File(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| format!("reading {path}: {e}"))?;
            text.lines()
                .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
                .filter(|v| v["topic"].as_str().is_some_and(|t| t.contains("/entropy/")))
                .filter_map(|v| serde_json::from_value(v["payload"].clone()).ok())
                .collect()
        }
        Sink::Stdout => return Err("output went to stdout".into()),
    };
    blocks.sort_by_key(|b| b.sequence_number);
    let mut bytes = Vec::with_capacity(blocks.len() * 32);
    for b in &blocks {
        bytes.extend(decode_hex(&b.block)?);
    }
    Ok(bytes)
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err(format!("odd-length hex block ({} chars)", s.len()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| format!("bad hex: {e}")))
        .collect()
}

fn print_checks(bytes: &[u8]) {
    println!();
    println!("Output checks over {} bytes", bytes.len());
    let results = battery::run_all(bytes);
    for r in &results {
        let p = r.p_value.map_or_else(|| "   -   ".to_string(), |p| format!("{p:.4}"));
        println!(
            "  {:<18} {}  p={p}  {}  {}",
            r.name,
            r.grade,
            if r.passed { "pass" } else { "FAIL" },
            r.details
        );
    }
    println!("  Quality score: {:.0}/100", battery::quality_score(&results));
}
