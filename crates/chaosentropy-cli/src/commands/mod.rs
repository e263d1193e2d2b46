pub mod config;
pub mod cutoffs;
pub mod diagnose;
pub mod run;

use std::time::Duration;

use chaosentropy_core::{Channel, ChannelFault, PipelineConfig};

/// Load a configuration file, or the defaults. Exits on error.
pub fn load_config(path: Option<&str>) -> PipelineConfig {
    match path {
        Some(path) => PipelineConfig::load(path).unwrap_or_else(|e| {
            eprintln!("Error loading config {path}: {e}");
            std::process::exit(1);
        }),
        None => PipelineConfig::default(),
    }
}

/// Parse a duration string like "5m", "30s", "1h", "100ms". Bare numbers are seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (numeric, millis) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1_000)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000)
    } else {
        (s, 1_000)
    };
    let value: u64 = numeric
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    Ok(Duration::from_millis(value.saturating_mul(millis)))
}

/// Parse `channel:kind[=arg]` into a channel and synthetic fault.
pub fn parse_fault(spec: &str) -> Result<(Channel, ChannelFault), String> {
    let (channel, kind) = spec
        .split_once(':')
        .ok_or_else(|| format!("fault '{spec}' must look like channel:kind"))?;
    let channel: Channel = channel.parse()?;
    let (kind, arg) = match kind.split_once('=') {
        Some((k, a)) => (k, Some(a)),
        None => (kind, None),
    };
    let fault = match (kind.trim(), arg) {
        ("stuck", None) => ChannelFault::Stuck(0x0123_4560),
        ("stuck", Some(code)) => ChannelFault::Stuck(parse_code(code)?),
        ("biased", arg) => {
            let p = arg.unwrap_or("0.9");
            let p: f64 = p.parse().map_err(|_| format!("invalid bias probability: {p}"))?;
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("bias probability {p} outside 0..=1"));
            }
            ChannelFault::Biased(p)
        }
        ("timeout", None) => ChannelFault::Timeout,
        ("out-of-range" | "rail", None) => ChannelFault::OutOfRange,
        ("delay", Some(d)) => ChannelFault::Delay(parse_duration(d)?),
        (other, _) => return Err(format!("unknown fault kind in '{spec}': {other}")),
    };
    Ok((channel, fault))
}

fn parse_code(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid ADC code: {s}"))
}
