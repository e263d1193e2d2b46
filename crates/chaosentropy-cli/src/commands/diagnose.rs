//! `chaosentropy diagnose`: chaos score for a capture or a simulated circuit.

use chaosentropy_analysis::chaos::{self, ChaosReport};
use chaosentropy_analysis::trace::{self, Oscillator};
use chaosentropy_core::{Channel, code_to_voltage};

pub struct DiagnoseCommandConfig<'a> {
    pub capture: Option<&'a str>,
    pub channel: &'a str,
    pub synthetic: Option<&'a str>,
    pub pot: f64,
    pub samples: usize,
    pub rate: f64,
    pub vref: f64,
    pub json: bool,
}

pub fn run(cmd: DiagnoseCommandConfig<'_>) {
    let (label, volts) = match load_trace(&cmd) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let report = match chaos::analyze(&volts, cmd.rate) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {label}: {e}");
            std::process::exit(1);
        }
    };

    if cmd.json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Error serializing report: {e}");
                std::process::exit(1);
            }
        }
    } else {
        print_report(&label, &report);
    }
}

fn load_trace(cmd: &DiagnoseCommandConfig<'_>) -> Result<(String, Vec<f64>), String> {
    if let Some(name) = cmd.synthetic {
        let osc: Oscillator = name.parse()?;
        let label = format!("simulated {osc} (pot {:.2})", cmd.pot.clamp(0.0, 1.0));
        return Ok((label, trace::simulate(osc, cmd.pot, cmd.samples)));
    }
    let Some(path) = cmd.capture else {
        return Err("pass --capture <file> or --synthetic <oscillator>".into());
    };
    let channel: Channel = cmd.channel.parse()?;
    let text = std::fs::read_to_string(path).map_err(|e| format!("reading {path}: {e}"))?;
    let volts = parse_capture(&text, channel.index() as u8, cmd.vref)?;
    Ok((format!("{path} ({channel})"), volts))
}

/// Voltages from a capture file.
///
/// `input,code` lines are converted with `vref` and filtered to `input`;
/// single-column lines are taken as volts. `#` starts a comment line.
pub fn parse_capture(text: &str, input: u8, vref: f64) -> Result<Vec<f64>, String> {
    let mut volts = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bad = || format!("line {}: cannot parse '{line}'", lineno + 1);
        match line.split_once(',') {
            Some((inp, code)) => {
                let inp: u8 = inp.trim().parse().map_err(|_| bad())?;
                if inp != input {
                    continue;
                }
                let code = code.trim();
                let code = match code.strip_prefix("0x") {
                    Some(hex) => u32::from_str_radix(hex, 16),
                    None => code.parse(),
                }
                .map_err(|_| bad())?;
                volts.push(code_to_voltage(code, vref));
            }
            None => volts.push(line.parse().map_err(|_| bad())?),
        }
    }
    Ok(volts)
}

fn print_report(label: &str, r: &ChaosReport) {
    println!("Chaos diagnostic: {label}");
    println!(
        "  {} samples at {:.0} Hz ({:.2}s)",
        r.samples,
        r.sample_rate_hz,
        r.samples as f64 / r.sample_rate_hz
    );
    println!();
    println!("  Signal");
    println!("    mean            {:.3} V", r.signal.mean);
    println!("    std             {:.3} V", r.signal.std);
    println!("    peak-to-peak    {:.3} V", r.signal.peak_to_peak);

    if let (Some(spectrum), Some(autocorr)) = (r.spectrum, r.autocorr) {
        println!("  Spectrum");
        println!("    dominant        {:.1} Hz", spectrum.dominant_hz);
        println!("    peaks           {}", spectrum.peaks);
        println!("    top-3 power     {:.2}%", spectrum.top3_concentration * 100.0);
        println!("  Autocorrelation");
        println!(
            "    decay           {} samples ({:.2} ms)",
            autocorr.decay_lag, autocorr.decay_ms
        );
        println!("    secondary peaks {}", autocorr.secondary_peaks);
        println!();
        println!("  Score");
        println!("    spectral        {:>5.1} / 30", r.scores.spectral);
        println!("    power           {:>5.1} / 25", r.scores.power);
        println!("    aperiodicity    {:>5.1} / 25", r.scores.aperiodicity);
        println!("    dynamic range   {:>5.1} / 20", r.scores.dynamic);
    } else {
        println!("  (signal below {} V peak-to-peak, not analyzed)", chaos::WEAK_SIGNAL_P2P_VOLTS);
    }
    println!();
    println!("  Total: {:.0}/100  {}", r.total, r.verdict);
    println!("  Hint:  {}", r.hint);
}
