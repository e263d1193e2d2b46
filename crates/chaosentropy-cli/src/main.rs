//! CLI for chaosentropy: four chaotic oscillators in, validated entropy out.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chaosentropy")]
#[command(about = "chaosentropy: health-tested entropy from chaotic oscillator circuits")]
#[command(version = chaosentropy_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the entropy pipeline until the source ends, the duration passes or Ctrl+C
    Run {
        /// TOML configuration file (defaults apply to anything left out)
        #[arg(long)]
        config: Option<String>,

        /// Replay a capture of `input,code` lines instead of the synthetic ADC
        #[arg(long)]
        replay: Option<String>,

        /// Seed for the synthetic ADC
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Stop after this many successful samples
        #[arg(long)]
        samples: Option<u64>,

        /// Maximum run time (e.g. "30s", "5m", "1h")
        #[arg(long)]
        duration: Option<String>,

        /// Write published messages as JSON lines to this file ("-" for stdout).
        /// Without it, messages are kept in memory and only counted.
        #[arg(long)]
        output: Option<String>,

        /// Inject a synthetic fault, e.g. `rossler:stuck`, `lorenz:biased=0.9`,
        /// `chua:timeout`, `rc:out-of-range`, `chua:delay=5ms`. Repeatable.
        #[arg(long = "fault")]
        faults: Vec<String>,

        /// Fixed conditioner seed for reproducible output
        #[arg(long)]
        conditioner_seed: Option<String>,

        /// Serve diagnostics over HTTP on this port while running
        #[arg(long)]
        serve: Option<u16>,

        /// Bind address for --serve
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Run statistical checks over the published blocks at the end
        #[arg(long)]
        check: bool,

        /// Write the shutdown report and final diagnostics as JSON
        #[arg(long)]
        report: Option<String>,
    },

    /// Score a trace for chaotic behaviour and suggest a potentiometer adjustment
    Diagnose {
        /// Capture file: `input,code` lines (ADC codes) or one voltage per line
        #[arg(long, conflicts_with = "synthetic")]
        capture: Option<String>,

        /// Channel to pick from an `input,code` capture
        #[arg(long, default_value = "chua")]
        channel: String,

        /// Simulate this oscillator instead of reading a capture
        #[arg(long)]
        synthetic: Option<String>,

        /// Potentiometer position 0.0..=1.0 for --synthetic
        #[arg(long, default_value = "1.0")]
        pot: f64,

        /// Samples to simulate for --synthetic
        #[arg(long, default_value = "33000")]
        samples: usize,

        /// Sample rate of the trace in Hz
        #[arg(long, default_value = "11000")]
        rate: f64,

        /// ADC reference voltage for code conversion
        #[arg(long, default_value = "5.0")]
        vref: f64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the configuration (defaults, or a file after validation) as TOML
    Config {
        /// Configuration file to load and echo
        #[arg(long)]
        config: Option<String>,
    },

    /// Print derived health-test cutoffs and the conditioner input size
    Cutoffs {
        /// Configuration file
        #[arg(long)]
        config: Option<String>,

        /// Override min-entropy per raw bit
        #[arg(long)]
        h_min: Option<f64>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            replay,
            seed,
            samples,
            duration,
            output,
            faults,
            conditioner_seed,
            serve,
            host,
            check,
            report,
        } => commands::run::run(commands::run::RunCommandConfig {
            config_path: config.as_deref(),
            replay: replay.as_deref(),
            seed,
            sample_limit: samples,
            duration: duration.as_deref(),
            output: output.as_deref(),
            faults: &faults,
            conditioner_seed: conditioner_seed.as_deref(),
            serve,
            host: &host,
            check,
            report_path: report.as_deref(),
        }),
        Commands::Diagnose {
            capture,
            channel,
            synthetic,
            pot,
            samples,
            rate,
            vref,
            json,
        } => commands::diagnose::run(commands::diagnose::DiagnoseCommandConfig {
            capture: capture.as_deref(),
            channel: &channel,
            synthetic: synthetic.as_deref(),
            pot,
            samples,
            rate,
            vref,
            json,
        }),
        Commands::Config { config } => commands::config::run(config.as_deref()),
        Commands::Cutoffs { config, h_min } => commands::cutoffs::run(config.as_deref(), h_min),
    }
}
