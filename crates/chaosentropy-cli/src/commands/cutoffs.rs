//! `chaosentropy cutoffs`: derived health-test parameters.

use chaosentropy_core::PipelineConfig;

pub fn run(path: Option<&str>, h_min: Option<f64>) {
    let mut config = super::load_config(path);
    if let Some(h) = h_min {
        config.entropy.h_min = h;
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    print_cutoffs(&config);
}

fn print_cutoffs(config: &PipelineConfig) {
    let h = config.entropy.h_min;
    let f = config.health.cutoff_factor;
    println!("H_min {h} bits per raw bit, false-alarm rate 2^-{f}");
    println!();
    println!(
        "  Repetition count cutoff    {:>6}{}",
        config.rct_cutoff(),
        if config.health.rct_cutoff.is_some() { "  (override)" } else { "" }
    );
    println!(
        "  Adaptive proportion cutoff {:>6} of {}{}",
        config.apt_cutoff(),
        config.health.apt_window,
        if config.health.apt_cutoff.is_some() { "  (override)" } else { "" }
    );
    println!(
        "  Conditioner input N_in     {:>6} raw bits per {}-byte block (+{} margin)",
        config.conditioner_input_bits(),
        config.conditioner.output_block_bytes,
        config.conditioner.security_margin_bits
    );
}
