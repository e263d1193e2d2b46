//! Offline statistical checks on conditioned output.
//!
//! These are sanity checks over collected blocks, not a certification suite.
//! The online RCT/APT tests in `chaosentropy-core` are what gate the stream;
//! this battery answers "does the published output look uniform?" after the
//! fact.

use std::fmt;

use rustfft::{FftPlanner, num_complex::Complex};
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::erf::erfc;

/// Significance level used for pass/fail.
pub const ALPHA: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_p(p: Option<f64>) -> Self {
        match p {
            Some(p) if p >= 0.1 => Self::A,
            Some(p) if p >= 0.01 => Self::B,
            Some(p) if p >= 0.001 => Self::C,
            Some(p) if p >= 0.0001 => Self::D,
            _ => Self::F,
        }
    }

    fn points(self) -> f64 {
        match self {
            Self::A => 100.0,
            Self::B => 75.0,
            Self::C => 50.0,
            Self::D => 25.0,
            Self::F => 0.0,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    /// `None` when there was not enough data to run the check.
    pub p_value: Option<f64>,
    pub statistic: f64,
    pub details: String,
    pub grade: Grade,
}

impl CheckResult {
    fn from_p(name: &'static str, p: f64, statistic: f64, details: String) -> Self {
        Self {
            name,
            passed: p >= ALPHA,
            p_value: Some(p),
            statistic,
            details,
            grade: Grade::from_p(Some(p)),
        }
    }

    fn failed(name: &'static str, details: String) -> Self {
        Self {
            name,
            passed: false,
            p_value: None,
            statistic: 0.0,
            details,
            grade: Grade::F,
        }
    }

    fn too_short(name: &'static str, needed_bits: usize, got_bits: usize) -> Self {
        Self::failed(name, format!("need {needed_bits} bits, got {got_bits}"))
    }
}

/// Bits of `data`, MSB first, as ±1.
fn signed_bits(data: &[u8]) -> impl Iterator<Item = i64> + '_ {
    data.iter()
        .flat_map(|&byte| (0..8).rev().map(move |shift| ((byte >> shift) & 1) as i64 * 2 - 1))
}

fn bit_at(data: &[u8], i: usize) -> u8 {
    (data[i / 8] >> (7 - i % 8)) & 1
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Balance of ones and zeros over the whole input.
pub fn monobit(data: &[u8]) -> CheckResult {
    const NAME: &str = "monobit";
    let n = data.len() * 8;
    if n < 100 {
        return CheckResult::too_short(NAME, 100, n);
    }
    let sum: i64 = signed_bits(data).sum();
    let s_obs = sum.unsigned_abs() as f64 / (n as f64).sqrt();
    let p = erfc(s_obs / std::f64::consts::SQRT_2);
    CheckResult::from_p(NAME, p, s_obs, format!("sum={sum}, n={n}"))
}

/// Ones proportion within fixed 128-bit blocks.
pub fn block_frequency(data: &[u8]) -> CheckResult {
    const NAME: &str = "block_frequency";
    const M: usize = 128;
    let n = data.len() * 8;
    let blocks = n / M;
    if blocks < 10 {
        return CheckResult::too_short(NAME, M * 10, n);
    }
    let chi2: f64 = data
        .chunks_exact(M / 8)
        .take(blocks)
        .map(|chunk| {
            let ones: u32 = chunk.iter().map(|b| b.count_ones()).sum();
            let pi = ones as f64 / M as f64 - 0.5;
            4.0 * M as f64 * pi * pi
        })
        .sum();
    match ChiSquared::new(blocks as f64) {
        Ok(dist) => CheckResult::from_p(NAME, dist.sf(chi2), chi2, format!("blocks={blocks}")),
        Err(e) => CheckResult::failed(NAME, e.to_string()),
    }
}

/// Chi-squared of the byte histogram against uniform.
pub fn byte_distribution(data: &[u8]) -> CheckResult {
    const NAME: &str = "byte_distribution";
    if data.len() < 256 {
        return CheckResult::too_short(NAME, 256 * 8, data.len() * 8);
    }
    let mut histogram = [0u64; 256];
    for &b in data {
        histogram[b as usize] += 1;
    }
    let expected = data.len() as f64 / 256.0;
    let chi2: f64 = histogram
        .iter()
        .map(|&count| (count as f64 - expected).powi(2) / expected)
        .sum();
    match ChiSquared::new(255.0) {
        Ok(dist) => CheckResult::from_p(
            NAME,
            dist.sf(chi2),
            chi2,
            format!("bytes={}, expected/bin={expected:.1}", data.len()),
        ),
        Err(e) => CheckResult::failed(NAME, e.to_string()),
    }
}

/// Number of runs of identical bits.
pub fn runs(data: &[u8]) -> CheckResult {
    const NAME: &str = "runs";
    let n = data.len() * 8;
    if n < 100 {
        return CheckResult::too_short(NAME, 100, n);
    }
    let ones: u32 = data.iter().map(|b| b.count_ones()).sum();
    let pi = ones as f64 / n as f64;
    // The runs statistic is meaningless when monobit already fails badly.
    if (pi - 0.5).abs() >= 2.0 / (n as f64).sqrt() {
        return CheckResult {
            name: NAME,
            passed: false,
            p_value: Some(0.0),
            statistic: 0.0,
            details: format!("ones proportion {pi:.4} fails the pre-test"),
            grade: Grade::F,
        };
    }
    let transitions = (1..n).filter(|&i| bit_at(data, i) != bit_at(data, i - 1)).count();
    let observed = transitions as f64 + 1.0;
    let expected = 2.0 * n as f64 * pi * (1.0 - pi);
    let z = (observed - expected).abs() / (2.0 * (2.0 * n as f64).sqrt() * pi * (1.0 - pi));
    let p = erfc(z / std::f64::consts::SQRT_2);
    CheckResult::from_p(
        NAME,
        p,
        z,
        format!("runs={observed:.0}, expected={expected:.0}"),
    )
}

/// Count of DFT magnitudes below the 95 % threshold; detects periodicity.
pub fn spectral(data: &[u8]) -> CheckResult {
    const NAME: &str = "spectral";
    let n = data.len() * 8;
    if n < 1000 {
        return CheckResult::too_short(NAME, 1000, n);
    }
    let mut buffer: Vec<Complex<f64>> = signed_bits(data)
        .map(|x| Complex {
            re: x as f64,
            im: 0.0,
        })
        .collect();
    FftPlanner::new().plan_fft_forward(n).process(&mut buffer);

    let half = n / 2;
    let threshold = ((1.0f64 / 0.05).ln() * n as f64).sqrt();
    let below = buffer[..half].iter().filter(|c| c.norm() < threshold).count() as f64;
    let expected = 0.95 * half as f64;
    let d = (below - expected) / (n as f64 * 0.95 * 0.05 / 4.0).sqrt();
    let p = erfc(d.abs() / std::f64::consts::SQRT_2);
    CheckResult::from_p(NAME, p, d, format!("below={below:.0}/{half}"))
}

/// Maximum excursion of the ±1 random walk.
pub fn cumulative_sums(data: &[u8]) -> CheckResult {
    const NAME: &str = "cumulative_sums";
    let n = data.len() * 8;
    if n < 100 {
        return CheckResult::too_short(NAME, 100, n);
    }
    let z = signed_bits(data)
        .scan(0i64, |walk, x| {
            *walk += x;
            Some(walk.unsigned_abs())
        })
        .max()
        .unwrap_or(0) as f64;
    if z == 0.0 {
        return CheckResult::failed(NAME, "walk never left zero".into());
    }
    // Simplified tail bound: P(max|S_k| >= z) ~ 2 * erfc(z / sqrt(2n)).
    let p = (2.0 * erfc(z / (2.0 * n as f64).sqrt())).min(1.0);
    CheckResult::from_p(NAME, p, z, format!("max_excursion={z:.0}, n={n}"))
}

// ---------------------------------------------------------------------------
// Battery
// ---------------------------------------------------------------------------

/// Run every check over `data`.
pub fn run_all(data: &[u8]) -> Vec<CheckResult> {
    let checks: [fn(&[u8]) -> CheckResult; 6] = [
        monobit,
        block_frequency,
        byte_distribution,
        runs,
        spectral,
        cumulative_sums,
    ];
    checks.iter().map(|check| check(data)).collect()
}

/// Mean grade points (A=100 … F=0) across `results`.
pub fn quality_score(results: &[CheckResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(|r| r.grade.points()).sum::<f64>() / results.len() as f64
}
