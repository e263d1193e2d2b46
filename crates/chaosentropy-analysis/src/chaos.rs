//! Chaos quality score for a captured oscillator trace.
//!
//! Used when tuning a circuit's potentiometer into its chaotic regime. Four
//! metrics are scored and summed to 0–100:
//!
//! | metric               | points | optimum                                  |
//! |----------------------|--------|------------------------------------------|
//! | spectral complexity  | 30     | 500–2000 spectral peaks above 10 % of max |
//! | power distribution   | 25     | top-3 bins hold 0.1 %–10 % of the power  |
//! | aperiodicity         | 25     | no autocorrelation peaks > 0.3 past lag 10 |
//! | dynamic range        | 20     | standard deviation 0.15–0.20 V           |

use std::fmt;

use rustfft::{FftPlanner, num_complex::Complex};
use serde::Serialize;

/// Minimum trace length accepted by [`analyze`].
pub const MIN_SAMPLES: usize = 1000;

/// Peak-to-peak amplitude below which the oscillator is considered stalled.
pub const WEAK_SIGNAL_P2P_VOLTS: f64 = 0.3;

const MAX_AUTOCORR_LAG: usize = 2000;
const SECONDARY_PEAK_MIN_LAG: usize = 10;
const SECONDARY_PEAK_HEIGHT: f64 = 0.3;
const SPECTRAL_PEAK_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error("trace too short: need {needed} samples, got {got}")]
    TooShort { needed: usize, got: usize },

    #[error("sample rate must be positive and finite, got {0}")]
    BadSampleRate(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Perfect,
    Strong,
    Weak,
    Periodic,
    None,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Perfect => write!(f, "perfect chaos"),
            Self::Strong => write!(f, "strong chaos"),
            Self::Weak => write!(f, "weak chaos / transition region"),
            Self::Periodic => write!(f, "periodic / bifurcation edge"),
            Self::None => write!(f, "no chaos"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub spectral: f64,
    pub power: f64,
    pub aperiodicity: f64,
    pub dynamic: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.spectral + self.power + self.aperiodicity + self.dynamic
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SignalStats {
    pub mean: f64,
    pub std: f64,
    pub peak_to_peak: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SpectrumStats {
    pub dominant_hz: f64,
    pub peaks: usize,
    /// Fraction of spectral magnitude in the three largest bins.
    pub top3_concentration: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AutocorrStats {
    /// First lag where the normalized autocorrelation drops below 0.5.
    pub decay_lag: usize,
    pub decay_ms: f64,
    pub secondary_peaks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChaosReport {
    pub samples: usize,
    pub sample_rate_hz: f64,
    pub signal: SignalStats,
    /// `None` when the signal was too weak to analyze further.
    pub spectrum: Option<SpectrumStats>,
    pub autocorr: Option<AutocorrStats>,
    pub scores: ScoreBreakdown,
    pub total: f64,
    pub verdict: Verdict,
    /// Tuning suggestion for the potentiometer.
    pub hint: &'static str,
}

impl ChaosReport {
    pub fn is_weak_signal(&self) -> bool {
        self.spectrum.is_none()
    }
}

/// Score a voltage trace sampled at `sample_rate_hz`.
pub fn analyze(volts: &[f64], sample_rate_hz: f64) -> Result<ChaosReport, AnalysisError> {
    if volts.len() < MIN_SAMPLES {
        return Err(AnalysisError::TooShort {
            needed: MIN_SAMPLES,
            got: volts.len(),
        });
    }
    if !(sample_rate_hz > 0.0 && sample_rate_hz.is_finite()) {
        return Err(AnalysisError::BadSampleRate(sample_rate_hz));
    }

    let signal = signal_stats(volts);
    if signal.peak_to_peak < WEAK_SIGNAL_P2P_VOLTS {
        return Ok(ChaosReport {
            samples: volts.len(),
            sample_rate_hz,
            signal,
            spectrum: None,
            autocorr: None,
            scores: ScoreBreakdown::default(),
            total: 0.0,
            verdict: Verdict::None,
            hint: "signal too weak: turn the potentiometer to center",
        });
    }

    let centered: Vec<f64> = volts.iter().map(|v| v - signal.mean).collect();
    let spectrum = spectrum_stats(&centered, sample_rate_hz);
    let autocorr = autocorr_stats(&centered, sample_rate_hz);

    let scores = ScoreBreakdown {
        spectral: score_spectral(spectrum.peaks),
        power: score_power(spectrum.top3_concentration),
        aperiodicity: score_aperiodicity(autocorr.secondary_peaks),
        dynamic: score_dynamic(signal.std),
    };
    let total = scores.total();
    let (verdict, hint) = assess(total, &scores, &spectrum, &autocorr);

    Ok(ChaosReport {
        samples: volts.len(),
        sample_rate_hz,
        signal,
        spectrum: Some(spectrum),
        autocorr: Some(autocorr),
        scores,
        total,
        verdict,
        hint,
    })
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

fn signal_stats(volts: &[f64]) -> SignalStats {
    let n = volts.len() as f64;
    let mean = volts.iter().sum::<f64>() / n;
    let var = volts.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let (lo, hi) = volts
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    SignalStats {
        mean,
        std: var.sqrt(),
        peak_to_peak: hi - lo,
    }
}

fn spectrum_stats(centered: &[f64], sample_rate_hz: f64) -> SpectrumStats {
    let n = centered.len();
    let mut buffer: Vec<Complex<f64>> = centered.iter().map(|&v| Complex { re: v, im: 0.0 }).collect();
    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(n).process(&mut buffer);

    let half = n / 2;
    let magnitude: Vec<f64> = buffer[..half]
        .iter()
        .map(|c| 2.0 / n as f64 * c.norm())
        .collect();

    let (dominant_idx, max) = magnitude
        .iter()
        .enumerate()
        .fold((0, 0.0), |best, (i, &m)| if m > best.1 { (i, m) } else { best });
    let peaks = find_peaks(&magnitude, max * SPECTRAL_PEAK_FRACTION);

    let total: f64 = magnitude.iter().sum();
    let mut sorted = magnitude.clone();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let top3: f64 = sorted.iter().take(3).sum();

    SpectrumStats {
        dominant_hz: dominant_idx as f64 * sample_rate_hz / n as f64,
        peaks: peaks.len(),
        top3_concentration: if total > 0.0 { top3 / total } else { 1.0 },
    }
}

fn autocorr_stats(centered: &[f64], sample_rate_hz: f64) -> AutocorrStats {
    let max_lag = MAX_AUTOCORR_LAG.min(centered.len() / 4);
    let acf = autocorrelation(centered, max_lag);
    let decay_lag = acf.iter().position(|&r| r < 0.5).unwrap_or(max_lag);
    let secondary_peaks = if acf.len() > SECONDARY_PEAK_MIN_LAG {
        find_peaks(&acf[SECONDARY_PEAK_MIN_LAG..], SECONDARY_PEAK_HEIGHT).len()
    } else {
        0
    };
    AutocorrStats {
        decay_lag,
        decay_ms: decay_lag as f64 / sample_rate_hz * 1000.0,
        secondary_peaks,
    }
}

/// Normalized autocorrelation for lags `0..max_lag`, via zero-padded FFT.
pub fn autocorrelation(centered: &[f64], max_lag: usize) -> Vec<f64> {
    let n = centered.len();
    if n == 0 || max_lag == 0 {
        return Vec::new();
    }
    let size = (2 * n).next_power_of_two();
    let mut buffer: Vec<Complex<f64>> = centered
        .iter()
        .map(|&v| Complex { re: v, im: 0.0 })
        .chain(std::iter::repeat(Complex { re: 0.0, im: 0.0 }))
        .take(size)
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(size).process(&mut buffer);
    for c in buffer.iter_mut() {
        *c = Complex {
            re: c.norm_sqr(),
            im: 0.0,
        };
    }
    planner.plan_fft_inverse(size).process(&mut buffer);

    let r0 = buffer[0].re;
    if r0 <= 0.0 {
        return vec![1.0; max_lag.min(n)];
    }
    buffer[..max_lag.min(n)].iter().map(|c| c.re / r0).collect()
}

/// Indices of local maxima with height >= `min_height`.
///
/// Flat-topped peaks count once, at their middle sample. Endpoints never
/// qualify.
pub fn find_peaks(x: &[f64], min_height: f64) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }
    let last = x.len() - 1;
    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut j = i + 1;
            while j < last && x[j] == x[i] {
                j += 1;
            }
            if x[j] < x[i] {
                if x[i] >= min_height {
                    peaks.push((i + j - 1) / 2);
                }
                i = j;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

fn score_spectral(peaks: usize) -> f64 {
    let p = peaks as f64;
    if peaks < 100 {
        p / 100.0 * 15.0
    } else if peaks < 500 {
        15.0 + (p - 100.0) / 400.0 * 10.0
    } else if peaks <= 2000 {
        30.0
    } else {
        (30.0 - (p - 2000.0) / 500.0 * 5.0).max(20.0)
    }
}

fn score_power(top3: f64) -> f64 {
    if top3 > 0.7 {
        0.0
    } else if top3 > 0.1 {
        5.0
    } else if top3 >= 0.001 {
        25.0
    } else {
        // Flat spectrum: white noise rather than chaos.
        15.0
    }
}

fn score_aperiodicity(secondary_peaks: usize) -> f64 {
    match secondary_peaks {
        0 => 25.0,
        1..=3 => 20.0,
        4..=7 => 10.0,
        _ => 0.0,
    }
}

fn score_dynamic(std: f64) -> f64 {
    if std < 0.05 {
        std / 0.05 * 5.0
    } else if std < 0.15 {
        5.0 + (std - 0.05) / 0.10 * 10.0
    } else if std <= 0.20 {
        20.0
    } else if std <= 0.25 {
        15.0
    } else {
        10.0
    }
}

fn assess(
    total: f64,
    scores: &ScoreBreakdown,
    spectrum: &SpectrumStats,
    autocorr: &AutocorrStats,
) -> (Verdict, &'static str) {
    if total >= 85.0 {
        (Verdict::Perfect, "sweet spot found: remember this position")
    } else if total >= 70.0 {
        let hint = if scores.aperiodicity < 20.0 {
            "turn slightly toward center to reduce periodicity"
        } else if scores.spectral < 25.0 {
            "turn slightly right to increase complexity"
        } else {
            "nearly perfect"
        };
        (Verdict::Strong, hint)
    } else if total >= 50.0 {
        let hint = if autocorr.secondary_peaks > 5 {
            "turn toward center to reduce periodicity"
        } else {
            "keep adjusting for a higher score"
        };
        (Verdict::Weak, hint)
    } else if total >= 20.0 {
        let hint = if spectrum.dominant_hz < 1000.0 {
            "turn left to increase frequency"
        } else {
            "turn right"
        };
        (Verdict::Periodic, hint)
    } else {
        (Verdict::None, "turn to center position (~50%)")
    }
}
