//! The four chaotic oscillator channels and their calibration metadata.
//!
//! Channels are a closed set. Adding a fifth circuit means adding a variant
//! here, not registering something at runtime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of oscillator channels on the board.
pub const CHANNEL_COUNT: usize = 4;

/// One physical chaotic oscillator feeding an ADC input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Chua's circuit (piecewise-linear negative resistance).
    Chua,
    /// Analog Lorenz attractor (op-amp integrators + multipliers).
    Lorenz,
    /// Analog Rössler attractor.
    Rossler,
    /// Coupled RC relaxation oscillator driven into chaos.
    RcRelaxation,
}

impl Channel {
    /// Rotation order used by the selector for equal weights.
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Chua,
        Channel::Lorenz,
        Channel::Rossler,
        Channel::RcRelaxation,
    ];

    /// Stable index 0..=3.
    pub fn index(self) -> usize {
        match self {
            Self::Chua => 0,
            Self::Lorenz => 1,
            Self::Rossler => 2,
            Self::RcRelaxation => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Chua => "chua",
            Self::Lorenz => "lorenz",
            Self::Rossler => "rossler",
            Self::RcRelaxation => "rc_relaxation",
        }
    }

    /// Short physics note shown by the CLI and diagnostics index.
    pub fn physics(self) -> &'static str {
        match self {
            Self::Chua => {
                "Double-scroll attractor from a piecewise-linear Chua diode; \
                 sensitive dependence amplifies resistor thermal noise."
            }
            Self::Lorenz => {
                "Three coupled integrators solving the Lorenz equations; \
                 lobe switching is driven by amplified component noise."
            }
            Self::Rossler => {
                "Single-scroll Rössler spiral; folding of the attractor mixes \
                 op-amp input noise into the trajectory."
            }
            Self::RcRelaxation => {
                "RC relaxation oscillator with nonlinear coupling; threshold \
                 crossings jitter chaotically once the potentiometer is tuned."
            }
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = String;

    /// Accepts a name (`lorenz`, `rc`, `rossler`/`rössler`) or an index `0..=3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if let Ok(idx) = s.parse::<usize>() {
            return Self::from_index(idx).ok_or_else(|| format!("channel index {idx} out of range"));
        }
        match s.as_str() {
            "chua" => Ok(Self::Chua),
            "lorenz" => Ok(Self::Lorenz),
            "rossler" | "rössler" => Ok(Self::Rossler),
            "rc" | "rc_relaxation" | "rc-relaxation" => Ok(Self::RcRelaxation),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Per-channel calibration applied by the sampler before a sample leaves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelCalibration {
    /// Physical ADC input the oscillator is wired to. Defaults to the channel index.
    pub adc_input: Option<u8>,
    /// Offset subtracted from the signed device count.
    pub offset: i64,
    /// Multiplicative gain applied after the offset.
    pub gain: f64,
    /// Expected signal bandwidth, informational (diagnostics, pacing checks).
    pub expected_bandwidth_hz: f64,
}

impl Default for ChannelCalibration {
    fn default() -> Self {
        Self {
            adc_input: None,
            offset: 0,
            gain: 1.0,
            expected_bandwidth_hz: 2_000.0,
        }
    }
}

impl ChannelCalibration {
    /// Apply offset and gain to a signed device count. Saturates at the
    /// `i64` range.
    pub fn apply(&self, count: i64) -> i64 {
        (count.saturating_sub(self.offset) as f64 * self.gain).round() as i64
    }
}
