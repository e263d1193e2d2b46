//! Numerical models of the four oscillator circuits.
//!
//! Produces voltage traces shaped like an ADC capture so the chaos score can
//! be exercised without hardware. `pot` is the tuning potentiometer position
//! in `[0, 1]`; it sweeps each model's bifurcation parameter from a periodic
//! or fixed-point regime (0) into the classic chaotic regime (1).

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Mid-rail the traces are centred on, in volts.
const MID_RAIL: f64 = 2.5;
/// Integrator steps discarded before the first sample.
const SETTLE_SAMPLES: usize = 2000;
/// RK4 substeps per output sample.
const SUBSTEPS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Oscillator {
    Chua,
    Lorenz,
    Rossler,
    /// Modelled as a driven double-well (Duffing) relaxation stage.
    RcRelaxation,
}

impl Oscillator {
    pub const ALL: [Oscillator; 4] = [Self::Chua, Self::Lorenz, Self::Rossler, Self::RcRelaxation];

    pub fn name(self) -> &'static str {
        match self {
            Self::Chua => "chua",
            Self::Lorenz => "lorenz",
            Self::Rossler => "rossler",
            Self::RcRelaxation => "rc_relaxation",
        }
    }

    /// Model time advanced per output sample.
    fn dt_per_sample(self) -> f64 {
        match self {
            Self::Chua => 0.02,
            Self::Lorenz => 0.005,
            Self::Rossler => 0.05,
            Self::RcRelaxation => 0.05,
        }
    }

    /// Volts per model unit of the observed state variable.
    fn volts_per_unit(self) -> f64 {
        match self {
            Self::Chua => 0.4,
            Self::Lorenz => 0.05,
            Self::Rossler => 0.1,
            Self::RcRelaxation => 0.5,
        }
    }

    fn initial_state(self) -> [f64; 3] {
        match self {
            Self::Chua => [0.7, 0.0, 0.0],
            Self::Lorenz => [1.0, 1.0, 1.0],
            Self::Rossler => [1.0, 1.0, 0.0],
            Self::RcRelaxation => [0.5, 0.0, 0.0],
        }
    }

    /// Time derivative of the state at bifurcation parameter `p`.
    ///
    /// The third state component of the relaxation model is the drive phase.
    fn derivative(self, p: f64, s: [f64; 3]) -> [f64; 3] {
        let [x, y, z] = s;
        match self {
            Self::Chua => {
                const BETA: f64 = 28.0;
                const M0: f64 = -1.143;
                const M1: f64 = -0.714;
                let diode = M1 * x + 0.5 * (M0 - M1) * ((x + 1.0).abs() - (x - 1.0).abs());
                [p * (y - x - diode), x - y + z, -BETA * y]
            }
            Self::Lorenz => {
                const SIGMA: f64 = 10.0;
                const BETA: f64 = 8.0 / 3.0;
                [SIGMA * (y - x), x * (p - z) - y, x * y - BETA * z]
            }
            Self::Rossler => {
                const A: f64 = 0.2;
                const B: f64 = 0.2;
                [-y - z, x + A * y, B + z * (x - p)]
            }
            Self::RcRelaxation => {
                const DAMPING: f64 = 0.3;
                const OMEGA: f64 = 1.2;
                [y, -DAMPING * y + x - x * x * x + p * z.cos(), OMEGA]
            }
        }
    }

    /// Map potentiometer position to the model's bifurcation parameter.
    pub fn parameter(self, pot: f64) -> f64 {
        let pot = pot.clamp(0.0, 1.0);
        match self {
            // alpha: 6 (stable) .. 15.6 (double scroll)
            Self::Chua => 6.0 + pot * 9.6,
            // rho: 10 (fixed point) .. 28
            Self::Lorenz => 10.0 + pot * 18.0,
            // c: 2 (period-1) .. 5.7
            Self::Rossler => 2.0 + pot * 3.7,
            // drive amplitude: 0.2 .. 0.5
            Self::RcRelaxation => 0.2 + pot * 0.3,
        }
    }
}

impl fmt::Display for Oscillator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Oscillator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chua" => Ok(Self::Chua),
            "lorenz" => Ok(Self::Lorenz),
            "rossler" | "rössler" => Ok(Self::Rossler),
            "rc" | "rc_relaxation" | "rc-relaxation" => Ok(Self::RcRelaxation),
            other => Err(format!("unknown oscillator: {other}")),
        }
    }
}

fn rk4_step(osc: Oscillator, p: f64, s: [f64; 3], h: f64) -> [f64; 3] {
    let add = |a: [f64; 3], b: [f64; 3], k: f64| [a[0] + k * b[0], a[1] + k * b[1], a[2] + k * b[2]];
    let k1 = osc.derivative(p, s);
    let k2 = osc.derivative(p, add(s, k1, h / 2.0));
    let k3 = osc.derivative(p, add(s, k2, h / 2.0));
    let k4 = osc.derivative(p, add(s, k3, h));
    [
        s[0] + h / 6.0 * (k1[0] + 2.0 * k2[0] + 2.0 * k3[0] + k4[0]),
        s[1] + h / 6.0 * (k1[1] + 2.0 * k2[1] + 2.0 * k3[1] + k4[1]),
        s[2] + h / 6.0 * (k1[2] + 2.0 * k2[2] + 2.0 * k3[2] + k4[2]),
    ]
}

/// Simulate `samples` voltage readings of `osc` at potentiometer position `pot`.
///
/// Output is clamped to the 0–5 V input range.
pub fn simulate(osc: Oscillator, pot: f64, samples: usize) -> Vec<f64> {
    let p = osc.parameter(pot);
    let h = osc.dt_per_sample() / SUBSTEPS as f64;
    let scale = osc.volts_per_unit();
    let mut state = osc.initial_state();

    let mut out = Vec::with_capacity(samples);
    for i in 0..SETTLE_SAMPLES + samples {
        for _ in 0..SUBSTEPS {
            state = rk4_step(osc, p, state, h);
        }
        if i >= SETTLE_SAMPLES {
            out.push((MID_RAIL + scale * state[0]).clamp(0.0, 5.0));
        }
    }
    out
}
