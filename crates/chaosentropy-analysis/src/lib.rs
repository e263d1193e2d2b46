//! Offline analysis for chaosentropy.
//!
//! - [`chaos`]: scores a captured oscillator voltage trace for how chaotic it
//!   is, and suggests which way to turn the tuning potentiometer.
//! - [`trace`]: numerical models of the four circuits, for scoring without
//!   hardware.
//! - [`battery`]: statistical checks over conditioned output blocks.

pub mod battery;
pub mod chaos;
pub mod trace;

pub use battery::{CheckResult, Grade, quality_score, run_all};
pub use chaos::{AnalysisError, ChaosReport, ScoreBreakdown, Verdict, analyze};
pub use trace::{Oscillator, simulate};
