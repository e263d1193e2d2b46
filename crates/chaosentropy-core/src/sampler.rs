//! Sampler adapter: turns an ADC into timestamped, calibrated samples.
//!
//! Two traits split the boundary:
//! - [`AdcDevice`] is the raw device contract (`read(input) -> code`), the
//!   only thing a hardware driver has to provide.
//! - [`Sampler`] is what the rest of the pipeline consumes. [`AdcSampler`]
//!   implements it over any device, applying rail checks and calibration, so
//!   downstream stages never see uncalibrated device counts.
//!
//! [`SyntheticAdc`] and [`ReplayAdc`] stand in for hardware in tests and in
//! the CLI.

use std::collections::VecDeque;
use std::io::BufRead;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::{CHANNEL_COUNT, Channel};
use crate::config::SamplerConfig;
use crate::error::{AcquisitionError, Error};

/// Full-scale positive code of a 32-bit ADC (rail).
pub const CODE_RAIL_POSITIVE: u32 = 0x7FFF_FFFF;
/// Full-scale negative code of a 32-bit ADC (rail).
pub const CODE_RAIL_NEGATIVE: u32 = 0x8000_0000;

/// Nanoseconds since the Unix epoch.
pub fn timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Convert a 32-bit two's-complement ADS1263 code to volts.
///
/// Negative codes scale by 2^31, positive codes by 2^31 - 1, matching the
/// converter's asymmetric full scale.
pub fn code_to_voltage(code: u32, vref: f64) -> f64 {
    count_to_voltage(code as i32 as i64, vref)
}

/// Convert a signed (possibly calibrated) count to volts.
pub fn count_to_voltage(count: i64, vref: f64) -> f64 {
    if count < 0 {
        count as f64 * vref / 2_147_483_648.0
    } else {
        count as f64 * vref / 2_147_483_647.0
    }
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One calibrated ADC sample with channel provenance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ns: u64,
    pub channel: Channel,
    /// ADC count after offset/gain calibration.
    pub raw_code: i64,
    /// `raw_code` expressed in volts.
    pub calibrated_value: f64,
}

/// What a device returns for one conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawReading {
    pub code: u32,
    pub timestamp_ns: u64,
}

/// Device-level failure, before channel attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFault {
    Timeout,
    Unavailable(String),
    Exhausted,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Raw ADC driver contract.
pub trait AdcDevice: Send {
    /// Perform one conversion on `input`, giving up after `timeout`.
    fn read(&mut self, input: u8, timeout: Duration) -> Result<RawReading, DeviceFault>;

    /// Number of physical inputs.
    fn input_count(&self) -> usize;

    /// Maximum conversion rate in samples per second.
    fn max_rate_hz(&self) -> f64;
}

/// Capability interface the pipeline samples through.
pub trait Sampler: Send {
    /// One calibrated sample from `channel`, bounded by `timeout`.
    fn sample(&mut self, channel: Channel, timeout: Duration) -> Result<Sample, AcquisitionError>;

    fn channel_count(&self) -> usize;

    fn max_rate_hz(&self) -> f64;
}

// ---------------------------------------------------------------------------
// ADC adapter
// ---------------------------------------------------------------------------

/// [`Sampler`] over an [`AdcDevice`].
pub struct AdcSampler<D: AdcDevice> {
    device: D,
    config: SamplerConfig,
    inputs: [u8; CHANNEL_COUNT],
}

impl<D: AdcDevice> AdcSampler<D> {
    /// Wrap `device`. Fails if a channel is wired to an input the device lacks.
    pub fn new(device: D, config: &SamplerConfig) -> Result<Self, Error> {
        let mut inputs = [0u8; CHANNEL_COUNT];
        for ch in Channel::ALL {
            let input = config.channels.adc_input(ch);
            if input as usize >= device.input_count() {
                return Err(Error::Startup(format!(
                    "channel {ch} wired to ADC input {input}, device has {}",
                    device.input_count()
                )));
            }
            inputs[ch.index()] = input;
        }
        Ok(Self {
            device,
            config: config.clone(),
            inputs,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn is_rail(&self, code: u32) -> bool {
        self.config.reject_rail_codes && (code == CODE_RAIL_POSITIVE || code == CODE_RAIL_NEGATIVE)
    }
}

impl<D: AdcDevice> Sampler for AdcSampler<D> {
    fn sample(&mut self, channel: Channel, timeout: Duration) -> Result<Sample, AcquisitionError> {
        let input = self.inputs[channel.index()];
        let t0 = Instant::now();
        let reading = self.device.read(input, timeout).map_err(|fault| match fault {
            DeviceFault::Timeout => AcquisitionError::Timeout { channel, timeout },
            DeviceFault::Unavailable(message) => AcquisitionError::Device { channel, message },
            DeviceFault::Exhausted => AcquisitionError::Exhausted,
        })?;
        // A conversion that completed past the deadline is stale.
        if t0.elapsed() > timeout {
            return Err(AcquisitionError::Timeout { channel, timeout });
        }
        if self.is_rail(reading.code) {
            return Err(AcquisitionError::OutOfRange {
                channel,
                code: reading.code,
            });
        }

        let count = reading.code as i32 as i64;
        let raw_code = self.config.channels.get(channel).apply(count);
        Ok(Sample {
            timestamp_ns: reading.timestamp_ns,
            channel,
            raw_code,
            calibrated_value: count_to_voltage(raw_code, self.config.vref),
        })
    }

    fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }

    fn max_rate_hz(&self) -> f64 {
        self.device.max_rate_hz()
    }
}

// ---------------------------------------------------------------------------
// Synthetic device
// ---------------------------------------------------------------------------

/// Injected misbehaviour for one synthetic input.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFault {
    /// Always returns the same code (stuck oscillator).
    Stuck(u32),
    /// Forces the LSB to 1 with probability `p_one`.
    Biased(f64),
    /// Never converts; every read waits out its timeout.
    Timeout,
    /// Always returns the positive rail code.
    OutOfRange,
    /// Each conversion takes this long.
    Delay(Duration),
}

/// Deterministic stand-in for the ADC.
///
/// Each input has its own seeded generator, so the code sequence of an input
/// does not depend on how reads interleave across inputs.
pub struct SyntheticAdc {
    rngs: Vec<StdRng>,
    faults: Vec<Option<ChannelFault>>,
    limit: Option<u64>,
    reads: u64,
    max_rate_hz: f64,
}

impl SyntheticAdc {
    pub fn new(seed: u64) -> Self {
        let rngs = (0..CHANNEL_COUNT as u64)
            .map(|i| StdRng::seed_from_u64(seed ^ (0x9E37_79B9_7F4A_7C15u64.wrapping_mul(i + 1))))
            .collect();
        Self {
            rngs,
            faults: vec![None; CHANNEL_COUNT],
            limit: None,
            reads: 0,
            max_rate_hz: 38_400.0,
        }
    }

    /// Inject a fault on one input.
    pub fn with_fault(mut self, input: u8, fault: ChannelFault) -> Self {
        if let Some(slot) = self.faults.get_mut(input as usize) {
            *slot = Some(fault);
        }
        self
    }

    /// Report [`DeviceFault::Exhausted`] after `limit` reads in total.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// A code well inside the converter's range (|count| < 2^30).
    fn healthy_code(rng: &mut StdRng) -> u32 {
        rng.random_range(-(1i32 << 30)..(1i32 << 30)) as u32
    }
}

impl AdcDevice for SyntheticAdc {
    fn read(&mut self, input: u8, timeout: Duration) -> Result<RawReading, DeviceFault> {
        let idx = input as usize;
        if idx >= self.rngs.len() {
            return Err(DeviceFault::Unavailable(format!("no input {input}")));
        }
        if self.limit.is_some_and(|limit| self.reads >= limit) {
            return Err(DeviceFault::Exhausted);
        }
        self.reads += 1;

        let rng = &mut self.rngs[idx];
        let code = match &self.faults[idx] {
            None => Self::healthy_code(rng),
            Some(ChannelFault::Stuck(code)) => *code,
            Some(ChannelFault::Biased(p_one)) => {
                let code = Self::healthy_code(rng) & !1;
                if rng.random_bool(p_one.clamp(0.0, 1.0)) {
                    code | 1
                } else {
                    code
                }
            }
            Some(ChannelFault::Timeout) => {
                std::thread::sleep(timeout);
                return Err(DeviceFault::Timeout);
            }
            Some(ChannelFault::OutOfRange) => CODE_RAIL_POSITIVE,
            Some(ChannelFault::Delay(delay)) => {
                if *delay >= timeout {
                    std::thread::sleep(timeout);
                    return Err(DeviceFault::Timeout);
                }
                std::thread::sleep(*delay);
                Self::healthy_code(rng)
            }
        };
        Ok(RawReading {
            code,
            timestamp_ns: timestamp_ns(),
        })
    }

    fn input_count(&self) -> usize {
        self.rngs.len()
    }

    fn max_rate_hz(&self) -> f64 {
        self.max_rate_hz
    }
}

// ---------------------------------------------------------------------------
// Replay device
// ---------------------------------------------------------------------------

/// Replays a recorded capture of `input,code` lines.
///
/// Codes may be decimal or `0x`-prefixed hex. Blank lines and lines starting
/// with `#` are skipped. Each input is served in file order. An input with
/// no codes left reports [`DeviceFault::Unavailable`], a per-channel miss,
/// while others still have data; [`DeviceFault::Exhausted`] ends the replay
/// once every input is dry.
pub struct ReplayAdc {
    queues: Vec<VecDeque<u32>>,
}

impl ReplayAdc {
    pub fn from_reader(reader: impl BufRead) -> std::io::Result<Self> {
        let mut queues = vec![VecDeque::new(); CHANNEL_COUNT];
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed = line.split_once(',').and_then(|(input, code)| {
                let input: usize = input.trim().parse().ok()?;
                let code = parse_code(code.trim())?;
                Some((input, code))
            });
            match parsed {
                Some((input, code)) if input < CHANNEL_COUNT => queues[input].push_back(code),
                _ => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("line {}: expected `input,code`, got {line:?}", lineno + 1),
                    ));
                }
            }
        }
        Ok(Self { queues })
    }

    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Codes still queued across all inputs.
    pub fn remaining(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }
}

fn parse_code(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if s.starts_with('-') {
        s.parse::<i32>().ok().map(|v| v as u32)
    } else {
        s.parse::<u32>().ok()
    }
}

impl AdcDevice for ReplayAdc {
    fn read(&mut self, input: u8, _timeout: Duration) -> Result<RawReading, DeviceFault> {
        let queue = self
            .queues
            .get_mut(input as usize)
            .ok_or_else(|| DeviceFault::Unavailable(format!("no input {input}")))?;
        if let Some(code) = queue.pop_front() {
            return Ok(RawReading {
                code,
                timestamp_ns: timestamp_ns(),
            });
        }
        if self.remaining() == 0 {
            return Err(DeviceFault::Exhausted);
        }
        Err(DeviceFault::Unavailable(format!(
            "input {input}: capture has no codes left"
        )))
    }

    fn input_count(&self) -> usize {
        self.queues.len()
    }

    fn max_rate_hz(&self) -> f64 {
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelCalibration;

    const T: Duration = Duration::from_millis(20);

    fn sampler(device: SyntheticAdc) -> AdcSampler<SyntheticAdc> {
        AdcSampler::new(device, &SamplerConfig::default()).unwrap()
    }

    // -----------------------------------------------------------------------
    // Code conversion
    // -----------------------------------------------------------------------

    #[test]
    fn test_code_to_voltage_full_scale() {
        assert!((code_to_voltage(0x7FFF_FFFF, 5.0) - 5.0).abs() < 1e-9);
        assert!((code_to_voltage(0x8000_0000, 5.0) + 5.0).abs() < 1e-9);
        assert_eq!(code_to_voltage(0, 5.0), 0.0);
    }

    #[test]
    fn test_code_to_voltage_negative_half_scale() {
        // 0xC0000000 is -2^30 → -vref/2
        assert!((code_to_voltage(0xC000_0000, 5.0) + 2.5).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // Adapter
    // -----------------------------------------------------------------------

    #[test]
    fn test_sample_is_calibrated() {
        let mut config = SamplerConfig::default();
        config.channels.lorenz = ChannelCalibration {
            offset: 10,
            gain: 2.0,
            ..ChannelCalibration::default()
        };
        let device = SyntheticAdc::new(1).with_fault(1, ChannelFault::Stuck(110));
        let mut s = AdcSampler::new(device, &config).unwrap();
        let sample = s.sample(Channel::Lorenz, T).unwrap();
        assert_eq!(sample.channel, Channel::Lorenz);
        assert_eq!(sample.raw_code, 200);
        assert!((sample.calibrated_value - count_to_voltage(200, 5.0)).abs() < 1e-15);
    }

    #[test]
    fn test_rail_code_is_out_of_range() {
        let mut s = sampler(SyntheticAdc::new(1).with_fault(2, ChannelFault::OutOfRange));
        let err = s.sample(Channel::Rossler, T).unwrap_err();
        assert_eq!(
            err,
            AcquisitionError::OutOfRange {
                channel: Channel::Rossler,
                code: CODE_RAIL_POSITIVE
            }
        );
    }

    #[test]
    fn test_rail_check_can_be_disabled() {
        let config = SamplerConfig {
            reject_rail_codes: false,
            ..SamplerConfig::default()
        };
        let device = SyntheticAdc::new(1).with_fault(0, ChannelFault::OutOfRange);
        let mut s = AdcSampler::new(device, &config).unwrap();
        assert!(s.sample(Channel::Chua, T).is_ok());
    }

    #[test]
    fn test_timeout_fault_reports_channel() {
        let mut s = sampler(SyntheticAdc::new(1).with_fault(3, ChannelFault::Timeout));
        let err = s.sample(Channel::RcRelaxation, Duration::from_millis(2)).unwrap_err();
        assert_eq!(err.channel(), Some(Channel::RcRelaxation));
        assert!(matches!(err, AcquisitionError::Timeout { .. }));
    }

    #[test]
    fn test_slow_conversion_within_timeout_succeeds() {
        let device = SyntheticAdc::new(1).with_fault(0, ChannelFault::Delay(Duration::from_millis(1)));
        let mut s = sampler(device);
        assert!(s.sample(Channel::Chua, Duration::from_millis(200)).is_ok());
    }

    #[test]
    fn test_wiring_to_missing_input_fails_startup() {
        let mut config = SamplerConfig::default();
        config.channels.chua.adc_input = Some(9);
        assert!(AdcSampler::new(SyntheticAdc::new(1), &config).is_err());
    }

    // -----------------------------------------------------------------------
    // Synthetic device
    // -----------------------------------------------------------------------

    #[test]
    fn test_synthetic_is_reproducible() {
        let mut a = SyntheticAdc::new(42);
        let mut b = SyntheticAdc::new(42);
        for i in 0..64u8 {
            let input = i % 4;
            assert_eq!(a.read(input, T).unwrap().code, b.read(input, T).unwrap().code);
        }
    }

    #[test]
    fn test_synthetic_inputs_independent_of_interleaving() {
        let mut a = SyntheticAdc::new(7);
        let mut b = SyntheticAdc::new(7);
        let a_codes: Vec<u32> = (0..8).map(|_| a.read(0, T).unwrap().code).collect();
        let b_codes: Vec<u32> = (0..8)
            .map(|_| {
                b.read(1, T).unwrap();
                b.read(0, T).unwrap().code
            })
            .collect();
        assert_eq!(a_codes, b_codes);
    }

    #[test]
    fn test_synthetic_limit_exhausts() {
        let mut d = SyntheticAdc::new(1).with_limit(3);
        for _ in 0..3 {
            assert!(d.read(0, T).is_ok());
        }
        assert_eq!(d.read(0, T).unwrap_err(), DeviceFault::Exhausted);
        let mut s = sampler(SyntheticAdc::new(1).with_limit(0));
        assert_eq!(s.sample(Channel::Chua, T).unwrap_err(), AcquisitionError::Exhausted);
    }

    #[test]
    fn test_biased_fault_skews_lsb() {
        let mut d = SyntheticAdc::new(3).with_fault(0, ChannelFault::Biased(1.0));
        assert!((0..100).all(|_| d.read(0, T).unwrap().code & 1 == 1));
    }

    // -----------------------------------------------------------------------
    // Replay device
    // -----------------------------------------------------------------------

    #[test]
    fn test_replay_serves_per_input_in_order() {
        let capture = "# input,code\n0,5\n1,0x10\n0,-1\n\n2,7\n";
        let mut d = ReplayAdc::from_reader(capture.as_bytes()).unwrap();
        assert_eq!(d.remaining(), 4);
        assert_eq!(d.read(0, T).unwrap().code, 5);
        assert_eq!(d.read(0, T).unwrap().code, u32::MAX);
        assert_eq!(d.read(1, T).unwrap().code, 16);
        assert!(matches!(d.read(0, T), Err(DeviceFault::Unavailable(_))));
        assert!(matches!(d.read(3, T), Err(DeviceFault::Unavailable(_))));
        assert_eq!(d.read(2, T).unwrap().code, 7);
        assert_eq!(d.remaining(), 0);
        assert_eq!(d.read(0, T).unwrap_err(), DeviceFault::Exhausted);
        assert_eq!(d.read(2, T).unwrap_err(), DeviceFault::Exhausted);
    }

    #[test]
    fn test_replay_dry_input_is_a_channel_miss() {
        let capture = "0,1
1,2
1,3
1,4
";
        let device = ReplayAdc::from_reader(capture.as_bytes()).unwrap();
        let mut s = AdcSampler::new(device, &SamplerConfig::default()).unwrap();
        let chua = s.sample(Channel::Chua, T);
        assert!(chua.is_ok());
        let lorenz_input = SamplerConfig::default().channels.adc_input(Channel::Lorenz);
        assert_eq!(lorenz_input, 1);
        assert!(matches!(
            s.sample(Channel::Chua, T),
            Err(AcquisitionError::Device { channel: Channel::Chua, .. })
        ));
        for _ in 0..3 {
            assert!(s.sample(Channel::Lorenz, T).is_ok());
        }
        assert!(matches!(
            s.sample(Channel::Lorenz, T),
            Err(AcquisitionError::Exhausted)
        ));
    }

    #[test]
    fn test_replay_rejects_malformed_lines() {
        assert!(ReplayAdc::from_reader("0;5\n".as_bytes()).is_err());
        assert!(ReplayAdc::from_reader("9,5\n".as_bytes()).is_err());
        assert!(ReplayAdc::from_reader("0,zz\n".as_bytes()).is_err());
    }
}
