//! Pipeline configuration.
//!
//! Loaded from TOML by the binary and handed to the core as a plain struct.
//! Every field has a default, so a config file only needs the values that
//! differ from the bench-characterized defaults below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ChannelCalibration};
use crate::conditioning::input_bits_required;
use crate::error::ConfigError;
use crate::health::{GlobalHaltPolicy, apt_cutoff, rct_cutoff};
use crate::publisher::RetryPolicy;

/// Full configuration surface of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sampler: SamplerConfig,
    pub selector: SelectorConfig,
    pub extractor: ExtractorConfig,
    pub entropy: EntropyConfig,
    pub health: HealthConfig,
    pub conditioner: ConditionerConfig,
    pub pool: PoolConfig,
    pub publisher: PublisherConfig,
    pub shutdown: ShutdownConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Rotation slots per second across all channels. 0 = free-running.
    pub sample_rate_hz: f64,
    /// Per-sample acquisition timeout.
    pub timeout_ms: u64,
    /// ADC reference voltage.
    pub vref: f64,
    /// Treat the two rail codes (full-scale positive/negative) as out of range.
    pub reject_rail_codes: bool,
    pub channels: ChannelCalibrations,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 0.0,
            timeout_ms: 50,
            vref: 5.0,
            reject_rail_codes: true,
            channels: ChannelCalibrations::default(),
        }
    }
}

impl SamplerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelCalibrations {
    pub chua: ChannelCalibration,
    pub lorenz: ChannelCalibration,
    pub rossler: ChannelCalibration,
    pub rc_relaxation: ChannelCalibration,
}

impl ChannelCalibrations {
    pub fn get(&self, channel: Channel) -> &ChannelCalibration {
        match channel {
            Channel::Chua => &self.chua,
            Channel::Lorenz => &self.lorenz,
            Channel::Rossler => &self.rossler,
            Channel::RcRelaxation => &self.rc_relaxation,
        }
    }

    /// ADC input wired to `channel`; defaults to the channel index.
    pub fn adc_input(&self, channel: Channel) -> u8 {
        self.get(channel)
            .adc_input
            .unwrap_or(channel.index() as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub weights: ChannelWeights,
    /// Consecutive misses after which a channel is reported as failed.
    pub max_consecutive_misses: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weights: ChannelWeights::default(),
            max_consecutive_misses: 16,
        }
    }
}

/// Rotation weights. 0 removes the channel from the rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelWeights {
    pub chua: u32,
    pub lorenz: u32,
    pub rossler: u32,
    pub rc_relaxation: u32,
}

impl Default for ChannelWeights {
    fn default() -> Self {
        Self {
            chua: 1,
            lorenz: 1,
            rossler: 1,
            rc_relaxation: 1,
        }
    }
}

impl ChannelWeights {
    pub fn get(&self, channel: Channel) -> u32 {
        match channel {
            Channel::Chua => self.chua,
            Channel::Lorenz => self.lorenz,
            Channel::Rossler => self.rossler,
            Channel::RcRelaxation => self.rc_relaxation,
        }
    }

    /// Channels with a non-zero weight, in rotation order.
    pub fn enabled(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|&ch| self.get(ch) > 0)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Low bits of the calibrated code XOR-ed into each per-sample bit.
    pub lsb_count: u8,
    /// Per-sample bits of one channel XOR-folded into one raw bit.
    pub decimation: u32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            lsb_count: 1,
            decimation: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyConfig {
    /// Conservative min-entropy per raw bit, in (0, 1].
    pub h_min: f64,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self { h_min: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// -log2 of the per-test false-alarm probability (30 → 2^-30).
    pub cutoff_factor: f64,
    /// Adaptive Proportion Test window, in symbols.
    pub apt_window: u32,
    /// Explicit RCT cutoff; derived from `h_min` when unset.
    pub rct_cutoff: Option<u32>,
    /// Explicit APT cutoff; derived from `h_min` when unset.
    pub apt_cutoff: Option<u32>,
    pub global_halt_policy: GlobalHaltPolicy,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cutoff_factor: 30.0,
            apt_window: 1024,
            rct_cutoff: None,
            apt_cutoff: None,
            global_halt_policy: GlobalHaltPolicy::Majority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionerConfig {
    pub output_block_bytes: usize,
    pub security_margin_bits: u32,
    /// Capacity of the extractor → conditioner raw-bit queue.
    pub raw_queue_capacity: usize,
    /// Starvation longer than this is logged as a possible upstream failure.
    pub starvation_warn_ms: u64,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            output_block_bytes: 32,
            security_margin_bits: 64,
            raw_queue_capacity: 8192,
            starvation_warn_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Capacity K in blocks.
    pub capacity: usize,
    /// How long one push waits on a full pool before the caller re-checks shutdown.
    pub push_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            push_timeout_ms: 250,
        }
    }
}

impl PoolConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub device_id: String,
    pub topic_namespace: String,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub retry_buffer_capacity: usize,
    /// Poll interval on an empty pool.
    pub take_timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            device_id: "chaos-0".to_string(),
            topic_namespace: "chaosentropy".to_string(),
            max_attempts: 5,
            backoff_base_ms: 50,
            backoff_cap_ms: 2_000,
            retry_buffer_capacity: 256,
            take_timeout_ms: 100,
        }
    }
}

impl PublisherConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }

    pub fn take_timeout(&self) -> Duration {
        Duration::from_millis(self.take_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5_000,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Loading, derived values, validation
// ---------------------------------------------------------------------------

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Repetition Count Test cutoff in effect.
    pub fn rct_cutoff(&self) -> u32 {
        self.health
            .rct_cutoff
            .unwrap_or_else(|| rct_cutoff(self.entropy.h_min, self.health.cutoff_factor))
    }

    /// Adaptive Proportion Test cutoff in effect.
    pub fn apt_cutoff(&self) -> u32 {
        self.health.apt_cutoff.unwrap_or_else(|| {
            apt_cutoff(
                self.health.apt_window,
                self.entropy.h_min,
                self.health.cutoff_factor,
            )
        })
    }

    /// Raw bits the conditioner consumes per output block (N_in).
    pub fn conditioner_input_bits(&self) -> usize {
        input_bits_required(
            self.conditioner.output_block_bytes * 8,
            self.conditioner.security_margin_bits,
            self.entropy.h_min,
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let h = self.entropy.h_min;
        if !(h > 0.0 && h <= 1.0) {
            return invalid(format!("entropy.h_min must be in (0, 1], got {h}"));
        }
        if !(self.sampler.sample_rate_hz >= 0.0 && self.sampler.sample_rate_hz.is_finite()) {
            return invalid("sampler.sample_rate_hz must be finite and >= 0".into());
        }
        if self.sampler.timeout_ms == 0 {
            return invalid("sampler.timeout_ms must be > 0".into());
        }
        if !(self.sampler.vref > 0.0) {
            return invalid("sampler.vref must be > 0".into());
        }
        for ch in Channel::ALL {
            let cal = self.sampler.channels.get(ch);
            if !(cal.gain.is_finite() && cal.gain != 0.0) {
                return invalid(format!("sampler.channels.{ch}.gain must be finite and non-zero"));
            }
            if cal.offset.unsigned_abs() > u64::from(u32::MAX) {
                return invalid(format!(
                    "sampler.channels.{ch}.offset must be within the 32-bit code range"
                ));
            }
        }
        if self.selector.weights.enabled().is_empty() {
            return invalid("selector.weights: at least one channel must be enabled".into());
        }
        if self.selector.max_consecutive_misses == 0 {
            return invalid("selector.max_consecutive_misses must be > 0".into());
        }
        if !(1..=32).contains(&self.extractor.lsb_count) {
            return invalid("extractor.lsb_count must be in 1..=32".into());
        }
        if self.extractor.decimation == 0 {
            return invalid("extractor.decimation must be > 0".into());
        }
        if !(self.health.cutoff_factor > 0.0 && self.health.cutoff_factor.is_finite()) {
            return invalid("health.cutoff_factor must be finite and > 0".into());
        }
        if self.health.apt_window < 2 {
            return invalid("health.apt_window must be >= 2".into());
        }
        if self.health.rct_cutoff.is_some_and(|c| c < 2) {
            return invalid("health.rct_cutoff must be >= 2".into());
        }
        if self
            .health
            .apt_cutoff
            .is_some_and(|c| c == 0 || c >= self.health.apt_window)
        {
            return invalid("health.apt_cutoff must be in 1..apt_window".into());
        }
        if self.conditioner.output_block_bytes == 0 || self.conditioner.output_block_bytes > 4096 {
            return invalid("conditioner.output_block_bytes must be in 1..=4096".into());
        }
        if self.conditioner.raw_queue_capacity == 0 {
            return invalid("conditioner.raw_queue_capacity must be > 0".into());
        }
        if self.pool.capacity == 0 {
            return invalid("pool.capacity must be > 0".into());
        }
        if self.publisher.max_attempts == 0 {
            return invalid("publisher.max_attempts must be > 0".into());
        }
        if self.publisher.backoff_base_ms > self.publisher.backoff_cap_ms {
            return invalid("publisher.backoff_base_ms must not exceed backoff_cap_ms".into());
        }
        if self.publisher.retry_buffer_capacity == 0 {
            return invalid("publisher.retry_buffer_capacity must be > 0".into());
        }
        if self.publisher.device_id.is_empty() || self.publisher.device_id.contains('/') {
            return invalid("publisher.device_id must be non-empty and contain no '/'".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_derived_values() {
        let config = PipelineConfig::default();
        // 1 + ceil(30 / 0.5)
        assert_eq!(config.rct_cutoff(), 61);
        // (256 + 64) / 0.5
        assert_eq!(config.conditioner_input_bits(), 640);
        let apt = config.apt_cutoff();
        assert!(apt > 724 && apt < 1024, "apt cutoff {apt}");
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = PipelineConfig::default();
        config.health.rct_cutoff = Some(5);
        config.health.apt_cutoff = Some(600);
        assert_eq!(config.rct_cutoff(), 5);
        assert_eq!(config.apt_cutoff(), 600);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let text = r#"
            [entropy]
            h_min = 0.8

            [selector.weights]
            rossler = 0

            [sampler.channels.lorenz]
            gain = 2.0
        "#;
        let config = PipelineConfig::from_toml_str(text).unwrap();
        assert!((config.entropy.h_min - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.selector.weights.chua, 1);
        assert_eq!(
            config.selector.weights.enabled(),
            vec![Channel::Chua, Channel::Lorenz, Channel::RcRelaxation]
        );
        assert_eq!(config.sampler.channels.adc_input(Channel::Lorenz), 1);
        assert!((config.sampler.channels.lorenz.gain - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.pool.capacity, 64);
    }

    #[test]
    fn test_global_policy_parses() {
        let config =
            PipelineConfig::from_toml_str("[health]\nglobal_halt_policy = \"all\"\n").unwrap();
        assert_eq!(config.health.global_halt_policy, GlobalHaltPolicy::All);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases: Vec<Box<dyn Fn(&mut PipelineConfig)>> = vec![
            Box::new(|c| c.entropy.h_min = 0.0),
            Box::new(|c| c.entropy.h_min = 1.5),
            Box::new(|c| c.extractor.decimation = 0),
            Box::new(|c| c.extractor.lsb_count = 0),
            Box::new(|c| c.pool.capacity = 0),
            Box::new(|c| c.publisher.max_attempts = 0),
            Box::new(|c| c.publisher.backoff_base_ms = 10_000),
            Box::new(|c| c.publisher.device_id = "a/b".into()),
            Box::new(|c| c.health.apt_cutoff = Some(1024)),
            Box::new(|c| c.sampler.channels.lorenz.offset = i64::MIN),
            Box::new(|c| c.sampler.channels.chua.offset = 1 << 40),
            Box::new(|c| {
                c.selector.weights = ChannelWeights {
                    chua: 0,
                    lorenz: 0,
                    rossler: 0,
                    rc_relaxation: 0,
                }
            }),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut config = PipelineConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "case {i} should be rejected"
            );
        }
    }

    #[test]
    fn test_toml_round_trip_and_load() {
        let config = PipelineConfig::default();
        let text = config.to_toml().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        let loaded = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
