//! Error taxonomy for the entropy pipeline.
//!
//! Channel-scoped failures ([`AcquisitionError`], [`HealthTestFailure`]) are
//! handled locally by the stage that observes them. [`PublishError`] is
//! transient and retried. Only [`ConfigError`] and device initialization
//! failures are allowed to stop the process.

use std::time::Duration;

use crate::channel::Channel;

/// Failure to obtain a sample from the ADC for one channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AcquisitionError {
    #[error("{channel}: no sample within {timeout:?}")]
    Timeout { channel: Channel, timeout: Duration },

    #[error("{channel}: ADC code {code:#010x} out of range")]
    OutOfRange { channel: Channel, code: u32 },

    #[error("{channel}: device error: {message}")]
    Device { channel: Channel, message: String },

    /// A finite source (replay capture, bounded synthetic run) has no more data.
    #[error("sample source exhausted")]
    Exhausted,
}

impl AcquisitionError {
    /// Channel the failure belongs to, if any.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            Self::Timeout { channel, .. }
            | Self::OutOfRange { channel, .. }
            | Self::Device { channel, .. } => Some(*channel),
            Self::Exhausted => None,
        }
    }
}

/// A continuous health test tripped for a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealthTestFailure {
    #[error("{channel}: symbol repeated {run} times (cutoff {cutoff})")]
    RepetitionCount { channel: Channel, run: u32, cutoff: u32 },

    #[error("{channel}: window-initial symbol seen {count} times in {window} (cutoff {cutoff})")]
    AdaptiveProportion {
        channel: Channel,
        count: u32,
        cutoff: u32,
        window: u32,
    },

    #[error("{channel}: {misses} consecutive acquisition failures")]
    PersistentAcquisition { channel: Channel, misses: u32 },
}

impl HealthTestFailure {
    pub fn channel(&self) -> Channel {
        match self {
            Self::RepetitionCount { channel, .. }
            | Self::AdaptiveProportion { channel, .. }
            | Self::PersistentAcquisition { channel, .. } => *channel,
        }
    }

    /// Stable machine-readable reason carried in status and health events.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::RepetitionCount { .. } => "repetition-count-exceeded",
            Self::AdaptiveProportion { .. } => "adaptive-proportion-exceeded",
            Self::PersistentAcquisition { .. } => "acquisition-persistent-failure",
        }
    }
}

/// Broker-side publish failure. Always treated as transient by the publisher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("broker rejected message: {0}")]
    Rejected(String),
}

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Crate-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("pipeline startup failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
