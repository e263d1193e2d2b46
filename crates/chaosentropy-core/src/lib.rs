//! # chaosentropy-core
//!
//! **Four chaotic oscillators in, validated entropy out.**
//!
//! `chaosentropy-core` turns the analog output of four physical chaotic
//! circuits (Chua, Lorenz, Rössler and an RC relaxation oscillator), sampled
//! by a 32-bit ADC, into SHA-256 conditioned blocks published over a
//! message broker. The raw stream is health-tested continuously while it is
//! produced.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use chaosentropy_core::{
//!     AdcSampler, MemoryBroker, Pipeline, PipelineConfig, PipelineOptions, SyntheticAdc,
//! };
//!
//! let config = PipelineConfig::default();
//! let sampler = AdcSampler::new(SyntheticAdc::new(7), &config.sampler).unwrap();
//! let broker = Arc::new(MemoryBroker::new());
//! let pipeline = Pipeline::start(config, Box::new(sampler), broker.clone(), PipelineOptions::default()).unwrap();
//!
//! std::thread::sleep(Duration::from_secs(1));
//! println!("{}", pipeline.diagnostics().status());
//! let report = pipeline.shutdown();
//! println!("{} blocks published", report.blocks_published);
//! ```
//!
//! ## Architecture
//!
//! Sampler → Selector → Bit Extractor → Health Tests ⟶ Conditioner → Pool → Publisher
//!
//! The health engine is the only writer of health state and holds veto power
//! over which raw bits the conditioner may consume. Every other component
//! reads it through an `Arc<HealthBoard>`.

pub mod channel;
pub mod conditioning;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod extractor;
pub mod health;
pub mod pipeline;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod sampler;
pub mod selector;

pub use channel::{CHANNEL_COUNT, Channel, ChannelCalibration};
pub use conditioning::{ConditionedBlock, Conditioner, ConditionerCounts, input_bits_required};
pub use config::PipelineConfig;
pub use diagnostics::{DiagnosticsHandle, DiagnosticsSnapshot};
pub use error::{AcquisitionError, ConfigError, Error, HealthTestFailure, PublishError, Result};
pub use extractor::{BitExtractor, RawBit, pack_bits};
pub use health::{
    GlobalHaltPolicy, HealthBoard, HealthEngine, HealthEvent, HealthStatus, apt_cutoff, rct_cutoff,
};
pub use pipeline::{Pipeline, PipelineOptions, ShutdownReport};
pub use pool::{EntropyPool, PoolError, PoolStats};
pub use publisher::{
    BlockMessage, Broker, JsonLinesBroker, MemoryBroker, PublisherBridge, RetryPolicy,
};
pub use sampler::{
    AdcDevice, AdcSampler, ChannelFault, ReplayAdc, Sample, Sampler, SyntheticAdc, code_to_voltage,
};
pub use selector::SourceSelector;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
