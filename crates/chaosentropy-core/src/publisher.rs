//! Publisher bridge: drains the pool onto a message broker.
//!
//! Delivery is at-least-once with bounded effort. Each block gets up to
//! `max_attempts` tries with exponential backoff
//! `min(cap, base · 2^(attempt−1))`. A block that exhausts its attempts goes
//! to the front of a bounded retry buffer; when the buffer overflows, the
//! oldest entry (at the back) is dropped and counted. Buffered blocks are
//! retried before new blocks are taken from the pool.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::conditioning::ConditionedBlock;
use crate::config::PublisherConfig;
use crate::error::PublishError;
use crate::health::{HealthBoard, HealthEvent};
use crate::pool::{EntropyPool, TakeError};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

// ---------------------------------------------------------------------------
// Broker boundary
// ---------------------------------------------------------------------------

/// A publish/subscribe channel. Connection and auth live behind this trait.
pub trait Broker: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// In-process broker that records every accepted message.
///
/// Failures can be injected for the next `n` publishes, or permanently.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    messages: Mutex<Vec<PublishedMessage>>,
    fail_next: AtomicU32,
    unreachable: AtomicBool,
    attempts: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls with `Unreachable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Publish calls seen, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Decoded block messages, in delivery order.
    pub fn block_messages(&self) -> Vec<BlockMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic.contains("/entropy/"))
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }

    /// Payloads published on health topics.
    pub fn health_messages(&self) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic.ends_with("/health"))
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }
}

impl Broker for MemoryBroker {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(PublishError::Unreachable("memory broker offline".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PublishError::Unreachable("injected failure".into()));
        }
        self.messages.lock().unwrap().push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

/// Writes one `{"topic": .., "payload": ..}` JSON object per line.
pub struct JsonLinesBroker<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesBroker<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap()
    }
}

impl<W: Write + Send> Broker for JsonLinesBroker<W> {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let payload: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| PublishError::Rejected(format!("payload is not JSON: {e}")))?;
        let line = serde_json::json!({ "topic": topic, "payload": payload });
        let mut w = self.writer.lock().unwrap();
        writeln!(w, "{line}")
            .and_then(|()| w.flush())
            .map_err(|e| PublishError::Unreachable(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Messages and topics
// ---------------------------------------------------------------------------

/// Wire form of a conditioned block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMessage {
    pub sequence_number: u64,
    /// Lowercase hex.
    pub block: String,
    pub block_size: usize,
    pub raw_bits_consumed: usize,
    /// Raw bits per channel name.
    pub source_channel_mix: BTreeMap<String, u32>,
    pub production_timestamp_ns: u64,
}

impl From<&ConditionedBlock> for BlockMessage {
    fn from(b: &ConditionedBlock) -> Self {
        Self {
            sequence_number: b.sequence,
            block: b.bytes.iter().map(|x| format!("{x:02x}")).collect(),
            block_size: b.bytes.len(),
            raw_bits_consumed: b.raw_bits_consumed,
            source_channel_mix: Channel::ALL
                .iter()
                .map(|&ch| (ch.name().to_string(), b.mix(ch)))
                .collect(),
            production_timestamp_ns: b.produced_at_ns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub ok: String,
    pub degraded: String,
    pub health: String,
}

impl Topics {
    pub fn new(namespace: &str, device_id: &str) -> Self {
        let base = format!("{namespace}/{device_id}");
        Self {
            ok: format!("{base}/entropy/ok"),
            degraded: format!("{base}/entropy/degraded"),
            health: format!("{base}/health"),
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PublisherStats {
    published: AtomicU64,
    retries: AtomicU64,
    last_delivery_retries: AtomicU32,
    exhausted: AtomicU64,
    dropped: AtomicU64,
    retry_buffer_len: AtomicU64,
    shutdown_discarded: AtomicU64,
    health_published: AtomicU64,
    health_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherCounts {
    pub published: u64,
    /// Failed attempts that were followed by another attempt.
    pub retries: u64,
    pub last_delivery_retries: u32,
    /// Deliveries that used up every attempt.
    pub exhausted: u64,
    /// Blocks lost to retry-buffer overflow.
    pub dropped: u64,
    pub retry_buffer_len: u64,
    pub shutdown_discarded: u64,
    pub health_published: u64,
    pub health_dropped: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherCounts {
        PublisherCounts {
            published: self.published.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            last_delivery_retries: self.last_delivery_retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retry_buffer_len: self.retry_buffer_len.load(Ordering::Relaxed),
            shutdown_discarded: self.shutdown_discarded.load(Ordering::Relaxed),
            health_published: self.health_published.load(Ordering::Relaxed),
            health_dropped: self.health_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Result of one [`PublisherBridge::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Published,
    /// Delivery failed; the block is in the retry buffer.
    Buffered,
    /// Nothing to publish within the take timeout.
    Idle,
    /// Pool closed and drained, retry buffer empty.
    Finished,
}

pub struct PublisherBridge {
    broker: Arc<dyn Broker>,
    pool: Arc<EntropyPool>,
    board: Arc<HealthBoard>,
    policy: RetryPolicy,
    topics: Topics,
    retry_buffer: VecDeque<ConditionedBlock>,
    retry_capacity: usize,
    take_timeout: Duration,
    stats: Arc<PublisherStats>,
}

impl PublisherBridge {
    pub fn new(
        config: &PublisherConfig,
        broker: Arc<dyn Broker>,
        pool: Arc<EntropyPool>,
        board: Arc<HealthBoard>,
    ) -> Self {
        Self {
            broker,
            pool,
            board,
            policy: config.retry_policy(),
            topics: Topics::new(&config.topic_namespace, &config.device_id),
            retry_buffer: VecDeque::new(),
            retry_capacity: config.retry_buffer_capacity.max(1),
            take_timeout: config.take_timeout(),
            stats: Arc::new(PublisherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        Arc::clone(&self.stats)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn retry_buffer_len(&self) -> usize {
        self.retry_buffer.len()
    }

    /// Publish one unit of work: health events first, then a buffered block
    /// if any, then a fresh block from the pool.
    ///
    /// With a `deadline`, no backoff sleep extends past it.
    pub fn step(&mut self, deadline: Option<Instant>) -> Step {
        self.publish_health_events(deadline);

        if let Some(block) = self.retry_buffer.pop_front() {
            self.sync_buffer_len();
            if self.send_block(&block, deadline).is_ok() {
                return Step::Published;
            }
            // Still failing: keep it at the front and let the pool move.
            self.retry_buffer.push_front(block);
            self.sync_buffer_len();
        }

        let block = match self.pool.take(self.take_timeout) {
            Ok(block) => block,
            Err(TakeError::Empty) => return Step::Idle,
            Err(TakeError::Closed) if self.retry_buffer.is_empty() => return Step::Finished,
            Err(TakeError::Closed) => return Step::Buffered,
        };
        match self.send_block(&block, deadline) {
            Ok(()) => Step::Published,
            Err(e) => {
                log::warn!(
                    "block {} undelivered after {} attempts: {e}",
                    block.sequence,
                    self.policy.max_attempts
                );
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                self.buffer(block);
                Step::Buffered
            }
        }
    }

    /// Publish pending health transitions. Failures are counted, not buffered.
    pub fn publish_health_events(&mut self, deadline: Option<Instant>) {
        let overflowed = self.board.take_overflowed();
        if overflowed > 0 {
            log::warn!("{overflowed} health events dropped before publishing");
            self.stats.health_dropped.fetch_add(overflowed, Ordering::Relaxed);
        }
        for event in self.board.drain_events() {
            match self.send_health(&event, deadline) {
                Ok(()) => {
                    self.stats.health_published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("health event dropped: {e}");
                    self.stats.health_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Discard everything still undelivered. Returns the count.
    pub fn discard_remaining(&mut self) -> usize {
        let n = self.retry_buffer.len() + self.pool.drain_remaining().len();
        self.retry_buffer.clear();
        self.sync_buffer_len();
        if n > 0 {
            log::warn!("shutdown: discarding {n} undelivered blocks");
            self.stats
                .shutdown_discarded
                .fetch_add(n as u64, Ordering::Relaxed);
        }
        n
    }

    fn buffer(&mut self, block: ConditionedBlock) {
        self.retry_buffer.push_front(block);
        if self.retry_buffer.len() > self.retry_capacity {
            if let Some(oldest) = self.retry_buffer.pop_back() {
                log::warn!("retry buffer full: dropping block {}", oldest.sequence);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sync_buffer_len();
    }

    fn sync_buffer_len(&self) {
        self.stats
            .retry_buffer_len
            .store(self.retry_buffer.len() as u64, Ordering::Relaxed);
    }

    fn send_block(
        &self,
        block: &ConditionedBlock,
        deadline: Option<Instant>,
    ) -> Result<(), PublishError> {
        let topic = if self.board.status().is_ok() {
            &self.topics.ok
        } else {
            &self.topics.degraded
        };
        let payload = serde_json::to_vec(&BlockMessage::from(block))
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        let retries = self.deliver(topic, &payload, deadline)?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_delivery_retries
            .store(retries, Ordering::Relaxed);
        Ok(())
    }

    fn send_health(&self, event: &HealthEvent, deadline: Option<Instant>) -> Result<(), PublishError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| PublishError::Rejected(e.to_string()))?;
        self.deliver(&self.topics.health, &payload, deadline)
            .map(|_| ())
    }

    /// Publish with retries. Returns the number of retries used.
    fn deliver(
        &self,
        topic: &str,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<u32, PublishError> {
        let mut attempt = 1;
        loop {
            match self.broker.publish(topic, payload) {
                Ok(()) => return Ok(attempt - 1),
                Err(e) if attempt >= self.policy.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.policy.delay(attempt);
                    if deadline.is_some_and(|d| Instant::now() + delay > d) {
                        return Err(e);
                    }
                    log::debug!("publish to {topic} failed (attempt {attempt}): {e}; retrying in {delay:?}");
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
