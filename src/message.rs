//! Message types: the consumer-visible `Message` and the internal
//! ingress reference produced by publish and consumed by the fan-out
//! worker.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Immutable record delivered to a subscriber.
///
/// Consumers may read but not mutate a received `Message` — the payload
/// is exposed as a shared `Arc<[u8]>` (under
/// [`SubscriptionStrategy::PayloadShared`]) or an exclusively-owned
/// `Vec<u8>` wrapped the same way (under
/// [`SubscriptionStrategy::PayloadClonedPerSubscriber`]), so there is no
/// API to mutate it in place regardless of strategy.
#[derive(Clone)]
pub struct Message {
    pub topic: String,
    pub timestamp: SystemTime,
    pub seq: u64,
    pub payload: Arc<[u8]>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("timestamp", &self.timestamp)
            .field("seq", &self.seq)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Internal message reference: produced once by publish, fanned out to
/// every subscriber snapshot at delivery time. One reference may
/// produce multiple externally-visible [`Message`]s.
#[derive(Clone)]
pub(crate) struct InternalMessage {
    pub topic: String,
    pub timestamp: SystemTime,
    pub seq: u64,
    pub payload: Arc<[u8]>,
}

impl InternalMessage {
    pub fn new(topic: String, seq: u64, payload: Arc<[u8]>) -> Self {
        Self {
            topic,
            timestamp: SystemTime::now(),
            seq,
            payload,
        }
    }

    /// Materializes an externally-visible `Message` for one subscriber,
    /// following the given payload-sharing strategy.
    pub fn materialize(&self, strategy: SubscriptionStrategy) -> Message {
        let payload = match strategy {
            SubscriptionStrategy::PayloadShared => Arc::clone(&self.payload),
            SubscriptionStrategy::PayloadClonedPerSubscriber => {
                Arc::from(self.payload.as_ref())
            }
        };
        Message {
            topic: self.topic.clone(),
            timestamp: self.timestamp,
            seq: self.seq,
            payload,
        }
    }
}

/// Per-subscription payload-sharing strategy.
///
/// `PayloadShared` hands every subscriber the same `Arc<[u8]>` backing
/// the published bytes (safe because the payload is never mutated after
/// publish). `PayloadClonedPerSubscriber` allocates a fresh buffer per
/// subscriber, trading the allocation for isolation from any other
/// subscriber's handling of the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStrategy {
    PayloadShared,
    PayloadClonedPerSubscriber,
}

impl Default for SubscriptionStrategy {
    fn default() -> Self {
        SubscriptionStrategy::PayloadShared
    }
}
