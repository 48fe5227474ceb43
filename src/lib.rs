//! An in-process publish/subscribe bus: producers publish byte-payload
//! messages to named topics, and consumers receive them asynchronously
//! through a per-subscriber delivery stream. Not a networked broker —
//! no persistence, no routing patterns, no delivery acknowledgement
//! protocol back to the producer.
//!
//! The engine is a two-stage bounded pipeline per topic: publish places
//! an item on the topic's ingress queue; a dedicated fan-out worker
//! drains it and tries to enqueue a copy into every live subscriber's
//! inbox, applying that subscriber's own drop-if-full or timed delivery
//! policy. Producers get synchronous back-pressure (`QueueFull`);
//! consumers never stall the bus — a slow reader only ever loses its
//! own messages, counted as drops.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use topicbus::{Bus, BusConfig, SubscribeConfig};
//!
//! # async fn run() -> Result<(), topicbus::BusError> {
//! let bus = Bus::new(BusConfig::default())?;
//!
//! let mut sub = bus.subscribe("orders", CancellationToken::new(), SubscribeConfig::default())?;
//! bus.publish("orders", &b"order-123"[..])?;
//!
//! if let Some(msg) = sub.recv().await {
//!     assert_eq!(&*msg.payload, b"order-123");
//! }
//!
//! bus.close().await?;
//! # Ok(())
//! # }
//! ```

mod bus;
mod config;
mod counters;
mod error;
mod id;
mod message;
mod metrics;
mod subscription;
mod topic;

pub use bus::{Bus, PublishAck, StatsResults, TopicStats};
pub use config::{
    BusConfig, BusConfigBuilder, EffectiveSubscribeConfig, PanicHandler, SubscribeConfig,
    DEFAULT_SEND_TIMEOUT, DEFAULT_SUB_BUFFER_SIZE, DEFAULT_TOPIC_QUEUE_SIZE, ENV_SUB_BUFFER_SIZE,
    ENV_TOPIC_QUEUE_SIZE,
};
pub use counters::{CounterSet, Counters};
pub use error::BusError;
pub use id::{default_id_generator, IdGenerator, UlidGenerator};
pub use message::{Message, SubscriptionStrategy};
pub use metrics::{BusMetrics, NoopMetrics};
pub use subscription::Subscription;

pub use tokio_util::sync::CancellationToken;
