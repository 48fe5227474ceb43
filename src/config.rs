//! Bus and subscription configuration
//!
//! `BusConfig`'s two env-var-overridable defaults follow the pattern in
//! `server/src/data/topics/mod.rs::TopicConfig::default()`
//! (`ENV_TOPIC_BUFFER_SIZE` / `ENV_TOPIC_CHANNEL_CAPACITY`); the rest of
//! the shape and the builder mirror
//! `examples/original_source/config.go`'s `Config`/`Option` pair.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::id::{IdGenerator, UlidGenerator};
use crate::message::SubscriptionStrategy;
use crate::metrics::{self, BusMetrics};

/// Environment variable overriding [`BusConfig::topic_queue_size`]'s default.
pub const ENV_TOPIC_QUEUE_SIZE: &str = "TOPICBUS_TOPIC_QUEUE_SIZE";
/// Environment variable overriding [`BusConfig::default_sub_buffer_size`]'s default.
pub const ENV_SUB_BUFFER_SIZE: &str = "TOPICBUS_SUB_BUFFER_SIZE";

pub const DEFAULT_TOPIC_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_SUB_BUFFER_SIZE: usize = 128;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(200);

/// A panic caught inside the fan-out worker, handed to
/// [`BusConfig::panic_handler`] when one is configured.
pub type PanicHandler = Arc<dyn Fn(&str, Box<dyn std::any::Any + Send>) + Send + Sync>;

/// Effective, immutable-after-construction bus configuration.
#[derive(Clone)]
pub struct BusConfig {
    pub topic_queue_size: usize,
    pub auto_delete_empty_topics: bool,
    pub copy_on_publish: bool,
    pub max_topics: usize,
    pub max_subscribers_per_topic: usize,
    pub default_sub_buffer_size: usize,
    pub default_send_timeout: Duration,
    pub default_drop_if_full: bool,
    pub default_strategy: SubscriptionStrategy,
    /// `None` only when explicitly cleared via
    /// [`BusConfigBuilder::without_id_generator`] — the default builder
    /// path always seeds a concrete [`UlidGenerator`]. [`crate::Bus::new`]
    /// rejects a `None` config with [`crate::BusError::IdGeneratorMissing`]
    /// (spec.md §7).
    pub(crate) id_generator: Option<Arc<dyn IdGenerator>>,
    pub(crate) metrics: Arc<dyn BusMetrics>,
    pub(crate) panic_handler: Option<PanicHandler>,
}

impl std::fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConfig")
            .field("topic_queue_size", &self.topic_queue_size)
            .field("auto_delete_empty_topics", &self.auto_delete_empty_topics)
            .field("copy_on_publish", &self.copy_on_publish)
            .field("max_topics", &self.max_topics)
            .field("max_subscribers_per_topic", &self.max_subscribers_per_topic)
            .field("default_sub_buffer_size", &self.default_sub_buffer_size)
            .field("default_send_timeout", &self.default_send_timeout)
            .field("default_drop_if_full", &self.default_drop_if_full)
            .field("default_strategy", &self.default_strategy)
            .finish_non_exhaustive()
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        let topic_queue_size = std::env::var(ENV_TOPIC_QUEUE_SIZE)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TOPIC_QUEUE_SIZE);
        let default_sub_buffer_size = std::env::var(ENV_SUB_BUFFER_SIZE)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SUB_BUFFER_SIZE);

        Self {
            topic_queue_size,
            auto_delete_empty_topics: true,
            copy_on_publish: false,
            max_topics: 0,
            max_subscribers_per_topic: 0,
            default_sub_buffer_size,
            default_send_timeout: DEFAULT_SEND_TIMEOUT,
            default_drop_if_full: true,
            default_strategy: SubscriptionStrategy::PayloadShared,
            id_generator: Some(Arc::new(UlidGenerator::new())),
            metrics: metrics::noop(),
            panic_handler: None,
        }
    }
}

/// Builder for [`BusConfig`], mirroring
/// `examples/original_source/config.go`'s `WithX` option functions.
#[derive(Default)]
pub struct BusConfigBuilder {
    cfg: BusConfig,
}

impl BusConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic_queue_size(mut self, size: usize) -> Self {
        self.cfg.topic_queue_size = size;
        self
    }

    pub fn auto_delete_empty_topics(mut self, enabled: bool) -> Self {
        self.cfg.auto_delete_empty_topics = enabled;
        self
    }

    pub fn copy_on_publish(mut self, enabled: bool) -> Self {
        self.cfg.copy_on_publish = enabled;
        self
    }

    pub fn max_topics(mut self, max: usize) -> Self {
        self.cfg.max_topics = max;
        self
    }

    pub fn max_subscribers_per_topic(mut self, max: usize) -> Self {
        self.cfg.max_subscribers_per_topic = max;
        self
    }

    pub fn default_sub_buffer_size(mut self, size: usize) -> Self {
        self.cfg.default_sub_buffer_size = size;
        self
    }

    pub fn default_send_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.default_send_timeout = timeout;
        self
    }

    pub fn default_drop_if_full(mut self, enabled: bool) -> Self {
        self.cfg.default_drop_if_full = enabled;
        self
    }

    pub fn default_strategy(mut self, strategy: SubscriptionStrategy) -> Self {
        self.cfg.default_strategy = strategy;
        self
    }

    pub fn id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.cfg.id_generator = Some(generator);
        self
    }

    /// Explicitly clears the id generator, so [`BusConfig::build`]
    /// produces a configuration [`crate::Bus::new`] rejects with
    /// [`crate::BusError::IdGeneratorMissing`] (spec.md §7). The default
    /// builder always carries a generator; this exists for callers that
    /// need to construct the "missing" state on purpose, mirroring
    /// `examples/original_source/config.go`'s `Option` functions being
    /// able to clear a field as readily as set one.
    pub fn without_id_generator(mut self) -> Self {
        self.cfg.id_generator = None;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn BusMetrics>) -> Self {
        self.cfg.metrics = metrics;
        self
    }

    /// Sets a handler invoked when the fan-out worker catches a fatal
    /// internal fault. If unset (or if the handler itself panics), the
    /// fault is fatal to the whole process via `std::process::abort`,
    /// per spec.md §7's "otherwise they are fatal" / §9's panic-handler
    /// contract — not just the one worker task.
    pub fn panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, Box<dyn std::any::Any + Send>) + Send + Sync + 'static,
    {
        self.cfg.panic_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> BusConfig {
        self.cfg.normalize()
    }
}

impl BusConfig {
    pub fn builder() -> BusConfigBuilder {
        BusConfigBuilder::new()
    }

    /// Clamps out-of-range fields to their defaults, matching
    /// `examples/original_source/config.go::Config.Normalize`.
    fn normalize(mut self) -> Self {
        if self.topic_queue_size == 0 {
            self.topic_queue_size = DEFAULT_TOPIC_QUEUE_SIZE;
        }
        if self.default_sub_buffer_size == 0 {
            self.default_sub_buffer_size = DEFAULT_SUB_BUFFER_SIZE;
        }
        if self.default_send_timeout.is_zero() {
            self.default_send_timeout = DEFAULT_SEND_TIMEOUT;
        }
        self
    }

    pub(crate) fn invoke_panic_handler(&self, topic: &str, payload: Box<dyn std::any::Any + Send>) {
        match &self.panic_handler {
            Some(handler) => {
                // The handler itself may not be unwind-safe; treat a
                // panicking handler the same as an unset one: propagate.
                let handler = AssertUnwindSafe(|| handler(topic, payload));
                if std::panic::catch_unwind(handler).is_err() {
                    std::process::abort();
                }
            }
            None => std::process::abort(),
        }
    }
}

/// Per-subscription configuration, overriding the bus's `Default*`
/// fields where set.
#[derive(Debug, Clone, Default)]
pub struct SubscribeConfig {
    pub buffer_size: Option<usize>,
    pub send_timeout: Option<Duration>,
    pub drop_if_full: Option<bool>,
    pub strategy: Option<SubscriptionStrategy>,
}

/// Fully resolved, per-subscription policy after normalization against
/// bus defaults, per spec.md §4.6.2 step 3.
#[derive(Debug, Clone, Copy)]
pub struct EffectiveSubscribeConfig {
    pub buffer_size: usize,
    pub send_timeout: Duration,
    pub drop_if_full: bool,
    pub strategy: SubscriptionStrategy,
}

impl SubscribeConfig {
    pub(crate) fn resolve(&self, defaults: &BusConfig) -> EffectiveSubscribeConfig {
        let buffer_size = self
            .buffer_size
            .filter(|&n| n >= 1)
            .unwrap_or(defaults.default_sub_buffer_size);

        let send_timeout = self.send_timeout.unwrap_or(defaults.default_send_timeout);
        let mut drop_if_full = self.drop_if_full.unwrap_or(defaults.default_drop_if_full);

        // SendTimeout <= 0 forces DropIfFull = true (spec.md §4.6.2 step 3).
        if send_timeout.is_zero() {
            drop_if_full = true;
        }

        let strategy = self.strategy.unwrap_or(defaults.default_strategy);

        EffectiveSubscribeConfig {
            buffer_size,
            send_timeout,
            drop_if_full,
            strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_table() {
        // SAFETY: tests run with no env overrides for these vars under
        // normal `cargo test` invocation.
        unsafe {
            std::env::remove_var(ENV_TOPIC_QUEUE_SIZE);
            std::env::remove_var(ENV_SUB_BUFFER_SIZE);
        }
        let cfg = BusConfig::default();
        assert_eq!(cfg.topic_queue_size, 1024);
        assert!(cfg.auto_delete_empty_topics);
        assert!(!cfg.copy_on_publish);
        assert_eq!(cfg.max_topics, 0);
        assert_eq!(cfg.max_subscribers_per_topic, 0);
        assert_eq!(cfg.default_sub_buffer_size, 128);
        assert_eq!(cfg.default_send_timeout, Duration::from_millis(200));
        assert!(cfg.default_drop_if_full);
        assert_eq!(cfg.default_strategy, SubscriptionStrategy::PayloadShared);
    }

    #[test]
    fn builder_normalizes_zero_queue_size_to_default() {
        let cfg = BusConfig::builder().topic_queue_size(0).build();
        assert_eq!(cfg.topic_queue_size, DEFAULT_TOPIC_QUEUE_SIZE);
    }

    #[test]
    fn subscribe_config_clamps_buffer_size_below_one() {
        let defaults = BusConfig::default();
        let sub = SubscribeConfig {
            buffer_size: Some(0),
            ..Default::default()
        };
        let effective = sub.resolve(&defaults);
        assert_eq!(effective.buffer_size, defaults.default_sub_buffer_size);
    }

    #[test]
    fn subscribe_config_zero_timeout_forces_drop_if_full() {
        let defaults = BusConfig::builder().default_drop_if_full(false).build();
        let sub = SubscribeConfig {
            send_timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        let effective = sub.resolve(&defaults);
        assert!(effective.drop_if_full);
    }

    #[test]
    fn subscribe_config_inherits_bus_defaults_when_unset() {
        let defaults = BusConfig::builder()
            .default_sub_buffer_size(64)
            .default_drop_if_full(false)
            .default_send_timeout(Duration::from_millis(50))
            .default_strategy(SubscriptionStrategy::PayloadClonedPerSubscriber)
            .build();
        let effective = SubscribeConfig::default().resolve(&defaults);
        assert_eq!(effective.buffer_size, 64);
        assert!(!effective.drop_if_full);
        assert_eq!(effective.send_timeout, Duration::from_millis(50));
        assert_eq!(
            effective.strategy,
            SubscriptionStrategy::PayloadClonedPerSubscriber
        );
    }
}
