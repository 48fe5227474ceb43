//! The bus controller: topic registry, publish/subscribe/unsubscribe,
//! and orderly shutdown.
//!
//! Grounded on `server/src/data/topics/mod.rs::TopicService`'s
//! `topics: RwLock<TopicMap>` registry and its `shutdown()` method's
//! two-phase signal-then-join; the per-call contracts follow spec.md
//! §4.6.1–§4.6.4 exactly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{BusConfig, SubscribeConfig};
use crate::counters::{CounterSet, Counters};
use crate::error::BusError;
use crate::id::IdGenerator;
use crate::message::InternalMessage;
use crate::subscription::{DetachFn, Subscription};
use crate::topic::{SubEntry, TopicState};

/// Result of one publish call. Always returned on success paths; the
/// `error` field carries `QueueFull` without discarding the rest of the
/// ack, mirroring the original Go `(PublishAck, error)` return shape
/// (spec.md §4.6.1).
#[derive(Debug, Clone)]
pub struct PublishAck {
    pub topic: String,
    pub enqueued: bool,
    pub subscribers: usize,
    pub error: Option<BusError>,
}

/// Per-topic slice of a stats snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicStats {
    pub counters: Counters,
    pub subscribers: usize,
    pub buffered_messages: usize,
}

/// Snapshot returned by [`Bus::stats`], per spec.md §6.
#[derive(Debug, Clone)]
pub struct StatsResults {
    pub start_time: SystemTime,
    pub open: bool,
    pub topics: usize,
    pub subscribers: usize,
    pub counters: Counters,
    pub per_topic: HashMap<String, TopicStats>,
}

struct BusInner {
    config: Arc<BusConfig>,
    id_generator: Arc<dyn IdGenerator>,
    open: AtomicBool,
    registry: RwLock<HashMap<String, Arc<TopicState>>>,
    global_counters: Arc<CounterSet>,
    start_time: SystemTime,
}

/// Top-level coordinator: lifecycle, topic registry, publish dispatch,
/// subscribe/unsubscribe, and shutdown (spec.md §4.6).
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Constructs a bus with the given configuration.
    ///
    /// Fails with [`BusError::IdGeneratorMissing`] if `config` was built
    /// via [`crate::BusConfigBuilder::without_id_generator`] — the
    /// default builder path always seeds a concrete `UlidGenerator`, so
    /// this only triggers when a caller explicitly clears it (spec.md
    /// §7: "configuration without an ID generator is a construction
    /// error").
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        let id_generator = config
            .id_generator
            .clone()
            .ok_or(BusError::IdGeneratorMissing)?;
        Ok(Self {
            inner: Arc::new(BusInner {
                config: Arc::new(config),
                id_generator,
                open: AtomicBool::new(true),
                registry: RwLock::new(HashMap::new()),
                global_counters: Arc::new(CounterSet::new()),
                start_time: SystemTime::now(),
            }),
        })
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Publishes `payload` to `topic`. See spec.md §4.6.1.
    ///
    /// Accepts anything convertible to `Arc<[u8]>` — an owned `Vec<u8>`
    /// or `Box<[u8]>` moves in without an extra copy; a borrowed `&[u8]`
    /// or an already-shared `Arc<[u8]>` does not. `CopyOnPublish`
    /// matters only in the last case: it forces a fresh, unaliased copy
    /// of a payload the caller may still hold a handle to elsewhere.
    pub fn publish(&self, topic: &str, payload: impl Into<Arc<[u8]>>) -> Result<PublishAck, BusError> {
        let name = topic.trim();
        if name.is_empty() {
            return Err(BusError::InvalidTopic);
        }
        if !self.is_open() {
            return Err(BusError::Closed);
        }

        let topic_state = {
            let registry = self.inner.registry.read();
            match registry.get(name) {
                Some(state) if state.subscriber_count() > 0 => Arc::clone(state),
                _ => {
                    return Ok(PublishAck {
                        topic: name.to_string(),
                        enqueued: false,
                        subscribers: 0,
                        error: None,
                    });
                }
            }
        };

        let subscribers = topic_state.subscriber_count();
        let seq = topic_state.next_seq();

        let mut payload_arc: Arc<[u8]> = payload.into();
        if self.inner.config.copy_on_publish {
            payload_arc = Arc::from(payload_arc.as_ref());
        }

        let msg = InternalMessage::new(name.to_string(), seq, payload_arc);

        match topic_state.enqueue(msg) {
            Ok(()) => {
                topic_state.mark_published();
                self.inner.global_counters.inc_published();
                self.inner.config.metrics.inc_published(name);
                Ok(PublishAck {
                    topic: name.to_string(),
                    enqueued: true,
                    subscribers,
                    error: None,
                })
            }
            Err(_) => {
                tracing::warn!(topic = name, "publish rejected: ingress queue full");
                Ok(PublishAck {
                    topic: name.to_string(),
                    enqueued: false,
                    subscribers,
                    error: Some(BusError::QueueFull),
                })
            }
        }
    }

    /// Subscribes to `topic`, binding `cancel` as an additional detach
    /// trigger. See spec.md §4.6.2.
    pub fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
        options: SubscribeConfig,
    ) -> Result<Subscription, BusError> {
        let name = topic.trim();
        if name.is_empty() {
            return Err(BusError::InvalidTopic);
        }
        if !self.is_open() {
            return Err(BusError::Closed);
        }

        let effective = options.resolve(&self.inner.config);

        let (sub_id, rx) = {
            let mut registry = self.inner.registry.write();

            // Re-verify open: the bus may have closed while this call
            // was waiting on the write lock (spec.md §4.6.2 step 4).
            if !self.is_open() {
                return Err(BusError::Closed);
            }

            let topic_state = match registry.get(name) {
                Some(state) => Arc::clone(state),
                None => {
                    if self.inner.config.max_topics != 0 && registry.len() >= self.inner.config.max_topics {
                        tracing::warn!(topic = name, "subscribe rejected: max topics exceeded");
                        return Err(BusError::MaxTopicsExceeded);
                    }
                    let state = TopicState::spawn(
                        name.to_string(),
                        &self.inner.config,
                        Arc::clone(&self.inner.global_counters),
                    );
                    registry.insert(name.to_string(), Arc::clone(&state));
                    state
                }
            };

            if self.inner.config.max_subscribers_per_topic != 0
                && topic_state.subscriber_count() >= self.inner.config.max_subscribers_per_topic
            {
                tracing::warn!(topic = name, "subscribe rejected: max subscribers exceeded");
                return Err(BusError::MaxSubscribersExceeded);
            }

            let sub_id = self.inner.id_generator.next();
            let (tx, rx) = tokio::sync::mpsc::channel(effective.buffer_size);
            topic_state.insert_subscriber(sub_id.clone(), SubEntry { tx, config: effective });
            (sub_id, rx)
        };
        tracing::debug!(topic = name, subscriber = %sub_id, "subscribed");

        let detach: DetachFn = self.make_detach(name.to_string(), sub_id.clone());

        let cancel_detach = Arc::clone(&detach);
        tokio::spawn(async move {
            cancel.cancelled().await;
            cancel_detach();
        });

        Ok(Subscription::new(
            sub_id,
            name.to_string(),
            effective,
            rx,
            detach,
            Arc::new(AtomicBool::new(false)),
        ))
    }

    /// Removes a subscriber by ID. Never errors: an already-closed bus,
    /// an unknown topic, and an unknown subscriber are all treated as a
    /// successful no-op (spec.md §4.6.3).
    pub fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> Result<(), BusError> {
        Self::detach_subscriber(&self.inner, topic.trim(), subscriber_id);
        Ok(())
    }

    fn make_detach(&self, topic: String, subscriber_id: String) -> DetachFn {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move || {
            if let Some(inner) = inner.upgrade() {
                Self::detach_subscriber(&inner, &topic, &subscriber_id);
            }
        })
    }

    /// Removes one subscriber and, if `AutoDeleteEmptyTopics` and the
    /// topic is now idle, reaps it — all under one write-lock critical
    /// section (spec.md §4.6.3).
    fn detach_subscriber(inner: &Arc<BusInner>, topic: &str, subscriber_id: &str) {
        let mut registry = inner.registry.write();
        let Some(topic_state) = registry.get(topic) else {
            return;
        };
        let removed = topic_state.remove_subscriber(subscriber_id);
        if removed {
            tracing::debug!(topic, subscriber = subscriber_id, "unsubscribed");
        }
        if removed
            && inner.config.auto_delete_empty_topics
            && topic_state.subscriber_count() == 0
            && topic_state.ingress_len() == 0
        {
            topic_state.close_ingress();
            registry.remove(topic);
            tracing::debug!(topic, "topic auto-deleted: idle with no subscribers");
        }
    }

    /// Closes the bus. Idempotent: only the first call performs any
    /// work. Closes every topic's ingress, then waits for every
    /// fan-out worker to drain and exit (spec.md §4.6.4).
    pub async fn close(&self) -> Result<(), BusError> {
        let was_open = self.inner.open.swap(false, Ordering::SeqCst);
        if !was_open {
            // Already closed by a previous call.
            return Ok(());
        }
        tracing::info!("bus closing");

        let topics = {
            let mut registry = self.inner.registry.write();
            let topics: Vec<Arc<TopicState>> = registry.values().cloned().collect();
            registry.clear();
            topics
        };

        for topic in &topics {
            topic.close_ingress();
        }
        for topic in &topics {
            if let Some(handle) = topic.take_worker() {
                let _ = handle.await;
            }
        }
        tracing::info!("bus closed");

        Ok(())
    }

    /// Point-in-time snapshot of bus and per-topic state. Read under
    /// the registry read lock; consistent per-topic, not across topics
    /// (spec.md §6).
    pub fn stats(&self) -> StatsResults {
        let registry = self.inner.registry.read();
        let mut per_topic = HashMap::with_capacity(registry.len());
        let mut subscribers = 0;
        for (name, state) in registry.iter() {
            let subs = state.subscriber_count();
            subscribers += subs;
            per_topic.insert(
                name.clone(),
                TopicStats {
                    counters: state.counters(),
                    subscribers: subs,
                    buffered_messages: state.buffered_messages(),
                },
            );
        }

        StatsResults {
            start_time: self.inner.start_time,
            open: self.is_open(),
            topics: registry.len(),
            subscribers,
            counters: self.inner.global_counters.snapshot(),
            per_topic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscribeConfig;
    use std::time::Duration;

    fn test_bus() -> Bus {
        Bus::new(BusConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op_ack() {
        let bus = test_bus();
        let ack = bus.publish("t", &b"x"[..]).unwrap();
        assert!(!ack.enqueued);
        assert_eq!(ack.subscribers, 0);
        assert!(ack.error.is_none());
        assert_eq!(bus.stats().topics, 0);
    }

    #[tokio::test]
    async fn publish_delivers_to_one_subscriber_and_updates_stats() {
        let bus = test_bus();
        let mut sub = bus
            .subscribe("t", CancellationToken::new(), SubscribeConfig::default())
            .unwrap();

        let ack = bus.publish("t", &b"x"[..]).unwrap();
        assert!(ack.enqueued);
        assert_eq!(ack.subscribers, 1);

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.seq, 1);
        assert_eq!(&*msg.payload, b"x");

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = bus.stats();
        assert_eq!(stats.per_topic["t"].counters.delivered, 1);
    }

    #[tokio::test]
    async fn new_rejects_a_config_with_no_id_generator() {
        let config = BusConfig::builder().without_id_generator().build();
        let err = Bus::new(config).unwrap_err();
        assert!(matches!(err, BusError::IdGeneratorMissing));
    }

    #[tokio::test]
    async fn invalid_topic_name_rejected_on_publish_and_subscribe() {
        let bus = test_bus();
        assert!(matches!(
            bus.publish("   ", &b"x"[..]),
            Err(BusError::InvalidTopic)
        ));
        assert!(matches!(
            bus.subscribe("  ", CancellationToken::new(), SubscribeConfig::default()),
            Err(BusError::InvalidTopic)
        ));
    }

    #[tokio::test]
    async fn max_topics_exceeded_on_second_distinct_topic() {
        let bus = Bus::new(BusConfig::builder().max_topics(1).build()).unwrap();
        let _a = bus
            .subscribe("t1", CancellationToken::new(), SubscribeConfig::default())
            .unwrap();
        let err = bus
            .subscribe("t2", CancellationToken::new(), SubscribeConfig::default())
            .unwrap_err();
        assert!(matches!(err, BusError::MaxTopicsExceeded));
    }

    #[tokio::test]
    async fn max_subscribers_per_topic_enforced() {
        let bus = Bus::new(BusConfig::builder().max_subscribers_per_topic(1).build()).unwrap();
        let _a = bus
            .subscribe("t", CancellationToken::new(), SubscribeConfig::default())
            .unwrap();
        let err = bus
            .subscribe("t", CancellationToken::new(), SubscribeConfig::default())
            .unwrap_err();
        assert!(matches!(err, BusError::MaxSubscribersExceeded));
    }

    #[tokio::test]
    async fn unsubscribe_then_auto_delete_reaps_idle_topic() {
        let bus = test_bus();
        let sub = bus
            .subscribe("t", CancellationToken::new(), SubscribeConfig::default())
            .unwrap();
        assert_eq!(bus.stats().topics, 1);

        sub.unsubscribe().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bus.stats().topics, 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_a_silent_no_op_for_unknown_topic_or_subscriber() {
        let bus = test_bus();
        assert!(bus.unsubscribe("missing-topic", "missing-sub").is_ok());
    }

    #[tokio::test]
    async fn cancellation_triggers_unsubscribe() {
        let bus = test_bus();
        let cancel = CancellationToken::new();
        let _sub = bus
            .subscribe("t", cancel.clone(), SubscribeConfig::default())
            .unwrap();
        assert_eq!(bus.stats().subscribers, 1);

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.stats().topics, 0);
    }

    #[tokio::test]
    async fn close_drains_then_terminates_streams_and_rejects_further_calls() {
        let bus = test_bus();
        let mut sub = bus
            .subscribe("t", CancellationToken::new(), SubscribeConfig::default())
            .unwrap();
        bus.publish("t", &b"last"[..]).unwrap();

        bus.close().await.unwrap();
        assert!(!bus.stats().open);

        let msg = sub.recv().await.unwrap();
        assert_eq!(&*msg.payload, b"last");
        assert!(sub.recv().await.is_none());

        assert!(matches!(
            bus.publish("t", &b"x"[..]),
            Err(BusError::Closed)
        ));
        assert!(matches!(
            bus.subscribe("t", CancellationToken::new(), SubscribeConfig::default()),
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let bus = test_bus();
        bus.close().await.unwrap();
        bus.close().await.unwrap();
        assert!(!bus.is_open());
    }

    #[tokio::test]
    async fn copy_on_publish_isolates_from_an_already_shared_arc_payload() {
        let payload: Arc<[u8]> = Arc::from(&b"hello"[..]);

        let shared_bus = Bus::new(BusConfig::builder().copy_on_publish(false).build()).unwrap();
        let mut shared_sub = shared_bus
            .subscribe("t", CancellationToken::new(), SubscribeConfig::default())
            .unwrap();
        shared_bus.publish("t", payload.clone()).unwrap();
        let received = shared_sub.recv().await.unwrap();
        assert!(Arc::ptr_eq(&payload, &received.payload));

        let copying_bus = Bus::new(BusConfig::builder().copy_on_publish(true).build()).unwrap();
        let mut copying_sub = copying_bus
            .subscribe("t", CancellationToken::new(), SubscribeConfig::default())
            .unwrap();
        copying_bus.publish("t", payload.clone()).unwrap();
        let received = copying_sub.recv().await.unwrap();
        assert!(!Arc::ptr_eq(&payload, &received.payload));
        assert_eq!(&*received.payload, &*payload);
    }

    #[tokio::test]
    async fn payload_cloned_per_subscriber_gives_each_subscriber_its_own_buffer() {
        use crate::message::SubscriptionStrategy;

        let bus = test_bus();
        let opts = SubscribeConfig {
            strategy: Some(SubscriptionStrategy::PayloadClonedPerSubscriber),
            ..Default::default()
        };
        let mut a = bus.subscribe("t", CancellationToken::new(), opts.clone()).unwrap();
        let mut b = bus.subscribe("t", CancellationToken::new(), opts).unwrap();

        bus.publish("t", &b"hello"[..]).unwrap();

        let ma = a.recv().await.unwrap();
        let mb = b.recv().await.unwrap();
        assert!(!Arc::ptr_eq(&ma.payload, &mb.payload));
        assert_eq!(&*ma.payload, &*mb.payload);
    }
}
