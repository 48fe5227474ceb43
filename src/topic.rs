//! Per-topic state and its fan-out worker
//!
//! Grounded on `server/src/data/topics/mod.rs`'s `TopicInner` /
//! `create_topic_internal` / `start_dispatcher` trio: a bounded `mpsc`
//! ingress pair built at topic creation, a `RwLock`-guarded subscriber
//! map snapshotted under read-mode before delivery, and a drain loop
//! that exits once the ingress sender side is gone and the channel is
//! empty. The per-subscriber drop/timeout policy is ported from
//! `examples/original_source/fanout.go::tryDeliver`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{BusConfig, EffectiveSubscribeConfig};
use crate::counters::{CounterSet, Counters};
use crate::error::BusError;
use crate::message::{InternalMessage, Message};

/// One live subscriber's delivery target and policy, snapshotted out of
/// `TopicState::subs` before each fan-out round.
#[derive(Clone)]
pub(crate) struct SubEntry {
    pub tx: mpsc::Sender<Message>,
    pub config: EffectiveSubscribeConfig,
}

/// Per-topic container: ingress queue, subscriber set, sequence
/// counter, and the `started`/`closed` lifecycle pair from spec.md §3.
///
/// `closed` is folded into `ingress_tx`'s `Option`: taking the sender
/// out is the atomic false→true transition (guarded by the same write
/// lock used to read it), so there is no separate flag to keep in sync.
pub(crate) struct TopicState {
    name: String,
    queue_capacity: usize,
    ingress_tx: RwLock<Option<mpsc::Sender<InternalMessage>>>,
    subs: RwLock<HashMap<String, SubEntry>>,
    seq: AtomicU64,
    started: AtomicBool,
    counters: CounterSet,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TopicState {
    /// Builds the ingress channel, registers the topic, and spawns its
    /// fan-out worker in one step — by construction, every `TopicState`
    /// a caller can observe already has `started == true`
    /// (spec.md §3's bus invariant).
    pub fn spawn(name: String, config: &Arc<BusConfig>, global: Arc<CounterSet>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.topic_queue_size);
        let state = Arc::new(TopicState {
            name,
            queue_capacity: config.topic_queue_size,
            ingress_tx: RwLock::new(Some(tx)),
            subs: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            started: AtomicBool::new(false),
            counters: CounterSet::new(),
            worker: Mutex::new(None),
        });

        let worker_state = Arc::clone(&state);
        let worker_config = Arc::clone(config);
        let handle = tokio::spawn(run_fanout(worker_state, rx, global, worker_config));
        *state.worker.lock() = Some(handle);
        state.started.store(true, Ordering::SeqCst);
        tracing::debug!(topic = %state.name, "fan-out worker started");
        state
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Non-blocking try-send on the ingress queue. `QueueFull` at
    /// capacity; `Closed` if the queue has already been closed (the
    /// close/publish race from spec.md §9 — treated as an ordinary
    /// rejected send, not a fault).
    pub fn enqueue(&self, msg: InternalMessage) -> Result<(), BusError> {
        let guard = self.ingress_tx.read();
        match guard.as_ref() {
            Some(tx) => tx.try_send(msg).map_err(|_| BusError::QueueFull),
            None => Err(BusError::Closed),
        }
    }

    /// Idempotent. Returns `true` the first time (the sender is taken
    /// and dropped, so the worker observes the channel close once
    /// drained); `false` on every call after.
    pub fn close_ingress(&self) -> bool {
        self.ingress_tx.write().take().is_some()
    }

    /// Best-effort count of items currently buffered in the ingress
    /// queue, derived from the channel's remaining permit capacity.
    pub fn ingress_len(&self) -> usize {
        match self.ingress_tx.read().as_ref() {
            Some(tx) => self.queue_capacity - tx.capacity(),
            None => 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.read().len()
    }

    pub fn insert_subscriber(&self, id: String, entry: SubEntry) {
        self.subs.write().insert(id, entry);
    }

    /// Removes a subscriber; returns whether it was present.
    pub fn remove_subscriber(&self, id: &str) -> bool {
        self.subs.write().remove(id).is_some()
    }

    /// Shallow copy of the subscriber map's values, taken under the
    /// read lock per spec.md §4.4's `snapshotSubs`.
    fn snapshot_subs(&self) -> Vec<SubEntry> {
        self.subs.read().values().cloned().collect()
    }

    pub fn counters(&self) -> Counters {
        self.counters.snapshot()
    }

    pub fn mark_published(&self) {
        self.counters.inc_published();
    }

    /// Sum of each live subscriber's current inbox length, for
    /// `stats()`'s per-topic "total buffered messages" field.
    pub fn buffered_messages(&self) -> usize {
        self.subs
            .read()
            .values()
            .map(|s| s.config.buffer_size.saturating_sub(s.tx.capacity()))
            .sum()
    }

    /// Takes the worker's join handle, if not already taken, for
    /// `Bus::close()` to await.
    pub fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().take()
    }
}

/// Per-topic fan-out task: drains ingress, snapshots subscribers,
/// delivers, updates counters. Exits once the ingress sender side is
/// gone and the channel is drained (spec.md §4.4's termination
/// invariant).
async fn run_fanout(
    state: Arc<TopicState>,
    mut rx: mpsc::Receiver<InternalMessage>,
    global: Arc<CounterSet>,
    config: Arc<BusConfig>,
) {
    while let Some(msg) = rx.recv().await {
        tracing::trace!(topic = %state.name, seq = msg.seq, "dequeued for fan-out");
        // Only the synchronous preparation (snapshot + materialize) is
        // wrapped: a future holding a `.await` point is not generally
        // unwind-safe, and nothing downstream of this can panic on
        // well-formed input anyway.
        let prepared = std::panic::catch_unwind(AssertUnwindSafe(|| {
            state
                .snapshot_subs()
                .into_iter()
                .map(|sub| {
                    let delivered = sub.config.strategy;
                    (sub, msg.materialize(delivered))
                })
                .collect::<Vec<_>>()
        }));

        let deliveries = match prepared {
            Ok(d) => d,
            Err(payload) => {
                tracing::warn!(topic = %state.name, "fan-out worker caught a panic");
                config.invoke_panic_handler(&state.name, payload);
                continue;
            }
        };

        for (sub, out_msg) in deliveries {
            let delivered = try_deliver(&sub, out_msg).await;
            if delivered {
                state.counters.inc_delivered();
                global.inc_delivered();
                config.metrics.inc_delivered(&state.name);
            } else {
                state.counters.inc_dropped();
                global.inc_dropped();
                config.metrics.inc_dropped(&state.name);
            }
        }
    }
    tracing::debug!(topic = %state.name, "fan-out worker drained and exiting");
}

/// Applies one subscriber's delivery policy, per spec.md §4.5.
async fn try_deliver(sub: &SubEntry, msg: Message) -> bool {
    if sub.config.drop_if_full {
        sub.tx.try_send(msg).is_ok()
    } else {
        matches!(
            tokio::time::timeout(sub.config.send_timeout, sub.tx.send(msg)).await,
            Ok(Ok(()))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SubscriptionStrategy;
    use std::time::Duration;

    fn test_config() -> Arc<BusConfig> {
        Arc::new(BusConfig::builder().topic_queue_size(8).build())
    }

    fn effective(buffer_size: usize, drop_if_full: bool) -> EffectiveSubscribeConfig {
        EffectiveSubscribeConfig {
            buffer_size,
            send_timeout: Duration::from_millis(50),
            drop_if_full,
            strategy: SubscriptionStrategy::PayloadShared,
        }
    }

    #[tokio::test]
    async fn delivers_published_message_to_subscriber() {
        let global = Arc::new(CounterSet::new());
        let cfg = test_config();
        let topic = TopicState::spawn("t".into(), &cfg, global);
        assert!(topic.started.load(Ordering::SeqCst));

        let (tx, mut rx) = mpsc::channel(4);
        topic.insert_subscriber("s1".into(), SubEntry { tx, config: effective(4, true) });

        topic
            .enqueue(InternalMessage::new("t".into(), topic.next_seq(), Arc::from(&b"x"[..])))
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(&*msg.payload, b"x");
        assert_eq!(msg.seq, 1);
    }

    #[tokio::test]
    async fn drop_if_full_counts_a_drop_instead_of_blocking() {
        let global = Arc::new(CounterSet::new());
        let cfg = test_config();
        let topic = TopicState::spawn("t".into(), &cfg, Arc::clone(&global));

        let (tx, rx) = mpsc::channel(1);
        topic.insert_subscriber("s1".into(), SubEntry { tx, config: effective(1, true) });

        topic
            .enqueue(InternalMessage::new("t".into(), topic.next_seq(), Arc::from(&b"a"[..])))
            .unwrap();
        topic
            .enqueue(InternalMessage::new("t".into(), topic.next_seq(), Arc::from(&b"b"[..])))
            .unwrap();

        // Give the fan-out task a chance to run both deliveries before
        // the consumer ever reads, so the second one finds a full inbox.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snap = topic.counters();
        assert_eq!(snap.delivered, 1);
        assert_eq!(snap.dropped, 1);
        drop(rx);
    }

    #[tokio::test]
    async fn close_ingress_is_idempotent_and_lets_worker_drain_then_exit() {
        let global = Arc::new(CounterSet::new());
        let cfg = test_config();
        let topic = TopicState::spawn("t".into(), &cfg, global);

        let (tx, mut rx) = mpsc::channel(4);
        topic.insert_subscriber("s1".into(), SubEntry { tx, config: effective(4, true) });

        topic
            .enqueue(InternalMessage::new("t".into(), topic.next_seq(), Arc::from(&b"x"[..])))
            .unwrap();

        assert!(topic.close_ingress());
        assert!(!topic.close_ingress());
        assert!(topic.ingress_tx.read().is_none());
        assert!(matches!(
            topic.enqueue(InternalMessage::new("t".into(), 99, Arc::from(&b"late"[..]))),
            Err(BusError::Closed)
        ));

        assert_eq!(&*rx.recv().await.unwrap().payload, b"x");

        let handle = topic.take_worker().expect("worker handle present");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker exits after drain")
            .unwrap();
    }

    #[tokio::test]
    async fn ingress_len_reflects_unconsumed_items() {
        let global = Arc::new(CounterSet::new());
        let cfg = test_config();
        let topic = TopicState::spawn("t".into(), &cfg, global);
        // No subscribers: nothing drains, so enqueued items stay pending
        // briefly before the (subscriber-less) fan-out loop consumes
        // them from the channel immediately. With zero subscribers the
        // delivery snapshot is empty, so the message is consumed but
        // nothing is ever sent anywhere.
        topic
            .enqueue(InternalMessage::new("t".into(), topic.next_seq(), Arc::from(&b"x"[..])))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(topic.ingress_len(), 0);
    }
}
