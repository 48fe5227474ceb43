//! Consumer-visible subscription handle
//!
//! Grounded on `examples/original_source/subscribe.go`'s `Subscription`
//! interface (`GetID`/`GetTopic`/`Read`/`Unsubscribe`) and
//! `server/src/data/topics/mod.rs::Subscriber` for the receiver-wrapper
//! shape, generalized to a per-subscriber bounded `mpsc` inbox instead
//! of a shared `broadcast` channel (see SPEC_FULL.md §4.3).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::EffectiveSubscribeConfig;
use crate::error::BusError;
use crate::message::Message;

/// Detach action bound at subscribe time; routes back to the owning
/// topic by ID so `Subscription` never owns the topic/bus directly
/// (see SPEC_FULL.md §9 on avoiding an owning cycle).
pub(crate) type DetachFn = Arc<dyn Fn() + Send + Sync>;

/// Consumer-visible handle to one subscription.
///
/// Created by [`crate::Bus::subscribe`]. Mutated only by the fan-out
/// worker (which enqueues into the inbox) and by the owning consumer
/// (which reads from it). Destroyed when detached — explicitly, via
/// context cancellation, or on bus close.
pub struct Subscription {
    id: String,
    topic: String,
    config: EffectiveSubscribeConfig,
    rx: Option<mpsc::Receiver<Message>>,
    detach: DetachFn,
    detached: Arc<AtomicBool>,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        topic: String,
        config: EffectiveSubscribeConfig,
        rx: mpsc::Receiver<Message>,
        detach: DetachFn,
        detached: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            topic,
            config,
            rx: Some(rx),
            detach,
            detached,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn config(&self) -> EffectiveSubscribeConfig {
        self.config
    }

    /// Receives the next message, or `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.as_mut()?.recv().await
    }

    /// Exposes the inbox as a receive-only, finite stream. Terminates
    /// when the subscription is detached; does not restart. Consumes
    /// the subscription's receiver — only one of `recv`/`into_stream`
    /// may be used.
    pub fn into_stream(mut self) -> ReceiverStream<Message> {
        ReceiverStream::new(self.rx.take().expect("inbox already taken"))
    }

    /// Idempotent. First call removes the subscription from its
    /// topic's subscriber set; subsequent calls are no-ops.
    pub fn unsubscribe(&self) -> Result<(), BusError> {
        if !self.detached.swap(true, Ordering::SeqCst) {
            (self.detach)();
        }
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;

    fn effective() -> EffectiveSubscribeConfig {
        crate::config::SubscribeConfig::default().resolve(&BusConfig::default())
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (_tx, rx) = mpsc::channel(1);
        let calls = Arc::new(AtomicBool::new(false));
        let calls_clone = Arc::clone(&calls);
        let sub = Subscription::new(
            "id1".into(),
            "t".into(),
            effective(),
            rx,
            Arc::new(move || calls_clone.store(true, Ordering::SeqCst)),
            Arc::new(AtomicBool::new(false)),
        );

        sub.unsubscribe().unwrap();
        assert!(calls.load(Ordering::SeqCst));

        // Second call must not invoke detach again, but must not error.
        calls.store(false, Ordering::SeqCst);
        sub.unsubscribe().unwrap();
        assert!(!calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn recv_returns_none_after_sender_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let mut sub = Subscription::new(
            "id1".into(),
            "t".into(),
            effective(),
            rx,
            Arc::new(|| {}),
            Arc::new(AtomicBool::new(false)),
        );
        drop(tx);
        assert!(sub.recv().await.is_none());
    }
}
