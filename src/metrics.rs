//! Pluggable metrics sink
//!
//! Grounded on `server/src/data/topics/backend.rs`'s `TopicBackend`
//! trait: a small `Send + Sync` trait dispatched through `Arc<dyn _>`,
//! with a no-op implementation as the default so the hot delivery path
//! never has to branch on whether metrics are configured.

use std::sync::Arc;

/// Four counter hooks invoked by the bus as messages flow through it.
/// Each takes the topic name the event occurred on.
pub trait BusMetrics: Send + Sync {
    fn inc_published(&self, topic: &str);
    fn inc_delivered(&self, topic: &str);
    fn inc_dropped(&self, topic: &str);
    fn inc_failed(&self, topic: &str);
}

/// No-op metrics sink, the default.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl BusMetrics for NoopMetrics {
    fn inc_published(&self, _topic: &str) {}
    fn inc_delivered(&self, _topic: &str) {}
    fn inc_dropped(&self, _topic: &str) {}
    fn inc_failed(&self, _topic: &str) {}
}

pub(crate) fn noop() -> Arc<dyn BusMetrics> {
    Arc::new(NoopMetrics)
}
