//! End-to-end demonstration: two subscribers, one slow, one fast, on
//! the same topic.
//!
//! Run with `cargo run --example basic`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use topicbus::{Bus, BusConfig, SubscribeConfig};

fn init_logging() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_ansi(true)
        .compact()
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), topicbus::BusError> {
    init_logging();

    let bus = Bus::new(BusConfig::default())?;

    let fast_cancel = CancellationToken::new();
    let mut fast = bus.subscribe("orders", fast_cancel.clone(), SubscribeConfig::default())?;

    let slow_opts = SubscribeConfig {
        buffer_size: Some(1),
        drop_if_full: Some(true),
        ..Default::default()
    };
    let mut slow = bus.subscribe("orders", CancellationToken::new(), slow_opts)?;

    tokio::spawn(async move {
        while let Some(msg) = fast.recv().await {
            tracing::info!(seq = msg.seq, "fast consumer received");
        }
    });

    for i in 0..5 {
        let payload = format!("order-{i}");
        let ack = bus.publish("orders", payload.into_bytes())?;
        tracing::info!(enqueued = ack.enqueued, subscribers = ack.subscribers, "published");
    }

    // The slow consumer never reads, so its single-slot inbox fills and
    // the rest are counted as drops rather than stalling the bus.
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Some(msg) = slow.recv().await {
        tracing::info!(seq = msg.seq, "slow consumer finally read one message");
    }

    let stats = bus.stats();
    tracing::info!(
        open = stats.open,
        topics = stats.topics,
        subscribers = stats.subscribers,
        "bus stats"
    );
    if let Some(topic_stats) = stats.per_topic.get("orders") {
        tracing::info!(
            delivered = topic_stats.counters.delivered,
            dropped = topic_stats.counters.dropped,
            "orders topic counters"
        );
    }

    fast_cancel.cancel();
    bus.close().await?;
    Ok(())
}
