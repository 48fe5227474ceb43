//! Error types for bus operations

use thiserror::Error;

/// Unified error type for bus operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus is not open
    #[error("bus is closed")]
    Closed,

    /// Topic name is empty or whitespace-only
    #[error("invalid topic name")]
    InvalidTopic,

    /// The topic's ingress queue is at capacity
    #[error("topic queue is full")]
    QueueFull,

    /// The registry is at its configured topic cap
    #[error("max topics exceeded")]
    MaxTopicsExceeded,

    /// The topic is at its configured subscriber cap
    #[error("max subscribers per topic exceeded")]
    MaxSubscribersExceeded,

    /// No id generator was configured at construction
    #[error("id generator not set")]
    IdGeneratorMissing,
}
