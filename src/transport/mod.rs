//! Message bus boundary.
//!
//! The coordination layer only needs a handful of things from a bus: a
//! liveness probe, publish, subscribe/unsubscribe and close. Delivery is
//! at-least-once, unordered across channels and carries no application-level
//! acknowledgment, so everything above this trait dedupes and times out on
//! its own.

mod memory;

pub use memory::{BrokerStats, MemoryBroker, MemoryBus};

use crate::types::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One delivery from the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Receiving end of a channel subscription. Closed when the bus drops the
/// subscription (close or broker shutdown).
pub type BusReceiver = mpsc::UnboundedReceiver<BusMessage>;

/// Publish/subscribe transport shared by every shard.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Liveness probe. Errors mean the transport is unusable right now.
    async fn ping(&self) -> Result<()>;

    /// Publish `payload` on `channel`. Success only means the bus accepted it.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to `channel`. Every delivery, including redeliveries,
    /// arrives on the returned receiver.
    async fn subscribe(&self, channel: &str) -> Result<BusReceiver>;

    /// Drop this connection's subscriptions to `channel`. Their receivers end.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Release the connection and drop all subscriptions made through it.
    async fn close(&self) -> Result<()>;
}
