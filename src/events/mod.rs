//! Lifecycle events emitted by the health monitor and the orchestrator.
//!
//! Events fan out over a `tokio::sync::broadcast` channel. Consumers call
//! `subscribe()` and drain the receiver; a lagging receiver loses the oldest
//! events rather than slowing the emitter down.

use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observable happened to the shard set or the local process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShardEvent {
    /// The orchestrator finished initialising.
    Initialized {
        shard_id: ShardId,
        total_shards: u32,
        connected: bool,
    },
    /// A shard stopped reporting health within the timeout.
    ShardDead { shard_id: ShardId },
    /// The orchestrator shut down.
    Shutdown { shard_id: ShardId },
}

/// Sending half shared by every component that emits lifecycle events.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<ShardEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event. Returns how many receivers saw it.
    pub fn emit(&self, event: ShardEvent) -> usize {
        tracing::debug!(?event, "shard_event");
        // No receivers is fine: nobody is listening yet.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShardEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
