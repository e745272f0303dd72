//! In-memory message bus.
//!
//! `MemoryBroker` plays the role of the shared pub/sub server; every shard
//! gets its own `MemoryBus` connection from it. Used by tests, by the
//! simulation binary and by deployments that run several shards inside one
//! process.
//!
//! The broker can be told to misbehave the way a real bus does:
//!   - **Unavailable**: `ping` and `publish` fail for every connection
//!   - **Redelivery**: each publish is delivered N extra times

use super::{BusMessage, BusReceiver, MessageBus};
use crate::types::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

// =============================================================================
// Subscriber Management
// =============================================================================

/// One registered subscription.
#[derive(Debug)]
struct Subscriber {
    connection_id: u64,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// Statistics about broker usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BrokerStats {
    pub messages_published: u64,
    pub deliveries: u64,
    pub failed_publishes: u64,
    pub active_subscriptions: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// channel -> subscribers
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    stats: RwLock<BrokerStats>,
    unavailable: AtomicBool,
    extra_deliveries: AtomicU32,
    next_connection: AtomicU64,
}

// =============================================================================
// MemoryBroker - shared hub
// =============================================================================

/// Shared in-process pub/sub hub.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> MemoryBus {
        let connection_id = self.state.next_connection.fetch_add(1, Ordering::Relaxed);
        MemoryBus {
            state: self.state.clone(),
            connection_id,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate an outage: while unavailable, `ping` and `publish` fail.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
        tracing::debug!(available, "memory_broker_availability_changed");
    }

    /// Deliver every published message `extra` additional times.
    pub fn set_redelivery(&self, extra: u32) {
        self.state.extra_deliveries.store(extra, Ordering::SeqCst);
    }

    /// Get current broker statistics.
    pub async fn get_stats(&self) -> BrokerStats {
        self.state.stats.read().await.clone()
    }
}

// =============================================================================
// MemoryBus - one connection
// =============================================================================

/// A single connection to a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryBus {
    state: Arc<BrokerState>,
    connection_id: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryBus {
    fn check_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport("connection closed"));
        }
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(Error::transport("broker unavailable"));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn ping(&self) -> Result<()> {
        self.check_usable()
    }

    /// Fan out to every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        if let Err(e) = self.check_usable() {
            self.state.stats.write().await.failed_publishes += 1;
            return Err(e);
        }

        let copies = 1 + self.state.extra_deliveries.load(Ordering::SeqCst) as u64;
        let mut subscribers = self.state.subscribers.write().await;

        // Receivers dropped without unsubscribing (e.g. a gateway that was
        // never cleaned up) are pruned here.
        let mut pruned = false;
        if let Some(subs) = subscribers.get_mut(channel) {
            let before = subs.len();
            subs.retain(|s| !s.tx.is_closed());
            pruned = subs.len() != before;
            if subs.is_empty() {
                subscribers.remove(channel);
            }
        }

        let mut delivered = 0u64;
        for subscriber in subscribers.get(channel).into_iter().flatten() {
            for _ in 0..copies {
                let message = BusMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                };
                if subscriber.tx.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }
        let active = count_active(&subscribers);
        drop(subscribers);

        let mut stats = self.state.stats.write().await;
        stats.messages_published += 1;
        stats.deliveries += delivered;
        if pruned {
            stats.active_subscriptions = active;
        }

        tracing::trace!(channel, delivered, "memory_bus_published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusReceiver> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport("connection closed"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.state.subscribers.write().await;
        subscribers
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                connection_id: self.connection_id,
                tx,
            });

        let active = count_active(&subscribers);
        drop(subscribers);
        self.state.stats.write().await.active_subscriptions = active;

        tracing::debug!(channel, connection = self.connection_id, "memory_bus_subscribed");
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut subscribers = self.state.subscribers.write().await;
        if let Some(subs) = subscribers.get_mut(channel) {
            subs.retain(|s| s.connection_id != self.connection_id);
            if subs.is_empty() {
                subscribers.remove(channel);
            }
        }

        let active = count_active(&subscribers);
        drop(subscribers);
        self.state.stats.write().await.active_subscriptions = active;

        tracing::debug!(channel, connection = self.connection_id, "memory_bus_unsubscribed");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut subscribers = self.state.subscribers.write().await;
        for subs in subscribers.values_mut() {
            subs.retain(|s| s.connection_id != self.connection_id);
        }
        subscribers.retain(|_, subs| !subs.is_empty());

        let active = count_active(&subscribers);
        drop(subscribers);
        self.state.stats.write().await.active_subscriptions = active;

        tracing::debug!(connection = self.connection_id, "memory_bus_closed");
        Ok(())
    }
}

fn count_active(subscribers: &HashMap<String, Vec<Subscriber>>) -> usize {
    subscribers.values().map(Vec::len).sum()
}

// =============================================================================
// Tests
// =============================================================================
