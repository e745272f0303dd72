//! Per-shard IPC gateway.
//!
//! Request/response and broadcast on top of a bus that only offers
//! at-least-once, unordered, fire-and-forget delivery:
//!   - **Requests** go to the target's private channel and are correlated by
//!     envelope id; each has its own timeout timer
//!   - **Responses** come back on the requester's private channel with the
//!     request id
//!   - **Broadcasts** go to the shared channel; every gateway (the sender
//!     included) runs its local handler
//!
//! Every incoming envelope passes the dedup cache first, so a redelivered
//! copy is dropped silently.

use super::dedup::DedupCache;
use super::envelope::{Envelope, MessageKind, ResponsePayload};
use super::router::{self, handler_fn, HandlerRegistry};
use crate::transport::{BusMessage, BusReceiver, MessageBus};
use crate::types::{Error, IpcConfig, MessageId, Result, ShardId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Transport state as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Snapshot of gateway bookkeeping and counters.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GatewayStats {
    pub pending_requests: usize,
    pub registered_handlers: usize,
    pub dedup_entries: usize,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub requests_answered: u64,
    pub timeouts: u64,
    pub broadcasts_sent: u64,
    pub broadcasts_received: u64,
    pub duplicates_dropped: u64,
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    requests_answered: AtomicU64,
    timeouts: AtomicU64,
    broadcasts_sent: AtomicU64,
    broadcasts_received: AtomicU64,
    duplicates_dropped: AtomicU64,
    handler_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Outstanding request awaiting its response.
#[derive(Debug)]
struct PendingRequest {
    event: String,
    target: ShardId,
    tx: oneshot::Sender<Result<Value>>,
    timer: JoinHandle<()>,
}

struct GatewayInner {
    shard_id: ShardId,
    config: IpcConfig,
    bus: Arc<dyn MessageBus>,
    connected: AtomicBool,
    released: AtomicBool,
    handlers: RwLock<HandlerRegistry>,
    pending: Mutex<HashMap<MessageId, PendingRequest>>,
    dedup: Mutex<DedupCache>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

/// IPC gateway owned by one shard process. Cheap to clone.
#[derive(Clone)]
pub struct ShardGateway {
    inner: Arc<GatewayInner>,
}

impl fmt::Debug for ShardGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardGateway")
            .field("shard_id", &self.inner.shard_id)
            .field("state", &self.state())
            .field("channel_prefix", &self.inner.config.channel_prefix)
            .finish_non_exhaustive()
    }
}

impl ShardGateway {
    pub fn new(shard_id: ShardId, config: IpcConfig, bus: Arc<dyn MessageBus>) -> Self {
        let dedup = DedupCache::new(config.dedup_capacity, config.dedup_ttl);
        Self {
            inner: Arc::new(GatewayInner {
                shard_id,
                config,
                bus,
                connected: AtomicBool::new(false),
                released: AtomicBool::new(false),
                handlers: RwLock::new(HandlerRegistry::new()),
                pending: Mutex::new(HashMap::new()),
                dedup: Mutex::new(dedup),
                listeners: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.inner.shard_id
    }

    pub fn state(&self) -> ConnectionState {
        if self.inner.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Probe the transport and subscribe to this shard's channels.
    ///
    /// A failed probe is not an error: the gateway comes up in degraded
    /// `Disconnected` mode. Only a gateway that was already cleaned up errors.
    pub async fn initialize(&self) -> Result<ConnectionState> {
        let inner = &self.inner;
        if inner.released.load(Ordering::SeqCst) {
            return Err(Error::not_connected(format!(
                "gateway for shard {} has been cleaned up",
                inner.shard_id
            )));
        }
        if self.is_connected() {
            return Ok(ConnectionState::Connected);
        }

        if let Err(e) = inner.bus.ping().await {
            tracing::warn!(shard = %inner.shard_id, error = %e, "gateway_probe_failed");
            inner.connected.store(false, Ordering::SeqCst);
            return Ok(ConnectionState::Disconnected);
        }

        let mut listeners = inner.listeners.lock().await;
        if listeners.is_empty() {
            let channels = [
                inner.config.shard_channel(inner.shard_id),
                inner.config.broadcast_channel(),
            ];
            for (subscribed, channel) in channels.iter().enumerate() {
                match inner.bus.subscribe(channel).await {
                    Ok(rx) => {
                        let weak = Arc::downgrade(inner);
                        listeners.push(tokio::spawn(listen(weak, rx)));
                    }
                    Err(e) => {
                        tracing::warn!(
                            shard = %inner.shard_id,
                            channel = %channel,
                            error = %e,
                            "gateway_subscribe_failed"
                        );
                        for listener in listeners.drain(..) {
                            listener.abort();
                        }
                        // Subscriptions taken before the failure are released
                        // so a later initialize starts from a clean bus.
                        for earlier in &channels[..subscribed] {
                            if let Err(e) = inner.bus.unsubscribe(earlier).await {
                                tracing::warn!(
                                    shard = %inner.shard_id,
                                    channel = %earlier,
                                    error = %e,
                                    "gateway_unsubscribe_failed"
                                );
                            }
                        }
                        return Ok(ConnectionState::Disconnected);
                    }
                }
            }
        }
        drop(listeners);

        inner.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            shard = %inner.shard_id,
            channel = %inner.config.shard_channel(inner.shard_id),
            "gateway_connected"
        );
        Ok(ConnectionState::Connected)
    }

    /// Tear everything down: listeners, pending requests, dedup cache and
    /// the transport connection. Safe to call more than once and before
    /// (or without) a successful `initialize`.
    pub async fn cleanup(&self) {
        let inner = &self.inner;
        inner.connected.store(false, Ordering::SeqCst);

        for listener in inner.listeners.lock().await.drain(..) {
            listener.abort();
        }

        let drained: Vec<(MessageId, PendingRequest)> =
            inner.pending.lock().await.drain().collect();
        let cancelled = drained.len();
        for (id, pending) in drained {
            pending.timer.abort();
            let _ = pending.tx.send(Err(Error::cancelled(format!(
                "request {} '{}' to shard {} cancelled by gateway cleanup",
                id, pending.event, pending.target
            ))));
        }

        inner.dedup.lock().await.clear();

        if !inner.released.swap(true, Ordering::SeqCst) {
            if let Err(e) = inner.bus.close().await {
                tracing::warn!(shard = %inner.shard_id, error = %e, "gateway_close_failed");
            }
            tracing::info!(shard = %inner.shard_id, cancelled, "gateway_cleaned_up");
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Register the handler for `event`, replacing any previous one.
    pub async fn register_handler<F, Fut, E>(&self, event: &str, handler: F)
    where
        F: Fn(Value, ShardId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, E>> + Send + 'static,
        E: fmt::Display,
    {
        let replaced = self
            .inner
            .handlers
            .write()
            .await
            .insert(event, handler_fn(handler));
        tracing::debug!(
            shard = %self.inner.shard_id,
            event,
            replaced = replaced.is_some(),
            "handler_registered"
        );
    }

    pub async fn unregister_handler(&self, event: &str) -> bool {
        self.inner.handlers.write().await.remove(event).is_some()
    }

    // =========================================================================
    // Request/Response
    // =========================================================================

    /// Send `event` to `target` and wait for its response, using the
    /// configured default timeout.
    pub async fn request(&self, target: ShardId, event: &str, payload: Value) -> Result<Value> {
        let timeout = self.inner.config.default_request_timeout;
        self.request_with_timeout(target, event, payload, timeout).await
    }

    /// Send `event` to `target` and wait at most `timeout` for the response.
    ///
    /// Never retries. Dropping the returned future does not cancel the
    /// request; its pending slot is freed by the timer.
    pub async fn request_with_timeout(
        &self,
        target: ShardId,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let inner = &self.inner;
        if !self.is_connected() {
            return Err(Error::not_connected(format!(
                "cannot send '{}' to shard {}: gateway for shard {} is disconnected",
                event, target, inner.shard_id
            )));
        }

        let envelope = Envelope::request(inner.shard_id, target, event, payload);
        let bytes = envelope.encode()?;
        let id = envelope.id.clone();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = inner.pending.lock().await;
            let timer = inner.spawn_timeout(id.clone(), timeout);
            pending.insert(
                id.clone(),
                PendingRequest {
                    event: event.to_string(),
                    target,
                    tx,
                    timer,
                },
            );
        }

        let channel = inner.config.shard_channel(target);
        if let Err(e) = inner.publish(&channel, bytes).await {
            if let Some(pending) = inner.pending.lock().await.remove(&id) {
                pending.timer.abort();
            }
            return Err(e);
        }
        bump(&inner.counters.requests_sent);
        tracing::debug!(shard = %inner.shard_id, target = %target, event, id = %id, "request_sent");

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::cancelled(format!(
                "request '{}' to shard {} was dropped",
                event, target
            ))),
        }
    }

    // =========================================================================
    // Broadcast
    // =========================================================================

    /// Publish `event` to every shard, this one included. No acknowledgment.
    ///
    /// A no-op while disconnected.
    pub async fn broadcast(&self, event: &str, payload: Value) -> Result<()> {
        let inner = &self.inner;
        if !self.is_connected() {
            tracing::warn!(shard = %inner.shard_id, event, "broadcast_skipped_disconnected");
            return Ok(());
        }

        let envelope = Envelope::broadcast(inner.shard_id, event, payload);
        inner
            .publish(&inner.config.broadcast_channel(), envelope.encode()?)
            .await?;
        bump(&inner.counters.broadcasts_sent);
        tracing::debug!(shard = %inner.shard_id, event, id = %envelope.id, "broadcast_sent");
        Ok(())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    pub async fn stats(&self) -> GatewayStats {
        let inner = &self.inner;
        let c = &inner.counters;
        GatewayStats {
            pending_requests: inner.pending.lock().await.len(),
            registered_handlers: inner.handlers.read().await.len(),
            dedup_entries: inner.dedup.lock().await.len(),
            requests_sent: c.requests_sent.load(Ordering::Relaxed),
            responses_received: c.responses_received.load(Ordering::Relaxed),
            requests_answered: c.requests_answered.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            broadcasts_sent: c.broadcasts_sent.load(Ordering::Relaxed),
            broadcasts_received: c.broadcasts_received.load(Ordering::Relaxed),
            duplicates_dropped: c.duplicates_dropped.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Drain one subscription until it closes or the gateway is gone.
async fn listen(inner: Weak<GatewayInner>, mut rx: BusReceiver) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_message(message).await;
    }
}

impl GatewayInner {
    /// Publish; any failure flips the gateway to disconnected for good.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        match self.bus.publish(channel, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    tracing::error!(
                        shard = %self.shard_id,
                        channel,
                        error = %e,
                        "gateway_disconnected"
                    );
                }
                Err(match e {
                    Error::Transport(_) => e,
                    other => Error::transport(other.to_string()),
                })
            }
        }
    }

    /// Timer that frees the pending slot and fails the request at the deadline.
    fn spawn_timeout(self: &Arc<Self>, id: MessageId, timeout: Duration) -> JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = inner.pending.lock().await.remove(&id);
            if let Some(pending) = expired {
                bump(&inner.counters.timeouts);
                tracing::warn!(
                    shard = %inner.shard_id,
                    target = %pending.target,
                    event = %pending.event,
                    timeout_ms = timeout.as_millis() as u64,
                    "request_timeout"
                );
                let _ = pending.tx.send(Err(Error::timeout(format!(
                    "request '{}' to shard {} timed out after {}ms",
                    pending.event,
                    pending.target,
                    timeout.as_millis()
                ))));
            }
        })
    }

    async fn handle_message(self: &Arc<Self>, message: BusMessage) {
        let envelope = match Envelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    shard = %self.shard_id,
                    channel = %message.channel,
                    error = %e,
                    "envelope_decode_failed"
                );
                return;
            }
        };

        let fresh = self
            .dedup
            .lock()
            .await
            .check_and_insert(envelope.kind, &envelope.id, Instant::now());
        if !fresh {
            bump(&self.counters.duplicates_dropped);
            tracing::debug!(shard = %self.shard_id, id = %envelope.id, "duplicate_dropped");
            return;
        }

        match envelope.kind {
            MessageKind::Request => {
                let inner = self.clone();
                tokio::spawn(async move { inner.answer(envelope).await });
            }
            MessageKind::Response => self.resolve(envelope).await,
            MessageKind::Broadcast => {
                let inner = self.clone();
                tokio::spawn(async move { inner.deliver_broadcast(envelope).await });
            }
        }
    }

    /// Run the local handler for a request and publish the response.
    async fn answer(&self, request: Envelope) {
        let handler = self.handlers.read().await.get(&request.event);
        let payload = match handler {
            Some(handler) => {
                let data = request.data.clone().unwrap_or(Value::Null);
                router::invoke(handler, data, request.sender).await
            }
            None => {
                tracing::warn!(
                    shard = %self.shard_id,
                    event = %request.event,
                    from = %request.sender,
                    "no_handler_for_request"
                );
                ResponsePayload::handler_missing(&request.event)
            }
        };
        if !payload.success {
            bump(&self.counters.handler_failures);
        }

        let response = match Envelope::response_to(&request, self.shard_id, &payload)
            .and_then(|response| response.encode())
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(shard = %self.shard_id, id = %request.id, error = %e, "response_encode_failed");
                return;
            }
        };

        let channel = self.config.shard_channel(request.sender);
        match self.publish(&channel, response).await {
            Ok(()) => bump(&self.counters.requests_answered),
            Err(e) => tracing::warn!(
                shard = %self.shard_id,
                id = %request.id,
                error = %e,
                "response_publish_failed"
            ),
        }
    }

    /// Complete the pending request matching this response, if any.
    async fn resolve(&self, response: Envelope) {
        let pending = self.pending.lock().await.remove(&response.id);
        let Some(pending) = pending else {
            tracing::debug!(
                shard = %self.shard_id,
                id = %response.id,
                "response_without_pending_request"
            );
            return;
        };

        pending.timer.abort();
        bump(&self.counters.responses_received);
        let result = response
            .response_payload()
            .and_then(|payload| payload.into_result(&pending.event));
        let _ = pending.tx.send(result);
    }

    /// Run the local broadcast handler; failures stay in this process.
    async fn deliver_broadcast(&self, envelope: Envelope) {
        bump(&self.counters.broadcasts_received);
        let Some(handler) = self.handlers.read().await.get(&envelope.event) else {
            tracing::trace!(shard = %self.shard_id, event = %envelope.event, "broadcast_unhandled");
            return;
        };

        let data = envelope.data.clone().unwrap_or(Value::Null);
        let outcome = router::invoke(handler, data, envelope.sender).await;
        if !outcome.success {
            bump(&self.counters.handler_failures);
            tracing::warn!(
                shard = %self.shard_id,
                event = %envelope.event,
                from = %envelope.sender,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "broadcast_handler_failed"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
