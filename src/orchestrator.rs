//! Shard orchestrator: wires partitioning, health monitoring and IPC.
//!
//! One orchestrator runs per shard process. It owns the local gateway and
//! health monitor, both sharing the injected bus, and publishes lifecycle
//! events (`Initialized`, `ShardDead`, `Shutdown`) on a single channel.
//!
//! Health reports travel between processes as broadcasts of
//! [`HEALTH_REPORT_EVENT`], so every process keeps its own view of the whole
//! shard set without a central authority.

use crate::events::{EventEmitter, ShardEvent};
use crate::health::{
    HealthMonitor, HealthUpdate, ShardDescriptor, SystemHealthSnapshot,
};
use crate::ipc::{ConnectionState, ShardGateway};
use crate::partition;
use crate::transport::MessageBus;
use crate::types::{Config, Error, Result, ShardId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Broadcast event carrying a [`HealthReport`] between processes.
pub const HEALTH_REPORT_EVENT: &str = "shard:health";

/// Health update addressed to a specific shard, as sent over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub shard_id: ShardId,
    #[serde(flatten)]
    pub update: HealthUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopped,
}

/// Per-process entry point for the coordination layer.
pub struct ShardOrchestrator {
    config: Config,
    shard_id: ShardId,
    gateway: ShardGateway,
    monitor: HealthMonitor,
    events: EventEmitter,
    phase: Phase,
}

impl fmt::Debug for ShardOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardOrchestrator")
            .field("shard_id", &self.shard_id)
            .field("phase", &self.phase)
            .field("gateway", &self.gateway)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl ShardOrchestrator {
    pub fn new(config: Config, shard_id: ShardId, bus: Arc<dyn MessageBus>) -> Result<Self> {
        config.validate()?;
        let events = EventEmitter::new();
        let gateway = ShardGateway::new(shard_id, config.ipc.clone(), bus.clone());
        let monitor = HealthMonitor::new(
            &config.sharding,
            &config.ipc,
            shard_id,
            bus,
            events.clone(),
        );

        Ok(Self {
            config,
            shard_id,
            gateway,
            monitor,
            events,
            phase: Phase::Created,
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Shard count in use (explicit or derived from the workload size).
    pub fn total_shards(&self) -> u32 {
        self.config.sharding.resolved_total_shards()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gateway(&self) -> &ShardGateway {
        &self.gateway
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect the gateway, start the sweep and emit `Initialized`.
    ///
    /// A transport that fails its probe leaves the gateway disconnected but
    /// still starts monitoring.
    pub async fn initialize(&mut self) -> Result<ConnectionState> {
        match self.phase {
            Phase::Stopped => {
                return Err(Error::validation(format!(
                    "orchestrator for shard {} has been shut down",
                    self.shard_id
                )))
            }
            Phase::Running => return Ok(self.gateway.state()),
            Phase::Created => {}
        }

        let reporter = self.monitor.reporter();
        self.gateway
            .register_handler(HEALTH_REPORT_EVENT, move |payload: Value, _sender| {
                let reporter = reporter.clone();
                async move {
                    let report: HealthReport = serde_json::from_value(payload)?;
                    let descriptor = reporter.update_health(report.shard_id, report.update).await?;
                    Ok::<_, Error>(serde_json::to_value(descriptor.status)?)
                }
            })
            .await;

        let connection = self.gateway.initialize().await?;
        let total_shards = self.total_shards();
        if total_shards == 0 {
            tracing::warn!(shard = %self.shard_id, "no_shard_count_configured");
        }
        self.monitor.start_monitoring(total_shards).await;
        self.phase = Phase::Running;

        tracing::info!(
            shard = %self.shard_id,
            total_shards,
            connection = ?connection,
            "orchestrator_initialized"
        );
        self.events.emit(ShardEvent::Initialized {
            shard_id: self.shard_id,
            total_shards,
            connected: connection == ConnectionState::Connected,
        });
        Ok(connection)
    }

    /// Stop the sweep, clean up the gateway and emit `Shutdown`. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.monitor.stop();
        self.gateway.cleanup().await;
        self.phase = Phase::Stopped;

        tracing::info!(shard = %self.shard_id, "orchestrator_shutdown");
        self.events.emit(ShardEvent::Shutdown {
            shard_id: self.shard_id,
        });
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ShardEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Routing & messaging
    // =========================================================================

    /// Shard owning `key` under the configured shard count.
    pub fn shard_for(&self, key: u64) -> ShardId {
        partition::shard_for(key, self.total_shards())
    }

    pub fn shard_for_key(&self, key: &str) -> ShardId {
        partition::shard_for_key(key, self.total_shards())
    }

    pub async fn register_handler<F, Fut, E>(&self, event: &str, handler: F)
    where
        F: Fn(Value, ShardId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, E>> + Send + 'static,
        E: fmt::Display,
    {
        self.gateway.register_handler(event, handler).await;
    }

    pub async fn request(&self, target: ShardId, event: &str, payload: Value) -> Result<Value> {
        self.gateway.request(target, event, payload).await
    }

    /// Send `event` to every shard, this one included.
    pub async fn broadcast(&self, event: &str, data: Value) -> Result<()> {
        self.gateway.broadcast(event, data).await
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Record a health report locally.
    pub async fn update_health(
        &self,
        shard_id: ShardId,
        update: HealthUpdate,
    ) -> Result<ShardDescriptor> {
        self.monitor.update_health(shard_id, update).await
    }

    /// Record this shard's health locally and share it with every process.
    pub async fn report_health(&self, update: HealthUpdate) -> Result<ShardDescriptor> {
        let descriptor = self
            .monitor
            .update_health(self.shard_id, update.clone())
            .await?;
        let report = HealthReport {
            shard_id: self.shard_id,
            update,
        };
        self.gateway
            .broadcast(HEALTH_REPORT_EVENT, serde_json::to_value(&report)?)
            .await?;
        Ok(descriptor)
    }

    pub async fn system_health(&self) -> SystemHealthSnapshot {
        self.monitor.system_health().await
    }

    pub async fn shard(&self, shard_id: ShardId) -> Option<ShardDescriptor> {
        self.monitor.shard(shard_id).await
    }

    pub async fn shards(&self) -> Vec<ShardDescriptor> {
        self.monitor.shards().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ShardStatus, SystemStatus};
    use crate::transport::MemoryBroker;

    fn config(total_shards: u32) -> Config {
        let mut config = Config::default();
        config.sharding.total_shards = total_shards;
        config
    }

    #[tokio::test]
    async fn test_initialize_emits_event_and_seeds_registry() {
        let broker = MemoryBroker::new();
        let mut orchestrator =
            ShardOrchestrator::new(config(4), ShardId::new(0), Arc::new(broker.connect())).unwrap();
        let mut events = orchestrator.subscribe_events();

        let state = orchestrator.initialize().await.unwrap();
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(
            events.recv().await.unwrap(),
            ShardEvent::Initialized {
                shard_id: ShardId::new(0),
                total_shards: 4,
                connected: true,
            }
        );

        let health = orchestrator.system_health().await;
        assert_eq!(health.total_shards, 4);
        assert_eq!(health.status, SystemStatus::Critical);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_final() {
        let broker = MemoryBroker::new();
        let mut orchestrator =
            ShardOrchestrator::new(config(1), ShardId::new(0), Arc::new(broker.connect())).unwrap();
        let mut events = orchestrator.subscribe_events();
        orchestrator.initialize().await.unwrap();
        let _ = events.recv().await;

        orchestrator.shutdown().await;
        orchestrator.shutdown().await;
        assert_eq!(
            events.recv().await.unwrap(),
            ShardEvent::Shutdown {
                shard_id: ShardId::new(0)
            }
        );
        assert!(events.try_recv().is_err());
        assert!(orchestrator.initialize().await.is_err());
        assert!(!orchestrator.monitor().is_running());
    }

    #[tokio::test]
    async fn test_unavailable_bus_still_monitors() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let mut orchestrator =
            ShardOrchestrator::new(config(2), ShardId::new(1), Arc::new(broker.connect())).unwrap();

        assert_eq!(
            orchestrator.initialize().await.unwrap(),
            ConnectionState::Disconnected
        );
        assert!(orchestrator.monitor().is_running());
        orchestrator
            .update_health(ShardId::new(1), HealthUpdate::ready(1, 1))
            .await
            .unwrap();
        assert_eq!(orchestrator.system_health().await.ready_shards, 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_report_health_reaches_local_registry() {
        let broker = MemoryBroker::new();
        let mut orchestrator =
            ShardOrchestrator::new(config(2), ShardId::new(1), Arc::new(broker.connect())).unwrap();
        orchestrator.initialize().await.unwrap();

        let descriptor = orchestrator
            .report_health(HealthUpdate::ready(3, 30))
            .await
            .unwrap();
        assert_eq!(descriptor.status, ShardStatus::Ready);
        assert_eq!(orchestrator.system_health().await.total_members, 30);
        orchestrator.shutdown().await;
    }

    #[test]
    fn test_routing_uses_configured_total() {
        let broker = MemoryBroker::new();
        let orchestrator =
            ShardOrchestrator::new(config(10), ShardId::new(0), Arc::new(broker.connect())).unwrap();
        assert_eq!(
            orchestrator.shard_for(175928847299117063),
            partition::shard_for(175928847299117063, 10)
        );
        assert_eq!(orchestrator.total_shards(), 10);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let broker = MemoryBroker::new();
        let mut config = config(1);
        config.ipc.channel_prefix.clear();
        assert!(ShardOrchestrator::new(config, ShardId::new(0), Arc::new(broker.connect())).is_err());
    }

    #[test]
    fn test_health_report_wire_shape() {
        let report = HealthReport {
            shard_id: ShardId::new(2),
            update: HealthUpdate::ready(4, 40),
        };
        let wire = serde_json::to_value(&report).unwrap();
        assert_eq!(wire["shard_id"], 2);
        assert_eq!(wire["status"], "ready");
        assert_eq!(wire["connection_groups"], 4);
        assert_eq!(wire["members"], 40);
    }
}
