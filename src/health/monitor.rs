//! Background liveness sweep.
//!
//! `HealthMonitor` owns the shard registry behind a lock and runs the sweep
//! on a spawned task. Shard runtimes push reports through `update_health`;
//! nothing else tells the monitor a shard is alive.

use super::registry::{
    HealthUpdate, ShardDescriptor, ShardRegistry, SystemHealthSnapshot,
};
use crate::events::{EventEmitter, ShardEvent};
use crate::ipc::Envelope;
use crate::transport::MessageBus;
use crate::types::{IpcConfig, Result, ShardId, ShardingConfig};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Cloneable handle for pushing health reports into a monitor's registry.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    registry: Arc<RwLock<ShardRegistry>>,
}

impl HealthReporter {
    /// Merge a health report from a shard runtime.
    pub async fn update_health(
        &self,
        shard_id: ShardId,
        update: HealthUpdate,
    ) -> Result<ShardDescriptor> {
        let mut registry = self.registry.write().await;
        let descriptor = registry.update(shard_id, update, Instant::now())?;
        Ok(descriptor.clone())
    }
}

/// Periodic shard liveness monitor.
pub struct HealthMonitor {
    registry: Arc<RwLock<ShardRegistry>>,
    check_interval: Duration,
    events: EventEmitter,
    bus: Arc<dyn MessageBus>,
    origin: ShardId,
    broadcast_channel: String,
    sweeps: Arc<AtomicU64>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("origin", &self.origin)
            .field("check_interval", &self.check_interval)
            .field("broadcast_channel", &self.broadcast_channel)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(
        sharding: &ShardingConfig,
        ipc: &IpcConfig,
        origin: ShardId,
        bus: Arc<dyn MessageBus>,
        events: EventEmitter,
    ) -> Self {
        Self {
            registry: Arc::new(RwLock::new(ShardRegistry::new(sharding.shard_timeout))),
            check_interval: sharding.health_check_interval,
            events,
            bus,
            origin,
            broadcast_channel: ipc.broadcast_channel(),
            sweeps: Arc::new(AtomicU64::new(0)),
            cancel: None,
            task: None,
        }
    }

    /// Seed `total_shards` descriptors and start the sweep loop.
    ///
    /// Calling it again replaces the table and restarts the loop.
    pub async fn start_monitoring(&mut self, total_shards: u32) {
        self.stop();
        self.registry
            .write()
            .await
            .seed(total_shards, Instant::now());

        let registry = self.registry.clone();
        let events = self.events.clone();
        let sweeps = self.sweeps.clone();
        let check_interval = self.check_interval;
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        tracing::info!(
            total_shards,
            interval_ms = check_interval.as_millis() as u64,
            "health_monitor_started"
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_sweep(&registry, &events, &sweeps).await;
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("health_monitor_stopped");
                        break;
                    }
                }
            }
        }));
    }

    /// Run one sweep and emit a `ShardDead` event per newly dead shard.
    async fn run_sweep(
        registry: &Arc<RwLock<ShardRegistry>>,
        events: &EventEmitter,
        sweeps: &AtomicU64,
    ) -> usize {
        let (newly_dead, timeout) = {
            let mut registry = registry.write().await;
            (registry.sweep(Instant::now()), registry.shard_timeout())
        };
        sweeps.fetch_add(1, Ordering::Relaxed);

        for shard_id in &newly_dead {
            tracing::warn!(
                shard = %shard_id,
                timeout_ms = timeout.as_millis() as u64,
                "shard_dead"
            );
            events.emit(ShardEvent::ShardDead {
                shard_id: *shard_id,
            });
        }
        newly_dead.len()
    }

    /// Run a sweep immediately, outside the timer.
    pub async fn sweep_now(&self) -> usize {
        Self::run_sweep(&self.registry, &self.events, &self.sweeps).await
    }

    /// Sweeps completed since this monitor was created.
    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Stop the sweep loop. The registry keeps its last state.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            // The loop exits on cancellation; abort covers a task that has
            // not been polled yet.
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Merge a health report from a shard runtime.
    pub async fn update_health(
        &self,
        shard_id: ShardId,
        update: HealthUpdate,
    ) -> Result<ShardDescriptor> {
        self.reporter().update_health(shard_id, update).await
    }

    pub fn reporter(&self) -> HealthReporter {
        HealthReporter {
            registry: self.registry.clone(),
        }
    }

    pub async fn system_health(&self) -> SystemHealthSnapshot {
        self.registry.read().await.snapshot()
    }

    pub async fn shard(&self, shard_id: ShardId) -> Option<ShardDescriptor> {
        self.registry.read().await.get(shard_id).cloned()
    }

    pub async fn shards(&self) -> Vec<ShardDescriptor> {
        self.registry.read().await.descriptors().to_vec()
    }

    /// Publish a broadcast envelope on the system channel. Fire-and-forget.
    pub async fn broadcast(&self, event: &str, data: Value) -> Result<()> {
        let envelope = Envelope::broadcast(self.origin, event, data);
        let payload = envelope.encode()?;
        self.bus.publish(&self.broadcast_channel, payload).await?;
        tracing::debug!(event, id = %envelope.id, "system_broadcast_published");
        Ok(())
    }

    /// Receiver for lifecycle events emitted by this monitor.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ShardEvent> {
        self.events.subscribe()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ShardStatus, SystemStatus};
    use crate::transport::{MemoryBroker, MessageBus};
    use tokio::sync::broadcast::error::TryRecvError;

    fn monitor(timeout_ms: u64, interval_ms: u64) -> (HealthMonitor, MemoryBroker) {
        let broker = MemoryBroker::new();
        let sharding = ShardingConfig {
            shard_timeout: Duration::from_millis(timeout_ms),
            health_check_interval: Duration::from_millis(interval_ms),
            ..ShardingConfig::default()
        };
        let monitor = HealthMonitor::new(
            &sharding,
            &IpcConfig::default(),
            ShardId::new(0),
            Arc::new(broker.connect()),
            EventEmitter::new(),
        );
        (monitor, broker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_shard_notified_exactly_once() {
        let (mut monitor, _broker) = monitor(100, 50);
        let mut events = monitor.subscribe();
        monitor.start_monitoring(2).await;

        // Shard 1 keeps reporting; shard 0 goes silent.
        for _ in 0..6 {
            monitor
                .update_health(ShardId::new(1), HealthUpdate::ready(1, 10))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
        }

        assert_eq!(
            events.try_recv().unwrap(),
            ShardEvent::ShardDead {
                shard_id: ShardId::new(0)
            }
        );
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        // Several more sweeps must not repeat the notification.
        monitor
            .update_health(ShardId::new(1), HealthUpdate::ready(1, 10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        let shard = monitor.shard(ShardId::new(0)).await.unwrap();
        assert_eq!(shard.status, ShardStatus::Dead);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_detected_within_one_interval_of_threshold() {
        let (mut monitor, _broker) = monitor(100, 50);
        let mut events = monitor.subscribe();
        monitor.start_monitoring(1).await;

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        // Threshold crossed at 100ms; the sweep at 150ms catches it.
        tokio::time::sleep(Duration::from_millis(61)).await;
        assert!(matches!(
            events.try_recv(),
            Ok(ShardEvent::ShardDead { .. })
        ));
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_sweep() {
        let (mut monitor, _broker) = monitor(100, 50);
        let mut events = monitor.subscribe();
        monitor.start_monitoring(1).await;
        assert!(monitor.is_running());

        monitor.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_system_health_through_monitor() {
        let (mut monitor, _broker) = monitor(60_000, 30_000);
        monitor.start_monitoring(10).await;
        for id in 0..10 {
            monitor
                .update_health(ShardId::new(id), HealthUpdate::ready(1, 1))
                .await
                .unwrap();
        }

        let health = monitor.system_health().await;
        assert_eq!(health.status, SystemStatus::Healthy);
        assert_eq!(health.ready_shards, 10);
        assert_eq!(health.total_shards, 10);
        assert_eq!(monitor.shards().await.len(), 10);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_sweep_now_without_timer() {
        let (mut monitor, _broker) = monitor(60_000, 30_000);
        monitor.start_monitoring(3).await;
        assert_eq!(monitor.sweep_now().await, 0);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_broadcast_publishes_on_system_channel() {
        let (monitor, broker) = monitor(60_000, 30_000);
        let listener = broker.connect();
        let mut rx = listener
            .subscribe(&IpcConfig::default().broadcast_channel())
            .await
            .unwrap();

        monitor
            .broadcast("maintenance", serde_json::json!({"in": "5m"}))
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        let envelope = Envelope::decode(&message.payload).unwrap();
        assert_eq!(envelope.event, "maintenance");
        assert_eq!(envelope.sender, ShardId::new(0));
        assert_eq!(envelope.data, Some(serde_json::json!({"in": "5m"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_table_and_sweep_task() {
        let (mut monitor, _broker) = monitor(60_000, 50);
        monitor.start_monitoring(2).await;
        monitor
            .update_health(ShardId::new(1), HealthUpdate::ready(1, 1))
            .await
            .unwrap();

        monitor.start_monitoring(5).await;
        assert!(monitor.is_running());
        let shards = monitor.shards().await;
        assert_eq!(shards.len(), 5);
        assert!(shards.iter().all(|s| s.status == ShardStatus::Spawning));

        // One loop ticking every 50ms; a leftover loop would double this.
        let before = monitor.sweep_count();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let swept = monitor.sweep_count() - before;
        assert!((10..=12).contains(&swept), "swept {swept} times");
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_dead_still_notified_by_sweep() {
        let (mut monitor, _broker) = monitor(100, 50);
        let mut events = monitor.subscribe();
        monitor.start_monitoring(1).await;

        let rejected = monitor
            .update_health(ShardId::new(0), HealthUpdate::status(ShardStatus::Dead))
            .await;
        assert!(matches!(rejected, Err(crate::types::Error::Validation(_))));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(
            events.try_recv().unwrap(),
            ShardEvent::ShardDead {
                shard_id: ShardId::new(0)
            }
        );
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        monitor.stop();
    }
}
