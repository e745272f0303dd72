//! Shard descriptor table.
//!
//! Plain data structure; the monitor owns it behind a lock and drives the
//! sweep. Liveness is measured on the monotonic clock (`tokio::time::Instant`)
//! while the reported timestamps use wall-clock time.

use crate::types::{Error, Result, ShardId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle status of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Spawning,
    Ready,
    Disconnected,
    Dead,
}

/// Aggregate status across all shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Everything the registry knows about one shard.
#[derive(Debug, Clone, Serialize)]
pub struct ShardDescriptor {
    pub id: ShardId,
    pub status: ShardStatus,
    pub ready_at: Option<DateTime<Utc>>,
    pub connection_groups: u64,
    pub members: u64,
    pub last_health_check: DateTime<Utc>,
    #[serde(skip)]
    last_seen: Instant,
}

impl ShardDescriptor {
    fn spawning(id: ShardId, now: Instant) -> Self {
        Self {
            id,
            status: ShardStatus::Spawning,
            ready_at: None,
            connection_groups: 0,
            members: 0,
            last_health_check: Utc::now(),
            last_seen: now,
        }
    }

    /// Time since the last health report, measured at `now`.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Partial health report from a shard runtime. `None` fields are left as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthUpdate {
    #[serde(default)]
    pub status: Option<ShardStatus>,
    #[serde(default)]
    pub connection_groups: Option<u64>,
    #[serde(default)]
    pub members: Option<u64>,
}

impl HealthUpdate {
    pub fn status(status: ShardStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Shorthand for a ready shard reporting its load.
    pub fn ready(connection_groups: u64, members: u64) -> Self {
        Self {
            status: Some(ShardStatus::Ready),
            connection_groups: Some(connection_groups),
            members: Some(members),
        }
    }
}

/// Derived, read-only view of the whole shard set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemHealthSnapshot {
    pub status: SystemStatus,
    pub total_shards: u32,
    pub ready_shards: u32,
    /// Summed over ready shards only.
    pub total_connection_groups: u64,
    /// Summed over ready shards only.
    pub total_members: u64,
}

/// Table of shard descriptors indexed by shard id.
#[derive(Debug)]
pub struct ShardRegistry {
    shards: Vec<ShardDescriptor>,
    shard_timeout: Duration,
}

impl ShardRegistry {
    pub fn new(shard_timeout: Duration) -> Self {
        Self {
            shards: Vec::new(),
            shard_timeout,
        }
    }

    /// Replace the table with `total_shards` fresh `spawning` descriptors.
    pub fn seed(&mut self, total_shards: u32, now: Instant) {
        self.shards = (0..total_shards)
            .map(|id| ShardDescriptor::spawning(ShardId::new(id), now))
            .collect();
    }

    pub fn total_shards(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn shard_timeout(&self) -> Duration {
        self.shard_timeout
    }

    /// Merge a health report into the shard's descriptor (last write wins).
    ///
    /// Reports may not declare a shard dead (only the sweep does that) nor
    /// move a live shard back to `spawning`. A dead shard accepts any report.
    pub fn update(
        &mut self,
        shard_id: ShardId,
        update: HealthUpdate,
        now: Instant,
    ) -> Result<&ShardDescriptor> {
        let total = self.total_shards();
        let descriptor = self.shards.get_mut(shard_id.index()).ok_or_else(|| {
            Error::not_found(format!(
                "shard {} is not monitored (total_shards={})",
                shard_id, total
            ))
        })?;

        if let Some(status) = update.status {
            check_transition(shard_id, descriptor.status, status)?;
            if status == ShardStatus::Ready && descriptor.status != ShardStatus::Ready {
                descriptor.ready_at = Some(Utc::now());
            }
            if status != descriptor.status {
                tracing::info!(
                    shard = %shard_id,
                    from = ?descriptor.status,
                    to = ?status,
                    "shard_status_changed"
                );
            }
            descriptor.status = status;
        }
        if let Some(groups) = update.connection_groups {
            descriptor.connection_groups = groups;
        }
        if let Some(members) = update.members {
            descriptor.members = members;
        }
        descriptor.last_health_check = Utc::now();
        descriptor.last_seen = now;

        Ok(descriptor)
    }

    /// Mark every stale, not-yet-dead shard as dead.
    ///
    /// Returns the ids that transitioned during this call; a shard already
    /// dead is never returned again.
    pub fn sweep(&mut self, now: Instant) -> Vec<ShardId> {
        let timeout = self.shard_timeout;
        let mut newly_dead = Vec::new();
        for descriptor in &mut self.shards {
            if descriptor.status != ShardStatus::Dead && descriptor.silence(now) > timeout {
                descriptor.status = ShardStatus::Dead;
                newly_dead.push(descriptor.id);
            }
        }
        newly_dead
    }

    pub fn get(&self, shard_id: ShardId) -> Option<&ShardDescriptor> {
        self.shards.get(shard_id.index())
    }

    pub fn descriptors(&self) -> &[ShardDescriptor] {
        &self.shards
    }

    /// Aggregate health; only ready shards contribute capacity.
    pub fn snapshot(&self) -> SystemHealthSnapshot {
        let total_shards = self.total_shards();
        let ready: Vec<&ShardDescriptor> = self
            .shards
            .iter()
            .filter(|s| s.status == ShardStatus::Ready)
            .collect();
        let ready_shards = ready.len() as u32;

        let status = if ready_shards == total_shards {
            SystemStatus::Healthy
        } else if ready_shards == 0 {
            SystemStatus::Critical
        } else {
            SystemStatus::Degraded
        };

        SystemHealthSnapshot {
            status,
            total_shards,
            ready_shards,
            total_connection_groups: ready.iter().map(|s| s.connection_groups).sum(),
            total_members: ready.iter().map(|s| s.members).sum(),
        }
    }
}

fn check_transition(shard_id: ShardId, from: ShardStatus, to: ShardStatus) -> Result<()> {
    match (from, to) {
        (_, ShardStatus::Dead) => Err(Error::validation(format!(
            "shard {} cannot report itself dead; only the liveness sweep marks shards dead",
            shard_id
        ))),
        (ShardStatus::Ready | ShardStatus::Disconnected, ShardStatus::Spawning) => {
            Err(Error::validation(format!(
                "shard {} cannot move from {:?} back to Spawning",
                shard_id, from
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry(total: u32) -> (ShardRegistry, Instant) {
        let now = Instant::now();
        let mut registry = ShardRegistry::new(Duration::from_secs(60));
        registry.seed(total, now);
        (registry, now)
    }

    #[test]
    fn test_seed_marks_all_spawning() {
        let (registry, _) = registry(4);
        assert_eq!(registry.total_shards(), 4);
        assert!(registry
            .descriptors()
            .iter()
            .all(|s| s.status == ShardStatus::Spawning && s.ready_at.is_none()));
    }

    #[test]
    fn test_all_ready_is_healthy() {
        let (mut registry, now) = registry(10);
        for id in 0..10 {
            registry
                .update(ShardId::new(id), HealthUpdate::ready(2, 100), now)
                .unwrap();
        }

        assert_eq!(
            registry.snapshot(),
            SystemHealthSnapshot {
                status: SystemStatus::Healthy,
                total_shards: 10,
                ready_shards: 10,
                total_connection_groups: 20,
                total_members: 1000,
            }
        );
    }

    #[test]
    fn test_none_ready_is_critical() {
        let (registry, _) = registry(10);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.status, SystemStatus::Critical);
        assert_eq!(snapshot.ready_shards, 0);
    }

    #[test]
    fn test_partial_ready_is_degraded() {
        for ready in 1..10 {
            let (mut registry, now) = registry(10);
            for id in 0..ready {
                registry
                    .update(ShardId::new(id), HealthUpdate::ready(1, 1), now)
                    .unwrap();
            }
            let snapshot = registry.snapshot();
            assert_eq!(snapshot.status, SystemStatus::Degraded);
            assert_eq!(snapshot.ready_shards, ready);
        }
    }

    #[test]
    fn test_aggregates_skip_non_ready_shards() {
        let (mut registry, now) = registry(3);
        registry
            .update(ShardId::new(0), HealthUpdate::ready(5, 50), now)
            .unwrap();
        registry
            .update(ShardId::new(1), HealthUpdate::ready(7, 70), now)
            .unwrap();
        registry
            .update(
                ShardId::new(1),
                HealthUpdate::status(ShardStatus::Disconnected),
                now,
            )
            .unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.ready_shards, 1);
        assert_eq!(snapshot.total_connection_groups, 5);
        assert_eq!(snapshot.total_members, 50);
    }

    #[test]
    fn test_update_merges_partial_fields() {
        let (mut registry, now) = registry(1);
        let id = ShardId::new(0);
        registry.update(id, HealthUpdate::ready(3, 30), now).unwrap();
        registry
            .update(
                id,
                HealthUpdate {
                    members: Some(31),
                    ..HealthUpdate::default()
                },
                now,
            )
            .unwrap();

        let shard = registry.get(id).unwrap();
        assert_eq!(shard.status, ShardStatus::Ready);
        assert_eq!(shard.connection_groups, 3);
        assert_eq!(shard.members, 31);
    }

    #[test]
    fn test_ready_at_stamped_on_entering_ready() {
        let (mut registry, now) = registry(1);
        let id = ShardId::new(0);
        registry.update(id, HealthUpdate::ready(0, 0), now).unwrap();
        let first = registry.get(id).unwrap().ready_at;
        assert!(first.is_some());

        // Staying ready keeps the original timestamp.
        registry.update(id, HealthUpdate::ready(1, 1), now).unwrap();
        assert_eq!(registry.get(id).unwrap().ready_at, first);
    }

    #[test]
    fn test_unknown_shard_rejected() {
        let (mut registry, now) = registry(2);
        let result = registry.update(ShardId::new(2), HealthUpdate::ready(0, 0), now);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_sweep_marks_stale_shards_dead_once() {
        let (mut registry, start) = registry(3);
        let later = start + Duration::from_secs(30);
        registry
            .update(ShardId::new(1), HealthUpdate::ready(0, 0), later)
            .unwrap();

        // Shard 1 reported at +30s; 0 and 2 are silent since seeding.
        let at = start + Duration::from_secs(61);
        assert_eq!(registry.sweep(at), vec![ShardId::new(0), ShardId::new(2)]);
        assert!(registry.sweep(at + Duration::from_secs(30)).contains(&ShardId::new(1)));
        assert!(registry.sweep(at + Duration::from_secs(600)).is_empty());
    }

    #[test]
    fn test_sweep_respects_exact_timeout_boundary() {
        let (mut registry, start) = registry(1);
        assert!(registry.sweep(start + Duration::from_secs(60)).is_empty());
        assert_eq!(
            registry.sweep(start + Duration::from_secs(60) + Duration::from_millis(1)),
            vec![ShardId::new(0)]
        );
    }

    #[test]
    fn test_dead_shard_revived_only_by_update() {
        let (mut registry, start) = registry(1);
        let id = ShardId::new(0);
        let later = start + Duration::from_secs(120);
        assert_eq!(registry.sweep(later), vec![id]);
        assert_eq!(registry.get(id).unwrap().status, ShardStatus::Dead);

        registry.update(id, HealthUpdate::ready(1, 1), later).unwrap();
        assert_eq!(registry.get(id).unwrap().status, ShardStatus::Ready);
        assert!(registry.sweep(later + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_reported_dead_rejected() {
        let (mut registry, now) = registry(1);
        let id = ShardId::new(0);
        let result = registry.update(id, HealthUpdate::status(ShardStatus::Dead), now);
        assert!(matches!(result, Err(Error::Validation(_))));

        // Still eligible for the sweep, which reports it exactly once.
        assert_eq!(registry.get(id).unwrap().status, ShardStatus::Spawning);
        assert_eq!(registry.sweep(now + Duration::from_secs(61)), vec![id]);
    }

    #[test]
    fn test_backwards_to_spawning_rejected() {
        let (mut registry, now) = registry(1);
        let id = ShardId::new(0);
        registry.update(id, HealthUpdate::ready(2, 20), now).unwrap();

        let result = registry.update(
            id,
            HealthUpdate {
                status: Some(ShardStatus::Spawning),
                members: Some(0),
                ..HealthUpdate::default()
            },
            now,
        );
        assert!(matches!(result, Err(Error::Validation(_))));

        // A rejected report leaves the descriptor untouched.
        let shard = registry.get(id).unwrap();
        assert_eq!(shard.status, ShardStatus::Ready);
        assert_eq!(shard.members, 20);

        registry
            .update(id, HealthUpdate::status(ShardStatus::Disconnected), now)
            .unwrap();
        assert!(registry
            .update(id, HealthUpdate::status(ShardStatus::Spawning), now)
            .is_err());
    }

    #[test]
    fn test_dead_shard_may_respawn() {
        let (mut registry, start) = registry(1);
        let id = ShardId::new(0);
        let later = start + Duration::from_secs(120);
        assert_eq!(registry.sweep(later), vec![id]);

        registry
            .update(id, HealthUpdate::status(ShardStatus::Spawning), later)
            .unwrap();
        assert_eq!(registry.get(id).unwrap().status, ShardStatus::Spawning);
    }
}
