//! Shard health tracking and dead-shard detection.
//!
//! Every shard runtime reports its own health; the monitor keeps one
//! descriptor per shard and periodically marks shards that went silent for
//! longer than the configured timeout as dead. Detection is monitoring-only:
//! recovery belongs to the external process supervisor.

mod monitor;
mod registry;

pub use monitor::{HealthMonitor, HealthReporter};
pub use registry::{
    HealthUpdate, ShardDescriptor, ShardRegistry, ShardStatus, SystemHealthSnapshot,
    SystemStatus,
};
