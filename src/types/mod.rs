//! Core types for the shard coordination layer.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ShardId, MessageId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for sharding, IPC and observability

mod config;
mod errors;
mod ids;

pub use config::{Config, IpcConfig, ObservabilityConfig, ShardingConfig};
pub use errors::{Error, Result};
pub use ids::{MessageId, ShardId};
