//! # Jeeves Shard - Partitioning and Cross-Shard Coordination
//!
//! Coordination layer for a bot-style service split across several shard
//! processes:
//! - Deterministic partitioning of snowflake ids onto shards
//! - Shard health registry with periodic dead-shard detection
//! - Request/response and broadcast IPC over an at-least-once pub/sub bus
//! - A per-process orchestrator tying the pieces together
//!
//! ## Architecture
//!
//! Each shard process runs one orchestrator; processes only talk through the bus:
//! ```text
//!   ┌──────────── shard process ────────────┐
//!   │          ShardOrchestrator            │
//!   │  ┌──────────────┐ ┌──────────────┐    │
//!   │  │ HealthMonitor│ │ ShardGateway │    │
//!   │  │  (registry,  │ │ (requests,   │    │
//!   │  │   sweep)     │ │  broadcasts) │    │
//!   │  └──────┬───────┘ └──────┬───────┘    │
//!   └─────────┼────────────────┼────────────┘
//!             └───── MessageBus ─────→  other shard processes
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod events;
pub mod health;
pub mod ipc;
pub mod orchestrator;
pub mod partition;
pub mod transport;
pub mod types;

// Internal utilities
pub mod observability;

pub use orchestrator::ShardOrchestrator;
pub use types::{Config, Error, Result};
