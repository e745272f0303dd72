//! Inter-shard messaging over the pub/sub bus.
//!
//! Each shard process owns one [`ShardGateway`]. Envelopes are JSON encoded
//! and addressed either to a shard's private channel or to the shared
//! broadcast channel.

pub mod dedup;
pub mod envelope;
pub mod gateway;
pub mod router;

pub use envelope::{AllShards, Envelope, FailureCode, MessageKind, Recipient, ResponsePayload};
pub use gateway::{ConnectionState, GatewayStats, ShardGateway};
pub use router::{handler_fn, Handler, HandlerRegistry};
