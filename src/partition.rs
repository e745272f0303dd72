//! Routing keys to shards.
//!
//! Every function here is pure: for a fixed `(key, total_shards)` the answer
//! is the same in every process and at every point in time, so independently
//! deployed shards agree on ownership without a coordination round-trip.

use crate::types::ShardId;

/// Low bits of a snowflake identifier that encode its worker of origin
/// (worker id, process id, increment) rather than its creation time.
pub const SNOWFLAKE_WORKER_BITS: u32 = 22;

/// Number of shards needed for `workload_size` units at `units_per_shard` each.
///
/// Always at least 1. A `units_per_shard` of 0 is treated as 1.
pub fn calculate_shard_count(workload_size: u64, units_per_shard: u64) -> u32 {
    let per_shard = units_per_shard.max(1);
    let needed = workload_size.div_ceil(per_shard).max(1);
    u32::try_from(needed).unwrap_or(u32::MAX)
}

/// Shard owning the snowflake-style numeric `key`.
///
/// Returns shard 0 when `total_shards` is 0 (not configured yet).
pub fn shard_for(key: u64, total_shards: u32) -> ShardId {
    if total_shards == 0 {
        return ShardId::new(0);
    }
    ShardId::new(((key >> SNOWFLAKE_WORKER_BITS) % u64::from(total_shards)) as u32)
}

/// Shard owning a textual routing key.
///
/// Decimal keys (the usual serialized form of snowflakes) take the numeric
/// path so both forms route identically; anything else is hashed.
pub fn shard_for_key(key: &str, total_shards: u32) -> ShardId {
    match key.parse::<u64>() {
        Ok(numeric) => shard_for(numeric, total_shards),
        Err(_) if total_shards == 0 => ShardId::new(0),
        Err(_) => ShardId::new((hash64(key.as_bytes()) % u64::from(total_shards)) as u32),
    }
}

/// 64-bit hash with xxHash64-style avalanche, stable across builds.
///
/// `std::hash` is not used because its output may change between releases.
fn hash64(bytes: &[u8]) -> u64 {
    const PRIME1: u64 = 0x9E3779B185EBCA87;
    const PRIME2: u64 = 0xC2B2AE3D27D4EB4F;
    const PRIME3: u64 = 0x165667B19E3779F9;
    const PRIME5: u64 = 0x27D4EB2F165667C5;

    let mut h: u64 = PRIME5.wrapping_add(bytes.len() as u64);
    for &b in bytes {
        h ^= u64::from(b).wrapping_mul(PRIME5);
        h = h.rotate_left(11).wrapping_mul(PRIME1);
    }

    h ^= h >> 33;
    h = h.wrapping_mul(PRIME2);
    h ^= h >> 29;
    h = h.wrapping_mul(PRIME3);
    h ^= h >> 32;
    h
}
