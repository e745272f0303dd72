//! Bounded memory of envelopes already processed.
//!
//! The bus redelivers, so every gateway remembers what it has seen. Entries
//! expire after `ttl` and the oldest are evicted beyond `capacity`, which
//! keeps memory flat under sustained traffic. Keys include the envelope kind
//! because a response reuses its request's id.

use super::envelope::MessageKind;
use crate::types::MessageId;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

type DedupKey = (MessageKind, MessageId);

#[derive(Debug)]
pub struct DedupCache {
    seen: HashMap<DedupKey, Instant>,
    order: VecDeque<(DedupKey, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Record the envelope; returns `false` if it was already seen.
    pub fn check_and_insert(&mut self, kind: MessageKind, id: &MessageId, now: Instant) -> bool {
        self.evict_expired(now);

        let key = (kind, id.clone());
        if self.seen.contains_key(&key) {
            return false;
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((oldest, _)) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }

        self.seen.insert(key.clone(), now);
        self.order.push_back((key, now));
        true
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((_, inserted)) = self.order.front() {
            if now.saturating_duration_since(*inserted) <= self.ttl {
                break;
            }
            if let Some((key, _)) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}
