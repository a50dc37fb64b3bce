//! Token-bucket rate limiting.
//!
//! Buckets hold milli-tokens so refill at low rates does not lose the
//! fractional remainder between checks. Buckets are created full on first
//! use and dropped again once they refill completely.

use crate::core::time::Timestamp;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

const MILLI: u64 = 1_000;
const SHARDS: usize = 16;
/// Retry hint when a bucket never refills.
const NO_REFILL_RETRY_MS: u64 = 60_000;

/// A single token bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucket {
    /// Tokens per second.
    pub rate: u64,
    /// Maximum tokens (burst).
    pub capacity: u64,
    tokens_milli: u64,
    last_refill_ms: u64,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(rate: u64, capacity: u64, now: Timestamp) -> Self {
        Self {
            rate,
            capacity,
            tokens_milli: capacity.saturating_mul(MILLI),
            last_refill_ms: now.ms,
        }
    }

    pub fn refill(&mut self, now: Timestamp) {
        let elapsed_ms = now.ms.saturating_sub(self.last_refill_ms);
        if elapsed_ms == 0 {
            return;
        }
        // rate tokens/s over elapsed ms is rate * elapsed milli-tokens.
        let added = self.rate.saturating_mul(elapsed_ms);
        self.tokens_milli = self
            .tokens_milli
            .saturating_add(added)
            .min(self.capacity.saturating_mul(MILLI));
        self.last_refill_ms = now.ms;
    }

    /// Take one token or report how long until one is available.
    pub fn try_consume(&mut self, now: Timestamp) -> Result<(), u64> {
        self.refill(now);
        if self.tokens_milli >= MILLI {
            self.tokens_milli -= MILLI;
            return Ok(());
        }
        if self.rate == 0 {
            return Err(NO_REFILL_RETRY_MS);
        }
        let missing = MILLI - self.tokens_milli;
        Err(missing.div_ceil(self.rate))
    }

    /// Whole tokens currently available.
    pub fn tokens(&mut self, now: Timestamp) -> u64 {
        self.refill(now);
        self.tokens_milli / MILLI
    }

    pub fn is_full(&mut self, now: Timestamp) -> bool {
        self.refill(now);
        self.tokens_milli >= self.capacity.saturating_mul(MILLI)
    }
}

/// Keyed token buckets, sharded to spread lock contention.
pub struct RateLimiter {
    rate: u64,
    burst: u64,
    shards: Vec<Mutex<HashMap<String, TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(refill_per_s: u64, burst: u64) -> Self {
        Self {
            rate: refill_per_s,
            burst,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, TokenBucket>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Charge one attempt to `key`; `Err(retry_after_ms)` when denied.
    pub fn check(&self, key: &str, now: Timestamp) -> Result<(), u64> {
        let mut shard = self.shard(key).lock();
        shard
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.rate, self.burst, now))
            .try_consume(now)
    }

    /// Drop buckets that refilled completely; returns how many remain.
    pub fn prune(&self, now: Timestamp) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock();
                shard.retain(|_, bucket| !bucket.is_full(now));
                shard.len()
            })
            .sum()
    }
}
