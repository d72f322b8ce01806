//! Record deduplication for downstream processors.
//!
//! Delivery is at-least-once, so a processor may see the same record twice
//! after a crash or a rebalance. Processors that need idempotence check a
//! [`DeduplicationStore`] before applying side effects and record the key
//! afterwards. The store is passed in by the caller; nothing here is global.
//!
//! [`BoundedDedupStore`] remembers at most `max_entries` keys, each for at
//! most `ttl`, so memory stays bounded no matter how long the process runs.
//! A key that has been evicted is treated as unseen.

use std::time::Duration;

use moka::sync::Cache;

use crate::message::Message;

/// Default number of keys kept by [`BoundedDedupStore`].
pub const DEFAULT_DEDUP_MAX_ENTRIES: u64 = 100_000;

/// Default lifetime of a key in [`BoundedDedupStore`].
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(3600);

/// Keys of records that have already been processed.
pub trait DeduplicationStore: Send + Sync {
    fn has(&self, key: &str) -> bool;

    fn add(&self, key: &str);
}

/// A [`DeduplicationStore`] with size and age limits.
#[derive(Clone)]
pub struct BoundedDedupStore {
    seen: Cache<String, ()>,
    max_entries: u64,
    ttl: Duration,
}

impl BoundedDedupStore {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self {
            seen,
            max_entries,
            ttl,
        }
    }

    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Approximate number of keys held. Eviction runs lazily.
    pub fn len(&self) -> u64 {
        self.seen.run_pending_tasks();
        self.seen.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BoundedDedupStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_MAX_ENTRIES, DEFAULT_DEDUP_TTL)
    }
}

impl DeduplicationStore for BoundedDedupStore {
    fn has(&self, key: &str) -> bool {
        self.seen.contains_key(key)
    }

    fn add(&self, key: &str) {
        self.seen.insert(key.to_string(), ());
    }
}

/// Identity of a record in the log: `topic-partition@offset`.
///
/// Unique per record, so it catches redelivery of the same record but not
/// duplicates produced twice. Use an application key for the latter.
pub fn record_key(message: &Message) -> String {
    format!("{}@{}", message.topic_partition(), message.offset)
}
