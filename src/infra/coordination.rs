//! Atomic key-value coordination store
//!
//! The only shared mutable state across worker processes. All
//! mutations are either single-operation atomic or composite
//! single-script atomic (`claim_slot`, `release_slot`); the in-memory
//! implementation takes one mutex per operation, which gives the same
//! atomicity a server-side script would.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::error::EvalResult;
use crate::evaluation::EvalId;
use crate::events::sequence_key;

/// Outcome of an idempotent slot release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRelease {
    /// Busy marker deleted and the slot returned to the pool
    Released,
    /// The slot was already back in the pool; nothing was pushed
    DoubleRelease,
    /// Neither a busy marker nor a pool entry was found for the slot
    UnknownSlot,
}

/// Coordination-store operations used across the pipeline
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Push a value onto the head of a list
    async fn push_front(&self, key: &str, value: &str) -> EvalResult<()>;

    /// Pop a value from the tail of a list
    async fn pop_back(&self, key: &str) -> EvalResult<Option<String>>;

    /// List length; zero for a missing key
    async fn list_len(&self, key: &str) -> EvalResult<usize>;

    /// Full list contents, head first
    async fn list_range(&self, key: &str) -> EvalResult<Vec<String>>;

    /// Set a string value with a time-to-live
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> EvalResult<()>;

    /// Set a string value with a time-to-live iff the key is absent;
    /// returns whether the write won
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> EvalResult<bool>;

    /// Read a string value; `None` when missing or expired
    async fn get(&self, key: &str) -> EvalResult<Option<String>>;

    /// Delete a key, reporting whether it existed
    async fn delete(&self, key: &str) -> EvalResult<bool>;

    /// Live string keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> EvalResult<Vec<String>>;

    /// Merge fields into a hash
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> EvalResult<()>;

    /// Read all fields of a hash; empty when missing
    async fn hash_get_all(&self, key: &str) -> EvalResult<HashMap<String, String>>;

    /// Atomically increment a counter, returning the post-increment value
    async fn counter_incr(&self, key: &str) -> EvalResult<u64>;

    /// Atomic claim: pop a slot from the pool tail and, in the same
    /// round trip, set its busy marker to `owner` with `ttl`.
    async fn claim_slot(
        &self,
        pool_key: &str,
        marker_prefix: &str,
        owner: &str,
        ttl: Duration,
    ) -> EvalResult<Option<String>>;

    /// Atomic idempotent release: delete the busy marker, then push the
    /// slot back onto the pool head iff the marker existed and the slot
    /// is not already pooled. One round trip.
    async fn release_slot(
        &self,
        pool_key: &str,
        marker_prefix: &str,
        slot: &str,
    ) -> EvalResult<SlotRelease>;

    /// Allocate the next dense per-evaluation event sequence number,
    /// starting at 0.
    async fn next_sequence(&self, eval_id: &EvalId) -> EvalResult<u64> {
        Ok(self.counter_incr(&sequence_key(eval_id)).await? - 1)
    }
}

struct ExpiringValue {
    value: String,
    expires_at: Option<Instant>,
}

impl ExpiringValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, ExpiringValue>,
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    counters: HashMap<String, u64>,
}

impl MemoryInner {
    fn live_string(&mut self, key: &str) -> Option<&str> {
        let now = Instant::now();
        if self.strings.get(key).map(|v| v.is_expired(now)).unwrap_or(false) {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|v| v.value.as_str())
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, v| !v.is_expired(now));
    }
}

/// In-process reference implementation
///
/// Suitable for single-process deployments and tests; multi-process
/// deployments use the Redis backend behind the `redis-store` feature.
#[derive(Default)]
pub struct MemoryCoordinationStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryCoordinationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn push_front(&self, key: &str, value: &str) -> EvalResult<()> {
        let mut inner = self.inner.lock();
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn pop_back(&self, key: &str) -> EvalResult<Option<String>> {
        let mut inner = self.inner.lock();
        Ok(inner.lists.get_mut(key).and_then(|list| list.pop_back()))
    }

    async fn list_len(&self, key: &str) -> EvalResult<usize> {
        let inner = self.inner.lock();
        Ok(inner.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    async fn list_range(&self, key: &str) -> EvalResult<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> EvalResult<()> {
        let mut inner = self.inner.lock();
        inner.strings.insert(
            key.to_string(),
            ExpiringValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> EvalResult<bool> {
        let mut inner = self.inner.lock();
        if inner.live_string(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            ExpiringValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> EvalResult<Option<String>> {
        let mut inner = self.inner.lock();
        Ok(inner.live_string(key).map(|s| s.to_string()))
    }

    async fn delete(&self, key: &str) -> EvalResult<bool> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.strings.remove(key) {
            Some(v) => Ok(!v.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> EvalResult<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.sweep_expired();
        Ok(inner
            .strings
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> EvalResult<()> {
        let mut inner = self.inner.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> EvalResult<HashMap<String, String>> {
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn counter_incr(&self, key: &str) -> EvalResult<u64> {
        let mut inner = self.inner.lock();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn claim_slot(
        &self,
        pool_key: &str,
        marker_prefix: &str,
        owner: &str,
        ttl: Duration,
    ) -> EvalResult<Option<String>> {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.lists.get_mut(pool_key).and_then(|l| l.pop_back()) else {
            return Ok(None);
        };
        inner.strings.insert(
            format!("{}{}", marker_prefix, slot),
            ExpiringValue {
                value: owner.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(Some(slot))
    }

    async fn release_slot(
        &self,
        pool_key: &str,
        marker_prefix: &str,
        slot: &str,
    ) -> EvalResult<SlotRelease> {
        let mut inner = self.inner.lock();
        let marker_key = format!("{}{}", marker_prefix, slot);
        let now = Instant::now();
        let marker_existed = inner
            .strings
            .remove(&marker_key)
            .map(|v| !v.is_expired(now))
            .unwrap_or(false);
        let already_pooled = inner
            .lists
            .get(pool_key)
            .map(|l| l.iter().any(|s| s == slot))
            .unwrap_or(false);

        if already_pooled {
            return Ok(SlotRelease::DoubleRelease);
        }
        if marker_existed {
            inner
                .lists
                .entry(pool_key.to_string())
                .or_default()
                .push_front(slot.to_string());
            return Ok(SlotRelease::Released);
        }
        Ok(SlotRelease::UnknownSlot)
    }
}

impl MemoryCoordinationStore {
    /// Test hook: force a marker to expire immediately
    #[doc(hidden)]
    pub fn expire_now(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(v) = inner.strings.get_mut(key) {
            v.expires_at = Some(Instant::now() - Duration::from_millis(1));
        }
    }
}
