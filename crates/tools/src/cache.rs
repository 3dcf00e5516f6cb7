//! Response cache with single-flight slots.
//!
//! Each key `sha256(tool + canonical request)` owns one async mutex. The
//! caller holding the slot performs the underlying call while concurrent
//! callers with the same key wait on the lock and then read the stored
//! response. Only successful responses are stored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use attestor_core::hashing::{canonical_json, sha256_hex};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Stable cache key for a tool request. Object key order is irrelevant.
pub fn cache_key(tool: &str, request: &Value) -> String {
    let material = format!("{tool}\n{}", canonical_json(request));
    sha256_hex(material.as_bytes())
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub value: Arc<Value>,
    pub redacted: Arc<Value>,
    expires_at: Instant,
}

impl CachedResponse {
    pub fn new(value: Arc<Value>, redacted: Arc<Value>, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            redacted,
            expires_at: now + ttl,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Exclusive access to one cache key for the duration of a call.
pub type CacheSlot = OwnedMutexGuard<Option<CachedResponse>>;

#[derive(Debug, Default)]
pub struct ResponseCache {
    slots: Mutex<HashMap<String, Arc<Mutex<Option<CachedResponse>>>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the slot for `key`, waiting for any in-flight call on it.
    pub async fn slot(&self, key: &str) -> CacheSlot {
        let entry = {
            let mut slots = self.slots.lock().await;
            slots.entry(key.to_string()).or_default().clone()
        };
        entry.lock_owned().await
    }

    /// Drop expired entries. Slots currently held by a caller are skipped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => guard.as_ref().is_some_and(|c| c.is_fresh(now)),
            Err(_) => true,
        });
        before - slots.len()
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
