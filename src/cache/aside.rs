// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-aside over a [`KeyValueStore`].
//!
//! Every value is stored as a [`CacheEntry`] whose embedded expiry is checked
//! on read, so correctness never depends on the store's native TTL. Store
//! failures are logged and counted and then treated as a miss (reads) or a
//! no-op (background writes). A read caller only ever sees a fresh value or
//! the factory's own error.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use replica_sync::ReplicaSyncConfig;
//! # use replica_sync::cache::{CacheAside, InMemoryKeyValueStore};
//! # async fn example() -> Result<(), std::io::Error> {
//! let cache = CacheAside::new(Arc::new(InMemoryKeyValueStore::new()), &ReplicaSyncConfig::default());
//!
//! let epoch: u64 = cache
//!     .get_or_set("epoch.current", Some(Duration::from_secs(60)), || async {
//!         Ok::<_, std::io::Error>(512)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::outcome::{self, CacheOutcome};
use super::store::{CacheError, KeyValueStore};
use super::writer::{CacheWriter, CacheWriterStats};
use crate::clock::{system_clock, SharedClock};
use crate::config::ReplicaSyncConfig;
use crate::metrics;

/// Result of a multi-key write: keys that failed carry their error.
#[derive(Debug, Default)]
pub struct CacheBatchResult {
    pub succeeded: usize,
    pub failed: Vec<(String, CacheError)>,
}

impl CacheBatchResult {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct CacheAside {
    store: Arc<dyn KeyValueStore>,
    writer: CacheWriter,
    fire_and_forget: AtomicBool,
    clock: SharedClock,
}

impl CacheAside {
    /// Build a cache over `store`, starting its background writer.
    /// Must be called inside a Tokio runtime.
    pub fn new(store: Arc<dyn KeyValueStore>, config: &ReplicaSyncConfig) -> Self {
        Self::with_clock(store, config, system_clock())
    }

    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        config: &ReplicaSyncConfig,
        clock: SharedClock,
    ) -> Self {
        let writer = CacheWriter::spawn(Arc::clone(&store), config.cache_writer_queue);
        Self {
            store,
            writer,
            fire_and_forget: AtomicBool::new(config.cache_fire_and_forget),
            clock,
        }
    }

    /// Switch between background (`true`) and synchronous (`false`) writes.
    pub fn set_write_mode(&self, fire_and_forget: bool) {
        self.fire_and_forget.store(fire_and_forget, Ordering::Relaxed);
        debug!(fire_and_forget, "Cache write mode changed");
    }

    #[must_use]
    pub fn is_fire_and_forget(&self) -> bool {
        self.fire_and_forget.load(Ordering::Relaxed)
    }

    /// Return the cached value, or compute, store and return a fresh one.
    ///
    /// Concurrent misses on the same key each run `factory`; invocation is
    /// at-least-once, not deduplicated. A factory error is returned as-is and
    /// nothing is cached.
    pub async fn get_or_set<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup::<T>(key).await {
            metrics::record_cache_request("hit");
            outcome::record(key, CacheOutcome::Hit);
            return Ok(value);
        }

        let value = factory().await?;
        metrics::record_cache_request("miss");
        outcome::record(key, CacheOutcome::Miss);

        match self.encode(&value, ttl) {
            Ok(payload) => {
                if let Err(e) = self.write(key, payload, ttl).await {
                    metrics::record_cache_error("set");
                    warn!(key = %key, error = %e, "Cache write failed after recompute");
                }
            }
            Err(e) => {
                metrics::record_cache_error("serialize");
                warn!(key = %key, error = %e, "Could not serialize value for cache");
            }
        }
        Ok(value)
    }

    /// Fetch a live value. Absent, expired and unreadable entries are `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup(key).await
    }

    /// Store `value`, honouring the current write mode. In fire-and-forget
    /// mode `Ok` means the write was queued.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let payload = self.encode(value, ttl)?;
        self.write(key, payload, ttl).await
    }

    /// Remove a key and wait for the store, in either write mode.
    ///
    /// The removal is ordered behind background writes already queued, so a
    /// recompute that missed before an invalidation cannot land after it.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.writer.remove(key).await.inspect_err(|e| {
            metrics::record_cache_error("remove");
            warn!(key = %key, error = %e, "Cache remove failed");
        })
    }

    /// Whether a live entry exists, with the same lazy expiry as [`get`](Self::get).
    pub async fn exists(&self, key: &str) -> bool {
        self.lookup::<IgnoredAny>(key).await.is_some()
    }

    /// Look up several keys concurrently. Missing keys are absent from the map.
    pub async fn get_multiple<T: DeserializeOwned>(&self, keys: &[&str]) -> HashMap<String, T> {
        let lookups = keys.iter().map(|key| async move {
            self.lookup::<T>(key).await.map(|v| (key.to_string(), v))
        });
        join_all(lookups).await.into_iter().flatten().collect()
    }

    /// Store several values concurrently; one key failing does not affect others.
    pub async fn set_multiple<T: Serialize>(
        &self,
        entries: &[(&str, T)],
        ttl: Option<Duration>,
    ) -> CacheBatchResult {
        let writes = entries.iter().map(|(key, value)| async move {
            (key.to_string(), self.set(key, value, ttl).await)
        });
        collect_batch(join_all(writes).await)
    }

    pub async fn remove_multiple(&self, keys: &[&str]) -> CacheBatchResult {
        let removals = keys
            .iter()
            .map(|key| async move { (key.to_string(), self.remove(key).await) });
        collect_batch(join_all(removals).await)
    }

    /// Best-effort removal of every key this cache owns. Queued background
    /// writes land first.
    pub async fn clear(&self) -> Result<u64, CacheError> {
        self.writer.flush().await;
        self.store.clear().await.inspect_err(|e| {
            metrics::record_cache_error("clear");
            warn!(error = %e, "Cache clear failed");
        })
    }

    /// Wait for queued background writes to land.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    #[must_use]
    pub fn writer_stats(&self) -> CacheWriterStats {
        self.writer.stats()
    }

    /// Drain and stop the background writer.
    pub async fn shutdown(&self) {
        self.writer.shutdown().await;
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get_string(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                metrics::record_cache_error("get");
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                metrics::record_cache_error("deserialize");
                debug!(key = %key, error = %e, "Unreadable cache entry, treating as miss");
                return None;
            }
        };

        if entry.is_expired(self.clock.now_millis()) {
            debug!(key = %key, expiry = entry.expiry_epoch_millis, "Cache entry expired");
            // Removal failures are already logged; the read is a miss either way
            let _ = self.remove(key).await;
            return None;
        }
        Some(entry.data)
    }

    fn encode<T: Serialize>(&self, value: &T, ttl: Option<Duration>) -> Result<String, CacheError> {
        let entry = CacheEntry::new(value, ttl, self.clock.now_millis());
        Ok(serde_json::to_string(&entry)?)
    }

    async fn write(&self, key: &str, payload: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        if self.is_fire_and_forget() {
            // A dropped write is counted by the writer; the cache simply stays cold
            self.writer.dispatch_set(key, payload, ttl);
            Ok(())
        } else {
            self.store.set_string(key, &payload, ttl).await
        }
    }
}

fn collect_batch(results: Vec<(String, Result<(), CacheError>)>) -> CacheBatchResult {
    let mut batch = CacheBatchResult::default();
    for (key, result) in results {
        match result {
            Ok(()) => batch.succeeded += 1,
            Err(e) => batch.failed.push((key, e)),
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryKeyValueStore;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn sync_config() -> ReplicaSyncConfig {
        ReplicaSyncConfig {
            cache_fire_and_forget: false,
            ..Default::default()
        }
    }

    fn cache_with_clock(
        config: &ReplicaSyncConfig,
    ) -> (CacheAside, Arc<InMemoryKeyValueStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let cache = CacheAside::with_clock(store.clone(), config, clock.clone());
        (cache, store, clock)
    }

    /// Fails every operation whose key starts with "bad".
    struct FlakyStore {
        inner: InMemoryKeyValueStore,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
            if key.starts_with("bad") {
                return Err(CacheError::Backend("connection reset".into()));
            }
            self.inner.get_string(key).await
        }
        async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
            if key.starts_with("bad") {
                return Err(CacheError::Backend("connection reset".into()));
            }
            self.inner.set_string(key, value, ttl).await
        }
        async fn remove(&self, key: &str) -> Result<(), CacheError> {
            if key.starts_with("bad") {
                return Err(CacheError::Backend("connection reset".into()));
            }
            self.inner.remove(key).await
        }
        async fn clear(&self) -> Result<u64, CacheError> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn test_round_trip_with_lazy_expiry() {
        let (cache, store, clock) = cache_with_clock(&sync_config());

        cache.set("k", &"v".to_string(), Some(Duration::from_secs(60))).await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get::<String>("k").await, None);
        assert!(!store.contains_key("k"), "expired entry must be physically removed");
    }

    #[tokio::test]
    async fn test_get_or_set_miss_then_hit() {
        let (cache, _store, _clock) = cache_with_clock(&sync_config());
        let calls = AtomicUsize::new(0);

        let factory = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CacheError>(vec![1u32, 2, 3])
        };

        let ((first, second), lookups) = outcome::track(async {
            let a = cache.get_or_set("list", None, factory).await.unwrap();
            let b = cache.get_or_set("list", None, factory).await.unwrap();
            (a, b)
        })
        .await;

        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let outcomes: Vec<_> = lookups.iter().map(|l| l.outcome).collect();
        assert_eq!(outcomes, vec![CacheOutcome::Miss, CacheOutcome::Hit]);
    }

    #[tokio::test]
    async fn test_factory_error_is_returned_and_not_cached() {
        let (cache, store, _clock) = cache_with_clock(&sync_config());

        let ((), lookups) = outcome::track(async {
            let result: Result<u32, &str> = cache
                .get_or_set("epoch", None, || async { Err("upstream down") })
                .await;
            assert_eq!(result, Err("upstream down"));
        })
        .await;

        assert!(store.is_empty());
        assert!(lookups.is_empty(), "failed calls are not classified");
    }

    #[tokio::test]
    async fn test_expired_entry_recomputes() {
        let (cache, _store, clock) = cache_with_clock(&sync_config());
        let ttl = Some(Duration::from_secs(10));

        let v: u32 = cache.get_or_set("n", ttl, || async { Ok::<_, CacheError>(1) }).await.unwrap();
        assert_eq!(v, 1);

        clock.advance(Duration::from_secs(11));
        let v: u32 = cache.get_or_set("n", ttl, || async { Ok::<_, CacheError>(2) }).await.unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn test_undeserializable_entry_is_a_miss() {
        let (cache, store, _clock) = cache_with_clock(&sync_config());
        store.set_string("k", "not json", None).await.unwrap();

        assert_eq!(cache.get::<u32>("k").await, None);
        let v: u32 = cache.get_or_set("k", None, || async { Ok::<_, CacheError>(9) }).await.unwrap();
        assert_eq!(v, 9);
        assert_eq!(cache.get::<u32>("k").await, Some(9));
    }

    #[tokio::test]
    async fn test_store_failures_never_reach_reader() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryKeyValueStore::new(),
        });
        let cache = CacheAside::new(store, &sync_config());

        let v: u32 = cache.get_or_set("bad.key", None, || async { Ok::<_, CacheError>(5) }).await.unwrap();
        assert_eq!(v, 5);
        assert!(!cache.exists("bad.key").await);
    }

    #[tokio::test]
    async fn test_fire_and_forget_write_lands_after_flush() {
        let (cache, store, _clock) = cache_with_clock(&ReplicaSyncConfig::default());
        assert!(cache.is_fire_and_forget());

        let v: u32 = cache.get_or_set("k", None, || async { Ok::<_, CacheError>(3) }).await.unwrap();
        assert_eq!(v, 3);

        cache.flush().await;
        assert!(store.contains_key("k"));
        assert_eq!(cache.writer_stats().written, 1);
    }

    #[tokio::test]
    async fn test_remove_is_not_overtaken_by_queued_write() {
        let (cache, store, _clock) = cache_with_clock(&ReplicaSyncConfig::default());

        let _: u32 = cache.get_or_set("k", None, || async { Ok::<_, CacheError>(1) }).await.unwrap();
        cache.remove("k").await.unwrap();
        cache.flush().await;

        assert!(!store.contains_key("k"));
        assert_eq!(cache.get::<u32>("k").await, None);
    }

    #[tokio::test]
    async fn test_fire_and_forget_failures_are_counted() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryKeyValueStore::new(),
        });
        let cache = CacheAside::new(store, &ReplicaSyncConfig::default());

        cache.set("bad.one", &1u32, None).await.unwrap();
        cache.set("good", &2u32, None).await.unwrap();
        cache.flush().await;

        let stats = cache.writer_stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.written, 1);
    }

    #[tokio::test]
    async fn test_write_mode_switch() {
        let (cache, store, _clock) = cache_with_clock(&ReplicaSyncConfig::default());
        cache.set_write_mode(false);

        cache.set("k", &1u32, None).await.unwrap();
        // Synchronous: visible without a flush
        assert!(store.contains_key("k"));
        assert_eq!(cache.writer_stats().dispatched, 0);
    }

    #[tokio::test]
    async fn test_exists_honours_expiry() {
        let (cache, _store, clock) = cache_with_clock(&sync_config());
        cache.set("k", &1u32, Some(Duration::from_secs(1))).await.unwrap();

        assert!(cache.exists("k").await);
        clock.advance(Duration::from_millis(1_001));
        assert!(!cache.exists("k").await);
    }

    #[tokio::test]
    async fn test_multi_key_partial_failure() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryKeyValueStore::new(),
        });
        let cache = CacheAside::new(store, &sync_config());

        let result = cache
            .set_multiple(&[("a", 1u32), ("bad", 2), ("c", 3)], None)
            .await;
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].0, "bad");

        let found: HashMap<String, u32> = cache.get_multiple(&["a", "bad", "c", "missing"]).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found["c"], 3);

        let removed = cache.remove_multiple(&["a", "bad"]).await;
        assert_eq!(removed.succeeded, 1);
        assert!(!removed.is_complete());
        assert!(!cache.exists("a").await);
    }

    #[tokio::test]
    async fn test_clear() {
        let (cache, store, _clock) = cache_with_clock(&sync_config());
        cache.set("a", &1u32, None).await.unwrap();
        cache.set("b", &2u32, None).await.unwrap();

        assert_eq!(cache.clear().await.unwrap(), 2);
        assert!(store.is_empty());
    }
}
