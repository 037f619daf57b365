//! Cache-aside behaviour over an in-memory store with a simulated clock.
//!
//! Run with: `cargo test --test cache_aside`

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use replica_sync::cache::{
    track, CacheAside, CacheError, CacheOutcome, InMemoryKeyValueStore, KeyValueStore,
};
use replica_sync::clock::ManualClock;
use replica_sync::ReplicaSyncConfig;

// =============================================================================
// Helpers
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DrepSummary {
    drep_id: String,
    voting_power: i64,
}

fn summary(power: i64) -> DrepSummary {
    DrepSummary { drep_id: "drep1abc".into(), voting_power: power }
}

fn config(fire_and_forget: bool) -> ReplicaSyncConfig {
    ReplicaSyncConfig { cache_fire_and_forget: fire_and_forget, ..Default::default() }
}

/// In-memory store that can be switched into an outage.
#[derive(Default)]
struct SwitchableStore {
    inner: InMemoryKeyValueStore,
    down: AtomicBool,
}

impl SwitchableStore {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::Backend("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for SwitchableStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        self.inner.get_string(key).await
    }

    async fn set_string(&self, key: &str, value: &str, ttl_hint: Option<Duration>) -> Result<(), CacheError> {
        self.check()?;
        self.inner.set_string(key, value, ttl_hint).await
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn clear(&self) -> Result<u64, CacheError> {
        self.check()?;
        self.inner.clear().await
    }
}

fn cache_over(store: Arc<SwitchableStore>, fire_and_forget: bool) -> (CacheAside, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_767_225_600_000));
    let cache = CacheAside::with_clock(store, &config(fire_and_forget), clock.clone());
    (cache, clock)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn set_then_get_within_ttl_and_physically_removed_after() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, clock) = cache_over(store.clone(), false);

    cache.set("drep:abc", &summary(10), Some(Duration::from_secs(60))).await.unwrap();
    clock.advance(Duration::from_secs(59));
    assert_eq!(cache.get::<DrepSummary>("drep:abc").await, Some(summary(10)));

    clock.advance(Duration::from_secs(2));
    assert_eq!(cache.get::<DrepSummary>("drep:abc").await, None);
    assert!(!store.inner.contains_key("drep:abc"));
}

#[tokio::test]
async fn request_sees_miss_then_hit_without_changing_values() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, _clock) = cache_over(store, false);
    let calls = AtomicUsize::new(0);

    let handler = || async {
        let a: DrepSummary = cache
            .get_or_set("drep:abc", Some(Duration::from_secs(300)), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(summary(42))
            })
            .await
            .unwrap();
        let b: DrepSummary = cache
            .get_or_set("drep:abc", Some(Duration::from_secs(300)), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(summary(0))
            })
            .await
            .unwrap();
        (a, b)
    };

    let ((a, b), lookups) = track(handler()).await;
    assert_eq!(a, summary(42));
    assert_eq!(b, summary(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let outcomes: Vec<_> = lookups.iter().map(|l| l.outcome).collect();
    assert_eq!(outcomes, vec![CacheOutcome::Miss, CacheOutcome::Hit]);
    assert_eq!(lookups[0].key, "drep:abc");
}

#[tokio::test]
async fn concurrent_misses_may_each_run_the_factory() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, _clock) = cache_over(store, false);
    let calls = Arc::new(AtomicUsize::new(0));

    let slow = |calls: Arc<AtomicUsize>| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, CacheError>(summary(1))
    };

    let (a, b) = tokio::join!(
        cache.get_or_set("drep:slow", None, || slow(calls.clone())),
        cache.get_or_set("drep:slow", None, || slow(calls.clone())),
    );

    assert_eq!(a.unwrap(), summary(1));
    assert_eq!(b.unwrap(), summary(1));
    // At-least-once: both callers missed before either stored
    let n = calls.load(Ordering::SeqCst);
    assert!((1..=2).contains(&n), "factory ran {n} times");
}

#[tokio::test]
async fn cache_outage_is_invisible_to_the_read_path() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, _clock) = cache_over(store.clone(), false);
    store.set_down(true);

    let value: DrepSummary = cache
        .get_or_set("drep:abc", None, || async { Ok::<_, CacheError>(summary(5)) })
        .await
        .unwrap();
    assert_eq!(value, summary(5));
    assert!(!cache.exists("drep:abc").await);

    store.set_down(false);
    assert!(!cache.exists("drep:abc").await, "nothing was written during the outage");
}

#[tokio::test]
async fn factory_error_is_returned_and_nothing_cached() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, _clock) = cache_over(store.clone(), false);

    let result: Result<DrepSummary, String> = cache
        .get_or_set("drep:abc", None, || async { Err("data fetch failed".to_string()) })
        .await;
    assert_eq!(result.unwrap_err(), "data fetch failed");
    assert!(store.inner.is_empty());
}

#[tokio::test]
async fn fire_and_forget_write_failure_is_only_counted() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, _clock) = cache_over(store.clone(), true);
    store.set_down(true);

    cache.set("drep:abc", &summary(1), None).await.unwrap();
    cache.flush().await;

    let stats = cache.writer_stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.written, 0);
}

#[tokio::test]
async fn synchronous_mode_surfaces_set_failures() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, _clock) = cache_over(store.clone(), true);
    cache.set_write_mode(false);
    store.set_down(true);

    let err = cache.set("drep:abc", &summary(1), None).await.unwrap_err();
    assert!(matches!(err, CacheError::Backend(_)));
}

#[tokio::test]
async fn fire_and_forget_write_lands_after_flush() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, _clock) = cache_over(store.clone(), true);

    let value: DrepSummary = cache
        .get_or_set("drep:abc", Some(Duration::from_secs(60)), || async {
            Ok::<_, CacheError>(summary(9))
        })
        .await
        .unwrap();
    assert_eq!(value, summary(9));

    cache.flush().await;
    assert_eq!(cache.get::<DrepSummary>("drep:abc").await, Some(summary(9)));
    assert_eq!(store.inner.ttl_hint("drep:abc"), Some(Duration::from_secs(60)));

    cache.shutdown().await;
}

#[tokio::test]
async fn multi_key_operations_are_independent() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, clock) = cache_over(store.clone(), false);

    let result = cache
        .set_multiple(&[("drep:a", summary(1)), ("drep:b", summary(2))], Some(Duration::from_secs(10)))
        .await;
    assert!(result.is_complete());
    assert_eq!(result.succeeded, 2);
    cache.set("drep:c", &summary(3), None).await.unwrap();

    clock.advance(Duration::from_secs(11));
    let found = cache.get_multiple::<DrepSummary>(&["drep:a", "drep:b", "drep:c", "drep:none"]).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found.get("drep:c"), Some(&summary(3)));

    let removed = cache.remove_multiple(&["drep:c", "drep:none"]).await;
    assert!(removed.is_complete());
    assert!(store.inner.is_empty());
}

#[tokio::test]
async fn clear_empties_the_store() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, _clock) = cache_over(store.clone(), false);
    cache.set("drep:a", &summary(1), None).await.unwrap();
    cache.set("drep:b", &summary(2), None).await.unwrap();

    assert_eq!(cache.clear().await.unwrap(), 2);
    assert!(!cache.exists("drep:a").await);
}

#[tokio::test]
async fn invalidation_wins_over_a_recompute_still_queued() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, _clock) = cache_over(store.clone(), true);

    // Miss queues the recomputed value on the background writer
    let value: DrepSummary = cache
        .get_or_set("drep:abc", Some(Duration::from_secs(300)), || async {
            Ok::<_, CacheError>(summary(1))
        })
        .await
        .unwrap();
    assert_eq!(value, summary(1));

    cache.remove("drep:abc").await.unwrap();
    cache.flush().await;

    assert_eq!(cache.get::<DrepSummary>("drep:abc").await, None);
    assert!(!store.inner.contains_key("drep:abc"));
    cache.shutdown().await;
}

#[tokio::test]
async fn fire_and_forget_remove_surfaces_store_errors() {
    let store = Arc::new(SwitchableStore::default());
    let (cache, _clock) = cache_over(store.clone(), true);
    store.set_down(true);

    let err = cache.remove("drep:abc").await.unwrap_err();
    assert!(matches!(err, CacheError::Backend(_)));
}
