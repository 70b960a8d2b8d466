//! Keyed context cache with per-entry expiry.
//!
//! Entries are fresh while `now - created_at < ttl`. Expired entries read as
//! absent and are dropped either by the reading call or by the periodic
//! sweep started with [`ContextCache::start_sweeper`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use armada_core::config::CacheSettings;

use crate::task::ScheduledTask;

/// Bytes of payload that feed [`fingerprint`].
pub const FINGERPRINT_PREFIX_LEN: usize = 1024;

const FINGERPRINT_BASE: u64 = 31;

/// Fast, non-cryptographic fingerprint of a request payload.
///
/// A polynomial rolling hash over the first [`FINGERPRINT_PREFIX_LEN`]
/// bytes. Payloads sharing that prefix, or colliding in 64 bits, map to the
/// same key and will be served each other's cached value.
pub fn fingerprint(payload: &[u8]) -> u64 {
    payload
        .iter()
        .take(FINGERPRINT_PREFIX_LEN)
        .fold(0u64, |hash, &byte| {
            hash.wrapping_mul(FINGERPRINT_BASE)
                .wrapping_add(u64::from(byte))
        })
}

/// Consumer id plus request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub consumer: String,
    pub fingerprint: u64,
}

impl CacheKey {
    pub fn new(consumer: impl Into<String>, fingerprint: u64) -> Self {
        Self {
            consumer: consumer.into(),
            fingerprint,
        }
    }

    /// Key for `payload` as seen by `consumer`.
    pub fn for_payload(consumer: impl Into<String>, payload: impl AsRef<[u8]>) -> Self {
        Self::new(consumer, fingerprint(payload.as_ref()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016x}", self.consumer, self.fingerprint)
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            ttl: Duration::from_secs(settings.ttl_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
            max_entries: settings.max_entries,
        }
    }
}

/// Errors from cache writes.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Context cache is full ({capacity} live entries), not storing {key}")]
    Full { key: CacheKey, capacity: usize },
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) < ttl
    }
}

/// Snapshot returned by [`ContextCache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Stored entries, including expired ones not yet swept.
    pub entries: usize,
    pub oldest_created_at: Option<Instant>,
    pub newest_created_at: Option<Instant>,
    pub hits: u64,
    pub misses: u64,
}

struct CacheInner<V> {
    config: CacheConfig,
    entries: RwLock<HashMap<CacheKey, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: Mutex<Option<ScheduledTask>>,
}

impl<V> CacheInner<V> {
    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now, ttl));
        before - entries.len()
    }
}

/// Shared TTL cache. Cloning yields another handle to the same store.
pub struct ContextCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for ContextCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> ContextCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        debug!(ttl = ?config.ttl, max_entries = config.max_entries, "ContextCache created");
        Self {
            inner: Arc::new(CacheInner {
                config,
                entries: RwLock::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// The cached value for `key`, if stored less than `ttl` ago.
    pub async fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let ttl = self.inner.config.ttl;

        let expired = {
            let entries = self.inner.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_fresh(now, ttl) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.inner.entries.write().await;
            // A concurrent set may have refreshed it in between.
            if entries
                .get(key)
                .is_some_and(|entry| !entry.is_fresh(Instant::now(), ttl))
            {
                entries.remove(key);
                debug!(%key, "Dropped expired cache entry");
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value`, replacing any previous entry and restarting its TTL.
    ///
    /// A write that cannot be stored is logged and dropped; the key then
    /// behaves as a miss.
    pub async fn set(&self, key: CacheKey, value: V) {
        if let Err(e) = self.try_set(key, value).await {
            warn!(error = %e, "Cache write dropped");
        }
    }

    /// Like [`Self::set`] but reports a full store instead of logging it.
    /// Overwriting an existing key always succeeds.
    pub async fn try_set(&self, key: CacheKey, value: V) -> Result<(), CacheError> {
        let now = Instant::now();
        let ttl = self.inner.config.ttl;
        let capacity = self.inner.config.max_entries;
        let mut entries = self.inner.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= capacity {
            entries.retain(|_, entry| entry.is_fresh(now, ttl));
            if entries.len() >= capacity {
                return Err(CacheError::Full { key, capacity });
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
            },
        );
        Ok(())
    }

    /// Return the fresh cached value or compute, store and return a new one.
    /// Errors from `compute` are returned and nothing is stored.
    pub async fn get_or_insert_with<F, Fut, E>(&self, key: CacheKey, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }
        let value = compute().await?;
        self.set(key, value.clone()).await;
        Ok(value)
    }

    /// Remove every entry. Counters are kept.
    pub async fn clear(&self) {
        self.inner.entries.write().await.clear();
    }

    /// Remove expired entries now and return how many were dropped.
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.inner.entries.read().await;
        CacheStats {
            entries: entries.len(),
            oldest_created_at: entries.values().map(|e| e.created_at).min(),
            newest_created_at: entries.values().map(|e| e.created_at).max(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }

    /// Start the periodic sweep. Calling it again while running is a no-op.
    pub async fn start_sweeper(&self) {
        let mut slot = self.inner.sweeper.lock().await;
        if slot.is_some() {
            return;
        }

        let weak: Weak<CacheInner<V>> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;
        *slot = Some(ScheduledTask::every("cache-sweep", interval, move || {
            let weak = Weak::clone(&weak);
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let removed = inner.sweep().await;
                if removed > 0 {
                    debug!(removed, "Swept expired cache entries");
                }
            }
        }));
        info!(?interval, "Cache sweeper started");
    }

    pub async fn stop_sweeper(&self) {
        let task = self.inner.sweeper.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
            info!("Cache sweeper stopped");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cache(ttl_ms: u64, max_entries: usize) -> ContextCache<String> {
        ContextCache::new(CacheConfig {
            ttl: Duration::from_millis(ttl_ms),
            sweep_interval: Duration::from_secs(60),
            max_entries,
        })
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::for_payload("test", name)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn fingerprint_only_reads_prefix() {
        let mut a = vec![b'x'; FINGERPRINT_PREFIX_LEN];
        let mut b = a.clone();
        a.extend_from_slice(b"tail one");
        b.extend_from_slice(b"a different tail");
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
        assert_eq!(fingerprint(b""), 0);
    }

    #[test]
    fn fingerprint_is_polynomial() {
        // ((97 * 31) + 98) * 31 + 99
        assert_eq!(fingerprint(b"abc"), 96_354);
    }

    #[test]
    fn key_display_includes_consumer() {
        let key = CacheKey::new("researcher", 0xff);
        assert_eq!(key.to_string(), "researcher:00000000000000ff");
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = cache(5000, 10);
        cache.set(key("k"), "v".into()).await;

        tokio::time::advance(Duration::from_millis(4999)).await;
        assert_eq!(cache.get(&key("k")).await.as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(cache.get(&key("k")).await, None);
        // Removed on read.
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_absent_exactly_at_ttl() {
        let cache = cache(100, 10);
        cache.set(key("k"), "v".into()).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cache.get(&key("k")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_restarts_ttl() {
        let cache = cache(100, 10);
        cache.set(key("k"), "old".into()).await;
        tokio::time::advance(Duration::from_millis(80)).await;
        cache.set(key("k"), "new".into()).await;
        tokio::time::advance(Duration::from_millis(80)).await;
        assert_eq!(cache.get(&key("k")).await.as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let cache = cache(100, 10);
        cache.set(key("old"), "1".into()).await;
        tokio::time::advance(Duration::from_millis(60)).await;
        cache.set(key("young"), "2".into()).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&key("young")).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_on_interval() {
        let cache = ContextCache::<String>::new(CacheConfig {
            ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10),
            max_entries: 10,
        });
        cache.start_sweeper().await;
        settle().await;
        cache.set(key("a"), "1".into()).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        // Expired but the sweep has not run yet.
        assert_eq!(cache.len().await, 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(cache.len().await, 0);

        cache.stop_sweeper().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_sweep_interval_still_sweeps() {
        let cache = ContextCache::<String>::new(CacheConfig {
            ttl: Duration::from_millis(10),
            sweep_interval: Duration::ZERO,
            max_entries: 10,
        });
        cache.start_sweeper().await;
        settle().await;
        cache.set(key("a"), "1".into()).await;

        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(cache.len().await, 0);

        cache.stop_sweeper().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_rejects_new_keys_but_allows_overwrite() {
        let cache = cache(1000, 2);
        cache.set(key("a"), "1".into()).await;
        cache.set(key("b"), "2".into()).await;

        let err = cache.try_set(key("c"), "3".into()).await.unwrap_err();
        assert!(matches!(err, CacheError::Full { capacity: 2, .. }));

        // Swallowed: key c degrades to a miss.
        cache.set(key("c"), "3".into()).await;
        assert!(cache.get(&key("c")).await.is_none());

        cache.try_set(key("a"), "updated".into()).await.unwrap();
        assert_eq!(cache.get(&key("a")).await.as_deref(), Some("updated"));
        assert_eq!(cache.get(&key("b")).await.as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_makes_room_from_expired_entries() {
        let cache = cache(100, 1);
        cache.set(key("a"), "1".into()).await;
        tokio::time::advance(Duration::from_millis(150)).await;
        cache.try_set(key("b"), "2".into()).await.unwrap();
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_ages_and_lookups() {
        let cache = cache(1000, 10);
        assert_eq!(cache.stats().await, CacheStats::default());

        let first = Instant::now();
        cache.set(key("a"), "1".into()).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set(key("b"), "2".into()).await;

        cache.get(&key("a")).await;
        cache.get(&key("missing")).await;

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.oldest_created_at, Some(first));
        assert_eq!(
            stats.newest_created_at,
            Some(first + Duration::from_millis(10))
        );
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn get_or_insert_with_computes_once() {
        let cache = cache(60_000, 10);
        let mut calls = 0;

        for _ in 0..3 {
            let value = cache
                .get_or_insert_with(key("ctx"), || {
                    calls += 1;
                    async { Ok::<_, std::io::Error>("computed".to_string()) }
                })
                .await
                .unwrap();
            assert_eq!(value, "computed");
        }
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn get_or_insert_with_does_not_cache_errors() {
        let cache = cache(60_000, 10);
        let result = cache
            .get_or_insert_with(key("ctx"), || async { Err::<String, _>("lookup failed") })
            .await;
        assert_eq!(result.unwrap_err(), "lookup failed");
        assert!(cache.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_readers_and_sweeps_keep_fresh_entries() {
        let cache = cache(60_000, 256);
        let mut tasks = tokio::task::JoinSet::new();

        for writer in 0..4 {
            let cache = cache.clone();
            tasks.spawn(async move {
                let mut stored = Vec::new();
                for n in 0..100 {
                    let k = key(&format!("w{writer}-{n}"));
                    if cache.try_set(k.clone(), format!("{writer}:{n}")).await.is_ok() {
                        stored.push(k);
                    }
                    tokio::task::yield_now().await;
                }
                stored
            });
        }
        for reader in 0..4 {
            let cache = cache.clone();
            tasks.spawn(async move {
                for n in 0..100 {
                    cache.get(&key(&format!("w{reader}-{n}"))).await;
                    tokio::task::yield_now().await;
                }
                Vec::new()
            });
        }
        {
            let cache = cache.clone();
            tasks.spawn(async move {
                for _ in 0..100 {
                    assert_eq!(cache.sweep().await, 0);
                    tokio::task::yield_now().await;
                }
                Vec::new()
            });
        }

        let mut stored = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            stored.extend(joined.unwrap());
        }

        assert_eq!(stored.len(), 256);
        assert_eq!(cache.len().await, stored.len());
        for k in &stored {
            assert!(cache.get(k).await.is_some(), "{k} lost");
        }
    }

    #[tokio::test]
    async fn clear_empties_store() {
        let cache = cache(60_000, 10);
        cache.set(key("a"), "1".into()).await;
        cache.set(key("b"), "2".into()).await;
        cache.clear().await;
        assert!(cache.is_empty().await);
        assert!(cache.get(&key("a")).await.is_none());
    }
}
