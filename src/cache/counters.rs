//! Cache-aside counters for likes and comments.

use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::application::repos::RepoError;
use crate::domain::types::CounterKey;

use super::keys::CacheKey;
use super::kv::KvStore;

pub struct CounterCache {
    kv: Arc<KvStore>,
}

impl CounterCache {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    /// Read a counter, computing and caching it on a miss.
    ///
    /// A concurrent initializer that stored its value first wins; the cached
    /// value is what gets returned. When the cache is unavailable the computed
    /// value is returned directly.
    pub async fn get<F, Fut>(&self, key: &CounterKey, compute: F) -> Result<i64, RepoError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<i64, RepoError>>,
    {
        let cache_key = CacheKey::Counter(*key).to_string();
        match self.kv.get_int(&cache_key) {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target = "cache::counters",
                    key = %cache_key,
                    error = %err,
                    "Counter cache read failed; using durable count"
                );
                return compute().await;
            }
        }

        let computed = compute().await?;
        match self.kv.set_int_if_absent(&cache_key, computed) {
            Ok(stored) => Ok(stored),
            Err(err) => {
                warn!(
                    target = "cache::counters",
                    key = %cache_key,
                    error = %err,
                    "Counter cache write failed"
                );
                Ok(computed)
            }
        }
    }

    /// Apply `delta` to a counter.
    ///
    /// The base value is always established through [`CounterCache::get`]
    /// before the delta lands, so a missing key is never incremented from
    /// zero. Returns `None` when the cache is unavailable; the next read then
    /// recomputes from the store.
    pub async fn increment<F, Fut>(
        &self,
        key: &CounterKey,
        delta: i64,
        compute: F,
    ) -> Result<Option<i64>, RepoError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<i64, RepoError>>,
    {
        let cache_key = CacheKey::Counter(*key).to_string();
        loop {
            match self.kv.incr_if_present(&cache_key, delta) {
                Ok(Some(value)) => return Ok(Some(value)),
                // Initialize, then retry the add; a flush in between sends us
                // around again.
                Ok(None) => {
                    self.get(key, &compute).await?;
                }
                Err(err) => {
                    warn!(
                        target = "cache::counters",
                        key = %cache_key,
                        delta,
                        error = %err,
                        "Counter increment skipped"
                    );
                    return Ok(None);
                }
            }
        }
    }

    /// Apply `delta` to a cached counter, or initialize a cold one from
    /// `compute` without applying it.
    ///
    /// For callers whose change is already durable: `compute` then counts it
    /// along with every other committed change the cache has not seen.
    pub async fn refresh_or_increment<F, Fut>(
        &self,
        key: &CounterKey,
        delta: i64,
        compute: F,
    ) -> Result<Option<i64>, RepoError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<i64, RepoError>>,
    {
        let cache_key = CacheKey::Counter(*key).to_string();
        match self.kv.incr_if_present(&cache_key, delta) {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => self.get(key, compute).await.map(Some),
            Err(err) => {
                warn!(
                    target = "cache::counters",
                    key = %cache_key,
                    delta,
                    error = %err,
                    "Counter increment skipped"
                );
                Ok(None)
            }
        }
    }

    pub async fn decrement<F, Fut>(
        &self,
        key: &CounterKey,
        delta: i64,
        compute: F,
    ) -> Result<Option<i64>, RepoError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<i64, RepoError>>,
    {
        self.increment(key, -delta, compute).await
    }

    /// Drop a cached counter.
    pub fn forget(&self, key: &CounterKey) -> bool {
        self.kv
            .delete(&CacheKey::Counter(*key).to_string())
            .unwrap_or(false)
    }
}
