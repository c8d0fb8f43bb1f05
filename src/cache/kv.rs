//! In-process key-value store for derived state.
//!
//! Holds text, integer and list values. Every public operation runs under a
//! single lock, and multi-step updates go through [`KvStore::atomically`],
//! which plays the role of a server-side script: callers never perform a
//! read-modify-write across two separate calls.
//!
//! The keyspace is bounded by `cache.max_keys` with LRU eviction. Readers
//! treat an evicted key exactly like one that was never written.
//!
//! The store has an explicit lifecycle. It is opened when the service starts
//! and closed at shutdown; operations on a closed store fail with
//! [`CacheError::Unavailable`].

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::info;

use super::config::CacheConfig;
use super::error::CacheError;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::kv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvValue {
    Text(String),
    Int(i64),
    /// Index 0 is the head of the list.
    List(VecDeque<String>),
}

impl KvValue {
    fn type_name(&self) -> &'static str {
        match self {
            KvValue::Text(_) => "text",
            KvValue::Int(_) => "int",
            KvValue::List(_) => "list",
        }
    }
}

struct KvState {
    open: bool,
    entries: LruCache<String, KvValue>,
    /// Last stamp handed out by [`KvTxn::next_stamp`]; survives evictions.
    stamp: i64,
}

pub struct KvStore {
    state: Mutex<KvState>,
}

/// View over the store handed to [`KvStore::atomically`] closures.
///
/// Reads mark the key as recently used.
pub struct KvTxn<'a> {
    entries: &'a mut LruCache<String, KvValue>,
    stamp: &'a mut i64,
}

impl KvTxn<'_> {
    pub fn exists(&mut self, key: &str) -> bool {
        self.entries.get(key).is_some()
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.pop(key).is_some()
    }

    pub fn get_text(&mut self, key: &str) -> Result<Option<&str>, CacheError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(KvValue::Text(value)) => Ok(Some(value.as_str())),
            Some(other) => Err(wrong_type(key, "text", other)),
        }
    }

    pub fn set_text(&mut self, key: &str, value: String) {
        self.entries.put(key.to_string(), KvValue::Text(value));
    }

    pub fn get_int(&mut self, key: &str) -> Result<Option<i64>, CacheError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(KvValue::Int(value)) => Ok(Some(*value)),
            Some(other) => Err(wrong_type(key, "int", other)),
        }
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.entries.put(key.to_string(), KvValue::Int(value));
    }

    /// Add `delta`, treating a missing key as zero.
    pub fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let next = self.get_int(key)?.unwrap_or(0) + delta;
        self.set_int(key, next);
        Ok(next)
    }

    /// A store-wide increasing value. Unlike a per-key counter it never
    /// repeats after the key holding it is evicted and written again.
    pub fn next_stamp(&mut self) -> i64 {
        *self.stamp += 1;
        *self.stamp
    }

    pub fn list(&mut self, key: &str) -> Result<Option<&VecDeque<String>>, CacheError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(KvValue::List(items)) => Ok(Some(items)),
            Some(other) => Err(wrong_type(key, "list", other)),
        }
    }

    /// Mutable access to an existing list.
    pub fn list_mut(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>, CacheError> {
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(KvValue::List(items)) => Ok(Some(items)),
            Some(other) => Err(wrong_type(key, "list", other)),
        }
    }

    pub fn replace_list(&mut self, key: &str, items: VecDeque<String>) {
        self.entries.put(key.to_string(), KvValue::List(items));
    }
}

fn wrong_type(key: &str, expected: &'static str, found: &KvValue) -> CacheError {
    CacheError::corrupt(
        key,
        format!("expected {expected} value, found {}", found.type_name()),
    )
}

impl KvStore {
    /// Create a store that is already open, bounded by `config.max_keys`.
    pub fn open(config: &CacheConfig) -> Self {
        Self::with_capacity(config.max_keys_non_zero())
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        info!(
            target = "cache::kv",
            capacity = capacity.get(),
            "Key-value store opened"
        );
        Self {
            state: Mutex::new(KvState {
                open: true,
                entries: LruCache::new(capacity),
                stamp: 0,
            }),
        }
    }

    /// Close the store and drop its contents. Later calls fail as unavailable.
    pub fn close(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "close");
        let dropped = state.entries.len();
        state.open = false;
        state.entries.clear();
        info!(target = "cache::kv", dropped, "Key-value store closed");
    }

    /// Reopen a closed store with empty contents.
    pub fn reopen(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "reopen");
        state.open = true;
    }

    pub fn is_open(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "is_open").open
    }

    /// Run `script` with exclusive access to the whole keyspace.
    pub fn atomically<R>(
        &self,
        op: &'static str,
        script: impl FnOnce(&mut KvTxn<'_>) -> Result<R, CacheError>,
    ) -> Result<R, CacheError> {
        let mut guard = mutex_lock(&self.state, SOURCE, op);
        let state = &mut *guard;
        if !state.open {
            return Err(CacheError::Unavailable { op });
        }
        let mut txn = KvTxn {
            entries: &mut state.entries,
            stamp: &mut state.stamp,
        };
        script(&mut txn)
    }

    pub fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.atomically("exists", |txn| Ok(txn.exists(key)))
    }

    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.atomically("delete", |txn| Ok(txn.delete(key)))
    }

    pub fn get_text(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.atomically("get_text", |txn| {
            Ok(txn.get_text(key)?.map(ToString::to_string))
        })
    }

    pub fn set_text(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.atomically("set_text", |txn| {
            txn.set_text(key, value);
            Ok(())
        })
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>, CacheError> {
        self.atomically("get_int", |txn| txn.get_int(key))
    }

    /// Store `value` unless the key already exists; returns the stored value.
    pub fn set_int_if_absent(&self, key: &str, value: i64) -> Result<i64, CacheError> {
        self.atomically("set_int_if_absent", |txn| match txn.get_int(key)? {
            Some(existing) => Ok(existing),
            None => {
                txn.set_int(key, value);
                Ok(value)
            }
        })
    }

    /// Add `delta` only when the key exists.
    pub fn incr_if_present(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError> {
        self.atomically("incr_if_present", |txn| {
            if txn.get_int(key)?.is_none() {
                return Ok(None);
            }
            txn.incr_by(key, delta).map(Some)
        })
    }

    /// Drop every key. Used by operators and tests to force reconstruction.
    pub fn flush_all(&self) -> Result<usize, CacheError> {
        self.atomically("flush_all", |txn| {
            let dropped = txn.entries.len();
            txn.entries.clear();
            Ok(dropped)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn store() -> KvStore {
        KvStore::open(&CacheConfig::default())
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero capacity")
    }

    #[test]
    fn closed_store_is_unavailable() {
        let kv = store();
        kv.set_text("a", "1".to_string()).expect("set");
        kv.close();

        assert!(!kv.is_open());
        assert!(matches!(
            kv.get_text("a"),
            Err(CacheError::Unavailable { op: "get_text" })
        ));

        kv.reopen();
        assert_eq!(kv.get_text("a").expect("get"), None);
    }

    #[test]
    fn set_if_absent_keeps_first_writer() {
        let kv = store();
        assert_eq!(kv.set_int_if_absent("n", 5).expect("set"), 5);
        assert_eq!(kv.set_int_if_absent("n", 9).expect("set"), 5);
        assert_eq!(kv.incr_if_present("n", 2).expect("incr"), Some(7));
        assert_eq!(kv.incr_if_present("missing", 2).expect("incr"), None);
    }

    #[test]
    fn wrong_type_is_reported_as_corrupt() {
        let kv = store();
        kv.set_text("k", "text".to_string()).expect("set");
        assert!(matches!(kv.get_int("k"), Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn keyspace_is_bounded_by_capacity() {
        let kv = KvStore::with_capacity(capacity(100));
        for n in 0..5_000 {
            kv.set_int_if_absent(&format!("counter:{n}"), n).expect("set");
        }

        assert_eq!(kv.flush_all().expect("flush"), 100);
    }

    #[test]
    fn least_recently_used_key_is_evicted_first() {
        let kv = KvStore::with_capacity(capacity(3));
        for key in ["a", "b", "c"] {
            kv.set_text(key, key.to_string()).expect("set");
        }

        // Reading `a` makes `b` the eviction candidate.
        assert_eq!(kv.get_text("a").expect("get").as_deref(), Some("a"));
        kv.set_text("d", "d".to_string()).expect("set");

        assert!(kv.exists("a").expect("exists"));
        assert!(!kv.exists("b").expect("exists"));
        assert!(kv.exists("c").expect("exists"));
        assert!(kv.exists("d").expect("exists"));
    }

    #[test]
    fn stamps_do_not_repeat_after_eviction() {
        let kv = KvStore::with_capacity(capacity(1));
        let first = kv
            .atomically("stamp", |txn| {
                let stamp = txn.next_stamp();
                txn.set_int("gen", stamp);
                Ok(stamp)
            })
            .expect("stamp");
        kv.set_text("other", "x".to_string()).expect("evict gen");
        assert_eq!(kv.get_int("gen").expect("get"), None);

        let second = kv
            .atomically("stamp", |txn| Ok(txn.next_stamp()))
            .expect("stamp");
        assert!(second > first);
    }

    #[test]
    fn concurrent_scripts_do_not_lose_updates() {
        let kv = Arc::new(store());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let kv = Arc::clone(&kv);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        kv.atomically("bump", |txn| txn.incr_by("n", 1))
                            .expect("bump");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(kv.get_int("n").expect("get"), Some(800));
    }
}
