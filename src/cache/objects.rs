//! Read-through cache of entity snapshots.
//!
//! Entries never expire; they are dropped by the invalidation bus whenever
//! the owning module mutates the entity.

use std::sync::Arc;

use tracing::warn;

use crate::application::repos::{ObjectStore, RepoError};
use crate::domain::entities::{ObjectRef, ObjectSnapshot};

use super::error::CacheError;
use super::keys::CacheKey;
use super::kv::KvStore;

pub struct ObjectCache {
    kv: Arc<KvStore>,
}

impl ObjectCache {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    pub fn cached(&self, object: ObjectRef) -> Result<Option<ObjectSnapshot>, CacheError> {
        let key = CacheKey::Object(object).to_string();
        match self.kv.get_text(&key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Return the snapshot from cache, loading and caching it on a miss.
    ///
    /// Cache failures are logged and the store answers instead. Missing
    /// entities are not cached.
    pub async fn get_through_cache(
        &self,
        object: ObjectRef,
        store: &dyn ObjectStore,
    ) -> Result<Option<ObjectSnapshot>, RepoError> {
        match self.cached(object) {
            Ok(Some(snapshot)) => return Ok(Some(snapshot)),
            Ok(None) => {}
            Err(err) => warn!(
                target = "cache::objects",
                kind = %object.kind,
                id = %object.id,
                error = %err,
                "Object cache read failed"
            ),
        }

        let Some(snapshot) = store.load_object(object).await? else {
            return Ok(None);
        };

        if let Err(err) = self.store(&snapshot) {
            warn!(
                target = "cache::objects",
                kind = %object.kind,
                id = %object.id,
                error = %err,
                "Object cache write failed"
            );
        }
        Ok(Some(snapshot))
    }

    fn store(&self, snapshot: &ObjectSnapshot) -> Result<(), CacheError> {
        let key = CacheKey::Object(snapshot.object_ref()).to_string();
        self.kv.set_text(&key, serde_json::to_string(snapshot)?)
    }

    pub fn invalidate(&self, object: ObjectRef) -> Result<bool, CacheError> {
        self.kv.delete(&CacheKey::Object(object).to_string())
    }
}
