use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::application::repos::{FollowershipDirectory, RepoError};

use super::error::CacheError;
use super::keys::CacheKey;
use super::kv::KvStore;

/// Cached set of user ids a user follows.
pub struct FollowingsCache {
    kv: Arc<KvStore>,
}

impl FollowingsCache {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    pub async fn following_ids(
        &self,
        user_id: Uuid,
        directory: &dyn FollowershipDirectory,
    ) -> Result<Vec<Uuid>, RepoError> {
        let key = CacheKey::Followings(user_id).to_string();
        match self.read(&key) {
            Ok(Some(ids)) => return Ok(ids),
            Ok(None) => {}
            Err(err) => warn!(
                target = "cache::followings",
                user_id = %user_id,
                error = %err,
                "Followings cache read failed"
            ),
        }

        let mut ids = directory.following_ids(user_id).await?;
        ids.sort_unstable();
        ids.dedup();

        let encoded = serde_json::to_string(&ids).map_err(RepoError::from_persistence)?;
        if let Err(err) = self.kv.set_text(&key, encoded) {
            warn!(
                target = "cache::followings",
                user_id = %user_id,
                error = %err,
                "Followings cache write failed"
            );
        }
        Ok(ids)
    }

    fn read(&self, key: &str) -> Result<Option<Vec<Uuid>>, CacheError> {
        match self.kv.get_text(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn invalidate(&self, user_id: Uuid) -> Result<bool, CacheError> {
        self.kv.delete(&CacheKey::Followings(user_id).to_string())
    }
}
