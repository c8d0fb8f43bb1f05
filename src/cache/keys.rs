//! Cache key layout.

use std::fmt;

use uuid::Uuid;

use crate::domain::entities::ObjectRef;
use crate::domain::types::CounterKey;

/// Every key the pipeline writes into the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// `feed:{subscriber}`: the ordered window itself.
    FeedWindow(Uuid),
    /// `feed:{subscriber}:ready`: set once the window is authoritative.
    FeedReady(Uuid),
    /// `feed:{subscriber}:gen`: bumped by every push, cold or warm.
    FeedGeneration(Uuid),
    /// `counter:{kind}:{id}:{name}`
    Counter(CounterKey),
    /// `object:{kind}:{id}`
    Object(ObjectRef),
    /// `followings:{user}`
    Followings(Uuid),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::FeedWindow(id) => write!(f, "feed:{id}"),
            CacheKey::FeedReady(id) => write!(f, "feed:{id}:ready"),
            CacheKey::FeedGeneration(id) => write!(f, "feed:{id}:gen"),
            CacheKey::Counter(key) => write!(
                f,
                "counter:{}:{}:{}",
                key.target().as_str(),
                key.target_id(),
                key.name().as_str()
            ),
            CacheKey::Object(object) => write!(f, "object:{}:{}", object.kind, object.id),
            CacheKey::Followings(id) => write!(f, "followings:{id}"),
        }
    }
}
