//! Records flowing between the store, the cache and the job queue.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::types::ObjectKind;

/// One post delivered into one subscriber's feed.
///
/// `created_at` is the post's creation time, so every subscriber's entry for
/// the same post carries the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedEntryRecord {
    pub subscriber_id: Uuid,
    pub post_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl FeedEntryRecord {
    pub fn new(subscriber_id: Uuid, post_id: Uuid, created_at: OffsetDateTime) -> Self {
        Self {
            subscriber_id,
            post_id,
            created_at,
        }
    }
}

/// Typed reference to a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: Uuid,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    pub fn post(id: Uuid) -> Self {
        Self::new(ObjectKind::Post, id)
    }

    pub fn user(id: Uuid) -> Self {
        Self::new(ObjectKind::User, id)
    }

    pub fn comment(id: Uuid) -> Self {
        Self::new(ObjectKind::Comment, id)
    }
}

/// Serialized snapshot of a user, post or comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub kind: ObjectKind,
    pub id: Uuid,
    /// Author of a post or comment; `None` for users.
    #[serde(default)]
    pub owner_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub body: serde_json::Value,
}

impl ObjectSnapshot {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind, self.id)
    }
}

/// A follow relationship: `from_user_id` follows `to_user_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FollowEdge {
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
}
