//! Repository traits describing persistence adapters and external collaborators.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::pagination::{FeedPosition, PaginationError};
use crate::domain::entities::{FeedEntryRecord, ObjectRef, ObjectSnapshot};
use crate::domain::types::{CounterKey, JobType};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error(transparent)]
    Pagination(#[from] PaginationError),
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    /// Whether retrying the same statement may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Timeout)
    }
}

/// Which slice of a subscriber's feed to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedRange {
    /// The newest entries.
    Latest,
    /// Entries strictly older than the position.
    Before(FeedPosition),
    /// Entries strictly newer than the position, closest to it first in the
    /// selection but returned in feed order.
    After(FeedPosition),
}

/// Outcome of a bulk insert-or-ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertSummary {
    pub inserted: u64,
    pub duplicates: u64,
}

/// Durable per-subscriber feed storage.
///
/// Every listing returns entries ordered by `(created_at desc, post_id desc)`.
#[async_trait]
pub trait FeedEntriesRepo: Send + Sync {
    /// Insert entries, silently skipping `(subscriber_id, post_id)` pairs that exist.
    async fn insert_entries(&self, entries: &[FeedEntryRecord]) -> Result<InsertSummary, RepoError>;

    async fn list_entries(
        &self,
        subscriber_id: Uuid,
        range: FeedRange,
        limit: u32,
    ) -> Result<Vec<FeedEntryRecord>, RepoError>;

    async fn count_entries(&self, subscriber_id: Uuid) -> Result<u64, RepoError>;
}

/// Follow graph lookups owned by the friendship module.
#[async_trait]
pub trait FollowershipDirectory: Send + Sync {
    async fn follower_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, RepoError>;

    async fn following_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, RepoError>;
}

/// Entity lookups owned by the user, post and comment modules.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn load_object(&self, object: ObjectRef) -> Result<Option<ObjectSnapshot>, RepoError>;
}

/// Durable counts of likes and comments.
#[async_trait]
pub trait CountsRepo: Send + Sync {
    async fn count_relations(&self, key: &CounterKey) -> Result<u64, RepoError>;
}

#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub run_at: OffsetDateTime,
    pub max_attempts: i32,
    pub priority: i32,
}

#[async_trait]
pub trait JobsRepo: Send + Sync {
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError>;
}
