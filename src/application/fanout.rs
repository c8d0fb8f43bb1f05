//! Fan-out-on-write.
//!
//! [`FanoutCoordinator::fanout`] runs on the request path: it writes the
//! author's own entry and enqueues a `fanout_post` job. That job calls
//! [`FanoutCoordinator::dispatch_batches`], which splits the follower list
//! into `batch_size` chunks and enqueues one `fanout_batch` job per chunk.
//! Each batch job runs [`BatchFanoutWorker::process_batch`].
//!
//! Every step is safe to repeat: rows are insert-or-ignore and window
//! pushes skip posts that are already cached.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::jobs::{enqueue_fanout_batch_job, enqueue_fanout_post_job};
use crate::application::repos::{
    FeedEntriesRepo, FollowershipDirectory, JobsRepo, ObjectStore, RepoError,
};
use crate::application::retry::RetryPolicy;
use crate::cache::{FeedCache, ObjectCache, PushOutcome};
use crate::domain::entities::{FeedEntryRecord, ObjectRef, ObjectSnapshot};
use crate::domain::types::ObjectKind;

const METRIC_FANOUT_BATCHES_ENQUEUED: &str = "feedline_fanout_batches_enqueued_total";
const METRIC_FANOUT_ENTRIES_INSERTED: &str = "feedline_fanout_entries_inserted_total";
const METRIC_FANOUT_CACHE_PUSH_FAILURES: &str = "feedline_fanout_cache_push_failures_total";
const METRIC_FANOUT_BATCH_MS: &str = "feedline_fanout_batch_ms";

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_JOB_MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct FanoutSettings {
    pub batch_size: NonZeroUsize,
    /// Attempts recorded on every enqueued job.
    pub job_max_attempts: i32,
    pub store_retry: RetryPolicy,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(DEFAULT_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN),
            job_max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
            store_retry: RetryPolicy::default(),
        }
    }
}

impl From<&crate::config::FanoutSettings> for FanoutSettings {
    fn from(settings: &crate::config::FanoutSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            job_max_attempts: i32::try_from(settings.job_max_attempts.get()).unwrap_or(i32::MAX),
            store_retry: RetryPolicy {
                max_attempts: settings.store_retry_attempts.get(),
                base_delay: settings.store_retry_base_delay,
                ..RetryPolicy::default()
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("post `{0}` could not be resolved")]
    UnknownPost(Uuid),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl FanoutError {
    /// Fatal errors abort the job; retrying cannot fix the payload.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownPost(_))
    }
}

/// Returned to the caller of [`FanoutCoordinator::fanout`].
#[derive(Debug, Clone)]
pub struct FanoutTicket {
    pub self_entry: FeedEntryRecord,
    pub job_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutSummary {
    pub follower_count: usize,
    pub batch_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub subscribers: usize,
    pub inserted: u64,
    pub duplicates: u64,
    pub cache_pushes: usize,
    pub cache_failures: usize,
}

async fn resolve_post(
    object_cache: &ObjectCache,
    objects: &dyn ObjectStore,
    post_id: Uuid,
) -> Result<ObjectSnapshot, FanoutError> {
    match object_cache
        .get_through_cache(ObjectRef::post(post_id), objects)
        .await?
    {
        Some(snapshot) if snapshot.kind == ObjectKind::Post => Ok(snapshot),
        _ => Err(FanoutError::UnknownPost(post_id)),
    }
}

/// Push into the window; failures are logged and counted, never raised.
fn push_logged(feed_cache: &FeedCache, entry: &FeedEntryRecord) -> Option<PushOutcome> {
    match feed_cache.push(entry) {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            counter!(METRIC_FANOUT_CACHE_PUSH_FAILURES).increment(1);
            warn!(
                target = "application::fanout",
                subscriber_id = %entry.subscriber_id,
                post_id = %entry.post_id,
                error = %err,
                "Feed cache push failed; window will be rebuilt on read"
            );
            None
        }
    }
}

pub struct FanoutCoordinator {
    feed_entries: Arc<dyn FeedEntriesRepo>,
    directory: Arc<dyn FollowershipDirectory>,
    objects: Arc<dyn ObjectStore>,
    object_cache: Arc<ObjectCache>,
    feed_cache: Arc<FeedCache>,
    jobs: Arc<dyn JobsRepo>,
    settings: FanoutSettings,
}

impl FanoutCoordinator {
    pub fn new(
        feed_entries: Arc<dyn FeedEntriesRepo>,
        directory: Arc<dyn FollowershipDirectory>,
        objects: Arc<dyn ObjectStore>,
        object_cache: Arc<ObjectCache>,
        feed_cache: Arc<FeedCache>,
        jobs: Arc<dyn JobsRepo>,
        settings: FanoutSettings,
    ) -> Self {
        Self {
            feed_entries,
            directory,
            objects,
            object_cache,
            feed_cache,
            jobs,
            settings,
        }
    }

    pub fn settings(&self) -> &FanoutSettings {
        &self.settings
    }

    /// Deliver a new post: self entry now, followers through the job queue.
    pub async fn fanout(
        &self,
        post_id: Uuid,
        author_id: Uuid,
    ) -> Result<FanoutTicket, FanoutError> {
        let post = resolve_post(&self.object_cache, self.objects.as_ref(), post_id).await?;
        let self_entry = FeedEntryRecord::new(author_id, post_id, post.created_at);

        self.settings
            .store_retry
            .run("fanout.self_entry", || {
                self.feed_entries
                    .insert_entries(std::slice::from_ref(&self_entry))
            })
            .await?;
        push_logged(&self.feed_cache, &self_entry);

        let job_id = enqueue_fanout_post_job(
            self.jobs.as_ref(),
            post_id,
            author_id,
            self.settings.job_max_attempts,
        )
        .await?;

        info!(
            target = "application::fanout",
            post_id = %post_id,
            author_id = %author_id,
            job_id = %job_id,
            "Fanout scheduled"
        );

        Ok(FanoutTicket { self_entry, job_id })
    }

    /// Split the author's followers into batches and enqueue one job per batch.
    ///
    /// Does not wait for the batches. Zero followers means zero batches.
    pub async fn dispatch_batches(
        &self,
        post_id: Uuid,
        author_id: Uuid,
    ) -> Result<FanoutSummary, FanoutError> {
        let mut followers = self
            .settings
            .store_retry
            .run("fanout.followers", || self.directory.follower_ids(author_id))
            .await?;
        followers.retain(|id| *id != author_id);

        let mut batch_count = 0;
        for chunk in followers.chunks(self.settings.batch_size.get()) {
            enqueue_fanout_batch_job(
                self.jobs.as_ref(),
                post_id,
                chunk.to_vec(),
                self.settings.job_max_attempts,
            )
            .await?;
            batch_count += 1;
        }
        counter!(METRIC_FANOUT_BATCHES_ENQUEUED).increment(batch_count as u64);

        let summary = FanoutSummary {
            follower_count: followers.len(),
            batch_count,
        };
        info!(
            target = "application::fanout",
            post_id = %post_id,
            author_id = %author_id,
            followers = summary.follower_count,
            batches = summary.batch_count,
            "Fanout batches enqueued"
        );
        Ok(summary)
    }
}

pub struct BatchFanoutWorker {
    feed_entries: Arc<dyn FeedEntriesRepo>,
    objects: Arc<dyn ObjectStore>,
    object_cache: Arc<ObjectCache>,
    feed_cache: Arc<FeedCache>,
    store_retry: RetryPolicy,
}

impl BatchFanoutWorker {
    pub fn new(
        feed_entries: Arc<dyn FeedEntriesRepo>,
        objects: Arc<dyn ObjectStore>,
        object_cache: Arc<ObjectCache>,
        feed_cache: Arc<FeedCache>,
        store_retry: RetryPolicy,
    ) -> Self {
        Self {
            feed_entries,
            objects,
            object_cache,
            feed_cache,
            store_retry,
        }
    }

    /// Persist one entry per subscriber, then push each into its window.
    ///
    /// Durable rows are written before any push, so a window that misses a
    /// push is repaired by the next load. Push failures never fail the batch.
    pub async fn process_batch(
        &self,
        post_id: Uuid,
        subscriber_ids: &[Uuid],
    ) -> Result<BatchOutcome, FanoutError> {
        let started_at = Instant::now();
        let post = resolve_post(&self.object_cache, self.objects.as_ref(), post_id).await?;

        let entries: Vec<FeedEntryRecord> = subscriber_ids
            .iter()
            .map(|subscriber_id| FeedEntryRecord::new(*subscriber_id, post_id, post.created_at))
            .collect();

        let inserted = self
            .store_retry
            .run("fanout.insert_batch", || {
                self.feed_entries.insert_entries(&entries)
            })
            .await?;
        counter!(METRIC_FANOUT_ENTRIES_INSERTED).increment(inserted.inserted);

        let mut outcome = BatchOutcome {
            subscribers: entries.len(),
            inserted: inserted.inserted,
            duplicates: inserted.duplicates,
            ..BatchOutcome::default()
        };
        for entry in &entries {
            match push_logged(&self.feed_cache, entry) {
                Some(PushOutcome::Inserted) => outcome.cache_pushes += 1,
                Some(_) => {}
                None => outcome.cache_failures += 1,
            }
        }

        histogram!(METRIC_FANOUT_BATCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        info!(
            target = "application::fanout",
            post_id = %post_id,
            subscribers = outcome.subscribers,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            cache_pushes = outcome.cache_pushes,
            cache_failures = outcome.cache_failures,
            "Fanout batch processed"
        );
        Ok(outcome)
    }
}
