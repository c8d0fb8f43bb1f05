//! In-memory collaborators and a wired pipeline for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use time::{Duration, OffsetDateTime, macros::datetime};
use uuid::Uuid;

use feedline::application::engagement::EngagementHooks;
use feedline::application::fanout::{BatchFanoutWorker, FanoutCoordinator, FanoutSettings};
use feedline::application::jobs::{FanoutBatchJob, FanoutPostJob};
use feedline::application::pagination::{FeedCursor, FeedPage, FeedPosition, FeedQuery};
use feedline::application::repos::{
    CountsRepo, FeedEntriesRepo, FeedRange, FollowershipDirectory, InsertSummary, JobsRepo,
    NewJobRecord, ObjectStore, RepoError,
};
use feedline::application::timeline::{FeedHydrator, TimelineService};
use feedline::cache::{
    CacheConfig, CounterCache, FeedCache, FollowingsCache, InvalidationBus, KvStore, ObjectCache,
};
use feedline::domain::entities::{FeedEntryRecord, ObjectRef, ObjectSnapshot};
use feedline::domain::types::{CounterKey, JobType, ObjectKind};

pub const EPOCH: OffsetDateTime = datetime!(2025-03-01 12:00 UTC);

/// Timestamp `seconds` after [`EPOCH`].
pub fn at(seconds: i64) -> OffsetDateTime {
    EPOCH + Duration::seconds(seconds)
}

#[derive(Default)]
pub struct MemoryFeedEntries {
    rows: Mutex<HashMap<(Uuid, Uuid), FeedEntryRecord>>,
    failures_remaining: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MemoryFeedEntries {
    /// Make the next `count` inserts fail with a transient error.
    pub fn fail_next_inserts(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Every entry of a subscriber in feed order.
    pub fn feed_of(&self, subscriber_id: Uuid) -> Vec<FeedEntryRecord> {
        let rows = self.rows.lock().expect("rows lock");
        let mut entries: Vec<FeedEntryRecord> = rows
            .values()
            .filter(|entry| entry.subscriber_id == subscriber_id)
            .copied()
            .collect();
        entries.sort_by(|a, b| FeedPosition::of(b).cmp(&FeedPosition::of(a)));
        entries
    }

    pub fn total(&self) -> usize {
        self.rows.lock().expect("rows lock").len()
    }
}

#[async_trait]
impl FeedEntriesRepo for MemoryFeedEntries {
    async fn insert_entries(
        &self,
        entries: &[FeedEntryRecord],
    ) -> Result<InsertSummary, RepoError> {
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RepoError::Timeout);
        }

        let mut rows = self.rows.lock().expect("rows lock");
        let mut summary = InsertSummary::default();
        for entry in entries {
            let key = (entry.subscriber_id, entry.post_id);
            if rows.contains_key(&key) {
                summary.duplicates += 1;
            } else {
                rows.insert(key, *entry);
                summary.inserted += 1;
            }
        }
        Ok(summary)
    }

    async fn list_entries(
        &self,
        subscriber_id: Uuid,
        range: FeedRange,
        limit: u32,
    ) -> Result<Vec<FeedEntryRecord>, RepoError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let feed = self.feed_of(subscriber_id);
        let limit = limit as usize;

        let entries = match range {
            FeedRange::Latest => feed.into_iter().take(limit).collect(),
            FeedRange::Before(cursor) => feed
                .into_iter()
                .filter(|entry| FeedPosition::of(entry) < cursor)
                .take(limit)
                .collect(),
            FeedRange::After(cursor) => {
                let newer: Vec<_> = feed
                    .into_iter()
                    .filter(|entry| FeedPosition::of(entry) > cursor)
                    .collect();
                let skip = newer.len().saturating_sub(limit);
                newer.into_iter().skip(skip).collect()
            }
        };
        Ok(entries)
    }

    async fn count_entries(&self, subscriber_id: Uuid) -> Result<u64, RepoError> {
        Ok(self.feed_of(subscriber_id).len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryDirectory {
    edges: Mutex<BTreeSet<(Uuid, Uuid)>>,
}

impl MemoryDirectory {
    pub fn follow(&self, from_user_id: Uuid, to_user_id: Uuid) {
        self.edges
            .lock()
            .expect("edges lock")
            .insert((from_user_id, to_user_id));
    }

    pub fn unfollow(&self, from_user_id: Uuid, to_user_id: Uuid) {
        self.edges
            .lock()
            .expect("edges lock")
            .remove(&(from_user_id, to_user_id));
    }
}

#[async_trait]
impl FollowershipDirectory for MemoryDirectory {
    async fn follower_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, RepoError> {
        let edges = self.edges.lock().expect("edges lock");
        Ok(edges
            .iter()
            .filter(|(_, to)| *to == user_id)
            .map(|(from, _)| *from)
            .collect())
    }

    async fn following_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, RepoError> {
        let edges = self.edges.lock().expect("edges lock");
        Ok(edges
            .iter()
            .filter(|(from, _)| *from == user_id)
            .map(|(_, to)| *to)
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryObjects {
    objects: Mutex<HashMap<ObjectRef, ObjectSnapshot>>,
    loads: AtomicUsize,
}

impl MemoryObjects {
    pub fn add_post(&self, author_id: Uuid, created_at: OffsetDateTime) -> Uuid {
        let id = Uuid::new_v4();
        self.put(ObjectSnapshot {
            kind: ObjectKind::Post,
            id,
            owner_id: Some(author_id),
            created_at,
            body: json!({ "body": format!("post {id}") }),
        });
        id
    }

    pub fn put(&self, snapshot: ObjectSnapshot) {
        self.objects
            .lock()
            .expect("objects lock")
            .insert(snapshot.object_ref(), snapshot);
    }

    pub fn remove(&self, object: ObjectRef) {
        self.objects.lock().expect("objects lock").remove(&object);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjects {
    async fn load_object(&self, object: ObjectRef) -> Result<Option<ObjectSnapshot>, RepoError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .objects
            .lock()
            .expect("objects lock")
            .get(&object)
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryCounts {
    counts: Mutex<HashMap<CounterKey, u64>>,
    calls: AtomicUsize,
}

impl MemoryCounts {
    pub fn set(&self, key: CounterKey, value: u64) {
        self.counts.lock().expect("counts lock").insert(key, value);
    }

    pub fn add(&self, key: CounterKey, delta: i64) {
        let mut counts = self.counts.lock().expect("counts lock");
        let value = counts.entry(key).or_default();
        *value = value.saturating_add_signed(delta);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CountsRepo for MemoryCounts {
    async fn count_relations(&self, key: &CounterKey) -> Result<u64, RepoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .counts
            .lock()
            .expect("counts lock")
            .get(key)
            .copied()
            .unwrap_or(0))
    }
}

#[derive(Default)]
pub struct RecordingJobs {
    queue: Mutex<Vec<NewJobRecord>>,
    enqueued: AtomicUsize,
}

impl RecordingJobs {
    pub fn take(&self) -> Vec<NewJobRecord> {
        std::mem::take(&mut *self.queue.lock().expect("queue lock"))
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("queue lock").len()
    }

    pub fn enqueued(&self) -> usize {
        self.enqueued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobsRepo for RecordingJobs {
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError> {
        let id = self.enqueued.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().expect("queue lock").push(job);
        Ok(format!("job-{id}"))
    }
}

/// Jobs processed by [`Harness::run_jobs`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobRun {
    pub post_jobs: usize,
    pub batch_jobs: usize,
}

/// The whole pipeline over in-memory collaborators and one cache store.
pub struct Harness {
    pub kv: Arc<KvStore>,
    pub feed_entries: Arc<MemoryFeedEntries>,
    pub directory: Arc<MemoryDirectory>,
    pub objects: Arc<MemoryObjects>,
    pub counts: Arc<MemoryCounts>,
    pub jobs: Arc<RecordingJobs>,
    pub feed_cache: Arc<FeedCache>,
    pub object_cache: Arc<ObjectCache>,
    pub counters: Arc<CounterCache>,
    pub followings: Arc<FollowingsCache>,
    pub bus: Arc<InvalidationBus>,
    pub coordinator: FanoutCoordinator,
    pub worker: BatchFanoutWorker,
    pub timeline: TimelineService,
    pub hydrator: FeedHydrator,
    pub engagement: EngagementHooks,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default(), FanoutSettings::default())
    }

    pub fn with_config(cache: CacheConfig, fanout: FanoutSettings) -> Self {
        let kv = Arc::new(KvStore::open(&cache));
        let feed_entries = Arc::new(MemoryFeedEntries::default());
        let directory = Arc::new(MemoryDirectory::default());
        let objects = Arc::new(MemoryObjects::default());
        let counts = Arc::new(MemoryCounts::default());
        let jobs = Arc::new(RecordingJobs::default());

        let feed_cache = Arc::new(FeedCache::new(kv.clone(), &cache));
        let object_cache = Arc::new(ObjectCache::new(kv.clone()));
        let counters = Arc::new(CounterCache::new(kv.clone()));
        let followings = Arc::new(FollowingsCache::new(kv.clone()));
        let bus = Arc::new(InvalidationBus::new(
            object_cache.clone(),
            followings.clone(),
        ));

        let coordinator = FanoutCoordinator::new(
            feed_entries.clone(),
            directory.clone(),
            objects.clone(),
            object_cache.clone(),
            feed_cache.clone(),
            jobs.clone(),
            fanout,
        );
        let worker = BatchFanoutWorker::new(
            feed_entries.clone(),
            objects.clone(),
            object_cache.clone(),
            feed_cache.clone(),
            fanout.store_retry,
        );
        let timeline = TimelineService::new(
            feed_entries.clone(),
            feed_cache.clone(),
            cache.page_limits(),
        );
        let hydrator = FeedHydrator::new(
            objects.clone(),
            object_cache.clone(),
            counts.clone(),
            counters.clone(),
            directory.clone(),
            followings.clone(),
        );
        let engagement = EngagementHooks::new(counters.clone(), counts.clone(), bus.clone());

        Self {
            kv,
            feed_entries,
            directory,
            objects,
            counts,
            jobs,
            feed_cache,
            object_cache,
            counters,
            followings,
            bus,
            coordinator,
            worker,
            timeline,
            hydrator,
            engagement,
        }
    }

    /// Register `count` new users following `author_id`.
    pub fn add_followers(&self, author_id: Uuid, count: usize) -> Vec<Uuid> {
        (0..count)
            .map(|_| {
                let follower = Uuid::new_v4();
                self.directory.follow(follower, author_id);
                follower
            })
            .collect()
    }

    /// Create a post and run its fan-out to completion.
    pub async fn publish(&self, author_id: Uuid, created_at: OffsetDateTime) -> Uuid {
        let post_id = self.objects.add_post(author_id, created_at);
        self.coordinator
            .fanout(post_id, author_id)
            .await
            .expect("fanout scheduled");
        self.run_jobs().await;
        post_id
    }

    /// Drain the job queue, running post jobs before the batches they create.
    pub async fn run_jobs(&self) -> JobRun {
        let mut run = JobRun::default();
        loop {
            let jobs = self.jobs.take();
            if jobs.is_empty() {
                return run;
            }
            for job in jobs {
                match job.job_type {
                    JobType::FanoutPost => {
                        let payload: FanoutPostJob =
                            serde_json::from_value(job.payload).expect("post job payload");
                        self.coordinator
                            .dispatch_batches(payload.post_id, payload.author_id)
                            .await
                            .expect("batches dispatched");
                        run.post_jobs += 1;
                    }
                    JobType::FanoutBatch => {
                        let payload: FanoutBatchJob =
                            serde_json::from_value(job.payload).expect("batch job payload");
                        self.worker
                            .process_batch(payload.post_id, &payload.subscriber_ids)
                            .await
                            .expect("batch processed");
                        run.batch_jobs += 1;
                    }
                }
            }
        }
    }

    /// Follow `next_cursor` from the first page until the feed is exhausted.
    pub async fn walk_feed(&self, subscriber_id: Uuid, page_size: u32) -> Vec<FeedPage> {
        let mut pages = Vec::new();
        let mut query = FeedQuery::first(page_size);
        loop {
            let page = self
                .timeline
                .page(subscriber_id, query)
                .await
                .expect("page");
            let next = page.next_cursor.clone();
            pages.push(page);
            match next {
                Some(cursor) => {
                    query = FeedQuery {
                        cursor: FeedCursor::Before(
                            FeedPosition::decode(&cursor).expect("cursor decodes"),
                        ),
                        page_size,
                    };
                }
                None => return pages,
            }
        }
    }
}

pub fn post_ids(pages: &[FeedPage]) -> Vec<Uuid> {
    pages
        .iter()
        .flat_map(|page| page.entries.iter().map(|entry| entry.post_id))
        .collect()
}
