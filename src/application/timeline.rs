//! Cursor pagination over a subscriber's feed.
//!
//! Backward pages (first page or `before` cursor) are served from the cached
//! window when it covers the request: either enough entries remain below the
//! cursor to fill the page plus one lookahead entry, or the window is not full and
//! therefore holds the whole feed. Anything else, including paging past the
//! floor of a full window, reads the store directly.
//!
//! Forward pages (`after` cursor) always ask the store for newer entries and
//! merge them with whatever the window holds above the cursor.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::application::engagement::durable_count;
use crate::application::pagination::{
    FeedCursor, FeedPage, FeedPosition, FeedQuery, PageLimits, PageSource, PaginationError,
    sort_feed_entries,
};
use crate::application::repos::{
    CountsRepo, FeedEntriesRepo, FeedRange, FollowershipDirectory, ObjectStore, RepoError,
};
use crate::cache::{
    CachedWindow, CounterCache, FeedCache, FollowingsCache, MaterializeError, ObjectCache,
};
use crate::domain::entities::{FeedEntryRecord, ObjectRef, ObjectSnapshot};
use crate::domain::types::{CounterKey, CounterTarget};

const METRIC_FEED_CACHE_HIT: &str = "feedline_feed_cache_hit_total";
const METRIC_FEED_CACHE_MISS: &str = "feedline_feed_cache_miss_total";
const METRIC_FEED_STORE_FALLBACK: &str = "feedline_feed_store_fallback_total";

const HYDRATE_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error(transparent)]
    InvalidQuery(#[from] PaginationError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

pub struct TimelineService {
    feed_entries: Arc<dyn FeedEntriesRepo>,
    feed_cache: Arc<FeedCache>,
    limits: PageLimits,
}

impl TimelineService {
    pub fn new(
        feed_entries: Arc<dyn FeedEntriesRepo>,
        feed_cache: Arc<FeedCache>,
        limits: PageLimits,
    ) -> Self {
        Self {
            feed_entries,
            feed_cache,
            limits,
        }
    }

    pub fn limits(&self) -> PageLimits {
        self.limits
    }

    /// Parse raw request parameters and return one page.
    pub async fn page_from_params(
        &self,
        subscriber_id: Uuid,
        before: Option<&str>,
        after: Option<&str>,
        size: Option<&str>,
    ) -> Result<FeedPage, TimelineError> {
        let query = FeedQuery::from_params(before, after, size, self.limits)?;
        self.page(subscriber_id, query).await
    }

    pub async fn page(
        &self,
        subscriber_id: Uuid,
        query: FeedQuery,
    ) -> Result<FeedPage, TimelineError> {
        let page_size = self.limits.clamp(i64::from(query.page_size)) as usize;
        match query.cursor {
            FeedCursor::First => self.page_backward(subscriber_id, None, page_size).await,
            FeedCursor::Before(position) => {
                self.page_backward(subscriber_id, Some(position), page_size)
                    .await
            }
            FeedCursor::After(position) => {
                self.page_forward(subscriber_id, position, page_size).await
            }
        }
    }

    pub async fn page_hydrated(
        &self,
        subscriber_id: Uuid,
        query: FeedQuery,
        hydrator: &FeedHydrator,
    ) -> Result<FeedPage<FeedItem>, TimelineError> {
        let page = self.page(subscriber_id, query).await?;
        Ok(hydrator.hydrate(subscriber_id, page).await?)
    }

    /// The cached window, loading it on a miss. `None` when the cache is down.
    async fn load_window(&self, subscriber_id: Uuid) -> Result<Option<CachedWindow>, RepoError> {
        match self.feed_cache.window(subscriber_id) {
            Ok(window) if window.from_cache => {
                counter!(METRIC_FEED_CACHE_HIT).increment(1);
                return Ok(Some(window));
            }
            Ok(_) => counter!(METRIC_FEED_CACHE_MISS).increment(1),
            Err(err) => {
                warn!(
                    target = "application::timeline",
                    subscriber_id = %subscriber_id,
                    error = %err,
                    "Feed cache read failed; serving from store"
                );
                return Ok(None);
            }
        }

        match self
            .feed_cache
            .materialize(subscriber_id, self.feed_entries.as_ref())
            .await
        {
            Ok(window) => Ok(Some(window)),
            Err(MaterializeError::Repo(err)) => Err(err),
            Err(MaterializeError::Cache(err)) => {
                warn!(
                    target = "application::timeline",
                    subscriber_id = %subscriber_id,
                    error = %err,
                    "Feed window could not be materialized; serving from store"
                );
                Ok(None)
            }
        }
    }

    async fn page_backward(
        &self,
        subscriber_id: Uuid,
        cursor: Option<FeedPosition>,
        page_size: usize,
    ) -> Result<FeedPage, TimelineError> {
        if let Some(window) = self.load_window(subscriber_id).await? {
            let candidates: Vec<FeedEntryRecord> = window
                .entries
                .iter()
                .filter(|entry| cursor.is_none_or(|cursor| FeedPosition::of(entry) < cursor))
                .take(page_size + 1)
                .copied()
                .collect();

            if candidates.len() > page_size || !window.is_full() {
                let source = if window.from_cache {
                    PageSource::Cache
                } else {
                    PageSource::Store
                };
                return Ok(backward_page(candidates, page_size, source));
            }
        }

        counter!(METRIC_FEED_STORE_FALLBACK).increment(1);
        let range = cursor.map_or(FeedRange::Latest, FeedRange::Before);
        let entries = self
            .feed_entries
            .list_entries(subscriber_id, range, (page_size + 1) as u32)
            .await?;
        Ok(backward_page(entries, page_size, PageSource::Store))
    }

    async fn page_forward(
        &self,
        subscriber_id: Uuid,
        cursor: FeedPosition,
        page_size: usize,
    ) -> Result<FeedPage, TimelineError> {
        let mut entries = self
            .feed_entries
            .list_entries(subscriber_id, FeedRange::After(cursor), (page_size + 1) as u32)
            .await?;

        let mut source = PageSource::Store;
        match self.feed_cache.window(subscriber_id) {
            Ok(window) if window.from_cache => {
                entries.extend(
                    window
                        .entries
                        .into_iter()
                        .filter(|entry| FeedPosition::of(entry) > cursor),
                );
                source = PageSource::Merged;
            }
            Ok(_) => {}
            Err(err) => warn!(
                target = "application::timeline",
                subscriber_id = %subscriber_id,
                error = %err,
                "Feed cache read failed while polling"
            ),
        }

        sort_feed_entries(&mut entries);
        // Newest first; the page is the run closest to the cursor.
        let has_next_page = entries.len() > page_size;
        if has_next_page {
            entries.drain(..entries.len() - page_size);
        }

        let head_cursor = entries
            .first()
            .map(FeedPosition::of)
            .unwrap_or(cursor)
            .encode();

        Ok(FeedPage {
            entries,
            has_next_page,
            next_cursor: None,
            head_cursor: Some(head_cursor),
            source,
        })
    }
}

fn backward_page(
    mut entries: Vec<FeedEntryRecord>,
    page_size: usize,
    source: PageSource,
) -> FeedPage {
    let has_next_page = entries.len() > page_size;
    entries.truncate(page_size);

    let next_cursor = if has_next_page {
        entries.last().map(|entry| FeedPosition::of(entry).encode())
    } else {
        None
    };
    let head_cursor = entries.first().map(|entry| FeedPosition::of(entry).encode());

    FeedPage {
        entries,
        has_next_page,
        next_cursor,
        head_cursor,
        source,
    }
}

/// A feed entry joined with its post, counters and follow state.
#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    pub entry: FeedEntryRecord,
    /// `None` when the post has been deleted since delivery.
    pub post: Option<ObjectSnapshot>,
    pub likes_count: i64,
    pub comments_count: i64,
    pub author_followed: bool,
}

pub struct FeedHydrator {
    objects: Arc<dyn ObjectStore>,
    object_cache: Arc<ObjectCache>,
    counts: Arc<dyn CountsRepo>,
    counters: Arc<CounterCache>,
    directory: Arc<dyn FollowershipDirectory>,
    followings: Arc<FollowingsCache>,
}

impl FeedHydrator {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        object_cache: Arc<ObjectCache>,
        counts: Arc<dyn CountsRepo>,
        counters: Arc<CounterCache>,
        directory: Arc<dyn FollowershipDirectory>,
        followings: Arc<FollowingsCache>,
    ) -> Self {
        Self {
            objects,
            object_cache,
            counts,
            counters,
            directory,
            followings,
        }
    }

    pub async fn hydrate(
        &self,
        subscriber_id: Uuid,
        page: FeedPage,
    ) -> Result<FeedPage<FeedItem>, RepoError> {
        let followed: HashSet<Uuid> = self
            .followings
            .following_ids(subscriber_id, self.directory.as_ref())
            .await?
            .into_iter()
            .collect();

        let FeedPage {
            entries,
            has_next_page,
            next_cursor,
            head_cursor,
            source,
        } = page;

        let items = stream::iter(entries)
            .map(|entry| self.hydrate_entry(entry, &followed))
            .buffered(HYDRATE_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;

        Ok(FeedPage {
            entries: items,
            has_next_page,
            next_cursor,
            head_cursor,
            source,
        })
    }

    async fn hydrate_entry(
        &self,
        entry: FeedEntryRecord,
        followed: &HashSet<Uuid>,
    ) -> Result<FeedItem, RepoError> {
        let post = self
            .object_cache
            .get_through_cache(ObjectRef::post(entry.post_id), self.objects.as_ref())
            .await?;

        let likes_key = CounterKey::likes(CounterTarget::Post, entry.post_id);
        let comments_key = CounterKey::comments(entry.post_id);
        let likes_count = self
            .counters
            .get(&likes_key, || durable_count(self.counts.as_ref(), &likes_key))
            .await?;
        let comments_count = self
            .counters
            .get(&comments_key, || {
                durable_count(self.counts.as_ref(), &comments_key)
            })
            .await?;

        let author_followed = post
            .as_ref()
            .and_then(|post| post.owner_id)
            .is_some_and(|owner| followed.contains(&owner));

        Ok(FeedItem {
            entry,
            post,
            likes_count,
            comments_count,
            author_followed,
        })
    }
}
