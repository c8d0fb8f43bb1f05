//! Bounded per-subscriber feed windows.
//!
//! A window holds the newest `list_limit` entries of one subscriber's feed,
//! serialized as `{post_id, created_at}` items, newest first. It is either
//! absent or an exact prefix of the durable feed:
//!
//! - `feed:{id}:ready` marks the window as authoritative. Without it pushes
//!   leave the window alone, because the durable row they follow will be
//!   picked up by the next load. A ready flag whose list was evicted counts
//!   as a cold window.
//! - `feed:{id}:gen` is restamped by every push. A load installs its snapshot
//!   only if the generation did not move while it was reading the store.
//!   Stamps come from [`KvTxn::next_stamp`], so an evicted generation never
//!   comes back with the value a load saw earlier.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::pagination::FeedPosition;
use crate::application::repos::{FeedEntriesRepo, FeedRange, RepoError};
use crate::domain::entities::FeedEntryRecord;

use super::config::CacheConfig;
use super::error::CacheError;
use super::keys::CacheKey;
use super::kv::{KvStore, KvTxn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WindowItem {
    post_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

impl WindowItem {
    fn position(&self) -> FeedPosition {
        FeedPosition::new(self.created_at, self.post_id)
    }

    fn into_entry(self, subscriber_id: Uuid) -> FeedEntryRecord {
        FeedEntryRecord::new(subscriber_id, self.post_id, self.created_at)
    }
}

fn encode_item(entry: &FeedEntryRecord) -> Result<String, CacheError> {
    let item = WindowItem {
        post_id: entry.post_id,
        created_at: entry.created_at,
    };
    Ok(serde_json::to_string(&item)?)
}

fn decode_item(key: &str, raw: &str) -> Result<WindowItem, CacheError> {
    serde_json::from_str(raw)
        .map_err(|err| CacheError::corrupt(key, format!("undecodable window item: {err}")))
}

struct FeedKeys {
    window: String,
    ready: String,
    generation: String,
}

impl FeedKeys {
    fn new(subscriber_id: Uuid) -> Self {
        Self {
            window: CacheKey::FeedWindow(subscriber_id).to_string(),
            ready: CacheKey::FeedReady(subscriber_id).to_string(),
            generation: CacheKey::FeedGeneration(subscriber_id).to_string(),
        }
    }
}

/// Result of reading a subscriber's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedWindow {
    pub entries: Vec<FeedEntryRecord>,
    /// False when no authoritative window exists.
    pub from_cache: bool,
    limit: usize,
}

impl CachedWindow {
    fn absent(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            from_cache: false,
            limit,
        }
    }

    /// A full window may be hiding older entries; a partial one is the whole feed.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    /// The oldest cached position.
    pub fn floor(&self) -> Option<FeedPosition> {
        self.entries.last().map(FeedPosition::of)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// No window exists yet; the next load will include the entry.
    Cold,
    Inserted,
    /// The post was already in the window.
    Duplicate,
    /// Older than everything in a full window.
    BelowFloor,
}

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

enum Install {
    Installed,
    AlreadyReady,
    Conflict,
}

/// The window's generation, stamping a fresh one when none is stored.
fn current_generation(txn: &mut KvTxn<'_>, keys: &FeedKeys) -> Result<i64, CacheError> {
    if let Some(generation) = txn.get_int(&keys.generation)? {
        return Ok(generation);
    }
    let stamp = txn.next_stamp();
    txn.set_int(&keys.generation, stamp);
    Ok(stamp)
}

pub struct FeedCache {
    kv: Arc<KvStore>,
    list_limit: usize,
    materialize_attempts: u32,
}

impl FeedCache {
    pub fn new(kv: Arc<KvStore>, config: &CacheConfig) -> Self {
        Self {
            kv,
            list_limit: config.list_limit_non_zero().get(),
            materialize_attempts: config.materialize_attempts.max(1),
        }
    }

    pub fn list_limit(&self) -> usize {
        self.list_limit
    }

    /// Insert `entry` into its subscriber's window at its ordered position.
    ///
    /// Runs as one script: restamp the generation, bail out on a cold window,
    /// skip posts already present, insert, trim to `list_limit`.
    pub fn push(&self, entry: &FeedEntryRecord) -> Result<PushOutcome, CacheError> {
        let keys = FeedKeys::new(entry.subscriber_id);
        let raw = encode_item(entry)?;
        let position = FeedPosition::of(entry);
        let limit = self.list_limit;

        self.kv.atomically("feed.push", |txn| {
            let stamp = txn.next_stamp();
            txn.set_int(&keys.generation, stamp);
            if !txn.exists(&keys.ready) {
                return Ok(PushOutcome::Cold);
            }

            let Some(items) = txn.list_mut(&keys.window)? else {
                txn.delete(&keys.ready);
                return Ok(PushOutcome::Cold);
            };
            let mut duplicate = None;
            let mut insert_at = None;
            for (index, existing) in items.iter().enumerate() {
                let current = decode_item(&keys.window, existing)?;
                if current.post_id == entry.post_id {
                    duplicate = Some((index, current.position()));
                }
                if insert_at.is_none() && current.position() < position {
                    insert_at = Some(index);
                }
            }

            if let Some((index, existing_position)) = duplicate {
                if existing_position == position {
                    return Ok(PushOutcome::Duplicate);
                }
                items.remove(index);
                insert_at = insert_at.map(|at| if at > index { at - 1 } else { at });
            }

            let at = insert_at.unwrap_or(items.len());
            if at >= limit {
                return Ok(PushOutcome::BelowFloor);
            }
            items.insert(at, raw);
            items.truncate(limit);
            Ok(PushOutcome::Inserted)
        })
    }

    /// Read the window without touching the store.
    pub fn window(&self, subscriber_id: Uuid) -> Result<CachedWindow, CacheError> {
        let keys = FeedKeys::new(subscriber_id);
        let limit = self.list_limit;

        self.kv.atomically("feed.window", |txn| {
            if !txn.exists(&keys.ready) {
                return Ok(CachedWindow::absent(limit));
            }
            let Some(items) = txn.list(&keys.window)? else {
                txn.delete(&keys.ready);
                return Ok(CachedWindow::absent(limit));
            };
            let entries = items
                .iter()
                .map(|raw| {
                    decode_item(&keys.window, raw).map(|item| item.into_entry(subscriber_id))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CachedWindow {
                entries,
                from_cache: true,
                limit,
            })
        })
    }

    /// Load the newest entries from the store and install them as the window.
    ///
    /// When pushes keep racing with the load the snapshot is returned without
    /// being installed; `from_cache` is false in that case and the next read
    /// tries again.
    pub async fn materialize(
        &self,
        subscriber_id: Uuid,
        store: &dyn FeedEntriesRepo,
    ) -> Result<CachedWindow, MaterializeError> {
        let keys = FeedKeys::new(subscriber_id);
        let limit = self.list_limit;
        let mut snapshot = Vec::new();

        for attempt in 1..=self.materialize_attempts {
            let generation = self
                .kv
                .atomically("feed.generation", |txn| current_generation(txn, &keys))?;
            let entries = store
                .list_entries(subscriber_id, FeedRange::Latest, limit as u32)
                .await?;
            let items = entries
                .iter()
                .map(encode_item)
                .collect::<Result<VecDeque<_>, _>>()?;

            let outcome = self.kv.atomically("feed.materialize", |txn| {
                if txn.exists(&keys.ready) {
                    return Ok(Install::AlreadyReady);
                }
                if txn.get_int(&keys.generation)? != Some(generation) {
                    return Ok(Install::Conflict);
                }
                txn.replace_list(&keys.window, items);
                txn.set_int(&keys.ready, 1);
                Ok(Install::Installed)
            })?;

            match outcome {
                Install::Installed => {
                    debug!(
                        target = "cache::feed",
                        subscriber_id = %subscriber_id,
                        entries = entries.len(),
                        "Feed window materialized"
                    );
                    return Ok(CachedWindow {
                        entries,
                        from_cache: true,
                        limit,
                    });
                }
                Install::AlreadyReady => return Ok(self.window(subscriber_id)?),
                Install::Conflict => {
                    debug!(
                        target = "cache::feed",
                        subscriber_id = %subscriber_id,
                        attempt,
                        "Feed window load raced with a push"
                    );
                    snapshot = entries;
                }
            }
        }

        warn!(
            target = "cache::feed",
            subscriber_id = %subscriber_id,
            attempts = self.materialize_attempts,
            "Feed window left cold after repeated push races"
        );
        Ok(CachedWindow {
            entries: snapshot,
            from_cache: false,
            limit,
        })
    }

    /// Return the window, loading it from the store first when absent.
    pub async fn window_or_materialize(
        &self,
        subscriber_id: Uuid,
        store: &dyn FeedEntriesRepo,
    ) -> Result<CachedWindow, MaterializeError> {
        let window = self.window(subscriber_id)?;
        if window.from_cache {
            return Ok(window);
        }
        self.materialize(subscriber_id, store).await
    }

    /// Drop the window so the next read rebuilds it.
    pub fn invalidate(&self, subscriber_id: Uuid) -> Result<(), CacheError> {
        let keys = FeedKeys::new(subscriber_id);
        self.kv.atomically("feed.invalidate", |txn| {
            txn.delete(&keys.ready);
            txn.delete(&keys.window);
            Ok(())
        })
    }
}
