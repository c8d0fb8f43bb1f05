//! Feed cursors and page-size handling.
//!
//! Feeds are ordered by `(created_at desc, post_id desc)`. A cursor is a
//! position in that order plus a direction: `before` walks towards older
//! entries, `after` polls for newer ones. Positions travel as opaque
//! URL-safe tokens.

use std::cmp::Ordering;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::entities::FeedEntryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FeedPositionPayload {
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    post_id: Uuid,
}

/// A point in a subscriber's feed order.
///
/// `Ord` follows recency: a greater position is newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedPosition {
    created_at: OffsetDateTime,
    post_id: Uuid,
}

impl FeedPosition {
    pub fn new(created_at: OffsetDateTime, post_id: Uuid) -> Self {
        Self {
            created_at,
            post_id,
        }
    }

    pub fn of(entry: &FeedEntryRecord) -> Self {
        Self::new(entry.created_at, entry.post_id)
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn post_id(&self) -> Uuid {
        self.post_id
    }

    pub fn encode(&self) -> String {
        let payload = FeedPositionPayload {
            created_at: self.created_at,
            post_id: self.post_id,
        };
        let serialized =
            serde_json::to_vec(&payload).expect("serializing feed cursor payload should succeed");
        URL_SAFE_NO_PAD.encode(serialized)
    }

    pub fn decode(cursor: &str) -> Result<Self, PaginationError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|err| PaginationError::InvalidCursor(err.to_string()))?;
        let payload: FeedPositionPayload = serde_json::from_slice(&bytes)
            .map_err(|err| PaginationError::InvalidCursor(err.to_string()))?;
        Ok(Self::new(payload.created_at, payload.post_id))
    }
}

impl Ord for FeedPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.post_id.cmp(&other.post_id))
    }
}

impl PartialOrd for FeedPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort entries into feed order (newest first) and drop repeated posts.
pub fn sort_feed_entries(entries: &mut Vec<FeedEntryRecord>) {
    entries.sort_by(|a, b| FeedPosition::of(b).cmp(&FeedPosition::of(a)));
    entries.dedup_by_key(|entry| entry.post_id);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedCursor {
    #[default]
    First,
    Before(FeedPosition),
    After(FeedPosition),
}

/// Page-size bounds applied to every feed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl PageLimits {
    /// Clamp into `[1, max_page_size]`; out-of-range sizes are never rejected.
    pub fn clamp(&self, requested: i64) -> u32 {
        let max = self.max_page_size.max(1);
        requested.clamp(1, i64::from(max)) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedQuery {
    pub cursor: FeedCursor,
    pub page_size: u32,
}

impl FeedQuery {
    pub fn first(page_size: u32) -> Self {
        Self {
            cursor: FeedCursor::First,
            page_size,
        }
    }

    /// Build a query from raw request parameters.
    ///
    /// Supplying both cursors, an undecodable cursor or a non-numeric size is
    /// a caller error. A numeric size outside the allowed range is clamped.
    pub fn from_params(
        before: Option<&str>,
        after: Option<&str>,
        size: Option<&str>,
        limits: PageLimits,
    ) -> Result<Self, PaginationError> {
        let cursor = match (non_blank(before), non_blank(after)) {
            (Some(_), Some(_)) => return Err(PaginationError::ConflictingCursors),
            (Some(token), None) => FeedCursor::Before(FeedPosition::decode(token)?),
            (None, Some(token)) => FeedCursor::After(FeedPosition::decode(token)?),
            (None, None) => FeedCursor::First,
        };

        let page_size = match non_blank(size) {
            Some(raw) => {
                let requested: i64 = raw
                    .parse()
                    .map_err(|_| PaginationError::InvalidPageSize(raw.to_string()))?;
                limits.clamp(requested)
            }
            None => limits.clamp(i64::from(limits.default_page_size)),
        };

        Ok(Self { cursor, page_size })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Where the entries of a page were read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    Cache,
    Store,
    Merged,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedPage<T = FeedEntryRecord> {
    pub entries: Vec<T>,
    pub has_next_page: bool,
    /// Continue towards older entries.
    pub next_cursor: Option<String>,
    /// Poll for entries newer than this page.
    pub head_cursor: Option<String>,
    pub source: PageSource,
}

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("`before` and `after` cannot be combined")]
    ConflictingCursors,
    #[error("invalid page size `{0}`")]
    InvalidPageSize(String),
}
