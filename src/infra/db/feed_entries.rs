use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{FeedEntriesRepo, FeedRange, InsertSummary, RepoError},
    domain::entities::FeedEntryRecord,
};

use super::{PostgresRepositories, map_sqlx_error};

/// Rows per `INSERT` statement; keeps bind parameters well under the protocol limit.
const INSERT_CHUNK: usize = 1_000;

#[derive(sqlx::FromRow)]
struct FeedEntryRow {
    subscriber_id: Uuid,
    post_id: Uuid,
    created_at: OffsetDateTime,
}

impl From<FeedEntryRow> for FeedEntryRecord {
    fn from(row: FeedEntryRow) -> Self {
        FeedEntryRecord::new(row.subscriber_id, row.post_id, row.created_at)
    }
}

#[async_trait]
impl FeedEntriesRepo for PostgresRepositories {
    async fn insert_entries(
        &self,
        entries: &[FeedEntryRecord],
    ) -> Result<InsertSummary, RepoError> {
        let mut summary = InsertSummary::default();

        for chunk in entries.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("INSERT INTO feed_entries (subscriber_id, post_id, created_at) ");
            qb.push_values(chunk, |mut row, entry| {
                row.push_bind(entry.subscriber_id)
                    .push_bind(entry.post_id)
                    .push_bind(entry.created_at);
            });
            qb.push(" ON CONFLICT (subscriber_id, post_id) DO NOTHING");

            let inserted = qb
                .build()
                .execute(self.pool())
                .await
                .map_err(map_sqlx_error)?
                .rows_affected();

            summary.inserted += inserted;
            summary.duplicates += chunk.len() as u64 - inserted;
        }

        Ok(summary)
    }

    async fn list_entries(
        &self,
        subscriber_id: Uuid,
        range: FeedRange,
        limit: u32,
    ) -> Result<Vec<FeedEntryRecord>, RepoError> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT subscriber_id, post_id, created_at FROM feed_entries WHERE subscriber_id = ",
        );
        qb.push_bind(subscriber_id);

        match range {
            FeedRange::Latest => {
                qb.push(" ORDER BY created_at DESC, post_id DESC");
            }
            FeedRange::Before(position) => {
                qb.push(" AND (created_at, post_id) < (");
                qb.push_bind(position.created_at());
                qb.push(", ");
                qb.push_bind(position.post_id());
                qb.push(") ORDER BY created_at DESC, post_id DESC");
            }
            FeedRange::After(position) => {
                qb.push(" AND (created_at, post_id) > (");
                qb.push_bind(position.created_at());
                qb.push(", ");
                qb.push_bind(position.post_id());
                qb.push(") ORDER BY created_at ASC, post_id ASC");
            }
        }

        qb.push(" LIMIT ");
        qb.push_bind(i64::from(limit));

        let rows = qb
            .build_query_as::<FeedEntryRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let mut entries: Vec<FeedEntryRecord> = rows.into_iter().map(Into::into).collect();
        if matches!(range, FeedRange::After(_)) {
            entries.reverse();
        }
        Ok(entries)
    }

    async fn count_entries(&self, subscriber_id: Uuid) -> Result<u64, RepoError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feed_entries WHERE subscriber_id = $1")
                .bind(subscriber_id)
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_error)?;

        Self::convert_count(count)
    }
}
