use async_trait::async_trait;

use crate::{
    application::repos::{CountsRepo, RepoError},
    domain::types::{CounterKey, CounterName},
};

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl CountsRepo for PostgresRepositories {
    async fn count_relations(&self, key: &CounterKey) -> Result<u64, RepoError> {
        let count: i64 = match key.name() {
            CounterName::Likes => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM likes WHERE target_kind = $1 AND target_id = $2",
                )
                .bind(key.target().as_str())
                .bind(key.target_id())
                .fetch_one(self.pool())
                .await
            }
            CounterName::Comments => {
                sqlx::query_scalar("SELECT COUNT(*) FROM comments WHERE post_id = $1")
                    .bind(key.target_id())
                    .fetch_one(self.pool())
                    .await
            }
        }
        .map_err(map_sqlx_error)?;

        Self::convert_count(count)
    }
}
