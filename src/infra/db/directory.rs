use async_trait::async_trait;
use uuid::Uuid;

use crate::application::repos::{FollowershipDirectory, RepoError};

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl FollowershipDirectory for PostgresRepositories {
    async fn follower_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, RepoError> {
        sqlx::query_scalar(
            "SELECT from_user_id FROM friendships WHERE to_user_id = $1 ORDER BY from_user_id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn following_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, RepoError> {
        sqlx::query_scalar(
            "SELECT to_user_id FROM friendships WHERE from_user_id = $1 ORDER BY to_user_id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }
}
