use async_trait::async_trait;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{ObjectStore, RepoError},
    domain::{
        entities::{ObjectRef, ObjectSnapshot},
        types::ObjectKind,
    },
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    display_name: Option<String>,
    created_at: OffsetDateTime,
}

#[derive(sqlx::FromRow)]
struct PostRow {
    id: Uuid,
    author_id: Uuid,
    body: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: Uuid,
    post_id: Uuid,
    author_id: Uuid,
    body: String,
    created_at: OffsetDateTime,
}

impl From<UserRow> for ObjectSnapshot {
    fn from(row: UserRow) -> Self {
        ObjectSnapshot {
            kind: ObjectKind::User,
            id: row.id,
            owner_id: None,
            created_at: row.created_at,
            body: json!({
                "username": row.username,
                "display_name": row.display_name,
            }),
        }
    }
}

impl From<PostRow> for ObjectSnapshot {
    fn from(row: PostRow) -> Self {
        ObjectSnapshot {
            kind: ObjectKind::Post,
            id: row.id,
            owner_id: Some(row.author_id),
            created_at: row.created_at,
            body: json!({
                "body": row.body,
                "updated_at": row.updated_at.unix_timestamp(),
            }),
        }
    }
}

impl From<CommentRow> for ObjectSnapshot {
    fn from(row: CommentRow) -> Self {
        ObjectSnapshot {
            kind: ObjectKind::Comment,
            id: row.id,
            owner_id: Some(row.author_id),
            created_at: row.created_at,
            body: json!({
                "post_id": row.post_id,
                "body": row.body,
            }),
        }
    }
}

#[async_trait]
impl ObjectStore for PostgresRepositories {
    async fn load_object(&self, object: ObjectRef) -> Result<Option<ObjectSnapshot>, RepoError> {
        let snapshot = match object.kind {
            ObjectKind::User => sqlx::query_as::<_, UserRow>(
                "SELECT id, username, display_name, created_at FROM users WHERE id = $1",
            )
            .bind(object.id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?
            .map(ObjectSnapshot::from),
            ObjectKind::Post => sqlx::query_as::<_, PostRow>(
                "SELECT id, author_id, body, created_at, updated_at FROM posts WHERE id = $1",
            )
            .bind(object.id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?
            .map(ObjectSnapshot::from),
            ObjectKind::Comment => sqlx::query_as::<_, CommentRow>(
                "SELECT id, post_id, author_id, body, created_at FROM comments WHERE id = $1",
            )
            .bind(object.id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?
            .map(ObjectSnapshot::from),
        };

        Ok(snapshot)
    }
}
