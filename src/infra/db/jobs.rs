use async_trait::async_trait;

use crate::application::repos::{JobsRepo, NewJobRecord, RepoError};

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl JobsRepo for PostgresRepositories {
    async fn enqueue_job(&self, job: NewJobRecord) -> Result<String, RepoError> {
        sqlx::query_scalar("SELECT (apalis.push_job($1, $2::json, $3, $4, $5, $6)).id")
            .bind(job.job_type.as_str())
            .bind(job.payload)
            .bind("Pending")
            .bind(job.run_at)
            .bind(job.max_attempts)
            .bind(job.priority)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)
    }
}
