use apalis::prelude::{Data, Error as ApalisError};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    application::fanout::FanoutError,
    application::repos::{JobsRepo, RepoError},
    domain::types::JobType,
};

use super::{
    context::{JobTimedOut, JobWorkerContext, job_aborted, job_failed},
    queue::enqueue_job,
};

const FANOUT_POST_PRIORITY: i32 = 10;
const FANOUT_BATCH_PRIORITY: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutPostJob {
    pub post_id: Uuid,
    pub author_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutBatchJob {
    pub post_id: Uuid,
    pub subscriber_ids: Vec<Uuid>,
}

pub async fn enqueue_fanout_post_job<J: JobsRepo + ?Sized>(
    repo: &J,
    post_id: Uuid,
    author_id: Uuid,
    max_attempts: i32,
) -> Result<String, RepoError> {
    let payload = FanoutPostJob { post_id, author_id };
    enqueue_job(
        repo,
        JobType::FanoutPost,
        &payload,
        None,
        max_attempts,
        FANOUT_POST_PRIORITY,
    )
    .await
}

pub async fn enqueue_fanout_batch_job<J: JobsRepo + ?Sized>(
    repo: &J,
    post_id: Uuid,
    subscriber_ids: Vec<Uuid>,
    max_attempts: i32,
) -> Result<String, RepoError> {
    let payload = FanoutBatchJob {
        post_id,
        subscriber_ids,
    };
    enqueue_job(
        repo,
        JobType::FanoutBatch,
        &payload,
        None,
        max_attempts,
        FANOUT_BATCH_PRIORITY,
    )
    .await
}

fn fanout_job_error(err: FanoutError) -> ApalisError {
    if err.is_fatal() {
        job_aborted(err)
    } else {
        job_failed(err)
    }
}

pub async fn process_fanout_post_job(
    payload: FanoutPostJob,
    context: Data<JobWorkerContext>,
) -> Result<(), ApalisError> {
    let ctx = &*context;

    let result = timeout(
        ctx.job_timeout,
        ctx.coordinator
            .dispatch_batches(payload.post_id, payload.author_id),
    )
    .await;

    match result {
        Ok(Ok(summary)) => {
            info!(
                target = "application::jobs::process_fanout_post_job",
                post_id = %payload.post_id,
                followers = summary.follower_count,
                batches = summary.batch_count,
                "fanout dispatched"
            );
            Ok(())
        }
        Ok(Err(err)) => {
            error!(
                target = "application::jobs::process_fanout_post_job",
                payload = ?payload,
                fatal = err.is_fatal(),
                error = %err,
                "fanout dispatch failed; replay with `feedline fanout`"
            );
            Err(fanout_job_error(err))
        }
        Err(_) => {
            error!(
                target = "application::jobs::process_fanout_post_job",
                payload = ?payload,
                timeout = ?ctx.job_timeout,
                "fanout dispatch timed out"
            );
            Err(job_failed(JobTimedOut(ctx.job_timeout)))
        }
    }
}

pub async fn process_fanout_batch_job(
    payload: FanoutBatchJob,
    context: Data<JobWorkerContext>,
) -> Result<(), ApalisError> {
    let ctx = &*context;

    let result = timeout(
        ctx.job_timeout,
        ctx.worker
            .process_batch(payload.post_id, &payload.subscriber_ids),
    )
    .await;

    match result {
        Ok(Ok(outcome)) => {
            info!(
                target = "application::jobs::process_fanout_batch_job",
                post_id = %payload.post_id,
                subscribers = outcome.subscribers,
                inserted = outcome.inserted,
                cache_failures = outcome.cache_failures,
                "fanout batch completed"
            );
            Ok(())
        }
        Ok(Err(err)) => {
            error!(
                target = "application::jobs::process_fanout_batch_job",
                payload = ?payload,
                fatal = err.is_fatal(),
                error = %err,
                "fanout batch failed"
            );
            Err(fanout_job_error(err))
        }
        Err(_) => {
            error!(
                target = "application::jobs::process_fanout_batch_job",
                payload = ?payload,
                timeout = ?ctx.job_timeout,
                "fanout batch timed out"
            );
            Err(job_failed(JobTimedOut(ctx.job_timeout)))
        }
    }
}
