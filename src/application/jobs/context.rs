use std::{sync::Arc, time::Duration};

use apalis::prelude::Error as ApalisError;
use thiserror::Error;

use crate::application::fanout::{BatchFanoutWorker, FanoutCoordinator};

/// Hard wall-clock limit for one fan-out job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Shared context passed to job workers so they can reach the pipeline.
#[derive(Clone)]
pub struct JobWorkerContext {
    pub coordinator: Arc<FanoutCoordinator>,
    pub worker: Arc<BatchFanoutWorker>,
    pub job_timeout: Duration,
}

#[derive(Debug, Error)]
#[error("job exceeded its time limit of {0:?}")]
pub struct JobTimedOut(pub Duration);

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convert any error into a retryable [`ApalisError::Failed`].
pub fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}

/// Convert a fatal error into [`ApalisError::Abort`] so the job is not retried.
pub fn job_aborted<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Abort(Arc::new(boxed))
}
