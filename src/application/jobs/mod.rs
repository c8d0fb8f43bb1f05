mod context;
mod fanout;
mod queue;

pub use context::{DEFAULT_JOB_TIMEOUT, JobTimedOut, JobWorkerContext, job_aborted, job_failed};
pub use fanout::{
    FanoutBatchJob, FanoutPostJob, enqueue_fanout_batch_job, enqueue_fanout_post_job,
    process_fanout_batch_job, process_fanout_post_job,
};
pub use queue::enqueue_job;
