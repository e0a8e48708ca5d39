//! Durable job queue and worker pool for image search and embedding refresh.
//!
//! `queued -> active -> completed | failed`. Jobs are never retried here;
//! finished jobs are kept for inspection up to a per-state cap.

mod queue;
mod runner;
mod task;

use serde::Serialize;

pub use queue::{JobQueue, JobRecord, JobState, QUEUE_DUMP_FILE};
pub use runner::JobRunner;
pub use task::{refresh_entity, ImageMatch, JobOutput, RefreshOutcome, Task};

/// Read-side view of a job for API callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub user_id: String,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub enqueued_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

impl From<JobRecord> for JobView {
    fn from(job: JobRecord) -> Self {
        let state = job.state.name();
        let (results, error) = match job.state {
            JobState::Completed(output) => (Some(output), None),
            JobState::Failed(reason) => (None, Some(reason)),
            JobState::Queued | JobState::Active => (None, None),
        };

        Self {
            id: job.id.to_string(),
            user_id: job.user_id,
            state,
            results,
            error,
            enqueued_at: job.enqueued_at,
            finished_at: job.finished_at,
        }
    }
}
