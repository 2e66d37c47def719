//! Background job queue for build downloads.
//!
//! The orchestrators only see the [`JobQueue`] trait: submit a [`DownloadRequest`], get a
//! [`JobHandle`], watch its [`JobInfo`]. [`LocalJobQueue`] runs jobs as tokio tasks with
//! constraint checks and linear backoff; [`HttpDownloadWorker`] does the transfer.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::models::JobHandle;

mod constraints;
pub use constraints::{ConstraintProbe, SystemConstraintProbe};
mod http;
pub use http::HttpDownloadWorker;
mod local;
pub use local::{LocalJobQueue, RetryPolicy};

/// Preconditions checked before every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Constraints {
    pub network_connected: bool,
    pub storage_not_low: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// `min * attempt`, capped by the queue's maximum backoff.
    Linear { min: Duration },
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32, max: Duration) -> Duration {
        match *self {
            BackoffPolicy::Linear { min } => min.saturating_mul(attempt.max(1)).min(max),
        }
    }
}

/// Everything a worker needs to fetch one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub file_name: String,
    /// Hex md5, compared case-insensitively. Empty skips verification.
    pub checksum: String,
    /// Zero when unknown.
    pub expected_size: u64,
    pub constraints: Constraints,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JobState {
    #[default]
    Enqueued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobProgress {
    pub bytes: u64,
    pub percent: u8,
}

/// Snapshot of a job, published on its watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobInfo {
    pub state: JobState,
    pub progress: Option<JobProgress>,
    /// Number of attempts started so far.
    pub attempt: u32,
}

/// Outcome of one worker attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkResult {
    Success,
    /// Transient failure, try again after backoff.
    Retry,
    /// Permanent failure, give up.
    Failure,
}

/// Performs the actual work of a job. Dropping the returned future aborts the attempt.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(
        &self,
        request: &DownloadRequest,
        progress: &(dyn Fn(JobProgress) + Send + Sync),
    ) -> WorkResult;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, request: DownloadRequest) -> Result<JobHandle>;

    /// Cancels the job and waits until it stopped. Unknown handles are ignored.
    async fn cancel(&self, handle: JobHandle);

    /// Forgets all finished jobs.
    async fn prune(&self);

    /// `None` for handles the queue doesn't know, e.g. from a previous process.
    async fn subscribe(&self, handle: JobHandle) -> Option<watch::Receiver<JobInfo>>;

    async fn info(&self, handle: JobHandle) -> Option<JobInfo> {
        self.subscribe(handle).await.map(|rx| *rx.borrow())
    }
}
