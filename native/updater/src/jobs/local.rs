use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use super::{
    ConstraintProbe, DownloadRequest, JobInfo, JobProgress, JobQueue, JobState, WorkResult,
    Worker,
};
use crate::{config::UpdaterConfig, models::JobHandle};

/// Queue-wide retry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_backoff: Duration,
    pub max_attempts: u32,
    /// How often unmet constraints are re-checked.
    pub constraint_poll_interval: Duration,
}

impl From<&UpdaterConfig> for RetryPolicy {
    fn from(config: &UpdaterConfig) -> Self {
        Self {
            max_backoff: config.max_backoff(),
            max_attempts: config.max_download_attempts.max(1),
            constraint_poll_interval: config.constraint_poll_interval(),
        }
    }
}

struct JobEntry {
    tx: watch::Sender<JobInfo>,
    token: CancellationToken,
}

/// In-process job queue: one tokio task per job.
pub struct LocalJobQueue {
    worker: Arc<dyn Worker>,
    probe: Arc<dyn ConstraintProbe>,
    policy: RetryPolicy,
    jobs: Mutex<HashMap<JobHandle, JobEntry>>,
}

impl LocalJobQueue {
    pub fn new(
        worker: Arc<dyn Worker>,
        probe: Arc<dyn ConstraintProbe>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self { worker, probe, policy, jobs: Mutex::new(HashMap::new()) })
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn enqueue(&self, request: DownloadRequest) -> Result<JobHandle> {
        let handle = JobHandle::new();
        let token = CancellationToken::new();
        let tx = watch::Sender::new(JobInfo::default());

        let mut jobs = self.jobs.lock().await;
        jobs.insert(handle, JobEntry { tx: tx.clone(), token: token.clone() });
        let active = jobs.values().filter(|j| !j.tx.borrow().state.is_finished()).count();
        drop(jobs);
        debug!(%handle, active, "Job enqueued");

        let job = Job {
            worker: self.worker.clone(),
            probe: self.probe.clone(),
            policy: self.policy,
            request,
            tx,
            token,
        };
        tokio::spawn(job.run().instrument(info_span!("job", %handle)));
        Ok(handle)
    }

    #[instrument(skip(self))]
    async fn cancel(&self, handle: JobHandle) {
        let jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get(&handle) else {
            debug!("Job not found for cancellation, may have been pruned");
            return;
        };
        entry.token.cancel();
        let mut rx = entry.tx.subscribe();
        drop(jobs);

        if rx.wait_for(|info| info.state.is_finished()).await.is_err() {
            warn!("Job channel closed before the job finished");
        }
    }

    async fn prune(&self) {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| !job.tx.borrow().state.is_finished());
        debug!(pruned = before - jobs.len(), remaining = jobs.len(), "Pruned finished jobs");
    }

    async fn subscribe(&self, handle: JobHandle) -> Option<watch::Receiver<JobInfo>> {
        self.jobs.lock().await.get(&handle).map(|job| job.tx.subscribe())
    }
}

struct Job {
    worker: Arc<dyn Worker>,
    probe: Arc<dyn ConstraintProbe>,
    policy: RetryPolicy,
    request: DownloadRequest,
    tx: watch::Sender<JobInfo>,
    token: CancellationToken,
}

impl Job {
    async fn run(self) {
        let state = self.attempts().await;
        self.tx.send_modify(|info| info.state = state);
        info!(?state, attempts = self.tx.borrow().attempt, "Job finished");
    }

    async fn attempts(&self) -> JobState {
        let mut attempt = 0;
        loop {
            if !self.wait_for_constraints().await {
                return JobState::Cancelled;
            }

            attempt += 1;
            self.tx.send_modify(|info| {
                info.state = JobState::Running;
                info.attempt = attempt;
            });
            debug!(attempt, "Starting attempt");

            let tx = self.tx.clone();
            let report = move |progress: JobProgress| {
                tx.send_modify(|info| info.progress = Some(progress));
            };
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => return JobState::Cancelled,
                result = self.worker.run(&self.request, &report) => result,
            };

            match result {
                WorkResult::Success => return JobState::Succeeded,
                WorkResult::Failure => return JobState::Failed,
                WorkResult::Retry if attempt >= self.policy.max_attempts => {
                    warn!(attempt, "Giving up after too many attempts");
                    return JobState::Failed;
                }
                WorkResult::Retry => {
                    let delay = self.request.backoff.delay(attempt, self.policy.max_backoff);
                    debug!(attempt, ?delay, "Attempt failed, backing off");
                    self.tx.send_modify(|info| info.state = JobState::Enqueued);
                    tokio::select! {
                        _ = self.token.cancelled() => return JobState::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Returns `false` if the job got cancelled while waiting.
    async fn wait_for_constraints(&self) -> bool {
        loop {
            if self.token.is_cancelled() {
                return false;
            }
            if self.probe.is_satisfied(&self.request).await {
                return true;
            }
            tokio::select! {
                _ = self.token.cancelled() => return false,
                _ = tokio::time::sleep(self.policy.constraint_poll_interval) => {}
            }
        }
    }
}
