use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    StatusStore,
    config::UpdaterConfig,
    jobs::{BackoffPolicy, Constraints, DownloadRequest, JobInfo, JobQueue, JobState},
    models::{GlobalStatus, JobHandle, Notification, Notifier, StatusCode},
    utils::clear_dir,
};

/// Owns the single outstanding build download.
///
/// The persisted [`JobHandle`] is what tells a pause from a resume: a live handle means a
/// job is queued or running. All commands and job-state reflections run under one lock,
/// so they never interleave.
pub struct DownloadOrchestrator {
    store: Arc<StatusStore>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
    cache_dir: PathBuf,
    min_backoff: Duration,
    ops: Mutex<()>,
    submitted_tx: broadcast::Sender<JobHandle>,
}

impl DownloadOrchestrator {
    pub fn new(
        store: Arc<StatusStore>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
        config: &UpdaterConfig,
    ) -> Arc<Self> {
        let (submitted_tx, _) = broadcast::channel(8);
        Arc::new(Self {
            store,
            queue,
            notifier,
            cache_dir: config.cache_dir.clone(),
            min_backoff: config.min_backoff(),
            ops: Mutex::new(()),
            submitted_tx,
        })
    }

    /// Starts a fresh download of the current build, discarding any previous status.
    /// Returns `None` when there is nothing to download.
    #[instrument(skip(self), err)]
    pub async fn start(self: &Arc<Self>) -> Result<Option<JobHandle>> {
        let _guard = self.ops.lock().await;
        if let Some(stale) = self.store.download_id()? {
            debug!(handle = %stale, "Dropping previous download job");
            self.store.set_download_id(None)?;
            self.queue.cancel(stale).await;
        }
        self.store.delete_download_status()?;
        self.enqueue().await
    }

    /// Pauses the live download, or resumes when there is none.
    #[instrument(skip(self), err)]
    pub async fn pause_or_resume(self: &Arc<Self>) -> Result<()> {
        let _guard = self.ops.lock().await;
        match self.store.download_id()? {
            Some(handle) => {
                info!(%handle, "Pausing download");
                self.store.set_download_id(None)?;
                self.queue.cancel(handle).await;
                self.store.set_download_status(StatusCode::Paused)?;
            }
            None => {
                info!("Resuming download");
                if self.enqueue().await?.is_some()
                    && self.store.download_status_code()? == StatusCode::Paused
                {
                    self.store.set_download_status(StatusCode::Indeterminate)?;
                }
            }
        }
        Ok(())
    }

    /// Cancels the download for good: the job is stopped and forgotten, the cache is
    /// emptied and the pipeline goes back to [`GlobalStatus::DownloadPending`].
    #[instrument(skip(self), err)]
    pub async fn cancel(&self) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.cancel_locked().await
    }

    /// Drops the live job and all download progress without reporting a cancellation.
    #[instrument(skip(self), err)]
    pub async fn discard(&self) -> Result<()> {
        let _guard = self.ops.lock().await;
        if let Some(handle) = self.store.download_id()? {
            debug!(%handle, "Discarding download job");
            self.store.set_download_id(None)?;
            self.queue.cancel(handle).await;
        }
        self.queue.prune().await;
        self.store.delete_download_status()?;
        self.clear_cache().await
    }

    pub fn is_downloading(&self) -> Result<bool> {
        Ok(self.store.download_status_code()?.is_active())
    }

    pub fn is_paused(&self) -> Result<bool> {
        Ok(self.store.download_status_code()? == StatusCode::Paused)
    }

    /// Handles of newly submitted jobs.
    pub fn subscribe_submissions(&self) -> broadcast::Receiver<JobHandle> {
        self.submitted_tx.subscribe()
    }

    pub async fn clear_cache(&self) -> Result<()> {
        clear_dir(&self.cache_dir).await.context("Failed to clear download cache")
    }

    /// Reconciles the persisted handle with the queue after a restart. A handle the queue
    /// no longer knows leaves the download paused for the user to resume.
    #[instrument(skip(self), err)]
    pub async fn recover(self: &Arc<Self>) -> Result<()> {
        let _guard = self.ops.lock().await;
        let Some(handle) = self.store.download_id()? else {
            return Ok(());
        };
        match self.queue.subscribe(handle).await {
            Some(rx) => {
                debug!(%handle, "Reattaching to download job");
                self.observe(handle, rx);
            }
            None => {
                info!(%handle, "Download job lost across restart, marking as paused");
                self.store.set_download_id(None)?;
                if self.store.download_status()?.is_some() {
                    self.store.set_download_status(StatusCode::Paused)?;
                }
            }
        }
        Ok(())
    }

    async fn cancel_locked(&self) -> Result<()> {
        if let Some(handle) = self.store.download_id()? {
            info!(%handle, "Cancelling download");
            self.store.set_download_id(None)?;
            self.queue.cancel(handle).await;
        }
        self.store.set_download_status(StatusCode::Cancelled)?;
        self.queue.prune().await;
        self.store.set_global_status(GlobalStatus::DownloadPending)?;
        self.clear_cache().await
    }

    async fn enqueue(self: &Arc<Self>) -> Result<Option<JobHandle>> {
        let Some(build_info) = self.store.build_info()? else {
            debug!("No build info, nothing to download");
            return Ok(None);
        };
        if build_info.local_file_name().is_none() {
            debug!("Build has no file name, nothing to download");
            return Ok(None);
        }

        let request = DownloadRequest {
            url: build_info.url,
            file_name: build_info.file_name,
            checksum: build_info.checksum,
            expected_size: build_info.file_size,
            constraints: Constraints { network_connected: true, storage_not_low: true },
            backoff: BackoffPolicy::Linear { min: self.min_backoff },
        };
        let handle = self.queue.enqueue(request).await.context("Failed to enqueue download")?;
        self.store.set_download_id(Some(handle))?;
        let _ = self.submitted_tx.send(handle);
        info!(%handle, "Download job submitted");

        if let Some(rx) = self.queue.subscribe(handle).await {
            self.observe(handle, rx);
        }
        if self.store.download_status_code()? == StatusCode::Unset {
            self.store.set_download_status(StatusCode::Indeterminate)?;
        }
        Ok(Some(handle))
    }

    fn observe(self: &Arc<Self>, handle: JobHandle, mut rx: watch::Receiver<JobInfo>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let info = *rx.borrow_and_update();
                match this.reflect(handle, info).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        error!(error = e.as_ref() as &dyn Error, %handle, "Failed to reflect job state");
                        break;
                    }
                }
                if rx.changed().await.is_err() {
                    debug!(%handle, "Job channel closed");
                    break;
                }
            }
            trace!(%handle, "Stopped observing job");
        });
    }

    /// Mirrors one job snapshot into the store. Returns whether to keep observing.
    async fn reflect(&self, handle: JobHandle, info: JobInfo) -> Result<bool> {
        let _guard = self.ops.lock().await;
        if self.store.download_id()? != Some(handle) {
            trace!(%handle, state = ?info.state, "Ignoring state of a stale job");
            return Ok(false);
        }

        match info.state {
            JobState::Enqueued => Ok(true),
            JobState::Running => {
                if self.store.download_status_code()? != StatusCode::Downloading {
                    self.store.set_download_status(StatusCode::Downloading)?;
                }
                if let Some(progress) = info.progress {
                    self.store.set_download_progress(progress.bytes, progress.percent)?;
                }
                Ok(true)
            }
            JobState::Succeeded => {
                info!(%handle, "Download finished");
                self.store.set_download_id(None)?;
                if let Some(progress) = info.progress {
                    self.store.set_download_progress(progress.bytes, progress.percent)?;
                }
                self.store.set_download_status(StatusCode::Finished)?;
                self.store.set_global_status(GlobalStatus::UpdatePending)?;
                Ok(false)
            }
            JobState::Failed => {
                warn!(%handle, attempts = info.attempt, "Download failed");
                self.store.set_download_id(None)?;
                self.store.set_download_status(StatusCode::Failed)?;
                self.store.set_global_status(GlobalStatus::DownloadPending)?;
                self.notifier.notify(Notification::DownloadFailed);
                Ok(false)
            }
            JobState::Cancelled => {
                info!(%handle, "Download job cancelled externally");
                self.cancel_locked().await?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::testing::{
        FakeJobQueue, RecordingNotifier, block_writes, eventually, sample_build_info,
    };

    struct Fixture {
        dir: TempDir,
        store: Arc<StatusStore>,
        queue: Arc<FakeJobQueue>,
        notifier: Arc<RecordingNotifier>,
        downloads: Arc<DownloadOrchestrator>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::default().resolve_dirs(dir.path());
        let store = Arc::new(StatusStore::open(&dir.path().join("status.json")).unwrap());
        store.set_build_info(&sample_build_info()).unwrap();
        let queue = FakeJobQueue::new();
        let notifier = RecordingNotifier::new();
        let downloads =
            DownloadOrchestrator::new(store.clone(), queue.clone(), notifier.clone(), &config);
        Fixture { dir, store, queue, notifier, downloads }
    }

    fn status(f: &Fixture) -> crate::models::DownloadStatus {
        f.store.download_status().unwrap().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_submits_build_request() {
        let f = fixture();
        let mut submissions = f.downloads.subscribe_submissions();
        let handle = f.downloads.start().await.unwrap().unwrap();

        assert_eq!(submissions.recv().await.unwrap(), handle);
        assert_eq!(f.store.download_id().unwrap(), Some(handle));
        assert_eq!(status(&f).status, StatusCode::Indeterminate);
        assert!(f.downloads.is_downloading().unwrap());

        let (_, request) = f.queue.submitted().pop().unwrap();
        assert_eq!(request.file_name, "ota.zip");
        assert_eq!(request.checksum, "abc");
        assert_eq!(request.expected_size, 2_000_000);
        assert_eq!(request.constraints, Constraints { network_connected: true, storage_not_low: true });
        assert_eq!(request.backoff, BackoffPolicy::Linear { min: Duration::from_secs(10) });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_without_build_is_noop() {
        let f = fixture();
        f.store.delete_build_info().unwrap();
        assert_eq!(f.downloads.start().await.unwrap(), None);
        assert!(f.queue.submitted().is_empty());
        assert_eq!(f.store.download_id().unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_fails_when_status_cannot_be_persisted() {
        let f = fixture();
        f.store.set_global_status(GlobalStatus::Downloading).unwrap();
        let handle = f.downloads.start().await.unwrap().unwrap();

        block_writes(&f.dir.path().join("status.json"));
        assert!(f.downloads.cancel().await.is_err());
        assert_eq!(f.store.download_id().unwrap(), Some(handle));
        assert_eq!(f.store.global_status().unwrap(), GlobalStatus::Downloading);
        assert!(f.queue.cancelled().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn progress_then_cancel() {
        let f = fixture();
        let handle = f.downloads.start().await.unwrap().unwrap();

        f.queue.publish(handle, JobState::Running, Some((500_000, 25)));
        eventually(|| status(&f).progress == 25).await;
        let running = status(&f);
        assert_eq!(running.status, StatusCode::Downloading);
        assert_eq!(running.downloaded_bytes, 500_000);

        std::fs::create_dir_all(f.dir.path().join("cache")).unwrap();
        std::fs::write(f.dir.path().join("cache/ota.zip.part"), b"partial").unwrap();

        f.downloads.cancel().await.unwrap();
        assert_eq!(status(&f).status, StatusCode::Cancelled);
        assert_eq!(f.store.download_id().unwrap(), None);
        assert_eq!(f.store.global_status().unwrap(), GlobalStatus::DownloadPending);
        assert_eq!(f.queue.cancelled(), vec![handle]);
        assert_eq!(f.queue.prune_count(), 1);
        assert!(!f.dir.path().join("cache/ota.zip.part").exists());
        assert!(!f.downloads.is_downloading().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_after_cancel_uses_new_handle_and_fresh_progress() {
        let f = fixture();
        let first = f.downloads.start().await.unwrap().unwrap();
        f.queue.publish(first, JobState::Running, Some((500_000, 25)));
        eventually(|| status(&f).progress == 25).await;
        f.downloads.cancel().await.unwrap();

        let second = f.downloads.start().await.unwrap().unwrap();
        assert_ne!(first, second);

        let current = status(&f);
        assert_eq!(current.status, StatusCode::Indeterminate);
        assert_eq!(current.progress, 0);
        assert_eq!(current.downloaded_bytes, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pause_then_resume() {
        let f = fixture();
        let first = f.downloads.start().await.unwrap().unwrap();
        f.queue.publish(first, JobState::Running, Some((500_000, 25)));
        eventually(|| status(&f).progress == 25).await;

        f.downloads.pause_or_resume().await.unwrap();
        assert!(f.downloads.is_paused().unwrap());
        assert_eq!(f.store.download_id().unwrap(), None);
        assert_eq!(f.queue.cancelled(), vec![first]);
        assert_eq!(status(&f).progress, 25);

        f.downloads.pause_or_resume().await.unwrap();
        let resumed = f.store.download_id().unwrap().unwrap();
        assert_ne!(resumed, first);
        assert_eq!(status(&f).status, StatusCode::Indeterminate);
        assert_eq!(f.queue.submitted().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn success_moves_to_update_pending() {
        let f = fixture();
        f.store.set_global_status(GlobalStatus::Downloading).unwrap();
        let handle = f.downloads.start().await.unwrap().unwrap();

        f.queue.publish(handle, JobState::Succeeded, Some((2_000_000, 100)));
        eventually(|| status(&f).status == StatusCode::Finished).await;
        assert_eq!(f.store.global_status().unwrap(), GlobalStatus::UpdatePending);
        assert_eq!(f.store.download_id().unwrap(), None);
        assert_eq!(status(&f).progress, 100);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_notifies_and_returns_to_download_pending() {
        let f = fixture();
        f.store.set_global_status(GlobalStatus::Downloading).unwrap();
        let handle = f.downloads.start().await.unwrap().unwrap();

        f.queue.publish(handle, JobState::Failed, None);
        eventually(|| status(&f).status == StatusCode::Failed).await;
        assert_eq!(f.store.global_status().unwrap(), GlobalStatus::DownloadPending);
        assert_eq!(f.notifier.sent(), vec![Notification::DownloadFailed]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn late_progress_of_paused_job_is_ignored() {
        let f = fixture();
        let handle = f.downloads.start().await.unwrap().unwrap();
        f.downloads.pause_or_resume().await.unwrap();

        f.queue.publish(handle, JobState::Running, Some((1_000_000, 50)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let paused = status(&f);
        assert_eq!(paused.status, StatusCode::Paused);
        assert_eq!(paused.progress, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn discard_forgets_job_without_cancelled_status() {
        let f = fixture();
        f.store.set_global_status(GlobalStatus::Downloading).unwrap();
        let handle = f.downloads.start().await.unwrap().unwrap();
        f.queue.publish(handle, JobState::Running, Some((500_000, 25)));
        eventually(|| status(&f).progress == 25).await;

        f.downloads.discard().await.unwrap();
        assert_eq!(f.store.download_id().unwrap(), None);
        assert_eq!(f.queue.cancelled(), vec![handle]);
        assert_eq!(status(&f).status, StatusCode::Unset);
        assert_eq!(status(&f).progress, 0);
        assert_eq!(f.store.global_status().unwrap(), GlobalStatus::Downloading);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recover_marks_lost_job_paused() {
        let f = fixture();
        f.downloads.start().await.unwrap().unwrap();
        f.queue.forget_all();

        f.downloads.recover().await.unwrap();
        assert_eq!(f.store.download_id().unwrap(), None);
        assert!(f.downloads.is_paused().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recover_reattaches_to_known_job() {
        let f = fixture();
        let handle = f.downloads.start().await.unwrap().unwrap();
        f.downloads.recover().await.unwrap();

        f.queue.publish(handle, JobState::Succeeded, None);
        eventually(|| status(&f).status == StatusCode::Finished).await;
    }
}
