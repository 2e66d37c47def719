//! Fakes for the orchestrators' collaborators.

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use time::macros::datetime;
use tokio::sync::watch;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::{
    engine::{EngineCallback, EngineError, UpdateEngine},
    jobs::{DownloadRequest, JobInfo, JobProgress, JobQueue, JobState},
    models::{BuildInfo, JobHandle, Notification, Notifier},
};

pub fn sample_build_info() -> BuildInfo {
    BuildInfo {
        version: "2.1".into(),
        release_date: datetime!(2024-05-01 12:00 UTC),
        url: "https://ota.example.com/ota.zip".into(),
        file_name: "ota.zip".into(),
        file_size: 2_000_000,
        checksum: "abc".into(),
    }
}

/// Writes a minimal valid A/B OTA package at `dir/name`.
pub fn write_package(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let mut zip = ZipWriter::new(std::fs::File::create(&path).unwrap());
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    zip.start_file("payload.bin", stored).unwrap();
    zip.write_all(b"CrAU-payload").unwrap();
    zip.start_file("payload_properties.txt", stored).unwrap();
    zip.write_all(b"FILE_HASH=aGFzaA==\nFILE_SIZE=12\nMETADATA_HASH=bWV0YQ==\nMETADATA_SIZE=4\n")
        .unwrap();
    zip.finish().unwrap();
    path
}

/// Polls `condition` until it holds or a few seconds passed.
/// Puts a non-empty directory where the status file lives, so every later commit fails
/// at the final rename.
pub fn block_writes(status_file: &Path) {
    if status_file.exists() {
        std::fs::remove_file(status_file).unwrap();
    }
    std::fs::create_dir(status_file).unwrap();
    std::fs::write(status_file.join("blocker"), "x").unwrap();
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Bind,
    Unbind,
    ApplyPayload { url: String, offset: u64, size: u64, headers: Vec<String> },
    Suspend,
    Resume,
    Cancel,
    CleanupAppliedPayload,
    ResetStatus,
    SetPerformanceMode(bool),
}

/// Update engine that records every call and keeps the bound callback for tests to drive.
#[derive(Debug)]
pub struct FakeUpdateEngine {
    calls: Mutex<Vec<EngineCall>>,
    callback: Mutex<Option<EngineCallback>>,
    pub bind_result: Mutex<Result<bool, EngineError>>,
    pub apply_error: Mutex<Option<EngineError>>,
    pub suspend_error: Mutex<Option<EngineError>>,
    pub cancel_error: Mutex<Option<EngineError>>,
}

impl FakeUpdateEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            bind_result: Mutex::new(Ok(true)),
            apply_error: Mutex::new(None),
            suspend_error: Mutex::new(None),
            cancel_error: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn count(&self, call: &EngineCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn is_bound(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// The callback registered by the last successful bind.
    pub fn callback(&self) -> EngineCallback {
        self.callback.lock().clone().expect("engine is not bound")
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

impl UpdateEngine for FakeUpdateEngine {
    fn bind(&self, callback: EngineCallback) -> Result<bool, EngineError> {
        self.record(EngineCall::Bind);
        let result = self.bind_result.lock().clone();
        if let Ok(true) = result {
            *self.callback.lock() = Some(callback);
        }
        result
    }

    fn unbind(&self) -> Result<bool, EngineError> {
        self.record(EngineCall::Unbind);
        Ok(self.callback.lock().take().is_some())
    }

    fn apply_payload(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        headers: &[String],
    ) -> Result<(), EngineError> {
        self.record(EngineCall::ApplyPayload {
            url: url.to_string(),
            offset,
            size,
            headers: headers.to_vec(),
        });
        self.apply_error.lock().clone().map_or(Ok(()), Err)
    }

    fn suspend(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Suspend);
        self.suspend_error.lock().clone().map_or(Ok(()), Err)
    }

    fn resume(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Resume);
        Ok(())
    }

    fn cancel(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Cancel);
        self.cancel_error.lock().clone().map_or(Ok(()), Err)
    }

    fn cleanup_applied_payload(&self) -> Result<(), EngineError> {
        self.record(EngineCall::CleanupAppliedPayload);
        Ok(())
    }

    fn reset_status(&self) -> Result<(), EngineError> {
        self.record(EngineCall::ResetStatus);
        Ok(())
    }

    fn set_performance_mode(&self, enable: bool) -> Result<(), EngineError> {
        self.record(EngineCall::SetPerformanceMode(enable));
        Ok(())
    }
}

/// Job queue that never runs anything; tests publish job states by hand.
#[derive(Debug, Default)]
pub struct FakeJobQueue {
    jobs: Mutex<HashMap<JobHandle, watch::Sender<JobInfo>>>,
    submitted: Mutex<Vec<(JobHandle, DownloadRequest)>>,
    cancelled: Mutex<Vec<JobHandle>>,
    pruned: Mutex<usize>,
}

impl FakeJobQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submitted(&self) -> Vec<(JobHandle, DownloadRequest)> {
        self.submitted.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<JobHandle> {
        self.cancelled.lock().clone()
    }

    pub fn prune_count(&self) -> usize {
        *self.pruned.lock()
    }

    pub fn publish(&self, handle: JobHandle, state: JobState, progress: Option<(u64, u8)>) {
        let jobs = self.jobs.lock();
        let tx = jobs.get(&handle).expect("unknown job");
        tx.send_modify(|info| {
            info.state = state;
            if let Some((bytes, percent)) = progress {
                info.progress = Some(JobProgress { bytes, percent });
            }
        });
    }

    /// Forgets every job, like a queue that lost its state across a restart.
    pub fn forget_all(&self) {
        self.jobs.lock().clear();
    }
}

#[async_trait]
impl JobQueue for FakeJobQueue {
    async fn enqueue(&self, request: DownloadRequest) -> Result<JobHandle> {
        let handle = JobHandle::new();
        self.jobs.lock().insert(handle, watch::Sender::new(JobInfo::default()));
        self.submitted.lock().push((handle, request));
        Ok(handle)
    }

    async fn cancel(&self, handle: JobHandle) {
        self.cancelled.lock().push(handle);
        if let Some(tx) = self.jobs.lock().get(&handle) {
            tx.send_modify(|info| {
                if !info.state.is_finished() {
                    info.state = JobState::Cancelled;
                }
            });
        }
    }

    async fn prune(&self) {
        *self.pruned.lock() += 1;
        self.jobs.lock().retain(|_, tx| !tx.borrow().state.is_finished());
    }

    async fn subscribe(&self, handle: JobHandle) -> Option<watch::Receiver<JobInfo>> {
        self.jobs.lock().get(&handle).map(|tx| tx.subscribe())
    }
}
