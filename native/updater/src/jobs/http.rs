use std::{
    error::Error,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use fs_err::tokio::{self as fs, OpenOptions};
use fs4::fs_err3_tokio::AsyncFileExt as _;
use reqwest::{StatusCode, header::RANGE};
use tokio::{io::AsyncWriteExt, time::Instant};
use tokio_stream::StreamExt as _;
use tracing::{debug, error, info, instrument, warn};

use super::{DownloadRequest, JobProgress, WorkResult, Worker};
use crate::{
    USER_AGENT,
    utils::{compute_md5_file, get_sys_proxy, move_file},
};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Why an attempt stopped short of a verified file.
#[derive(Debug)]
enum AttemptError {
    /// Worth retrying; the partial file is kept for a ranged resume.
    Transient(anyhow::Error),
    /// Retrying won't help; the partial file is discarded.
    Permanent(anyhow::Error),
}

impl AttemptError {
    fn transient(e: impl Into<anyhow::Error>) -> Self {
        AttemptError::Transient(e.into())
    }

    fn permanent(e: impl Into<anyhow::Error>) -> Self {
        AttemptError::Permanent(e.into())
    }
}

/// Downloads builds over HTTP into `<cache_dir>/<file>.part`, then moves the verified file
/// to `<downloads_dir>/<file>`.
#[derive(Debug, Clone)]
pub struct HttpDownloadWorker {
    client: reqwest::Client,
    cache_dir: PathBuf,
    downloads_dir: PathBuf,
}

impl HttpDownloadWorker {
    pub fn new(cache_dir: PathBuf, downloads_dir: PathBuf) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30));
        if let Some(proxy) = get_sys_proxy() {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("Invalid system proxy")?);
        }
        let client = builder.build().context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, cache_dir, downloads_dir))
    }

    pub fn with_client(client: reqwest::Client, cache_dir: PathBuf, downloads_dir: PathBuf) -> Self {
        Self { client, cache_dir, downloads_dir }
    }

    pub fn part_path(&self, file_name: &str) -> PathBuf {
        self.cache_dir.join(format!("{file_name}.part"))
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress: &(dyn Fn(JobProgress) + Send + Sync),
    ) -> Result<PathBuf, AttemptError> {
        let file_name = sanitize_filename::sanitize(request.file_name.trim());
        if file_name.is_empty() {
            return Err(AttemptError::permanent(anyhow!("Empty file name")));
        }
        fs::create_dir_all(&self.cache_dir)
            .await
            .context("Failed to create cache directory")
            .map_err(AttemptError::transient)?;

        let part = self.part_path(&file_name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part)
            .await
            .map_err(AttemptError::transient)?;
        if !file.try_lock_exclusive().map_err(AttemptError::transient)? {
            return Err(AttemptError::transient(anyhow!("{} is locked", part.display())));
        }

        let mut existing = file.metadata().await.map_err(AttemptError::transient)?.len();
        if request.expected_size > 0 && existing > request.expected_size {
            debug!(existing, "Partial file larger than expected, restarting");
            file.set_len(0).await.map_err(AttemptError::transient)?;
            existing = 0;
        }

        let downloaded = if request.expected_size > 0 && existing == request.expected_size {
            debug!("Partial file already complete, skipping transfer");
            existing
        } else {
            self.transfer(request, &mut file, existing, progress).await?
        };
        file.sync_all().await.map_err(AttemptError::transient)?;
        drop(file);

        if request.expected_size > 0 && downloaded != request.expected_size {
            return Err(AttemptError::permanent(anyhow!(
                "Size mismatch: expected {} bytes, got {downloaded}",
                request.expected_size
            )));
        }
        if !request.checksum.is_empty() {
            let actual = compute_md5_file(&part).await.map_err(AttemptError::transient)?;
            if !actual.eq_ignore_ascii_case(request.checksum.trim()) {
                return Err(AttemptError::permanent(anyhow!(
                    "Checksum mismatch: expected {}, got {actual}",
                    request.checksum
                )));
            }
        }

        let dst = self.downloads_dir.join(&file_name);
        move_file(&part, &dst).await.map_err(AttemptError::transient)?;
        Ok(dst)
    }

    /// Streams the body into `file`, resuming from `existing` bytes. Returns the file's
    /// final length.
    async fn transfer(
        &self,
        request: &DownloadRequest,
        file: &mut fs::File,
        existing: u64,
        progress: &(dyn Fn(JobProgress) + Send + Sync),
    ) -> Result<u64, AttemptError> {
        let mut req = self.client.get(&request.url);
        if existing > 0 {
            req = req.header(RANGE, format!("bytes={existing}-"));
        }
        let resp = req.send().await.map_err(AttemptError::transient)?;

        let status = resp.status();
        let mut downloaded = match status {
            StatusCode::PARTIAL_CONTENT => {
                debug!(existing, "Resuming partial download");
                existing
            }
            s if s.is_success() => {
                if existing > 0 {
                    debug!(existing, "Server ignored range, restarting from zero");
                }
                file.set_len(0).await.map_err(AttemptError::transient)?;
                0
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                file.set_len(0).await.map_err(AttemptError::transient)?;
                return Err(AttemptError::transient(anyhow!("Range not satisfiable, restarting")));
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                return Err(AttemptError::transient(anyhow!("Server responded with {s}")));
            }
            s => return Err(AttemptError::permanent(anyhow!("Server responded with {s}"))),
        };

        let total = match request.expected_size {
            0 => resp.content_length().map(|len| len + downloaded).unwrap_or(0),
            size => size,
        };
        let percent = |bytes: u64| if total > 0 { (bytes * 100 / total).min(100) as u8 } else { 0 };

        let mut stream = resp.bytes_stream();
        let mut last_emit = Instant::now();
        progress(JobProgress { bytes: downloaded, percent: percent(downloaded) });
        while let Some(item) = stream.next().await {
            let chunk = item.map_err(AttemptError::transient)?;
            file.write_all(&chunk).await.map_err(AttemptError::transient)?;
            downloaded += chunk.len() as u64;
            let now = Instant::now();
            if now.duration_since(last_emit) >= PROGRESS_INTERVAL {
                progress(JobProgress { bytes: downloaded, percent: percent(downloaded) });
                last_emit = now;
            }
        }
        file.flush().await.map_err(AttemptError::transient)?;
        progress(JobProgress { bytes: downloaded, percent: percent(downloaded) });
        Ok(downloaded)
    }
}

#[async_trait]
impl Worker for HttpDownloadWorker {
    #[instrument(skip(self, request, progress), fields(url = %request.url, file = %request.file_name))]
    async fn run(
        &self,
        request: &DownloadRequest,
        progress: &(dyn Fn(JobProgress) + Send + Sync),
    ) -> WorkResult {
        match self.download(request, progress).await {
            Ok(path) => {
                info!(path = %path.display(), "Download finished");
                WorkResult::Success
            }
            Err(AttemptError::Transient(e)) => {
                warn!(error = e.as_ref() as &dyn Error, "Download attempt failed, will retry");
                WorkResult::Retry
            }
            Err(AttemptError::Permanent(e)) => {
                error!(error = e.as_ref() as &dyn Error, "Download failed");
                discard_partial(&self.part_path(&sanitize_filename::sanitize(request.file_name.trim())))
                    .await;
                WorkResult::Failure
            }
        }
    }
}

async fn discard_partial(part: &Path) {
    if let Err(e) = fs::remove_file(part).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(error = &e as &dyn Error, path = %part.display(), "Failed to remove partial file");
    }
}
