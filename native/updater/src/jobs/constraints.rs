use std::{error::Error, path::PathBuf};

use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, trace, warn};

use super::DownloadRequest;

/// Checks whether a job's [`Constraints`](super::Constraints) currently hold.
#[async_trait]
pub trait ConstraintProbe: Send + Sync {
    async fn is_satisfied(&self, request: &DownloadRequest) -> bool;
}

/// Probe backed by DNS resolution and free space of the cache directory.
#[derive(Debug, Clone)]
pub struct SystemConstraintProbe {
    cache_dir: PathBuf,
    storage_low_threshold: u64,
}

impl SystemConstraintProbe {
    pub fn new(cache_dir: PathBuf, storage_low_threshold: u64) -> Self {
        Self { cache_dir, storage_low_threshold }
    }

    async fn network_connected(url: &str) -> bool {
        let Ok(url) = Url::parse(url) else {
            // Let the worker report the bad URL as a permanent failure.
            return true;
        };
        let Some(host) = url.host_str() else {
            return true;
        };
        let port = url.port_or_known_default().unwrap_or(443);
        match tokio::net::lookup_host((host, port)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!(error = &e as &dyn Error, host, "Host doesn't resolve");
                false
            }
        }
    }

    fn storage_not_low(&self) -> bool {
        if let Err(e) = fs_err::create_dir_all(&self.cache_dir) {
            warn!(error = &e as &dyn Error, "Failed to create cache directory");
            return false;
        }
        match fs4::available_space(&self.cache_dir) {
            Ok(available) => {
                trace!(available, threshold = self.storage_low_threshold, "Free space");
                available >= self.storage_low_threshold
            }
            Err(e) => {
                warn!(error = &e as &dyn Error, "Failed to query free space, assuming enough");
                true
            }
        }
    }
}

#[async_trait]
impl ConstraintProbe for SystemConstraintProbe {
    async fn is_satisfied(&self, request: &DownloadRequest) -> bool {
        let constraints = request.constraints;
        if constraints.storage_not_low && !self.storage_not_low() {
            debug!("Storage is low");
            return false;
        }
        if constraints.network_connected && !Self::network_connected(&request.url).await {
            debug!("Network is not available");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::jobs::{BackoffPolicy, Constraints};

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest {
            url: url.into(),
            file_name: "ota.zip".into(),
            checksum: String::new(),
            expected_size: 0,
            constraints: Constraints { network_connected: true, storage_not_low: true },
            backoff: BackoffPolicy::Linear { min: Duration::from_secs(1) },
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn localhost_with_space_is_satisfied() {
        let dir = tempdir().unwrap();
        let probe = SystemConstraintProbe::new(dir.path().join("cache"), 0);
        assert!(probe.is_satisfied(&request("http://127.0.0.1:8080/ota.zip")).await);
        assert!(dir.path().join("cache").is_dir());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn impossible_threshold_is_low_storage() {
        let dir = tempdir().unwrap();
        let probe = SystemConstraintProbe::new(dir.path().to_path_buf(), u64::MAX);
        assert!(!probe.is_satisfied(&request("http://127.0.0.1/ota.zip")).await);

        let mut unconstrained = request("http://127.0.0.1/ota.zip");
        unconstrained.constraints = Constraints::default();
        assert!(probe.is_satisfied(&unconstrained).await);
    }
}
