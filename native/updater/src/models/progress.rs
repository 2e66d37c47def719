use humansize::{DECIMAL, format_size};

use super::{DownloadStatus, StatusCode, UpdateStatus, UpdateStep};

/// Presentation-ready view of a download or update status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressInfo {
    /// Localization key for the status line.
    pub status_key: &'static str,
    /// Secondary text, e.g. transferred size.
    pub extras: Option<String>,
    pub indeterminate: bool,
    pub progress: u8,
}

impl ProgressInfo {
    pub fn from_download(status: &DownloadStatus) -> Self {
        let status_key = match status.status {
            StatusCode::Indeterminate => "waiting",
            StatusCode::Downloading => "downloading",
            StatusCode::Paused => "download_paused",
            StatusCode::Finished => "download_finished",
            StatusCode::Failed => "download_failed",
            StatusCode::Cancelled => "download_cancelled",
            _ => "",
        };
        let extras = format!(
            "{}/{}",
            format_size(status.downloaded_bytes, DECIMAL),
            format_size(status.total_bytes, DECIMAL)
        );
        Self {
            status_key,
            extras: Some(extras),
            indeterminate: status.status == StatusCode::Indeterminate,
            progress: status.progress,
        }
    }

    pub fn from_update(status: &UpdateStatus) -> Self {
        let status_key = match (status.status, status.step) {
            (StatusCode::Indeterminate, _) => "waiting",
            (StatusCode::Updating, Some(UpdateStep::Finalizing)) => "finalizing_update",
            (StatusCode::Updating, _) => "installing_update",
            (StatusCode::Paused, _) => "update_paused",
            (StatusCode::BatteryLow, _) => "battery_low",
            (StatusCode::Finished, _) => "update_finished",
            (StatusCode::Failed, _) => "update_failed",
            (StatusCode::Cancelled, _) => "update_cancelled",
            _ => "",
        };
        let extras = status.step.map(|step| format!("{}/2", step.number()));
        Self {
            status_key,
            extras,
            indeterminate: status.status == StatusCode::Indeterminate,
            progress: status.progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn download_progress_reports_sizes() {
        let status = DownloadStatus {
            status: StatusCode::Downloading,
            downloaded_bytes: 500_000,
            total_bytes: 2_000_000,
            progress: 25,
        };
        let info = ProgressInfo::from_download(&status);
        assert_eq!(info.status_key, "downloading");
        assert_eq!(info.extras.as_deref(), Some("500 kB/2 MB"));
        assert!(!info.indeterminate);
        assert_eq!(info.progress, 25);
    }

    #[test]
    fn update_progress_labels_steps() {
        let status = UpdateStatus {
            status: StatusCode::Updating,
            step: Some(UpdateStep::Finalizing),
            progress: 40,
        };
        let info = ProgressInfo::from_update(&status);
        assert_eq!(info.status_key, "finalizing_update");
        assert_eq!(info.extras.as_deref(), Some("2/2"));

        let waiting = ProgressInfo::from_update(&UpdateStatus::default().with_status(StatusCode::Indeterminate));
        assert!(waiting.indeterminate);
        assert_eq!(waiting.extras, None);
    }
}
