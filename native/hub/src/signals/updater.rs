use rinf::{DartSignal, RustSignal, SignalPiece};
use serde::{Deserialize, Serialize};
use updater::models::{self, DownloadStatus, GlobalStatus, ProgressInfo, ThemeMode, UpdateStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub enum PipelinePhase {
    Unknown,
    DownloadPending,
    Downloading,
    UpdatePending,
    Updating,
    RebootPending,
    BatteryLow,
    Cancelled,
    Failed,
}

impl From<GlobalStatus> for PipelinePhase {
    fn from(status: GlobalStatus) -> Self {
        match status {
            GlobalStatus::Unknown => PipelinePhase::Unknown,
            GlobalStatus::DownloadPending => PipelinePhase::DownloadPending,
            GlobalStatus::Downloading => PipelinePhase::Downloading,
            GlobalStatus::UpdatePending => PipelinePhase::UpdatePending,
            GlobalStatus::Updating => PipelinePhase::Updating,
            GlobalStatus::RebootPending => PipelinePhase::RebootPending,
            GlobalStatus::BatteryLow => PipelinePhase::BatteryLow,
            GlobalStatus::Cancelled => PipelinePhase::Cancelled,
            GlobalStatus::Failed => PipelinePhase::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub enum StatusKind {
    Unset,
    BatteryLow,
    Cancelled,
    Failed,
    Indeterminate,
    Downloading,
    Updating,
    Paused,
    Finished,
}

impl From<models::StatusCode> for StatusKind {
    fn from(code: models::StatusCode) -> Self {
        use models::StatusCode;
        match code {
            StatusCode::Unset => StatusKind::Unset,
            StatusCode::BatteryLow => StatusKind::BatteryLow,
            StatusCode::Cancelled => StatusKind::Cancelled,
            StatusCode::Failed => StatusKind::Failed,
            StatusCode::Indeterminate => StatusKind::Indeterminate,
            StatusCode::Downloading => StatusKind::Downloading,
            StatusCode::Updating => StatusKind::Updating,
            StatusCode::Paused => StatusKind::Paused,
            StatusCode::Finished => StatusKind::Finished,
        }
    }
}

/// Ready-to-render progress line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub struct ProgressText {
    /// Localization key of the status line
    pub status_key: String,
    pub extras: Option<String>,
    pub indeterminate: bool,
    pub progress: u8,
}

impl From<ProgressInfo> for ProgressText {
    fn from(info: ProgressInfo) -> Self {
        Self {
            status_key: info.status_key.to_string(),
            extras: info.extras,
            indeterminate: info.indeterminate,
            progress: info.progress,
        }
    }
}

// Requests

#[derive(Serialize, Deserialize, DartSignal)]
pub struct StartDownloadRequest {}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct PauseOrResumeDownloadRequest {}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct CancelDownloadRequest {}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct StartUpdateRequest {}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct PauseUpdateRequest {
    /// `false` resumes
    pub pause: bool,
}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct CancelUpdateRequest {}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct ResetAllRequest {}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct LocalUpgradeRequest {
    pub path: String,
}

/// Build metadata fetched by the UI from the OTA server.
#[derive(Debug, Clone, Serialize, Deserialize, DartSignal)]
pub struct BuildInfoReceived {
    pub version: String,
    /// Unix timestamp in seconds
    pub release_date: i64,
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    pub checksum: String,
}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct SetThemeRequest {
    /// 0 light, 1 dark, 2 follow system
    pub theme: i64,
}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct SetRefreshIntervalRequest {
    pub days: u32,
}

// Events

#[derive(Serialize, Deserialize, RustSignal)]
pub struct GlobalStatusChanged {
    pub phase: PipelinePhase,
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct DownloadStatusChanged {
    pub status: StatusKind,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub progress: ProgressText,
}

impl From<&DownloadStatus> for DownloadStatusChanged {
    fn from(status: &DownloadStatus) -> Self {
        Self {
            status: status.status.into(),
            downloaded_bytes: status.downloaded_bytes,
            total_bytes: status.total_bytes,
            progress: ProgressInfo::from_download(status).into(),
        }
    }
}

/// A download job was handed to the job queue.
#[derive(Serialize, Deserialize, RustSignal)]
pub struct DownloadJobSubmitted {
    pub handle: String,
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct UpdateStatusChanged {
    pub status: StatusKind,
    /// 1 while streaming the payload, 2 while finalizing
    pub step: Option<u8>,
    pub progress: ProgressText,
}

impl From<&UpdateStatus> for UpdateStatusChanged {
    fn from(status: &UpdateStatus) -> Self {
        Self {
            status: status.status.into(),
            step: status.step.map(|step| step.number()),
            progress: ProgressInfo::from_update(status).into(),
        }
    }
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct BuildInfoChanged {
    pub version: Option<String>,
    pub release_date: Option<i64>,
    pub file_size: Option<u64>,
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct LocalUpgradeFileChanged {
    pub path: Option<String>,
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct PreferencesChanged {
    pub theme: i64,
    pub refresh_interval_days: u32,
}

impl PreferencesChanged {
    pub fn new(theme: ThemeMode, refresh_interval_days: u32) -> Self {
        Self { theme: theme.into(), refresh_interval_days }
    }
}
