use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

/// Top-level phase of the whole pipeline.
///
/// Persisted as the integer code shared with [`StatusCode`] (`0` means nothing is known
/// yet). Download and update phases never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum GlobalStatus {
    #[default]
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

impl GlobalStatus {
    pub const fn code(self) -> i64 {
        match self {
            GlobalStatus::Unknown => 0,
            GlobalStatus::BatteryLow => StatusCode::BatteryLow.code(),
            GlobalStatus::Cancelled => StatusCode::Cancelled.code(),
            GlobalStatus::Failed => StatusCode::Failed.code(),
            GlobalStatus::Downloading => StatusCode::Downloading.code(),
            GlobalStatus::Updating => StatusCode::Updating.code(),
            GlobalStatus::DownloadPending => 308,
            GlobalStatus::UpdatePending => 309,
            GlobalStatus::RebootPending => 310,
        }
    }
}

impl TryFrom<i64> for GlobalStatus {
    type Error = UnknownStatusCode;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => GlobalStatus::Unknown,
            300 => GlobalStatus::BatteryLow,
            301 => GlobalStatus::Cancelled,
            302 => GlobalStatus::Failed,
            304 => GlobalStatus::Downloading,
            305 => GlobalStatus::Updating,
            308 => GlobalStatus::DownloadPending,
            309 => GlobalStatus::UpdatePending,
            310 => GlobalStatus::RebootPending,
            other => return Err(UnknownStatusCode(other)),
        })
    }
}

impl From<GlobalStatus> for i64 {
    fn from(status: GlobalStatus) -> Self {
        status.code()
    }
}

/// Status of a single download or payload application.
///
/// Variants are declared in code order so the derived ordering matches the persisted
/// integer codes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "i64", into = "i64")]
pub enum StatusCode {
    #[default]
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

impl StatusCode {
    pub const fn code(self) -> i64 {
        match self {
            StatusCode::Unset => 0,
            StatusCode::BatteryLow => 300,
            StatusCode::Cancelled => 301,
            StatusCode::Failed => 302,
            StatusCode::Indeterminate => 303,
            StatusCode::Downloading => 304,
            StatusCode::Updating => 305,
            StatusCode::Paused => 306,
            StatusCode::Finished => 307,
        }
    }

    /// Whether the code lies in the active range `[Indeterminate, Paused]`.
    pub fn is_active(self) -> bool {
        (StatusCode::Indeterminate..=StatusCode::Paused).contains(&self)
    }
}

impl TryFrom<i64> for StatusCode {
    type Error = UnknownStatusCode;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => StatusCode::Unset,
            300 => StatusCode::BatteryLow,
            301 => StatusCode::Cancelled,
            302 => StatusCode::Failed,
            303 => StatusCode::Indeterminate,
            304 => StatusCode::Downloading,
            305 => StatusCode::Updating,
            306 => StatusCode::Paused,
            307 => StatusCode::Finished,
            other => return Err(UnknownStatusCode(other)),
        })
    }
}

impl From<StatusCode> for i64 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("unknown status code {_0}")]
pub struct UnknownStatusCode(#[error(not(source))] pub i64);

/// Progress of the current build download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub status: StatusCode,
    pub downloaded_bytes: u64,
    /// Zero until the expected size is known.
    pub total_bytes: u64,
    /// Always within `0..=100`.
    pub progress: u8,
}

impl DownloadStatus {
    pub fn with_total(total_bytes: u64) -> Self {
        Self { total_bytes, ..Self::default() }
    }

    /// Applies a progress report, keeping `downloaded_bytes <= total_bytes` once the total
    /// is known.
    pub fn apply_progress(&mut self, downloaded_bytes: u64, percent: u8) {
        self.downloaded_bytes = if self.total_bytes > 0 {
            downloaded_bytes.min(self.total_bytes)
        } else {
            downloaded_bytes
        };
        self.progress = percent.min(100);
    }
}

/// Sub-phase of payload application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateStep {
    /// The engine is streaming the payload into the inactive slot.
    Streaming,
    /// The engine is verifying and finalizing the written slot.
    Finalizing,
}

impl UpdateStep {
    pub const fn number(self) -> u8 {
        match self {
            UpdateStep::Streaming => 1,
            UpdateStep::Finalizing => 2,
        }
    }
}

/// Progress of payload application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub status: StatusCode,
    pub step: Option<UpdateStep>,
    pub progress: u8,
}

impl UpdateStatus {
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}
