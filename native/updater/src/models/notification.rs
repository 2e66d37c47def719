//! User-facing notifications emitted by the orchestrators.
//!
//! Orchestrators only pick the category; rendering (toast, system notification, log line)
//! is up to the [`Notifier`] the application installs.

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    InvalidPackage,
    MetadataVerificationFailed,
    AttemptingDowngrade,
    RootfsVerificationFailed,
    TransferError,
    /// The engine refused the binding or the payload submission.
    EngineUnavailable,
}

impl FailureReason {
    pub const fn message_key(self) -> &'static str {
        match self {
            FailureReason::InvalidPackage => "invalid_zip_file",
            FailureReason::MetadataVerificationFailed => "metadata_verification_failed",
            FailureReason::AttemptingDowngrade => "attempting_downgrade",
            FailureReason::RootfsVerificationFailed => "rootfs_verification_failed",
            FailureReason::TransferError => "ota_transfer_error",
            FailureReason::EngineUnavailable => "update_engine_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    UpdateFinished,
    UpdateFailed(FailureReason),
    BatteryLow,
    DownloadFailed,
}

impl Notification {
    pub const fn title_key(self) -> &'static str {
        match self {
            Notification::UpdateFinished => "update_finished",
            Notification::UpdateFailed(_) => "update_failed",
            Notification::BatteryLow => "battery_low",
            Notification::DownloadFailed => "download_failed",
        }
    }

    pub const fn message_key(self) -> &'static str {
        match self {
            Notification::UpdateFinished => "update_finished_notif_desc",
            Notification::UpdateFailed(reason) => reason.message_key(),
            Notification::BatteryLow => "plug_in_charger",
            Notification::DownloadFailed => "download_failed_desc",
        }
    }

    pub const fn is_error(self) -> bool {
        matches!(self, Notification::UpdateFailed(_) | Notification::DownloadFailed)
    }
}

/// Sink for user-facing notifications. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Notifier that only writes to the log, for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        let (title, message) = (notification.title_key(), notification.message_key());
        if notification.is_error() {
            warn!(title, message, "Notification");
        } else {
            info!(title, message, "Notification");
        }
    }
}
