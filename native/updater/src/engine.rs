//! Contract of the platform update engine.
//!
//! The engine is a binder-style service that streams a payload into the inactive slot. It
//! is driven through [`UpdateEngine`] and reports back through the [`EngineCallback`]
//! registered with [`UpdateEngine::bind`].

use derive_more::{Display, Error};
use tokio::sync::mpsc;
use tracing::trace;

/// Engine-side failure of a binder call.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum EngineError {
    /// The service rejected the call with its own error code, e.g. "nothing to suspend".
    #[display("update engine service error {_0}")]
    ServiceSpecific(#[error(not(source))] i32),
    /// The binder transaction itself failed.
    #[display("binder call failed: {_0}")]
    Binder(#[error(not(source))] String),
}

/// Phase reported by `onStatusUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    Idle,
    UpdateAvailable,
    Downloading,
    Finalizing,
    UpdatedNeedReboot,
    CleanupPreviousUpdate,
    Other(i32),
}

impl From<i32> for EngineStatus {
    fn from(code: i32) -> Self {
        match code {
            0 => EngineStatus::Idle,
            2 => EngineStatus::UpdateAvailable,
            3 => EngineStatus::Downloading,
            5 => EngineStatus::Finalizing,
            6 => EngineStatus::UpdatedNeedReboot,
            11 => EngineStatus::CleanupPreviousUpdate,
            other => EngineStatus::Other(other),
        }
    }
}

/// Result code reported by `onPayloadApplicationComplete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    DownloadTransferError,
    NewRootfsVerificationError,
    DownloadInvalidMetadataMagicString,
    DownloadMetadataSignatureMismatch,
    UserCancelled,
    PayloadTimestampError,
    Other(i32),
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        match code {
            0 => ErrorCode::Success,
            9 => ErrorCode::DownloadTransferError,
            15 => ErrorCode::NewRootfsVerificationError,
            21 => ErrorCode::DownloadInvalidMetadataMagicString,
            26 => ErrorCode::DownloadMetadataSignatureMismatch,
            48 => ErrorCode::UserCancelled,
            51 => ErrorCode::PayloadTimestampError,
            other => ErrorCode::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// `percent` is the engine's fraction in `0.0..=1.0`.
    StatusUpdate { status: EngineStatus, percent: f32 },
    PayloadApplicationComplete(ErrorCode),
}

/// Callback handle given to the engine on bind. Cheap to clone; events sent after the
/// receiving side went away are dropped.
#[derive(Debug, Clone)]
pub struct EngineCallback {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineCallback {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    pub fn on_status_update(&self, status: i32, percent: f32) {
        self.send(EngineEvent::StatusUpdate { status: status.into(), percent });
    }

    pub fn on_payload_application_complete(&self, error_code: i32) {
        self.send(EngineEvent::PayloadApplicationComplete(error_code.into()));
    }

    fn send(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!(?event, "Callback context gone, dropping engine event");
        }
    }
}

/// Binder-style update engine. Calls are synchronous and cheap; the work happens in the
/// service and is reported through the bound callback.
pub trait UpdateEngine: Send + Sync {
    /// Registers `callback`; `Ok(false)` means the service refused the binding.
    fn bind(&self, callback: EngineCallback) -> Result<bool, EngineError>;
    fn unbind(&self) -> Result<bool, EngineError>;
    fn apply_payload(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        headers: &[String],
    ) -> Result<(), EngineError>;
    fn suspend(&self) -> Result<(), EngineError>;
    fn resume(&self) -> Result<(), EngineError>;
    fn cancel(&self) -> Result<(), EngineError>;
    fn cleanup_applied_payload(&self) -> Result<(), EngineError>;
    fn reset_status(&self) -> Result<(), EngineError>;
    fn set_performance_mode(&self, enable: bool) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn raw_codes_map_to_known_values() {
        assert_eq!(EngineStatus::from(3), EngineStatus::Downloading);
        assert_eq!(EngineStatus::from(6), EngineStatus::UpdatedNeedReboot);
        assert_eq!(EngineStatus::from(4), EngineStatus::Other(4));
        assert_eq!(ErrorCode::from(26), ErrorCode::DownloadMetadataSignatureMismatch);
        assert_eq!(ErrorCode::from(48), ErrorCode::UserCancelled);
        assert_eq!(ErrorCode::from(7), ErrorCode::Other(7));
    }

    #[test]
    fn callback_after_receiver_dropped_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = EngineCallback::new(tx);
        callback.on_status_update(3, 0.5);
        drop(rx);
        callback.on_payload_application_complete(0);
    }

    #[test]
    fn engine_error_messages() {
        assert_eq!(EngineError::ServiceSpecific(2).to_string(), "update engine service error 2");
        assert_eq!(EngineError::Binder("dead".into()).to_string(), "binder call failed: dead");
    }
}
